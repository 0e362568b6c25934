//! Cross-Worker Pipe Manager: forwarding links that let a viewer on one
//! worker reach a producer homed on another.
//!
//! Links are unidirectional (source router → target router), scoped to
//! one producer, and live until the room is torn down. Creation is
//! idempotent per `(producer, target_worker)`; a concurrent duplicate
//! surfacing as `LinkExists` from the engine is recorded as success.

use crate::engine::EngineError;
use crate::error::Result;
use crate::room::Room;
use crate::types::ProducerId;
use tracing::debug;

/// What `ensure_pipe` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeOutcome {
    /// Producer and viewer share a worker; nothing to forward.
    SameWorker,
    /// A link for this `(producer, target)` already existed.
    AlreadyPiped,
    Created,
}

/// Make `producer_id` consumable on `to_worker`.
pub async fn ensure_pipe(
    room: &Room,
    producer_id: &ProducerId,
    from_worker: usize,
    to_worker: usize,
) -> Result<PipeOutcome> {
    if from_worker == to_worker {
        return Ok(PipeOutcome::SameWorker);
    }

    if room.state().has_pipe(producer_id, to_worker) {
        return Ok(PipeOutcome::AlreadyPiped);
    }

    let source = room.routers.get_or_create(from_worker).await?;
    let target = room.routers.get_or_create(to_worker).await?;

    match source.pipe_producer_to(producer_id, target).await {
        Ok(()) => {}
        // Two consumers raced us to the same link; theirs won.
        Err(EngineError::LinkExists) => {
            debug!(
                room = %room.id,
                producer = %producer_id,
                to_worker,
                "pipe link already up, recording"
            );
        }
        Err(other) => return Err(other.into()),
    }

    room.state_mut().record_pipe(producer_id.clone(), to_worker);
    debug!(
        room = %room.id,
        producer = %producer_id,
        from_worker,
        to_worker,
        "pipe established"
    );
    Ok(PipeOutcome::Created)
}
