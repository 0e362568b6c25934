//! `OmniView` room orchestration and adaptive routing engine.
//!
//! This crate is the control plane of a proctored video session: it
//! owns rooms, members and the media-plane resources (transports,
//! producers, consumers) those members hold, and decides where on a
//! pool of media-engine workers each stream lives. The media plane
//! itself stays behind the [`engine`] traits; this crate never touches
//! RTP or DTLS.
//!
//! ## Architecture
//!
//! - **`SessionManager`**: the request surface; join/leave, transports,
//!   produce/consume, room stats
//! - **`WorkerPool`**: fixed pool of engine workers, fail-fast on death
//! - **`RouterRegistry`**: at most one router per `(room, worker)`
//! - **`Room`**: per-room state store guarded by a synchronous lock
//! - **`ensure_pipe`**: idempotent cross-worker forwarding links
//! - **`qos` / `monitor`**: proctor-first layer selection, bounded
//!   active-speaker ranking, loss-driven adaptive bitrate
//!
//! ## Usage
//!
//! ```rust,ignore
//! use omniview_sfu::{Config, SessionManager, WorkerPool};
//!
//! let config = Config::default();
//! let pool = WorkerPool::new(engine);
//! pool.initialize(config.worker.resolved_count(), &config.worker.engine_settings()).await?;
//! let sessions = SessionManager::new(pool, config, signal_sink);
//! let role = sessions.join(&room_id, &member_id, None).await?;
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod mock;
pub mod monitor;
pub mod pipe;
pub mod placement;
pub mod qos;
pub mod room;
pub mod router;
pub mod session;
pub mod signal;
pub mod types;
pub mod worker_pool;

pub use config::{Config, load_config};
pub use error::{Error, Result};
pub use logging::init_logging;
pub use pipe::{ensure_pipe, PipeOutcome};
pub use room::Room;
pub use router::RouterRegistry;
pub use session::SessionManager;
pub use signal::{SignalEvent, SignalSink};
pub use types::{ConsumerId, MemberId, ProducerId, Role, RoomId, TransportId};
pub use worker_pool::WorkerPool;
