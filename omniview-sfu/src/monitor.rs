//! Network Monitor: periodic per-transport stat sampling for student
//! members, feeding the adaptive-bitrate machines.
//!
//! One task per room, started when the first student joins and
//! cancelled exactly once at room teardown. A tick that cannot read
//! stats (transport mid-close) skips that transport; telemetry failures
//! never propagate.

use crate::config::MonitoringConfig;
use crate::engine::{ConsumerHandle, TransportHandle, TransportStatType};
use crate::qos::{select_video_layers, AbrMachine, AbrTransition, StreamPriority, LAYERS_MINIMUM};
use crate::room::{NetworkSample, Room};
use crate::types::{MediaKind, MemberId, ProducerId, Role};
use std::sync::Arc;
use tokio::time::{interval, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Spawn the monitor loop for `room`. The caller owns the token and
/// cancels it at teardown.
pub fn spawn_monitor(room: Arc<Room>, config: MonitoringConfig, token: CancellationToken) {
    info!(room = %room.id, interval_ms = config.stats_interval_ms, "network monitor started");
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_millis(config.stats_interval_ms));
        loop {
            tokio::select! {
                () = token.cancelled() => {
                    debug!(room = %room.id, "network monitor stopped");
                    break;
                }
                _ = ticker.tick() => {
                    run_tick(&room, &config).await;
                }
            }
        }
    });
}

/// One monitoring pass over every student transport in the room.
pub async fn run_tick(room: &Room, config: &MonitoringConfig) {
    let targets: Vec<(MemberId, Arc<dyn TransportHandle>)> = {
        let state = room.state();
        state
            .transports
            .values()
            .filter(|record| state.member_role(&record.owner) == Some(Role::Student))
            .map(|record| (record.owner.clone(), Arc::clone(&record.handle)))
            .collect()
    };

    for (member, transport) in targets {
        if transport.closed() {
            continue;
        }

        let stats = match transport.get_stats().await {
            Ok(stats) => stats,
            Err(err) => {
                // Transport may be closing under us; skip this tick.
                debug!(room = %room.id, member = %member, error = %err, "stats read failed");
                continue;
            }
        };

        let mut rtt_ms = 0u32;
        let mut lost = 0u64;
        let mut total = 0u64;
        for stat in &stats {
            if stat.stat_type == TransportStatType::Transport {
                if let Some(rtt) = stat.round_trip_time_ms {
                    rtt_ms = rtt.round() as u32;
                }
            }
            if let Some(packets_lost) = stat.packets_lost {
                lost += packets_lost;
                total += stat.packets_sent.or(stat.packets_received).unwrap_or(0);
            }
        }
        let loss_rate = if total > 0 {
            lost as f64 / total as f64
        } else {
            0.0
        };

        let transitions = record_sample(room, &member, rtt_ms, loss_rate, config);
        for (producer_id, transition) in transitions {
            apply_transition(room, &producer_id, transition).await;
        }
    }
}

/// Store the member's sample and advance the ABR machine of each of
/// their video producers. Returns the transitions to apply.
fn record_sample(
    room: &Room,
    member: &MemberId,
    rtt_ms: u32,
    loss_rate: f64,
    config: &MonitoringConfig,
) -> Vec<(ProducerId, AbrTransition)> {
    let mut state = room.state_mut();
    state.samples.insert(
        member.clone(),
        NetworkSample {
            rtt_ms,
            loss_rate,
            timestamp: chrono::Utc::now(),
        },
    );

    let video_producers: Vec<ProducerId> = state
        .producers
        .iter()
        .filter(|(_, record)| &record.owner == member && record.kind == MediaKind::Video)
        .map(|(id, _)| id.clone())
        .collect();

    let mut transitions = Vec::new();
    for producer_id in video_producers {
        let machine = state
            .abr
            .entry(producer_id.clone())
            .or_insert_with(|| AbrMachine::new(config.degrade_threshold, config.recover_threshold));
        if let Some(transition) = machine.observe(loss_rate) {
            transitions.push((producer_id, transition));
        }
    }
    transitions
}

/// Apply a degrade/recover action to the producer's consumers in a
/// peer-degradable priority tier. Proctor-bound consumers are never
/// touched here, and recovery restores the gating decision the viewer
/// would get at consume time, not a blanket default.
async fn apply_transition(room: &Room, producer_id: &ProducerId, transition: AbrTransition) {
    let (peer_consumers, recover_layers) = {
        let state = room.state();
        let Some(producer) = state.producers.get(producer_id) else {
            return;
        };
        let stream_type = producer.stream_type;
        let recover_layers = select_video_layers(
            Role::Student,
            state.ranking.contains(&producer.owner),
            state.ranking.at_capacity(),
        );
        let consumers: Vec<Arc<dyn ConsumerHandle>> = state
            .consumers
            .values()
            .filter(|record| {
                &record.producer_id == producer_id
                    && record.viewer_role == Role::Student
                    && StreamPriority::classify(record.kind, stream_type, record.viewer_role)
                        .is_peer_degradable()
            })
            .map(|record| Arc::clone(&record.handle))
            .collect();
        (consumers, recover_layers)
    };

    let layers = match transition {
        AbrTransition::Degrade => LAYERS_MINIMUM,
        AbrTransition::Recover => recover_layers,
    };
    if transition == AbrTransition::Recover && layers == LAYERS_MINIMUM {
        // The owner is gated out of the ranking; consumers already sit
        // at the floor the degrade put them on.
        debug!(producer = %producer_id, "recovery while gated, keeping floor");
        return;
    }

    info!(
        room = %room.id,
        producer = %producer_id,
        ?transition,
        peer_consumers = peer_consumers.len(),
        "adaptive bitrate transition"
    );

    for consumer in peer_consumers {
        // Producer may not be layered; that is fine.
        if let Err(err) = consumer.set_preferred_layers(layers).await {
            debug!(producer = %producer_id, error = %err, "layer adjustment skipped");
        }
    }
}
