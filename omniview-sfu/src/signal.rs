//! Messaging collaborator seam: events pushed to clients and the ack
//! payloads returned from request handlers.
//!
//! The transport (websocket, socket.io, grpc stream, ...) lives outside
//! this crate. It must deliver room broadcasts to every member except
//! the sender, in the order the triggering operations completed within
//! one room. Request handlers return `Result<Ack>` so the transport can
//! keep the exactly-one-response-per-request contract.

use crate::engine::{RtpCapabilities, RtpParameters};
use crate::types::{ConsumerId, MediaKind, MemberId, ProducerId, Role, RoomId, StreamType};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Metadata broadcast when a producer appears, and returned from
/// `get_producers`. Carries enough for any member to locate the stream
/// and, if needed, pipe to its home worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProducerInfo {
    pub producer_id: ProducerId,
    pub member_id: MemberId,
    pub kind: MediaKind,
    pub stream_type: StreamType,
    pub owner_role: Role,
    pub worker_index: usize,
}

/// Events emitted toward clients.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum SignalEvent {
    /// Router RTP capabilities, sent on join (and replayed on duplicate join).
    Rtp(RtpCapabilities),
    /// The role the server assigned at join time.
    Role(Role),
    NewProducer(ProducerInfo),
    MemberLeft(MemberId),
    ConsumerClosed {
        consumer_id: ConsumerId,
        producer_id: ProducerId,
    },
}

/// Outbound half of the messaging collaborator.
pub trait SignalSink: Send + Sync + 'static {
    /// Deliver an event to one member.
    fn emit(&self, member: &MemberId, event: SignalEvent);

    /// Deliver an event to every room member except `except`.
    fn broadcast_except(&self, room: &RoomId, except: &MemberId, event: SignalEvent);
}

/// Ack for `create_transport`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportAck {
    pub id: crate::types::TransportId,
    pub ice_parameters: serde_json::Value,
    pub ice_candidates: serde_json::Value,
    pub dtls_parameters: serde_json::Value,
    /// Which pool worker hosts this transport; consumers echo it back
    /// when they want a transport near a specific producer.
    pub worker_index: usize,
}

/// Ack for `produce`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProduceAck {
    pub id: ProducerId,
}

/// Ack for `consume`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumeAck {
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
}

/// Per-member network health as shown to proctors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberNetworkReport {
    pub rtt_ms: u32,
    pub loss_rate: f64,
}

/// Ack for `get_room_stats` (proctor-only).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoomStatsAck {
    pub members: usize,
    pub students: usize,
    pub proctors: usize,
    pub producers: usize,
    pub consumers: usize,
    pub active_speakers: Vec<MemberId>,
    pub network: HashMap<MemberId, MemberNetworkReport>,
    pub producers_per_worker: Vec<usize>,
    pub transports_per_worker: Vec<usize>,
}
