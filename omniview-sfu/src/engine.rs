//! Media Engine collaborator contract.
//!
//! The orchestration core never touches RTP/SRTP, ICE/DTLS or codecs
//! itself; it drives an external engine through these traits. Payloads
//! the core only ferries between clients and the engine (capabilities,
//! RTP/DTLS parameters) stay opaque JSON so the core cannot grow an
//! accidental dependency on media internals.
//!
//! Every method that crosses into the engine is a suspension point;
//! callers must assume other handlers interleave while awaiting.

use crate::types::{ConsumerId, MediaKind, ProducerId, RouterId, StreamType, TransportId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Failures reported by the media engine.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("worker failed: {0}")]
    WorkerFailed(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("transport closed: {0}")]
    TransportClosed(String),

    /// A forwarding link for this producer already exists on the target
    /// router. Benign race between two concurrent consumers; callers
    /// treat it as success.
    #[error("pipe link already exists")]
    LinkExists,

    /// The producer is not using layered encoding, so layer preferences
    /// cannot be applied. Non-fatal.
    #[error("preferred layers unsupported")]
    LayersUnsupported,

    #[error("engine failure: {0}")]
    Failed(String),
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Router RTP capability set, opaque to the core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RtpCapabilities(pub serde_json::Value);

/// Client RTP parameters for a producer, opaque to the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RtpParameters(pub serde_json::Value);

/// DTLS parameters exchanged during transport connect, opaque to the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DtlsParameters(pub serde_json::Value);

/// Parameters a client needs to establish one transport. Replayed
/// verbatim when a cached viewer transport is reused.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConnectInfo {
    pub id: TransportId,
    pub ice_parameters: serde_json::Value,
    pub ice_candidates: serde_json::Value,
    pub dtls_parameters: serde_json::Value,
}

/// One codec the routers are created with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodecCapability {
    pub kind: MediaKind,
    pub mime_type: String,
    pub clock_rate: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default)]
    pub parameters: serde_json::Value,
}

/// Per-worker engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSettings {
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
    pub log_level: String,
}

/// Options for a new transport.
#[derive(Debug, Clone, Copy)]
pub struct TransportOptions {
    /// Initial available outgoing bitrate in bps. Role-dependent:
    /// proctors start higher than students.
    pub initial_outgoing_bitrate: u32,
}

/// Spatial/temporal layer preference for a layered consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreferredLayers {
    pub spatial: u8,
    pub temporal: u8,
}

/// Worker CPU accounting, for diagnostics.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub cpu_user_ms: u64,
    pub cpu_system_ms: u64,
}

/// What a transport stat record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportStatType {
    /// The transport-level record; carries RTT.
    Transport,
    OutboundRtp,
    InboundRtp,
}

/// One record from `TransportHandle::get_stats`.
#[derive(Debug, Clone)]
pub struct TransportStat {
    pub stat_type: TransportStatType,
    pub round_trip_time_ms: Option<f64>,
    pub packets_lost: Option<u64>,
    pub packets_sent: Option<u64>,
    pub packets_received: Option<u64>,
}

/// Entry point: creates worker processes.
#[async_trait]
pub trait MediaEngine: Send + Sync + 'static {
    async fn create_worker(&self, settings: &WorkerSettings)
        -> EngineResult<Arc<dyn WorkerHandle>>;
}

/// One engine worker process.
#[async_trait]
pub trait WorkerHandle: Send + Sync + 'static {
    /// Opaque process identity, for logs.
    fn pid(&self) -> u32;

    async fn create_router(
        &self,
        codecs: &[CodecCapability],
    ) -> EngineResult<Arc<dyn RouterHandle>>;

    async fn resource_usage(&self) -> EngineResult<ResourceUsage>;

    /// Resolves when the worker terminates unexpectedly. Never resolves
    /// for a healthy worker.
    async fn died(&self);
}

/// One routing domain on one worker.
#[async_trait]
pub trait RouterHandle: Send + Sync + 'static {
    fn id(&self) -> RouterId;

    fn rtp_capabilities(&self) -> RtpCapabilities;

    async fn create_transport(
        &self,
        options: TransportOptions,
    ) -> EngineResult<Arc<dyn TransportHandle>>;

    fn can_consume(&self, producer_id: &ProducerId, caps: &RtpCapabilities) -> bool;

    /// Establish a unidirectional forwarding link for one producer from
    /// this router to `target`. `EngineError::LinkExists` when the link
    /// is already up.
    async fn pipe_producer_to(
        &self,
        producer_id: &ProducerId,
        target: Arc<dyn RouterHandle>,
    ) -> EngineResult<()>;

    async fn close(&self);
}

/// One ICE/DTLS transport on a router.
#[async_trait]
pub trait TransportHandle: Send + Sync + 'static {
    fn id(&self) -> TransportId;

    /// Connection parameters for the client side.
    fn connect_info(&self) -> TransportConnectInfo;

    async fn connect(&self, dtls: DtlsParameters) -> EngineResult<()>;

    async fn produce(
        &self,
        kind: MediaKind,
        rtp: RtpParameters,
        stream_type: StreamType,
    ) -> EngineResult<Arc<dyn ProducerHandle>>;

    async fn consume(
        &self,
        producer_id: &ProducerId,
        caps: RtpCapabilities,
    ) -> EngineResult<Arc<dyn ConsumerHandle>>;

    async fn get_stats(&self) -> EngineResult<Vec<TransportStat>>;

    fn closed(&self) -> bool;

    async fn close(&self);
}

/// One media stream entering the engine.
#[async_trait]
pub trait ProducerHandle: Send + Sync + 'static {
    fn id(&self) -> ProducerId;

    fn kind(&self) -> MediaKind;

    fn closed(&self) -> bool;

    async fn close(&self);
}

/// One media stream leaving the engine toward a viewer.
#[async_trait]
pub trait ConsumerHandle: Send + Sync + 'static {
    fn id(&self) -> ConsumerId;

    fn kind(&self) -> MediaKind;

    fn rtp_parameters(&self) -> RtpParameters;

    /// Whether the source producer uses layered (simulcast) encoding.
    fn simulcast(&self) -> bool;

    /// `EngineError::LayersUnsupported` when the producer is not
    /// layered; callers treat that as non-fatal.
    async fn set_preferred_layers(&self, layers: PreferredLayers) -> EngineResult<()>;

    async fn close(&self);
}
