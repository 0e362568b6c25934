//! Deterministic in-process media engine.
//!
//! Implements the full [`crate::engine`] contract against in-memory
//! bookkeeping: producer visibility per router, pipe links, connect
//! latches, scripted transport stats. Used by the test suites and by
//! the binary for engine-less local runs. No media flows anywhere.

use crate::engine::{
    CodecCapability, ConsumerHandle, DtlsParameters, EngineError, EngineResult, MediaEngine,
    PreferredLayers, ProducerHandle, ResourceUsage, RouterHandle, RtpCapabilities, RtpParameters,
    TransportConnectInfo, TransportHandle, TransportOptions, TransportStat, WorkerHandle,
    WorkerSettings,
};
use crate::types::{ConsumerId, MediaKind, ProducerId, RouterId, StreamType, TransportId};
use async_trait::async_trait;
use nanoid::nanoid;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

enum StatsScript {
    Records(Vec<TransportStat>),
    Fail,
}

/// Shared bookkeeping; handles hold this instead of each other, so
/// nothing forms a reference cycle.
#[derive(Default)]
struct MockState {
    workers_created: AtomicUsize,
    routers_created: AtomicUsize,
    open_routers: AtomicUsize,
    pipe_calls: AtomicUsize,
    death_tokens: Mutex<Vec<CancellationToken>>,
    /// Producers consumable per router (home producers + piped ones).
    visible: Mutex<HashMap<RouterId, HashSet<ProducerId>>>,
    /// Which pool worker each router was created on.
    router_workers: Mutex<HashMap<RouterId, usize>>,
    /// Established links by `(producer, target_worker)`.
    links: Mutex<HashSet<(ProducerId, usize)>>,
    producer_kinds: Mutex<HashMap<ProducerId, MediaKind>>,
    producer_closed: Mutex<HashMap<ProducerId, Arc<AtomicBool>>>,
    consumer_closed: Mutex<HashMap<ConsumerId, Arc<AtomicBool>>>,
    non_simulcast: Mutex<HashSet<ProducerId>>,
    connect_calls: Mutex<HashMap<TransportId, usize>>,
    stats: Mutex<HashMap<TransportId, StatsScript>>,
    layer_history: Mutex<HashMap<ConsumerId, Vec<PreferredLayers>>>,
}

pub struct MockEngine {
    state: Arc<MockState>,
}

impl MockEngine {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Arc::new(MockState::default()),
        })
    }

    #[must_use]
    pub fn workers_created(&self) -> usize {
        self.state.workers_created.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn routers_created(&self) -> usize {
        self.state.routers_created.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn open_routers(&self) -> usize {
        self.state.open_routers.load(Ordering::SeqCst)
    }

    /// Number of `pipe_producer_to` calls issued, successful or not.
    #[must_use]
    pub fn pipe_calls(&self) -> usize {
        self.state.pipe_calls.load(Ordering::SeqCst)
    }

    /// Pretend some other node already piped `producer` to
    /// `target_worker`, so the next pipe call reports `LinkExists`.
    pub fn prime_existing_link(&self, producer: &ProducerId, target_worker: usize) {
        self.state
            .links
            .lock()
            .insert((producer.clone(), target_worker));
    }

    /// Simulate the unexpected death of worker `index`.
    pub fn kill_worker(&self, index: usize) {
        if let Some(token) = self.state.death_tokens.lock().get(index) {
            token.cancel();
        }
    }

    #[must_use]
    pub fn connect_calls(&self, transport: &TransportId) -> usize {
        self.state
            .connect_calls
            .lock()
            .get(transport)
            .copied()
            .unwrap_or(0)
    }

    pub fn set_transport_stats(&self, transport: &TransportId, records: Vec<TransportStat>) {
        self.state
            .stats
            .lock()
            .insert(transport.clone(), StatsScript::Records(records));
    }

    /// Make `get_stats` fail for this transport (e.g. mid-close).
    pub fn fail_transport_stats(&self, transport: &TransportId) {
        self.state
            .stats
            .lock()
            .insert(transport.clone(), StatsScript::Fail);
    }

    /// Every `set_preferred_layers` call recorded for this consumer.
    #[must_use]
    pub fn layer_history(&self, consumer: &ConsumerId) -> Vec<PreferredLayers> {
        self.state
            .layer_history
            .lock()
            .get(consumer)
            .cloned()
            .unwrap_or_default()
    }

    #[must_use]
    pub fn producer_is_closed(&self, producer: &ProducerId) -> bool {
        self.state
            .producer_closed
            .lock()
            .get(producer)
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }

    #[must_use]
    pub fn consumer_is_closed(&self, consumer: &ConsumerId) -> bool {
        self.state
            .consumer_closed
            .lock()
            .get(consumer)
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }

    /// Mark a producer as not using layered encoding, so consumers of
    /// it reject `set_preferred_layers`.
    pub fn set_not_simulcast(&self, producer: &ProducerId) {
        self.state.non_simulcast.lock().insert(producer.clone());
    }

    /// Capabilities every mock router rejects.
    #[must_use]
    pub fn incompatible_caps() -> RtpCapabilities {
        RtpCapabilities(json!({ "incompatible": true }))
    }

    /// Capabilities every mock router accepts.
    #[must_use]
    pub fn compatible_caps() -> RtpCapabilities {
        RtpCapabilities(json!({ "codecs": ["VP8", "opus"] }))
    }
}

#[async_trait]
impl MediaEngine for MockEngine {
    async fn create_worker(
        &self,
        _settings: &WorkerSettings,
    ) -> EngineResult<Arc<dyn WorkerHandle>> {
        let index = self.state.workers_created.fetch_add(1, Ordering::SeqCst);
        let death = CancellationToken::new();
        self.state.death_tokens.lock().push(death.clone());
        Ok(Arc::new(MockWorker {
            index,
            pid: 10_000 + index as u32,
            death,
            state: Arc::clone(&self.state),
        }))
    }
}

struct MockWorker {
    index: usize,
    pid: u32,
    death: CancellationToken,
    state: Arc<MockState>,
}

#[async_trait]
impl WorkerHandle for MockWorker {
    fn pid(&self) -> u32 {
        self.pid
    }

    async fn create_router(
        &self,
        codecs: &[CodecCapability],
    ) -> EngineResult<Arc<dyn RouterHandle>> {
        self.state.routers_created.fetch_add(1, Ordering::SeqCst);
        self.state.open_routers.fetch_add(1, Ordering::SeqCst);
        let id = RouterId::from(format!("router_{}", nanoid!(8)));
        self.state
            .visible
            .lock()
            .insert(id.clone(), HashSet::new());
        self.state
            .router_workers
            .lock()
            .insert(id.clone(), self.index);
        Ok(Arc::new(MockRouter {
            id,
            caps: RtpCapabilities(json!({
                "codecs": codecs
                    .iter()
                    .map(|c| c.mime_type.clone())
                    .collect::<Vec<_>>(),
            })),
            closed: AtomicBool::new(false),
            state: Arc::clone(&self.state),
        }))
    }

    async fn resource_usage(&self) -> EngineResult<ResourceUsage> {
        Ok(ResourceUsage::default())
    }

    async fn died(&self) {
        self.death.cancelled().await;
    }
}

struct MockRouter {
    id: RouterId,
    caps: RtpCapabilities,
    closed: AtomicBool,
    state: Arc<MockState>,
}

#[async_trait]
impl RouterHandle for MockRouter {
    fn id(&self) -> RouterId {
        self.id.clone()
    }

    fn rtp_capabilities(&self) -> RtpCapabilities {
        self.caps.clone()
    }

    async fn create_transport(
        &self,
        _options: TransportOptions,
    ) -> EngineResult<Arc<dyn TransportHandle>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::Failed("router closed".into()));
        }
        Ok(Arc::new(MockTransport {
            id: TransportId::from(format!("transport_{}", nanoid!(8))),
            router_id: self.id.clone(),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            state: Arc::clone(&self.state),
        }))
    }

    fn can_consume(&self, producer_id: &ProducerId, caps: &RtpCapabilities) -> bool {
        if caps.0.get("incompatible").and_then(serde_json::Value::as_bool) == Some(true) {
            return false;
        }
        self.state
            .visible
            .lock()
            .get(&self.id)
            .is_some_and(|set| set.contains(producer_id))
    }

    async fn pipe_producer_to(
        &self,
        producer_id: &ProducerId,
        target: Arc<dyn RouterHandle>,
    ) -> EngineResult<()> {
        self.state.pipe_calls.fetch_add(1, Ordering::SeqCst);

        let target_id = target.id();
        let target_worker = self
            .state
            .router_workers
            .lock()
            .get(&target_id)
            .copied()
            .ok_or_else(|| EngineError::NotFound(format!("router {target_id}")))?;

        {
            let mut visible = self.state.visible.lock();
            let home_has_producer = visible
                .get(&self.id)
                .is_some_and(|set| set.contains(producer_id));
            if !home_has_producer {
                return Err(EngineError::NotFound(format!("producer {producer_id}")));
            }
            visible
                .entry(target_id)
                .or_default()
                .insert(producer_id.clone());
        }

        if !self
            .state
            .links
            .lock()
            .insert((producer_id.clone(), target_worker))
        {
            return Err(EngineError::LinkExists);
        }
        Ok(())
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.state.open_routers.fetch_sub(1, Ordering::SeqCst);
            self.state.visible.lock().remove(&self.id);
            self.state.router_workers.lock().remove(&self.id);
        }
    }
}

struct MockTransport {
    id: TransportId,
    router_id: RouterId,
    connected: AtomicBool,
    closed: AtomicBool,
    state: Arc<MockState>,
}

#[async_trait]
impl TransportHandle for MockTransport {
    fn id(&self) -> TransportId {
        self.id.clone()
    }

    fn connect_info(&self) -> TransportConnectInfo {
        TransportConnectInfo {
            id: self.id.clone(),
            ice_parameters: json!({ "usernameFragment": self.id.as_str() }),
            ice_candidates: json!([{ "ip": "127.0.0.1", "port": 3100 }]),
            dtls_parameters: json!({ "role": "auto" }),
        }
    }

    async fn connect(&self, _dtls: DtlsParameters) -> EngineResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::TransportClosed(self.id.to_string()));
        }
        *self
            .state
            .connect_calls
            .lock()
            .entry(self.id.clone())
            .or_insert(0) += 1;
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn produce(
        &self,
        kind: MediaKind,
        _rtp: RtpParameters,
        _stream_type: StreamType,
    ) -> EngineResult<Arc<dyn ProducerHandle>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::TransportClosed(self.id.to_string()));
        }
        let id = ProducerId::from(format!("producer_{}", nanoid!(8)));
        let closed = Arc::new(AtomicBool::new(false));
        self.state.producer_kinds.lock().insert(id.clone(), kind);
        self.state
            .producer_closed
            .lock()
            .insert(id.clone(), Arc::clone(&closed));
        self.state
            .visible
            .lock()
            .entry(self.router_id.clone())
            .or_default()
            .insert(id.clone());
        Ok(Arc::new(MockProducer {
            id,
            kind,
            closed,
            state: Arc::clone(&self.state),
        }))
    }

    async fn consume(
        &self,
        producer_id: &ProducerId,
        caps: RtpCapabilities,
    ) -> EngineResult<Arc<dyn ConsumerHandle>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::TransportClosed(self.id.to_string()));
        }
        if caps.0.get("incompatible").and_then(serde_json::Value::as_bool) == Some(true) {
            return Err(EngineError::Failed("incompatible capabilities".into()));
        }
        let visible = self
            .state
            .visible
            .lock()
            .get(&self.router_id)
            .is_some_and(|set| set.contains(producer_id));
        if !visible {
            return Err(EngineError::NotFound(format!("producer {producer_id}")));
        }

        let kind = self
            .state
            .producer_kinds
            .lock()
            .get(producer_id)
            .copied()
            .ok_or_else(|| EngineError::NotFound(format!("producer {producer_id}")))?;
        let simulcast =
            kind == MediaKind::Video && !self.state.non_simulcast.lock().contains(producer_id);

        let id = ConsumerId::from(format!("consumer_{}", nanoid!(8)));
        let closed = Arc::new(AtomicBool::new(false));
        self.state
            .consumer_closed
            .lock()
            .insert(id.clone(), Arc::clone(&closed));
        Ok(Arc::new(MockConsumer {
            id,
            kind,
            producer_id: producer_id.clone(),
            simulcast,
            closed,
            state: Arc::clone(&self.state),
        }))
    }

    async fn get_stats(&self) -> EngineResult<Vec<TransportStat>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::TransportClosed(self.id.to_string()));
        }
        match self.state.stats.lock().get(&self.id) {
            Some(StatsScript::Records(records)) => Ok(records.clone()),
            Some(StatsScript::Fail) => Err(EngineError::Failed("stats unavailable".into())),
            None => Ok(Vec::new()),
        }
    }

    fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

struct MockProducer {
    id: ProducerId,
    kind: MediaKind,
    closed: Arc<AtomicBool>,
    state: Arc<MockState>,
}

#[async_trait]
impl ProducerHandle for MockProducer {
    fn id(&self) -> ProducerId {
        self.id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        // A closed producer is no longer consumable anywhere.
        for set in self.state.visible.lock().values_mut() {
            set.remove(&self.id);
        }
    }
}

struct MockConsumer {
    id: ConsumerId,
    kind: MediaKind,
    producer_id: ProducerId,
    simulcast: bool,
    closed: Arc<AtomicBool>,
    state: Arc<MockState>,
}

#[async_trait]
impl ConsumerHandle for MockConsumer {
    fn id(&self) -> ConsumerId {
        self.id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> RtpParameters {
        RtpParameters(json!({
            "consumerId": self.id.as_str(),
            "producerId": self.producer_id.as_str(),
        }))
    }

    fn simulcast(&self) -> bool {
        self.simulcast
    }

    async fn set_preferred_layers(&self, layers: PreferredLayers) -> EngineResult<()> {
        if !self.simulcast {
            return Err(EngineError::LayersUnsupported);
        }
        self.state
            .layer_history
            .lock()
            .entry(self.id.clone())
            .or_default()
            .push(layers);
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
