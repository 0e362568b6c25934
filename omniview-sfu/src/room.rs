//! Room State Store: the per-room aggregate of members, producers,
//! transports, consumers, pipes, the active-speaker ranking and network
//! samples.
//!
//! All entities are owned by their room and referenced by opaque ids;
//! nothing stores a back-reference to the room. The registries are
//! guarded by a synchronous lock that is never held across an await:
//! handlers snapshot or mutate, drop the guard, then call the engine,
//! and re-check on resume.

use crate::engine::{ConsumerHandle, ProducerHandle, TransportHandle};
use crate::qos::{AbrMachine, ActiveSpeakerRanking};
use crate::router::RouterRegistry;
use crate::types::{
    ConsumerId, MediaKind, MemberId, ProducerId, Role, RoomId, StreamType, TransportDirection,
    TransportId,
};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// One participant. Role is fixed at join and never changes.
#[derive(Debug, Clone)]
pub struct Member {
    pub role: Role,
    /// Worker this member's producing transport was placed on. Set on
    /// first send-transport creation, used by the placement score.
    pub send_worker: Option<usize>,
}

pub struct ProducerRecord {
    pub owner: MemberId,
    pub kind: MediaKind,
    pub stream_type: StreamType,
    pub worker_index: usize,
    pub handle: Arc<dyn ProducerHandle>,
}

pub struct TransportRecord {
    pub owner: MemberId,
    pub worker_index: usize,
    pub direction: TransportDirection,
    /// One-way latch: once connected, stays connected until closed.
    pub connected: bool,
    pub handle: Arc<dyn TransportHandle>,
}

pub struct ConsumerRecord {
    pub viewer: MemberId,
    pub viewer_role: Role,
    pub producer_id: ProducerId,
    pub transport_id: TransportId,
    pub kind: MediaKind,
    pub handle: Arc<dyn ConsumerHandle>,
}

/// Latest network measurement for one member; overwritten every
/// monitoring tick.
#[derive(Debug, Clone)]
pub struct NetworkSample {
    pub rtt_ms: u32,
    pub loss_rate: f64,
    pub timestamp: DateTime<Utc>,
}

/// The mutable registries of one room.
pub struct RoomState {
    pub members: HashMap<MemberId, Member>,
    pub producers: HashMap<ProducerId, ProducerRecord>,
    pub transports: HashMap<TransportId, TransportRecord>,
    pub consumers: HashMap<ConsumerId, ConsumerRecord>,
    /// `(producer, target_worker)` pairs with an established
    /// forwarding link.
    pub pipes: HashSet<(ProducerId, usize)>,
    pub ranking: ActiveSpeakerRanking,
    pub samples: HashMap<MemberId, NetworkSample>,
    /// Adaptive-bitrate machine per video producer.
    pub abr: HashMap<ProducerId, AbrMachine>,
    /// Viewer transport cache: a viewer gets at most one recv transport
    /// per worker.
    recv_transports: HashMap<(MemberId, usize), TransportId>,
}

impl RoomState {
    pub(crate) fn new(max_active_speakers: usize) -> Self {
        Self {
            members: HashMap::new(),
            producers: HashMap::new(),
            transports: HashMap::new(),
            consumers: HashMap::new(),
            pipes: HashSet::new(),
            ranking: ActiveSpeakerRanking::new(max_active_speakers),
            samples: HashMap::new(),
            abr: HashMap::new(),
            recv_transports: HashMap::new(),
        }
    }

    /// Register a member; false when the member already exists.
    pub fn add_member(&mut self, id: MemberId, role: Role) -> bool {
        if self.members.contains_key(&id) {
            return false;
        }
        self.members.insert(
            id,
            Member {
                role,
                send_worker: None,
            },
        );
        true
    }

    pub fn member(&self, id: &MemberId) -> Option<&Member> {
        self.members.get(id)
    }

    pub fn member_role(&self, id: &MemberId) -> Option<Role> {
        self.members.get(id).map(|m| m.role)
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn role_count(&self, role: Role) -> usize {
        self.members.values().filter(|m| m.role == role).count()
    }

    /// Register a producer, enforcing at most one open producer per
    /// `(owner, kind, stream_type)`. Returns the displaced record so
    /// the caller can close its engine handle and dependent consumers.
    pub fn register_producer(&mut self, id: ProducerId, record: ProducerRecord) -> Option<ProducerRecord> {
        let displaced_id = self
            .producers
            .iter()
            .find(|(_, existing)| {
                existing.owner == record.owner
                    && existing.kind == record.kind
                    && existing.stream_type == record.stream_type
            })
            .map(|(existing_id, _)| existing_id.clone());

        let displaced = displaced_id.and_then(|existing_id| self.remove_producer(&existing_id));
        self.producers.insert(id, record);
        displaced
    }

    /// Remove one producer and its pipe records and ABR machine.
    pub fn remove_producer(&mut self, id: &ProducerId) -> Option<ProducerRecord> {
        self.pipes.retain(|(producer_id, _)| producer_id != id);
        self.abr.remove(id);
        self.producers.remove(id)
    }

    /// Remove every producer owned by `member`.
    pub fn remove_producers_of(&mut self, member: &MemberId) -> Vec<(ProducerId, ProducerRecord)> {
        let ids: Vec<ProducerId> = self
            .producers
            .iter()
            .filter(|(_, record)| &record.owner == member)
            .map(|(id, _)| id.clone())
            .collect();
        ids.into_iter()
            .filter_map(|id| self.remove_producer(&id).map(|record| (id, record)))
            .collect()
    }

    pub fn register_transport(&mut self, id: TransportId, record: TransportRecord) {
        if record.direction == TransportDirection::Recv {
            self.recv_transports
                .insert((record.owner.clone(), record.worker_index), id.clone());
        }
        self.transports.insert(id, record);
    }

    /// Latch a transport as connected; false when it already was.
    pub fn mark_connected(&mut self, id: &TransportId) -> Option<bool> {
        let record = self.transports.get_mut(id)?;
        if record.connected {
            Some(false)
        } else {
            record.connected = true;
            Some(true)
        }
    }

    /// Cached recv transport for `(viewer, worker)`, if still registered.
    pub fn cached_recv_transport(&self, viewer: &MemberId, worker_index: usize) -> Option<&TransportRecord> {
        let id = self.recv_transports.get(&(viewer.clone(), worker_index))?;
        self.transports.get(id)
    }

    pub fn remove_transport(&mut self, id: &TransportId) -> Option<TransportRecord> {
        let record = self.transports.remove(id)?;
        self.recv_transports
            .retain(|_, cached| cached != id);
        Some(record)
    }

    pub fn remove_transports_of(&mut self, member: &MemberId) -> Vec<(TransportId, TransportRecord)> {
        let ids: Vec<TransportId> = self
            .transports
            .iter()
            .filter(|(_, record)| &record.owner == member)
            .map(|(id, _)| id.clone())
            .collect();
        ids.into_iter()
            .filter_map(|id| self.remove_transport(&id).map(|record| (id, record)))
            .collect()
    }

    pub fn register_consumer(&mut self, id: ConsumerId, record: ConsumerRecord) {
        self.consumers.insert(id, record);
    }

    pub fn remove_consumers_of_producer(&mut self, producer_id: &ProducerId) -> Vec<(ConsumerId, ConsumerRecord)> {
        let ids: Vec<ConsumerId> = self
            .consumers
            .iter()
            .filter(|(_, record)| &record.producer_id == producer_id)
            .map(|(id, _)| id.clone())
            .collect();
        ids.into_iter()
            .filter_map(|id| self.consumers.remove(&id).map(|record| (id, record)))
            .collect()
    }

    pub fn remove_consumers_of_member(&mut self, member: &MemberId) -> Vec<(ConsumerId, ConsumerRecord)> {
        let ids: Vec<ConsumerId> = self
            .consumers
            .iter()
            .filter(|(_, record)| &record.viewer == member)
            .map(|(id, _)| id.clone())
            .collect();
        ids.into_iter()
            .filter_map(|id| self.consumers.remove(&id).map(|record| (id, record)))
            .collect()
    }

    pub fn remove_consumers_on_transport(&mut self, transport_id: &TransportId) -> Vec<(ConsumerId, ConsumerRecord)> {
        let ids: Vec<ConsumerId> = self
            .consumers
            .iter()
            .filter(|(_, record)| &record.transport_id == transport_id)
            .map(|(id, _)| id.clone())
            .collect();
        ids.into_iter()
            .filter_map(|id| self.consumers.remove(&id).map(|record| (id, record)))
            .collect()
    }

    /// Record a pipe; false when one already exists for this key.
    pub fn record_pipe(&mut self, producer_id: ProducerId, target_worker: usize) -> bool {
        self.pipes.insert((producer_id, target_worker))
    }

    pub fn has_pipe(&self, producer_id: &ProducerId, target_worker: usize) -> bool {
        self.pipes.contains(&(producer_id.clone(), target_worker))
    }

    /// Tear down every trace of a member. Returns the member record.
    pub fn purge_member(&mut self, member: &MemberId) -> Option<Member> {
        self.samples.remove(member);
        self.ranking.remove(member);
        self.members.remove(member)
    }

    /// Open producers per worker index, for stats and diagnostics.
    pub fn producers_per_worker(&self, worker_count: usize) -> Vec<usize> {
        let mut counts = vec![0; worker_count];
        for record in self.producers.values() {
            if let Some(slot) = counts.get_mut(record.worker_index) {
                *slot += 1;
            }
        }
        counts
    }

    pub fn transports_per_worker(&self, worker_count: usize) -> Vec<usize> {
        let mut counts = vec![0; worker_count];
        for record in self.transports.values() {
            if let Some(slot) = counts.get_mut(record.worker_index) {
                *slot += 1;
            }
        }
        counts
    }
}

/// One room: registries plus its router registry and monitor handle.
pub struct Room {
    pub id: RoomId,
    state: RwLock<RoomState>,
    pub routers: RouterRegistry,
    monitor: Mutex<Option<CancellationToken>>,
}

impl Room {
    pub fn new(id: RoomId, routers: RouterRegistry, max_active_speakers: usize) -> Self {
        Self {
            id,
            state: RwLock::new(RoomState::new(max_active_speakers)),
            routers,
            monitor: Mutex::new(None),
        }
    }

    pub fn state(&self) -> RwLockReadGuard<'_, RoomState> {
        self.state.read()
    }

    pub fn state_mut(&self) -> RwLockWriteGuard<'_, RoomState> {
        self.state.write()
    }

    /// Install the monitor's cancellation token; false when a monitor
    /// is already running.
    pub fn install_monitor(&self, token: CancellationToken) -> bool {
        let mut monitor = self.monitor.lock();
        if monitor.is_some() {
            return false;
        }
        *monitor = Some(token);
        true
    }

    pub fn monitor_running(&self) -> bool {
        self.monitor.lock().is_some()
    }

    /// Take the monitor token for cancellation. Taking clears the slot,
    /// so teardown cancels at most once.
    pub fn take_monitor(&self) -> Option<CancellationToken> {
        self.monitor.lock().take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::tests_support::{closed_producer_handle, open_producer_handle};

    fn state() -> RoomState {
        RoomState::new(4)
    }

    #[test]
    fn member_registration_is_idempotent() {
        let mut state = state();
        let alice = MemberId::from("alice");
        assert!(state.add_member(alice.clone(), Role::Student));
        assert!(!state.add_member(alice.clone(), Role::Proctor));
        // First registration wins, including the role.
        assert_eq!(state.member_role(&alice), Some(Role::Student));
    }

    #[test]
    fn producer_replacement_per_member_kind_and_stream() {
        let mut state = state();
        let alice = MemberId::from("alice");

        let first_id = ProducerId::from("p1");
        let displaced = state.register_producer(
            first_id.clone(),
            ProducerRecord {
                owner: alice.clone(),
                kind: MediaKind::Video,
                stream_type: StreamType::Camera,
                worker_index: 0,
                handle: open_producer_handle("p1"),
            },
        );
        assert!(displaced.is_none());

        // Same key: the first producer is displaced.
        let displaced = state.register_producer(
            ProducerId::from("p2"),
            ProducerRecord {
                owner: alice.clone(),
                kind: MediaKind::Video,
                stream_type: StreamType::Camera,
                worker_index: 0,
                handle: open_producer_handle("p2"),
            },
        );
        assert!(displaced.is_some());
        assert!(!state.producers.contains_key(&first_id));

        // Different stream type: coexists.
        let displaced = state.register_producer(
            ProducerId::from("p3"),
            ProducerRecord {
                owner: alice,
                kind: MediaKind::Video,
                stream_type: StreamType::Screen,
                worker_index: 0,
                handle: open_producer_handle("p3"),
            },
        );
        assert!(displaced.is_none());
        assert_eq!(state.producers.len(), 2);
    }

    #[test]
    fn removing_producer_drops_its_pipes() {
        let mut state = state();
        let producer = ProducerId::from("p1");
        state.register_producer(
            producer.clone(),
            ProducerRecord {
                owner: MemberId::from("alice"),
                kind: MediaKind::Video,
                stream_type: StreamType::Camera,
                worker_index: 0,
                handle: closed_producer_handle("p1"),
            },
        );
        assert!(state.record_pipe(producer.clone(), 1));
        assert!(!state.record_pipe(producer.clone(), 1));
        assert!(state.has_pipe(&producer, 1));

        state.remove_producer(&producer);
        assert!(!state.has_pipe(&producer, 1));
    }

    #[test]
    fn monitor_installs_once_and_cancels_once() {
        let room = Room::new(
            RoomId::from("r1"),
            RouterRegistry::new(
                crate::worker_pool::WorkerPool::with_fatal_handler(
                    crate::mock::MockEngine::new(),
                    std::sync::Arc::new(|_, _| {}),
                ),
                Vec::new(),
            ),
            4,
        );
        assert!(room.install_monitor(CancellationToken::new()));
        assert!(!room.install_monitor(CancellationToken::new()));
        assert!(room.take_monitor().is_some());
        assert!(room.take_monitor().is_none());
    }
}
