//! Session Lifecycle Manager: the request surface of the orchestration
//! core.
//!
//! Every handler follows the same lock discipline: snapshot or mutate
//! room state under the synchronous guard, drop the guard, call the
//! engine, then re-check on resume. A member who left while an engine
//! call was in flight gets their freshly created resource closed
//! instead of registered.

use crate::config::Config;
use crate::engine::{
    DtlsParameters, RtpCapabilities, RtpParameters, TransportOptions,
};
use crate::error::{Error, Result};
use crate::monitor::spawn_monitor;
use crate::pipe::ensure_pipe;
use crate::placement::{pick_worker_for_producer, DEFAULT_RECV_WORKER};
use crate::qos::select_video_layers;
use crate::room::{ConsumerRecord, ProducerRecord, Room, TransportRecord};
use crate::router::RouterRegistry;
use crate::signal::{
    ConsumeAck, MemberNetworkReport, ProduceAck, ProducerInfo, RoomStatsAck, SignalEvent,
    SignalSink, TransportAck,
};
use crate::types::{
    MediaKind, MemberId, ProducerId, Role, RoomId, StreamType, TransportDirection, TransportId,
};
use crate::worker_pool::WorkerPool;
use dashmap::DashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Room orchestration entry point. One instance serves every room.
pub struct SessionManager {
    pool: Arc<WorkerPool>,
    config: Config,
    signal: Arc<dyn SignalSink>,
    rooms: DashMap<RoomId, Arc<Room>>,
}

impl SessionManager {
    pub fn new(pool: Arc<WorkerPool>, config: Config, signal: Arc<dyn SignalSink>) -> Arc<Self> {
        Arc::new(Self {
            pool,
            config,
            signal,
            rooms: DashMap::new(),
        })
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn room(&self, id: &RoomId) -> Result<Arc<Room>> {
        self.rooms
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| Error::NotFound(format!("room {id}")))
    }

    fn get_or_create_room(&self, id: &RoomId) -> Arc<Room> {
        Arc::clone(
            self.rooms
                .entry(id.clone())
                .or_insert_with(|| {
                    info!(room = %id, "room created");
                    Arc::new(Room::new(
                        id.clone(),
                        RouterRegistry::new(
                            Arc::clone(&self.pool),
                            self.config.router.media_codecs.clone(),
                        ),
                        self.config.qos.max_active_student_streams,
                    ))
                })
                .value(),
        )
    }

    /// Join `member` to `room_id`. Duplicate joins replay the router
    /// capabilities and the already-assigned role instead of failing.
    pub async fn join(
        &self,
        room_id: &RoomId,
        member: &MemberId,
        requested_role: Option<&str>,
    ) -> Result<Role> {
        if !self.pool.is_ready() {
            return Err(Error::NotReady);
        }
        let requested = Role::from_request(requested_role);

        // Register before the first suspension point: a room holding a
        // registered member cannot be torn down underneath us. If the
        // last member left between map lookup and registration, scrub
        // the orphan and start over on a fresh room.
        let (room, role, fresh) = loop {
            let room = self.get_or_create_room(room_id);
            let (role, fresh) = {
                let mut state = room.state_mut();
                match state.member_role(member) {
                    // First registration wins, including the role.
                    Some(existing) => (existing, false),
                    None => {
                        state.add_member(member.clone(), requested);
                        (requested, true)
                    }
                }
            };
            let still_current = self
                .rooms
                .get(room_id)
                .is_some_and(|entry| Arc::ptr_eq(entry.value(), &room));
            if still_current {
                break (room, role, fresh);
            }
            room.state_mut().purge_member(member);
        };

        let caps = self.room_capabilities(&room).await?;

        self.signal.emit(member, SignalEvent::Rtp(caps));
        self.signal.emit(member, SignalEvent::Role(role));

        if fresh {
            info!(room = %room_id, member = %member, ?role, "member joined");
            if role == Role::Student {
                self.start_monitor(&room);
            }
        } else {
            debug!(room = %room_id, member = %member, "duplicate join replayed");
        }
        Ok(role)
    }

    async fn room_capabilities(&self, room: &Arc<Room>) -> Result<RtpCapabilities> {
        let router = match room.routers.any().await {
            Some(router) => router,
            None => room.routers.get_or_create(DEFAULT_RECV_WORKER).await?,
        };
        Ok(router.rtp_capabilities())
    }

    fn start_monitor(&self, room: &Arc<Room>) {
        let token = CancellationToken::new();
        if room.install_monitor(token.clone()) {
            spawn_monitor(Arc::clone(room), self.config.monitoring.clone(), token);
        }
    }

    /// Create a WebRTC transport for `member`.
    ///
    /// Send transports are placed by the Placement Policy and pin the
    /// member's send worker. Recv transports go to the requested worker
    /// (default 0) and are cached per `(member, worker)`; a repeat
    /// request replays the existing connection parameters.
    pub async fn create_transport(
        &self,
        room_id: &RoomId,
        member: &MemberId,
        direction: TransportDirection,
        worker_index: Option<usize>,
    ) -> Result<TransportAck> {
        let room = self.room(room_id)?;
        let worker_count = self.pool.count();

        let (role, worker) = {
            let state = room.state();
            let record = state
                .member(member)
                .ok_or_else(|| Error::NotFound(format!("member {member}")))?;

            let worker = match direction {
                TransportDirection::Send => match record.send_worker {
                    Some(pinned) => pinned,
                    None => pick_worker_for_producer(&state, worker_count),
                },
                TransportDirection::Recv => {
                    let worker = worker_index.unwrap_or(DEFAULT_RECV_WORKER);
                    if worker >= worker_count {
                        return Err(Error::InvalidInput(format!(
                            "worker index {worker} out of range (pool size {worker_count})"
                        )));
                    }
                    if let Some(cached) = state.cached_recv_transport(member, worker) {
                        debug!(room = %room_id, member = %member, worker, "recv transport reused");
                        return Ok(transport_ack(cached.handle.connect_info(), worker));
                    }
                    worker
                }
            };
            (record.role, worker)
        };

        let bitrate = match role {
            Role::Proctor => self.config.transport.proctor_initial_outgoing_bitrate,
            Role::Student => self.config.transport.initial_outgoing_bitrate,
        };

        let router = room.routers.get_or_create(worker).await?;
        let transport = router
            .create_transport(TransportOptions {
                initial_outgoing_bitrate: bitrate,
            })
            .await?;
        let info = transport.connect_info();
        let transport_id = transport.id();

        let registered = {
            let mut state = room.state_mut();
            if state.member(member).is_some() {
                if direction == TransportDirection::Send {
                    if let Some(record) = state.members.get_mut(member) {
                        record.send_worker = Some(worker);
                    }
                }
                state.register_transport(
                    transport_id.clone(),
                    TransportRecord {
                        owner: member.clone(),
                        worker_index: worker,
                        direction,
                        connected: false,
                        handle: Arc::clone(&transport),
                    },
                );
                true
            } else {
                false
            }
        };
        if !registered {
            // Member left while the engine call was in flight.
            transport.close().await;
            return Err(Error::NotFound(format!("member {member}")));
        }

        debug!(
            room = %room_id,
            member = %member,
            transport = %transport_id,
            worker,
            ?direction,
            "transport created"
        );
        Ok(transport_ack(info, worker))
    }

    /// Finish the DTLS handshake. A transport that already connected
    /// short-circuits to success without re-issuing the engine call.
    pub async fn connect_transport(
        &self,
        room_id: &RoomId,
        member: &MemberId,
        transport_id: &TransportId,
        dtls: DtlsParameters,
    ) -> Result<()> {
        let room = self.room(room_id)?;

        let handle = {
            let state = room.state();
            let record = state
                .transports
                .get(transport_id)
                .ok_or_else(|| Error::NotFound(format!("transport {transport_id}")))?;
            if &record.owner != member {
                return Err(Error::PermissionDenied(format!(
                    "transport {transport_id} belongs to another member"
                )));
            }
            if record.connected {
                debug!(room = %room_id, transport = %transport_id, "already connected");
                return Ok(());
            }
            Arc::clone(&record.handle)
        };

        handle.connect(dtls).await?;
        room.state_mut().mark_connected(transport_id);
        Ok(())
    }

    /// Publish a media stream on a send transport. At most one open
    /// producer per `(member, kind, stream_type)`: a duplicate key
    /// closes the predecessor and its consumers.
    pub async fn produce(
        &self,
        room_id: &RoomId,
        member: &MemberId,
        transport_id: &TransportId,
        kind: MediaKind,
        rtp: RtpParameters,
        stream_type: StreamType,
    ) -> Result<ProduceAck> {
        let room = self.room(room_id)?;

        let (handle, worker, role) = {
            let state = room.state();
            let record = state
                .transports
                .get(transport_id)
                .ok_or_else(|| Error::NotFound(format!("transport {transport_id}")))?;
            if &record.owner != member {
                return Err(Error::PermissionDenied(format!(
                    "transport {transport_id} belongs to another member"
                )));
            }
            let role = state
                .member_role(member)
                .ok_or_else(|| Error::NotFound(format!("member {member}")))?;
            (Arc::clone(&record.handle), record.worker_index, role)
        };

        let producer = handle.produce(kind, rtp, stream_type).await?;
        let producer_id = producer.id();

        enum Registered {
            Gone,
            Ok {
                displaced: Option<ProducerRecord>,
                displaced_consumers: Vec<ConsumerRecord>,
                closed_events: Vec<(MemberId, SignalEvent)>,
            },
        }

        let registered = {
            let mut state = room.state_mut();
            if state.member(member).is_none() {
                Registered::Gone
            } else {
                let displaced = state.register_producer(
                    producer_id.clone(),
                    ProducerRecord {
                        owner: member.clone(),
                        kind,
                        stream_type,
                        worker_index: worker,
                        handle: Arc::clone(&producer),
                    },
                );
                let (displaced_consumers, closed_events) = match &displaced {
                    Some(old) => {
                        let old_id = old.handle.id();
                        let removed = state.remove_consumers_of_producer(&old_id);
                        let events = removed
                            .iter()
                            .map(|(consumer_id, record)| {
                                (
                                    record.viewer.clone(),
                                    SignalEvent::ConsumerClosed {
                                        consumer_id: consumer_id.clone(),
                                        producer_id: old_id.clone(),
                                    },
                                )
                            })
                            .collect();
                        (removed.into_iter().map(|(_, r)| r).collect(), events)
                    }
                    None => (Vec::new(), Vec::new()),
                };
                Registered::Ok {
                    displaced,
                    displaced_consumers,
                    closed_events,
                }
            }
        };

        match registered {
            Registered::Gone => {
                // Member left while the engine call was in flight.
                producer.close().await;
                Err(Error::NotFound(format!("member {member}")))
            }
            Registered::Ok {
                displaced,
                displaced_consumers,
                closed_events,
            } => {
                if let Some(old) = displaced {
                    info!(
                        room = %room_id,
                        member = %member,
                        ?kind,
                        ?stream_type,
                        "producer replaced"
                    );
                    old.handle.close().await;
                }
                for record in displaced_consumers {
                    record.handle.close().await;
                }
                for (viewer, event) in closed_events {
                    self.signal.emit(&viewer, event);
                }

                self.signal.broadcast_except(
                    room_id,
                    member,
                    SignalEvent::NewProducer(ProducerInfo {
                        producer_id: producer_id.clone(),
                        member_id: member.clone(),
                        kind,
                        stream_type,
                        owner_role: role,
                        worker_index: worker,
                    }),
                );
                info!(
                    room = %room_id,
                    member = %member,
                    producer = %producer_id,
                    ?kind,
                    ?stream_type,
                    worker,
                    "producer created"
                );
                Ok(ProduceAck { id: producer_id })
            }
        }
    }

    /// Subscribe `viewer`'s recv transport to a producer, piping the
    /// producer across workers first when needed. Layer preferences are
    /// applied best-effort; a non-layered producer is left as is.
    pub async fn consume(
        &self,
        room_id: &RoomId,
        viewer: &MemberId,
        transport_id: &TransportId,
        producer_id: &ProducerId,
        caps: RtpCapabilities,
    ) -> Result<ConsumeAck> {
        let room = self.room(room_id)?;

        let (transport, viewer_worker, viewer_role, producer_worker, owner, kind) = {
            let state = room.state();
            let viewer_role = state
                .member_role(viewer)
                .ok_or_else(|| Error::NotFound(format!("member {viewer}")))?;
            let transport_record = state
                .transports
                .get(transport_id)
                .ok_or_else(|| Error::NotFound(format!("transport {transport_id}")))?;
            if &transport_record.owner != viewer {
                return Err(Error::PermissionDenied(format!(
                    "transport {transport_id} belongs to another member"
                )));
            }
            let producer_record = state
                .producers
                .get(producer_id)
                .ok_or_else(|| Error::NotFound(format!("producer {producer_id}")))?;
            (
                Arc::clone(&transport_record.handle),
                transport_record.worker_index,
                viewer_role,
                producer_record.worker_index,
                producer_record.owner.clone(),
                producer_record.kind,
            )
        };

        ensure_pipe(&room, producer_id, producer_worker, viewer_worker).await?;

        let router = room.routers.get_or_create(viewer_worker).await?;
        if !router.can_consume(producer_id, &caps) {
            return Err(Error::IncompatibleCapabilities(format!(
                "cannot consume producer {producer_id}"
            )));
        }

        let consumer = transport.consume(producer_id, caps).await?;
        let consumer_id = consumer.id();

        if kind == MediaKind::Video {
            let (active, at_capacity) = {
                let state = room.state();
                (state.ranking.contains(&owner), state.ranking.at_capacity())
            };
            let layers = select_video_layers(viewer_role, active, at_capacity);
            if let Err(err) = consumer.set_preferred_layers(layers).await {
                // Producer is not layered; keep the consumer as is.
                debug!(consumer = %consumer_id, error = %err, "layer preference skipped");
            }
        }

        let registered = {
            let mut state = room.state_mut();
            if state.member(viewer).is_some() {
                state.register_consumer(
                    consumer_id.clone(),
                    ConsumerRecord {
                        viewer: viewer.clone(),
                        viewer_role,
                        producer_id: producer_id.clone(),
                        transport_id: transport_id.clone(),
                        kind,
                        handle: Arc::clone(&consumer),
                    },
                );
                true
            } else {
                false
            }
        };
        if !registered {
            // Viewer left while the engine call was in flight.
            consumer.close().await;
            return Err(Error::NotFound(format!("member {viewer}")));
        }

        debug!(
            room = %room_id,
            viewer = %viewer,
            producer = %producer_id,
            consumer = %consumer_id,
            "consumer created"
        );
        Ok(ConsumeAck {
            id: consumer_id,
            producer_id: producer_id.clone(),
            kind,
            rtp_parameters: consumer.rtp_parameters(),
        })
    }

    /// Every open producer of other members, with enough metadata for
    /// the client to pick a transport near the producer's home worker.
    pub fn get_producers(&self, room_id: &RoomId, member: &MemberId) -> Result<Vec<ProducerInfo>> {
        let room = self.room(room_id)?;
        let state = room.state();
        if state.member(member).is_none() {
            return Err(Error::NotFound(format!("member {member}")));
        }
        Ok(state
            .producers
            .iter()
            .filter(|(_, record)| &record.owner != member)
            .map(|(id, record)| ProducerInfo {
                producer_id: id.clone(),
                member_id: record.owner.clone(),
                kind: record.kind,
                stream_type: record.stream_type,
                owner_role: state.member_role(&record.owner).unwrap_or(Role::Student),
                worker_index: record.worker_index,
            })
            .collect())
    }

    /// Aggregate room health, visible to proctors only.
    pub fn get_room_stats(&self, room_id: &RoomId, member: &MemberId) -> Result<RoomStatsAck> {
        let room = self.room(room_id)?;
        let worker_count = self.pool.count();
        let state = room.state();
        match state.member_role(member) {
            Some(Role::Proctor) => {}
            Some(Role::Student) => {
                return Err(Error::PermissionDenied(
                    "room stats are proctor-only".to_string(),
                ))
            }
            None => return Err(Error::NotFound(format!("member {member}"))),
        }

        Ok(RoomStatsAck {
            members: state.members.len(),
            students: state.role_count(Role::Student),
            proctors: state.role_count(Role::Proctor),
            producers: state.producers.len(),
            consumers: state.consumers.len(),
            active_speakers: state.ranking.members().to_vec(),
            network: state
                .samples
                .iter()
                .map(|(id, sample)| {
                    (
                        id.clone(),
                        MemberNetworkReport {
                            rtt_ms: sample.rtt_ms,
                            loss_rate: sample.loss_rate,
                        },
                    )
                })
                .collect(),
            producers_per_worker: state.producers_per_worker(worker_count),
            transports_per_worker: state.transports_per_worker(worker_count),
        })
    }

    /// Producer audio score report. A speaking student is promoted in
    /// the active-speaker ranking; scores at or below the threshold and
    /// non-students are ignored.
    pub fn audio_activity(&self, room_id: &RoomId, member: &MemberId, score: u8) -> Result<()> {
        let room = self.room(room_id)?;
        if score <= self.config.qos.audio_activity_threshold {
            return Ok(());
        }
        let mut state = room.state_mut();
        if state.member_role(member) == Some(Role::Student) {
            state.ranking.promote(member);
        }
        Ok(())
    }

    /// ICE/DTLS failure cascade: purge a transport and everything that
    /// depended on it.
    pub async fn on_transport_closed(&self, room_id: &RoomId, transport_id: &TransportId) -> Result<()> {
        let room = self.room(room_id)?;

        let (transport, producers, consumers, events) = {
            let mut state = room.state_mut();
            let Some(record) = state.remove_transport(transport_id) else {
                return Ok(());
            };

            let mut consumers = state.remove_consumers_on_transport(transport_id);
            let mut producers = Vec::new();
            if record.direction == TransportDirection::Send {
                // A send transport carries every stream its owner
                // publishes.
                for (producer_id, producer) in state.remove_producers_of(&record.owner) {
                    consumers.extend(state.remove_consumers_of_producer(&producer_id));
                    producers.push(producer);
                }
            }

            let events: Vec<(MemberId, SignalEvent)> = consumers
                .iter()
                .map(|(consumer_id, consumer)| {
                    (
                        consumer.viewer.clone(),
                        SignalEvent::ConsumerClosed {
                            consumer_id: consumer_id.clone(),
                            producer_id: consumer.producer_id.clone(),
                        },
                    )
                })
                .collect();

            (record.handle, producers, consumers, events)
        };

        warn!(
            room = %room_id,
            transport = %transport_id,
            producers = producers.len(),
            consumers = consumers.len(),
            "transport closed, cascading"
        );

        for (_, consumer) in consumers {
            consumer.handle.close().await;
        }
        for producer in producers {
            producer.handle.close().await;
        }
        transport.close().await;

        for (viewer, event) in events {
            self.signal.emit(&viewer, event);
        }
        Ok(())
    }

    /// Remove `member` from the room, closing everything they own and
    /// every consumer watching them. The last member out tears the room
    /// down: monitor cancelled, routers closed, room removed.
    pub async fn leave(&self, room_id: &RoomId, member: &MemberId) -> Result<()> {
        let room = self.room(room_id)?;

        let (producers, consumers, transports, events, last_out) = {
            let mut state = room.state_mut();
            if state.purge_member(member).is_none() {
                return Ok(());
            }

            let mut consumers = state.remove_consumers_of_member(member);
            let mut producers = Vec::new();
            for (producer_id, producer) in state.remove_producers_of(member) {
                consumers.extend(state.remove_consumers_of_producer(&producer_id));
                producers.push(producer);
            }
            let transports = state.remove_transports_of(member);

            // consumerClosed only reaches viewers who are still here.
            let events: Vec<(MemberId, SignalEvent)> = consumers
                .iter()
                .filter(|(_, consumer)| &consumer.viewer != member)
                .map(|(consumer_id, consumer)| {
                    (
                        consumer.viewer.clone(),
                        SignalEvent::ConsumerClosed {
                            consumer_id: consumer_id.clone(),
                            producer_id: consumer.producer_id.clone(),
                        },
                    )
                })
                .collect();

            (producers, consumers, transports, events, state.is_empty())
        };

        for (_, consumer) in consumers {
            consumer.handle.close().await;
        }
        for producer in producers {
            producer.handle.close().await;
        }
        for (_, transport) in transports {
            transport.handle.close().await;
        }

        for (viewer, event) in events {
            self.signal.emit(&viewer, event);
        }
        self.signal
            .broadcast_except(room_id, member, SignalEvent::MemberLeft(member.clone()));
        info!(room = %room_id, member = %member, "member left");

        if last_out {
            // A join may have registered a member since we looked:
            // remove only if this exact room is still current and still
            // empty, and tear down only what was actually removed.
            let removed = self
                .rooms
                .remove_if(room_id, |_, candidate| {
                    Arc::ptr_eq(candidate, &room) && candidate.state().is_empty()
                })
                .is_some();
            if removed {
                if let Some(token) = room.take_monitor() {
                    token.cancel();
                }
                room.routers.close_all().await;
                info!(room = %room_id, "room torn down");
            }
        }
        Ok(())
    }
}

fn transport_ack(info: crate::engine::TransportConnectInfo, worker_index: usize) -> TransportAck {
    TransportAck {
        id: info.id,
        ice_parameters: info.ice_parameters,
        ice_candidates: info.ice_candidates,
        dtls_parameters: info.dtls_parameters,
        worker_index,
    }
}
