//! Placement Policy: which worker a new producing participant lands on.
//!
//! The score for each worker is the sum over students already assigned
//! to it of `(producer_count + 1)`, plus the transports it hosts. The
//! `+1` makes a freshly joined student with no producers yet still
//! count as load, so bursts of joins spread instead of piling onto one
//! worker. Ties break to the lowest index, so placement is
//! deterministic.

use crate::room::RoomState;
use crate::types::{MemberId, Role};
use std::collections::HashMap;

/// Default worker for viewer (recv) transports when the caller does not
/// name the producer's home worker.
pub const DEFAULT_RECV_WORKER: usize = 0;

/// Per-worker load score for the producing side.
#[must_use]
pub fn worker_scores(state: &RoomState, worker_count: usize) -> Vec<usize> {
    let mut producer_counts: HashMap<&MemberId, usize> = HashMap::new();
    for record in state.producers.values() {
        *producer_counts.entry(&record.owner).or_insert(0) += 1;
    }

    let mut scores = vec![0usize; worker_count];

    for (member_id, member) in &state.members {
        if member.role != Role::Student {
            continue;
        }
        let Some(worker) = member.send_worker else {
            continue;
        };
        if let Some(slot) = scores.get_mut(worker) {
            *slot += producer_counts.get(member_id).copied().unwrap_or(0) + 1;
        }
    }

    for record in state.transports.values() {
        if let Some(slot) = scores.get_mut(record.worker_index) {
            *slot += 1;
        }
    }

    scores
}

/// Worker index for a new producing participant: minimum score, lowest
/// index on ties.
#[must_use]
pub fn pick_worker_for_producer(state: &RoomState, worker_count: usize) -> usize {
    let scores = worker_scores(state, worker_count);
    scores
        .iter()
        .enumerate()
        .min_by_key(|(index, score)| (**score, *index))
        .map_or(0, |(index, _)| index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::tests_support::{dummy_transport_handle, open_producer_handle};
    use crate::room::{ProducerRecord, RoomState, TransportRecord};
    use crate::types::{MediaKind, ProducerId, StreamType, TransportDirection, TransportId};

    fn empty_state() -> RoomState {
        // Ranking capacity is irrelevant here.
        RoomState::new(4)
    }

    fn add_student(state: &mut RoomState, name: &str, worker: usize, producers: usize) {
        let member = MemberId::from(name);
        state.add_member(member.clone(), Role::Student);
        state
            .members
            .get_mut(&member)
            .expect("member just added")
            .send_worker = Some(worker);
        for i in 0..producers {
            let id = ProducerId::from(format!("{name}-p{i}"));
            state.register_producer(
                id.clone(),
                ProducerRecord {
                    owner: member.clone(),
                    kind: MediaKind::Video,
                    stream_type: if i % 2 == 0 {
                        StreamType::Camera
                    } else {
                        StreamType::Screen
                    },
                    worker_index: worker,
                    handle: open_producer_handle(id.as_str()),
                },
            );
        }
    }

    #[test]
    fn empty_room_picks_worker_zero() {
        let state = empty_state();
        assert_eq!(pick_worker_for_producer(&state, 3), 0);
    }

    #[test]
    fn min_score_wins_with_lowest_index_tie_break() {
        let mut state = empty_state();
        // Worker 0 carries three students, workers 1 and 2 one each:
        // scores [3, 1, 1] (one point per producer-less student).
        add_student(&mut state, "a", 0, 0);
        add_student(&mut state, "b", 0, 0);
        add_student(&mut state, "c", 0, 0);
        add_student(&mut state, "d", 1, 0);
        add_student(&mut state, "e", 2, 0);

        assert_eq!(worker_scores(&state, 3), vec![3, 1, 1]);
        assert_eq!(pick_worker_for_producer(&state, 3), 1);
    }

    #[test]
    fn producers_and_transports_add_load() {
        let mut state = empty_state();
        add_student(&mut state, "a", 0, 2); // score 0: 2 + 1 = 3
        add_student(&mut state, "b", 1, 0); // score 1: 1
        state.register_transport(
            TransportId::from("t1"),
            TransportRecord {
                owner: MemberId::from("b"),
                worker_index: 1,
                direction: TransportDirection::Send,
                connected: false,
                handle: dummy_transport_handle("t1"),
            },
        );

        assert_eq!(worker_scores(&state, 2), vec![3, 2]);
        assert_eq!(pick_worker_for_producer(&state, 2), 1);
    }

    #[test]
    fn second_student_lands_on_other_worker() {
        let mut state = empty_state();
        // Student A placed on worker 0 with a transport there.
        add_student(&mut state, "a", 0, 0);
        state.register_transport(
            TransportId::from("ta"),
            TransportRecord {
                owner: MemberId::from("a"),
                worker_index: 0,
                direction: TransportDirection::Send,
                connected: true,
                handle: dummy_transport_handle("ta"),
            },
        );

        assert_eq!(pick_worker_for_producer(&state, 2), 1);
    }

    #[test]
    fn proctors_do_not_count_toward_load() {
        let mut state = empty_state();
        state.add_member(MemberId::from("p"), Role::Proctor);
        state
            .members
            .get_mut(&MemberId::from("p"))
            .expect("proctor")
            .send_worker = Some(0);
        add_student(&mut state, "a", 1, 0);

        // Worker 0 scores zero despite the proctor assignment.
        assert_eq!(worker_scores(&state, 2), vec![0, 1]);
        assert_eq!(pick_worker_for_producer(&state, 2), 0);
    }
}
