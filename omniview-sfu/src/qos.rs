//! QoS policy: stream priorities, role-based layer selection,
//! active-speaker gating, and the per-producer adaptive-bitrate machine.
//!
//! The one rule everything here bends around is proctor-first: no
//! bandwidth-saving measure may reduce what a proctor receives. Only
//! student-bound (peer) layers are ever degraded.

use crate::types::{MediaKind, MemberId, Role, StreamType};
use crate::engine::PreferredLayers;
use serde::{Deserialize, Serialize};

/// Degradation order under pressure. Lower value degrades last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamPriority {
    Audio = 0,
    ProctorVideo = 1,
    StudentVideo = 2,
    ScreenShare = 3,
    Data = 4,
}

impl StreamPriority {
    /// Classify a stream by what it carries and who it is bound for.
    #[must_use]
    pub const fn classify(kind: MediaKind, stream_type: StreamType, bound_for: Role) -> Self {
        match (kind, stream_type) {
            (MediaKind::Audio, _) => Self::Audio,
            (MediaKind::Video, StreamType::Screen) => Self::ScreenShare,
            (MediaKind::Video, StreamType::Camera) => match bound_for {
                Role::Proctor => Self::ProctorVideo,
                Role::Student => Self::StudentVideo,
            },
        }
    }

    /// Whether this tier may lose layers when a peer uplink degrades.
    /// Audio and proctor video sit below the cut and are never touched.
    #[must_use]
    pub const fn is_peer_degradable(self) -> bool {
        matches!(self, Self::StudentVideo | Self::ScreenShare | Self::Data)
    }
}

/// Highest simulcast layer: full spatial and temporal resolution.
pub const LAYERS_HIGHEST: PreferredLayers = PreferredLayers {
    spatial: 2,
    temporal: 2,
};

/// Student default: lowest spatial layer, medium temporal.
pub const LAYERS_STUDENT: PreferredLayers = PreferredLayers {
    spatial: 0,
    temporal: 1,
};

/// Floor for gated and degraded streams.
pub const LAYERS_MINIMUM: PreferredLayers = PreferredLayers {
    spatial: 0,
    temporal: 0,
};

/// Pick the layers a viewer gets for a video consumer.
///
/// Proctors always get the highest layer. Students get the low layer,
/// forced to the minimum when the producing member is not an active
/// speaker and the ranking is already full. Audio is never gated; this
/// function is only consulted for video.
#[must_use]
pub fn select_video_layers(
    viewer_role: Role,
    owner_is_active_speaker: bool,
    ranking_at_capacity: bool,
) -> PreferredLayers {
    match viewer_role {
        Role::Proctor => LAYERS_HIGHEST,
        Role::Student => {
            if !owner_is_active_speaker && ranking_at_capacity {
                LAYERS_MINIMUM
            } else {
                LAYERS_STUDENT
            }
        }
    }
}

/// Bounded most-recently-active ranking of speaking members.
#[derive(Debug, Clone)]
pub struct ActiveSpeakerRanking {
    order: Vec<MemberId>,
    capacity: usize,
}

impl ActiveSpeakerRanking {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            order: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Move `member` to the front, truncating to capacity.
    pub fn promote(&mut self, member: &MemberId) {
        self.order.retain(|m| m != member);
        self.order.insert(0, member.clone());
        self.order.truncate(self.capacity);
    }

    pub fn remove(&mut self, member: &MemberId) {
        self.order.retain(|m| m != member);
    }

    #[must_use]
    pub fn contains(&self, member: &MemberId) -> bool {
        self.order.iter().any(|m| m == member)
    }

    #[must_use]
    pub fn at_capacity(&self) -> bool {
        self.order.len() >= self.capacity
    }

    #[must_use]
    pub fn members(&self) -> &[MemberId] {
        &self.order
    }
}

/// Adaptive-bitrate state for one video producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbrState {
    Nominal,
    Degraded,
}

/// State-machine output: what the caller must apply to the producer's
/// student-bound consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbrTransition {
    /// Reduce the peer-bound layer to the floor.
    Degrade,
    /// Restore the peer-bound layer to the role default.
    Recover,
}

/// Hysteresis machine: loss above `degrade_threshold` degrades, loss
/// below `recover_threshold` recovers, samples in between change
/// nothing. Instantaneous samples, no smoothing.
#[derive(Debug, Clone)]
pub struct AbrMachine {
    state: AbrState,
    degrade_threshold: f64,
    recover_threshold: f64,
}

impl AbrMachine {
    #[must_use]
    pub fn new(degrade_threshold: f64, recover_threshold: f64) -> Self {
        Self {
            state: AbrState::Nominal,
            degrade_threshold,
            recover_threshold,
        }
    }

    #[must_use]
    pub const fn state(&self) -> AbrState {
        self.state
    }

    /// Feed one loss-rate sample; returns the transition to apply, if any.
    pub fn observe(&mut self, loss_rate: f64) -> Option<AbrTransition> {
        match self.state {
            AbrState::Nominal if loss_rate > self.degrade_threshold => {
                self.state = AbrState::Degraded;
                Some(AbrTransition::Degrade)
            }
            AbrState::Degraded if loss_rate < self.recover_threshold => {
                self.state = AbrState::Nominal;
                Some(AbrTransition::Recover)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_ladder_orders_streams() {
        assert!(StreamPriority::Audio < StreamPriority::ProctorVideo);
        assert!(StreamPriority::ProctorVideo < StreamPriority::StudentVideo);
        assert!(StreamPriority::StudentVideo < StreamPriority::ScreenShare);
        assert!(StreamPriority::ScreenShare < StreamPriority::Data);
    }

    #[test]
    fn classify_by_kind_type_and_destination() {
        assert_eq!(
            StreamPriority::classify(MediaKind::Audio, StreamType::Camera, Role::Student),
            StreamPriority::Audio
        );
        assert_eq!(
            StreamPriority::classify(MediaKind::Video, StreamType::Camera, Role::Proctor),
            StreamPriority::ProctorVideo
        );
        assert_eq!(
            StreamPriority::classify(MediaKind::Video, StreamType::Camera, Role::Student),
            StreamPriority::StudentVideo
        );
        assert_eq!(
            StreamPriority::classify(MediaKind::Video, StreamType::Screen, Role::Proctor),
            StreamPriority::ScreenShare
        );
    }

    #[test]
    fn audio_and_proctor_video_are_never_peer_degradable() {
        assert!(!StreamPriority::Audio.is_peer_degradable());
        assert!(!StreamPriority::ProctorVideo.is_peer_degradable());
        assert!(StreamPriority::StudentVideo.is_peer_degradable());
        assert!(StreamPriority::ScreenShare.is_peer_degradable());
        assert!(StreamPriority::Data.is_peer_degradable());
    }

    #[test]
    fn proctor_always_gets_highest_layers() {
        assert_eq!(select_video_layers(Role::Proctor, false, true), LAYERS_HIGHEST);
        assert_eq!(select_video_layers(Role::Proctor, true, false), LAYERS_HIGHEST);
    }

    #[test]
    fn student_gated_only_when_ranking_full_and_owner_absent() {
        assert_eq!(select_video_layers(Role::Student, true, true), LAYERS_STUDENT);
        assert_eq!(select_video_layers(Role::Student, false, false), LAYERS_STUDENT);
        assert_eq!(select_video_layers(Role::Student, false, true), LAYERS_MINIMUM);
    }

    #[test]
    fn ranking_is_bounded_and_most_recent_first() {
        let mut ranking = ActiveSpeakerRanking::new(3);
        for name in ["a", "b", "c", "d"] {
            ranking.promote(&MemberId::from(name));
        }
        assert_eq!(ranking.members().len(), 3);
        assert_eq!(ranking.members()[0], MemberId::from("d"));
        assert!(!ranking.contains(&MemberId::from("a")));

        // Re-promoting moves to the front instead of duplicating.
        ranking.promote(&MemberId::from("b"));
        assert_eq!(ranking.members()[0], MemberId::from("b"));
        assert_eq!(ranking.members().len(), 3);
    }

    #[test]
    fn ranking_remove_frees_capacity() {
        let mut ranking = ActiveSpeakerRanking::new(2);
        ranking.promote(&MemberId::from("a"));
        ranking.promote(&MemberId::from("b"));
        assert!(ranking.at_capacity());
        ranking.remove(&MemberId::from("a"));
        assert!(!ranking.at_capacity());
    }

    #[test]
    fn abr_hysteresis_band_holds_state() {
        let mut machine = AbrMachine::new(0.05, 0.01);
        assert_eq!(machine.state(), AbrState::Nominal);

        // 6% loss: degrade.
        assert_eq!(machine.observe(0.06), Some(AbrTransition::Degrade));
        assert_eq!(machine.state(), AbrState::Degraded);

        // 3% loss sits inside the band: nothing happens.
        assert_eq!(machine.observe(0.03), None);
        assert_eq!(machine.state(), AbrState::Degraded);

        // 0.8% loss: recover.
        assert_eq!(machine.observe(0.008), Some(AbrTransition::Recover));
        assert_eq!(machine.state(), AbrState::Nominal);
    }

    #[test]
    fn abr_ignores_repeated_samples_in_same_state() {
        let mut machine = AbrMachine::new(0.05, 0.01);
        assert_eq!(machine.observe(0.2), Some(AbrTransition::Degrade));
        assert_eq!(machine.observe(0.3), None);
        assert_eq!(machine.observe(0.005), Some(AbrTransition::Recover));
        assert_eq!(machine.observe(0.0), None);
    }
}
