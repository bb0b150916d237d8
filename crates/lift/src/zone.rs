use thiserror::Error;
use tracing::debug;

use crate::types::ConnectionId;
use crate::view::TransferView;

/// Whether the countdown runs while nobody is waiting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CountdownPolicy {
    #[default]
    WhileOccupied,
    Always,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StagingZoneConfig {
    pub capacity: usize,
    pub countdown_seconds: f32,
    pub policy: CountdownPolicy,
}

impl Default for StagingZoneConfig {
    fn default() -> Self {
        Self {
            capacity: 2,
            countdown_seconds: 15.0,
            policy: CountdownPolicy::WhileOccupied,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum ZoneConfigError {
    #[error("staging zone capacity must be at least 1")]
    ZeroCapacity,
    #[error("countdown must be finite and > 0, got {0}")]
    InvalidCountdown(f32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnterOutcome {
    Admitted,
    AlreadyMember,
    Full,
}

/// The waiting area. Owns its membership set and countdown exclusively.
#[derive(Debug)]
pub struct StagingZone {
    config: StagingZoneConfig,
    members: Vec<ConnectionId>,
    countdown: f32,
    sealed: bool,
}

impl StagingZone {
    pub fn new(config: StagingZoneConfig) -> Result<Self, ZoneConfigError> {
        if config.capacity == 0 {
            return Err(ZoneConfigError::ZeroCapacity);
        }
        if !config.countdown_seconds.is_finite() || config.countdown_seconds <= 0.0 {
            return Err(ZoneConfigError::InvalidCountdown(config.countdown_seconds));
        }
        Ok(Self {
            config,
            members: Vec::with_capacity(config.capacity),
            countdown: config.countdown_seconds,
            sealed: false,
        })
    }

    pub fn on_entity_enter(
        &mut self,
        connection: ConnectionId,
        view: &mut dyn TransferView,
    ) -> EnterOutcome {
        if self.members.contains(&connection) {
            return EnterOutcome::AlreadyMember;
        }
        if self.sealed || self.members.len() >= self.config.capacity {
            debug!(connection = %connection, "zone_enter_rejected_full");
            return EnterOutcome::Full;
        }
        self.members.push(connection);
        debug!(
            connection = %connection,
            member_count = self.members.len(),
            "zone_member_entered"
        );
        if self.members.len() == self.config.capacity {
            self.set_sealed(true, view);
        }
        self.push_membership(view);
        EnterOutcome::Admitted
    }

    pub fn on_entity_exit(&mut self, connection: ConnectionId, view: &mut dyn TransferView) -> bool {
        let Some(index) = self.members.iter().position(|member| *member == connection) else {
            return false;
        };
        self.members.remove(index);
        debug!(
            connection = %connection,
            member_count = self.members.len(),
            "zone_member_exited"
        );
        if self.members.len() < self.config.capacity {
            self.set_sealed(false, view);
        }
        self.push_membership(view);
        true
    }

    /// Advances the countdown. Returns the membership snapshot when the
    /// countdown expired with members present; the zone is already reset by
    /// then.
    pub fn tick(&mut self, dt_seconds: f32, view: &mut dyn TransferView) -> Option<Vec<ConnectionId>> {
        let running = match self.config.policy {
            CountdownPolicy::WhileOccupied => !self.members.is_empty(),
            CountdownPolicy::Always => true,
        };
        if running {
            self.countdown -= dt_seconds.max(0.0);
        }

        let snapshot = if self.countdown <= 0.0 {
            let snapshot = (!self.members.is_empty()).then(|| self.members.clone());
            self.reset(view);
            snapshot
        } else {
            None
        };
        view.set_countdown(self.countdown.max(0.0));
        snapshot
    }

    pub fn reset(&mut self, view: &mut dyn TransferView) {
        self.members.clear();
        self.countdown = self.config.countdown_seconds;
        self.set_sealed(false, view);
        self.push_membership(view);
        view.set_countdown(self.countdown);
    }

    pub fn members(&self) -> &[ConnectionId] {
        &self.members
    }

    pub fn contains(&self, connection: ConnectionId) -> bool {
        self.members.contains(&connection)
    }

    pub fn countdown(&self) -> f32 {
        self.countdown
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub fn config(&self) -> &StagingZoneConfig {
        &self.config
    }

    fn set_sealed(&mut self, sealed: bool, view: &mut dyn TransferView) {
        if self.sealed != sealed {
            self.sealed = sealed;
            view.set_sealed(sealed);
        }
    }

    fn push_membership(&self, view: &mut dyn TransferView) {
        view.set_membership(self.members.len(), self.config.capacity);
    }
}

#[cfg(test)]
mod tests {
    use crate::view::ViewState;

    use super::*;

    fn zone(capacity: usize, policy: CountdownPolicy) -> StagingZone {
        StagingZone::new(StagingZoneConfig {
            capacity,
            countdown_seconds: 1.0,
            policy,
        })
        .expect("zone")
    }

    #[test]
    fn rejects_invalid_config() {
        assert_eq!(
            StagingZone::new(StagingZoneConfig {
                capacity: 0,
                ..StagingZoneConfig::default()
            })
            .expect_err("zero capacity"),
            ZoneConfigError::ZeroCapacity
        );
        assert!(StagingZone::new(StagingZoneConfig {
            countdown_seconds: 0.0,
            ..StagingZoneConfig::default()
        })
        .is_err());
    }

    #[test]
    fn membership_never_exceeds_capacity_under_any_event_order() {
        let mut view = ViewState::default();
        let mut zone = zone(3, CountdownPolicy::WhileOccupied);
        let events: [(bool, u64); 14] = [
            (true, 1),
            (true, 2),
            (true, 2),
            (true, 3),
            (true, 4),
            (false, 9),
            (false, 2),
            (true, 4),
            (true, 5),
            (false, 1),
            (false, 1),
            (true, 5),
            (true, 6),
            (true, 7),
        ];
        for (enter, raw) in events {
            let id = ConnectionId(raw);
            if enter {
                zone.on_entity_enter(id, &mut view);
            } else {
                zone.on_entity_exit(id, &mut view);
            }
            assert!(zone.members().len() <= 3);
            let mut sorted = zone.members().to_vec();
            sorted.sort();
            sorted.dedup();
            assert_eq!(sorted.len(), zone.members().len());
            assert_eq!(view.member_count, zone.members().len());
        }
    }

    #[test]
    fn seals_at_capacity_and_reopens_on_exit() {
        let mut view = ViewState::default();
        let mut zone = zone(2, CountdownPolicy::WhileOccupied);
        assert_eq!(
            zone.on_entity_enter(ConnectionId(1), &mut view),
            EnterOutcome::Admitted
        );
        assert_eq!(
            zone.on_entity_enter(ConnectionId(1), &mut view),
            EnterOutcome::AlreadyMember
        );
        zone.on_entity_enter(ConnectionId(2), &mut view);
        assert!(zone.is_sealed());
        assert!(view.sealed);
        assert_eq!(
            zone.on_entity_enter(ConnectionId(3), &mut view),
            EnterOutcome::Full
        );

        assert!(zone.on_entity_exit(ConnectionId(2), &mut view));
        assert!(!zone.is_sealed());
        assert!(!zone.on_entity_exit(ConnectionId(42), &mut view));
    }

    #[test]
    fn countdown_waits_for_members_by_default() {
        let mut view = ViewState::default();
        let mut zone = zone(2, CountdownPolicy::WhileOccupied);
        for _ in 0..10 {
            assert!(zone.tick(0.5, &mut view).is_none());
        }
        assert_eq!(zone.countdown(), 1.0);

        zone.on_entity_enter(ConnectionId(7), &mut view);
        assert!(zone.tick(0.6, &mut view).is_none());
        let snapshot = zone.tick(0.6, &mut view).expect("dispatch");
        assert_eq!(snapshot, vec![ConnectionId(7)]);
        assert!(zone.members().is_empty());
        assert_eq!(zone.countdown(), 1.0);
        assert_eq!(view.member_count, 0);
    }

    #[test]
    fn always_policy_resets_without_dispatch_when_empty() {
        let mut view = ViewState::default();
        let mut zone = zone(2, CountdownPolicy::Always);
        assert!(zone.tick(0.7, &mut view).is_none());
        assert!(zone.countdown() < 1.0);
        assert!(zone.tick(0.7, &mut view).is_none());
        assert_eq!(zone.countdown(), 1.0);
    }

    #[test]
    fn view_never_sees_negative_countdown() {
        let mut view = ViewState::default();
        let mut zone = zone(1, CountdownPolicy::Always);
        zone.tick(0.9, &mut view);
        zone.on_entity_enter(ConnectionId(1), &mut view);
        zone.tick(5.0, &mut view);
        assert!(view.seconds_remaining >= 0.0);
        assert_eq!(view.seconds_remaining, 1.0);
    }
}
