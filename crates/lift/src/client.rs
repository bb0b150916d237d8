use std::time::Duration;

use tracing::{debug, info, warn};

use crate::content::WorldTemplateId;
use crate::handshake::{ClientMessage, ServerMessage};
use crate::instances::{InstanceHandle, LoadCompletion, LoadOutcome, WorldLoader};
use crate::types::InstanceId;

pub const DEFAULT_CLIENT_LOAD_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct ClientAgentSettings {
    pub world_template: WorldTemplateId,
    pub load_timeout: Duration,
}

impl ClientAgentSettings {
    pub fn new(world_template: WorldTemplateId) -> Self {
        Self {
            world_template,
            load_timeout: DEFAULT_CLIENT_LOAD_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientPhase {
    Idle,
    Loading {
        instance_id: InstanceId,
        elapsed: Duration,
    },
    AwaitingCommit {
        instance_id: InstanceId,
    },
    InSession {
        instance_id: InstanceId,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    LoadStarted(InstanceId),
    DuplicateInviteIgnored(InstanceId),
    ReadySent(InstanceId),
    LoadFailed {
        instance_id: InstanceId,
        reason: String,
    },
    LoadTimedOut(InstanceId),
    /// The authority committed the hand-off; the staging area is released.
    Committed(InstanceId),
}

/// Client half of the handshake. Loads only on an explicit Invite, answers
/// with a single Ready, and never retries a failed or timed-out load.
#[derive(Debug)]
pub struct ClientTransferAgent {
    settings: ClientAgentSettings,
    phase: ClientPhase,
    loaded: Option<InstanceHandle>,
    outbound: Vec<ClientMessage>,
    staging_released: bool,
    completion_scratch: Vec<LoadCompletion>,
}

impl ClientTransferAgent {
    pub fn new(settings: ClientAgentSettings) -> Self {
        Self {
            settings,
            phase: ClientPhase::Idle,
            loaded: None,
            outbound: Vec::new(),
            staging_released: false,
            completion_scratch: Vec::new(),
        }
    }

    pub fn on_message(
        &mut self,
        message: ServerMessage,
        loader: &mut dyn WorldLoader,
    ) -> Option<ClientEvent> {
        match message {
            ServerMessage::Invite { instance_id } => Some(self.on_invite(instance_id, loader)),
            ServerMessage::Committed { instance_id } => self.on_committed(instance_id),
        }
    }

    fn on_invite(&mut self, instance_id: InstanceId, loader: &mut dyn WorldLoader) -> ClientEvent {
        let duplicate = match self.phase {
            ClientPhase::Loading {
                instance_id: current,
                ..
            }
            | ClientPhase::AwaitingCommit {
                instance_id: current,
            }
            | ClientPhase::InSession {
                instance_id: current,
            } => current == instance_id,
            ClientPhase::Idle => false,
        };
        if duplicate {
            debug!(instance_id = %instance_id, "invite_ignored_duplicate");
            return ClientEvent::DuplicateInviteIgnored(instance_id);
        }

        if let Some(previous) = self
            .loaded
            .filter(|held| held.template == self.settings.world_template)
        {
            self.loaded = None;
            info!(instance_id = %previous.instance_id, "unloading_previous_instance");
            loader.request_unload(previous);
        }

        match loader.request_load(instance_id, self.settings.world_template) {
            Ok(()) => {
                self.phase = ClientPhase::Loading {
                    instance_id,
                    elapsed: Duration::ZERO,
                };
                info!(instance_id = %instance_id, "instance_load_started");
                ClientEvent::LoadStarted(instance_id)
            }
            Err(err) => {
                self.phase = ClientPhase::Idle;
                warn!(instance_id = %instance_id, error = %err, "instance_load_rejected");
                ClientEvent::LoadFailed {
                    instance_id,
                    reason: err.to_string(),
                }
            }
        }
    }

    fn on_committed(&mut self, instance_id: InstanceId) -> Option<ClientEvent> {
        if self.phase != (ClientPhase::AwaitingCommit { instance_id }) {
            debug!(instance_id = %instance_id, "commit_ignored_unexpected");
            return None;
        }
        self.phase = ClientPhase::InSession { instance_id };
        self.staging_released = true;
        info!(instance_id = %instance_id, "staging_area_released");
        Some(ClientEvent::Committed(instance_id))
    }

    pub fn tick(&mut self, dt: Duration, loader: &mut dyn WorldLoader) -> Vec<ClientEvent> {
        let mut events = Vec::new();
        let mut completions = std::mem::take(&mut self.completion_scratch);
        loader.poll_completions(&mut completions);
        for completion in completions.drain(..) {
            self.on_completion(completion, loader, &mut events);
        }
        self.completion_scratch = completions;

        if let ClientPhase::Loading {
            instance_id,
            elapsed,
        } = self.phase
        {
            let elapsed = elapsed.saturating_add(dt);
            if elapsed >= self.settings.load_timeout {
                warn!(
                    instance_id = %instance_id,
                    timeout_ms = self.settings.load_timeout.as_millis() as u64,
                    "instance_load_timed_out"
                );
                self.phase = ClientPhase::Idle;
                events.push(ClientEvent::LoadTimedOut(instance_id));
            } else {
                self.phase = ClientPhase::Loading {
                    instance_id,
                    elapsed,
                };
            }
        }
        events
    }

    fn on_completion(
        &mut self,
        completion: LoadCompletion,
        loader: &mut dyn WorldLoader,
        events: &mut Vec<ClientEvent>,
    ) {
        let current = match self.phase {
            ClientPhase::Loading { instance_id, .. } => Some(instance_id),
            _ => None,
        };
        if current != Some(completion.instance_id) {
            if let LoadOutcome::Loaded(handle) = completion.outcome {
                debug!(instance_id = %handle.instance_id, "stale_load_discarded");
                loader.request_unload(handle);
            }
            return;
        }

        match completion.outcome {
            LoadOutcome::Loaded(handle) => {
                self.loaded = Some(handle);
                self.phase = ClientPhase::AwaitingCommit {
                    instance_id: handle.instance_id,
                };
                self.outbound.push(ClientMessage::Ready {
                    instance_id: handle.instance_id,
                });
                info!(instance_id = %handle.instance_id, "ready_sent");
                events.push(ClientEvent::ReadySent(handle.instance_id));
            }
            LoadOutcome::Failed(reason) => {
                self.phase = ClientPhase::Idle;
                warn!(instance_id = %completion.instance_id, reason = %reason, "instance_load_failed");
                events.push(ClientEvent::LoadFailed {
                    instance_id: completion.instance_id,
                    reason,
                });
            }
        }
    }

    pub fn drain_outbound(&mut self) -> Vec<ClientMessage> {
        std::mem::take(&mut self.outbound)
    }

    pub fn phase(&self) -> ClientPhase {
        self.phase
    }

    /// Records an instance the client already holds, such as the world it
    /// is staged in.
    pub fn hold_instance(&mut self, handle: InstanceHandle) {
        self.loaded = Some(handle);
    }

    pub fn loaded_instance(&self) -> Option<InstanceHandle> {
        self.loaded
    }

    pub fn staging_released(&self) -> bool {
        self.staging_released
    }
}

#[cfg(test)]
mod tests {
    use crate::instances::SimulatedWorldLoader;

    use super::*;

    fn agent() -> ClientTransferAgent {
        ClientTransferAgent::new(ClientAgentSettings {
            world_template: WorldTemplateId(1),
            load_timeout: Duration::from_secs(2),
        })
    }

    fn invite(id: u64) -> ServerMessage {
        ServerMessage::Invite {
            instance_id: InstanceId(id),
        }
    }

    #[test]
    fn invite_load_ready_commit_round() {
        let mut loader = SimulatedWorldLoader::new(2, 1);
        let mut agent = agent();
        assert_eq!(
            agent.on_message(invite(4), &mut loader),
            Some(ClientEvent::LoadStarted(InstanceId(4)))
        );
        assert_eq!(
            agent.on_message(invite(4), &mut loader),
            Some(ClientEvent::DuplicateInviteIgnored(InstanceId(4)))
        );
        assert!(agent.drain_outbound().is_empty());

        assert!(agent.tick(Duration::from_millis(100), &mut loader).is_empty());
        assert_eq!(
            agent.tick(Duration::from_millis(100), &mut loader),
            vec![ClientEvent::ReadySent(InstanceId(4))]
        );
        assert_eq!(
            agent.drain_outbound(),
            vec![ClientMessage::Ready {
                instance_id: InstanceId(4)
            }]
        );

        assert_eq!(
            agent.on_message(
                ServerMessage::Committed {
                    instance_id: InstanceId(4)
                },
                &mut loader
            ),
            Some(ClientEvent::Committed(InstanceId(4)))
        );
        assert!(agent.staging_released());
        assert_eq!(
            agent.phase(),
            ClientPhase::InSession {
                instance_id: InstanceId(4)
            }
        );
    }

    #[test]
    fn invalid_template_fails_without_ready() {
        let mut loader = SimulatedWorldLoader::new(1, 0);
        let mut agent = agent();
        assert!(matches!(
            agent.on_message(invite(1), &mut loader),
            Some(ClientEvent::LoadFailed { .. })
        ));
        assert!(agent.tick(Duration::from_millis(100), &mut loader).is_empty());
        assert!(agent.drain_outbound().is_empty());
        assert_eq!(agent.phase(), ClientPhase::Idle);
    }

    #[test]
    fn load_timeout_gives_up_and_discards_late_completion() {
        let mut loader = SimulatedWorldLoader::new(2, 5);
        let mut agent = agent();
        agent.on_message(invite(2), &mut loader);
        assert_eq!(
            agent.tick(Duration::from_secs(2), &mut loader),
            vec![ClientEvent::LoadTimedOut(InstanceId(2))]
        );
        for _ in 0..6 {
            assert!(agent.tick(Duration::from_secs(1), &mut loader).is_empty());
        }
        assert!(agent.drain_outbound().is_empty());
        assert!(!loader.is_loaded(InstanceId(2)));
    }

    #[test]
    fn new_invite_unloads_previous_instance_of_same_template() {
        let mut loader = SimulatedWorldLoader::new(2, 0);
        let mut agent = agent();
        agent.on_message(invite(1), &mut loader);
        agent.tick(Duration::from_millis(10), &mut loader);
        assert!(loader.is_loaded(InstanceId(1)));

        agent.on_message(invite(2), &mut loader);
        assert!(!loader.is_loaded(InstanceId(1)));
        agent.tick(Duration::from_millis(10), &mut loader);
        assert_eq!(
            agent.loaded_instance().map(|handle| handle.instance_id),
            Some(InstanceId(2))
        );
    }

    #[test]
    fn new_invite_keeps_held_instance_of_other_template() {
        let mut loader = SimulatedWorldLoader::new(2, 0);
        loader
            .request_load(InstanceId(7), WorldTemplateId(0))
            .expect("lobby load");
        let mut completions = Vec::new();
        loader.poll_completions(&mut completions);
        assert!(loader.is_loaded(InstanceId(7)));

        let mut agent = agent();
        agent.hold_instance(InstanceHandle {
            instance_id: InstanceId(7),
            template: WorldTemplateId(0),
        });
        assert_eq!(
            agent.on_message(invite(2), &mut loader),
            Some(ClientEvent::LoadStarted(InstanceId(2)))
        );
        assert!(loader.is_loaded(InstanceId(7)));
        agent.tick(Duration::from_millis(10), &mut loader);
        assert!(loader.is_loaded(InstanceId(2)));
        assert!(loader.is_loaded(InstanceId(7)));
    }

    #[test]
    fn default_timeouts_let_the_client_give_up_before_the_ledger() {
        assert!(crate::authority::DEFAULT_LEDGER_TIMEOUT > DEFAULT_CLIENT_LOAD_TIMEOUT);
        assert_eq!(
            ClientAgentSettings::new(WorldTemplateId(0)).load_timeout,
            DEFAULT_CLIENT_LOAD_TIMEOUT
        );
    }

    #[test]
    fn failed_load_is_not_retried() {
        let mut loader = SimulatedWorldLoader::new(2, 0);
        loader.fail_next_loads(1);
        let mut agent = agent();
        agent.on_message(invite(3), &mut loader);
        let events = agent.tick(Duration::from_millis(10), &mut loader);
        assert!(matches!(&events[..], [ClientEvent::LoadFailed { .. }]));
        assert!(agent.tick(Duration::from_millis(10), &mut loader).is_empty());
        assert_eq!(loader.in_flight_count(), 0);
    }
}
