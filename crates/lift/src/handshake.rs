use std::collections::{HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::instances::{InstanceState, WorldInstances};
use crate::ledger::{LedgerEntry, PendingTransferLedger};
use crate::types::{ConnectionId, InstanceId};

/// Authority to client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Load this instance, then answer with `Ready`.
    Invite { instance_id: InstanceId },
    /// The hand-off completed; the staging area may be released.
    Committed { instance_id: InstanceId },
}

/// Client to authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Ready { instance_id: InstanceId },
}

#[derive(Debug, Error)]
pub enum WireError {
    #[error("malformed message line: {0}")]
    Malformed(#[from] serde_json::Error),
}

pub fn encode_line<T: Serialize>(message: &T) -> Result<String, WireError> {
    Ok(serde_json::to_string(message)?)
}

pub fn decode_server_message(line: &str) -> Result<ServerMessage, WireError> {
    Ok(serde_json::from_str(line.trim())?)
}

pub fn decode_client_message(line: &str) -> Result<ClientMessage, WireError> {
    Ok(serde_json::from_str(line.trim())?)
}

/// Why a `Ready` was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyRejection {
    NoPendingTransfer,
    InstanceMismatch {
        expected: InstanceId,
        received: InstanceId,
    },
    InstanceNotLoaded {
        state: Option<InstanceState>,
    },
}

impl ReadyRejection {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoPendingTransfer => "no_pending_transfer",
            Self::InstanceMismatch { .. } => "instance_mismatch",
            Self::InstanceNotLoaded { .. } => "instance_not_loaded",
        }
    }
}

pub fn validate_ready(
    connection: ConnectionId,
    instance_id: InstanceId,
    ledger: &PendingTransferLedger,
    instances: &WorldInstances,
) -> Result<LedgerEntry, ReadyRejection> {
    let entry = ledger
        .resolve(connection)
        .copied()
        .ok_or(ReadyRejection::NoPendingTransfer)?;
    if entry.instance_id != instance_id {
        return Err(ReadyRejection::InstanceMismatch {
            expected: entry.instance_id,
            received: instance_id,
        });
    }
    let state = instances.state(instance_id);
    if !matches!(state, Some(InstanceState::Loaded | InstanceState::Active)) {
        return Err(ReadyRejection::InstanceNotLoaded { state });
    }
    Ok(entry)
}

/// Queue of authority-to-client messages. An Invite goes out at most once
/// per (connection, instance).
#[derive(Debug, Default)]
pub struct Outbox {
    queued: VecDeque<(ConnectionId, ServerMessage)>,
    invited: HashSet<(ConnectionId, InstanceId)>,
}

impl Outbox {
    pub fn invite(&mut self, connection: ConnectionId, instance_id: InstanceId) -> bool {
        if !self.invited.insert((connection, instance_id)) {
            return false;
        }
        self.queued
            .push_back((connection, ServerMessage::Invite { instance_id }));
        true
    }

    pub fn committed(&mut self, connection: ConnectionId, instance_id: InstanceId) {
        self.queued
            .push_back((connection, ServerMessage::Committed { instance_id }));
    }

    /// Drops the at-most-once bookkeeping for a batch that has drained.
    pub fn forget_instance(&mut self, instance_id: InstanceId) {
        self.invited
            .retain(|(_, invited_instance)| *invited_instance != instance_id);
    }

    /// Drops queued messages addressed to a connection that went away.
    pub fn discard_for(&mut self, connection: ConnectionId) {
        self.queued.retain(|(target, _)| *target != connection);
    }

    pub fn drain(&mut self) -> Vec<(ConnectionId, ServerMessage)> {
        self.queued.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queued.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queued.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::content::WorldTemplateId;
    use crate::instances::InstanceHandle;
    use crate::types::AvatarRef;

    use super::*;

    #[test]
    fn messages_are_tagged_json_lines() {
        let line = encode_line(&ServerMessage::Invite {
            instance_id: InstanceId(3),
        })
        .expect("encode");
        assert_eq!(line, r#"{"type":"invite","instance_id":3}"#);

        let ready = decode_client_message(" {\"type\":\"ready\",\"instance_id\":3}\n").expect("decode");
        assert_eq!(
            ready,
            ClientMessage::Ready {
                instance_id: InstanceId(3)
            }
        );
        assert!(decode_client_message(r#"{"type":"invite","instance_id":3}"#).is_err());
        assert!(decode_server_message("not json").is_err());
    }

    #[test]
    fn invite_is_sent_at_most_once_per_batch() {
        let mut outbox = Outbox::default();
        assert!(outbox.invite(ConnectionId(1), InstanceId(0)));
        assert!(!outbox.invite(ConnectionId(1), InstanceId(0)));
        assert!(outbox.invite(ConnectionId(2), InstanceId(0)));
        assert_eq!(outbox.drain().len(), 2);
        assert!(!outbox.invite(ConnectionId(1), InstanceId(0)));

        outbox.forget_instance(InstanceId(0));
        assert!(outbox.invite(ConnectionId(1), InstanceId(0)));
        outbox.discard_for(ConnectionId(1));
        assert!(outbox.is_empty());
    }

    #[test]
    fn ready_validation_checks_entry_instance_and_state() {
        let mut ledger = PendingTransferLedger::new(Duration::from_secs(30));
        let mut instances = WorldInstances::default();
        instances.insert_requested(InstanceId(1), WorldTemplateId(0));
        ledger
            .add(ConnectionId(5), InstanceId(1), AvatarRef(50), Duration::ZERO)
            .expect("add");

        assert_eq!(
            validate_ready(ConnectionId(6), InstanceId(1), &ledger, &instances),
            Err(ReadyRejection::NoPendingTransfer)
        );
        assert_eq!(
            validate_ready(ConnectionId(5), InstanceId(2), &ledger, &instances),
            Err(ReadyRejection::InstanceMismatch {
                expected: InstanceId(1),
                received: InstanceId(2),
            })
        );
        assert_eq!(
            validate_ready(ConnectionId(5), InstanceId(1), &ledger, &instances),
            Err(ReadyRejection::InstanceNotLoaded {
                state: Some(InstanceState::Requested),
            })
        );

        instances.mark_loaded(InstanceHandle {
            instance_id: InstanceId(1),
            template: WorldTemplateId(0),
        });
        let entry = validate_ready(ConnectionId(5), InstanceId(1), &ledger, &instances)
            .expect("accepted");
        assert_eq!(entry.old_avatar, AvatarRef(50));
    }
}
