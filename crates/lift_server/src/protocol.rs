use lift::{ConnectionId, InstanceId, ViewState};
use serde::{Deserialize, Serialize};

/// Everything a client may send. `hello` stands in for the login flow and
/// `zone_enter`/`zone_exit` for the staging area's trigger volume.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundCommand {
    Hello { name: String },
    ZoneEnter,
    ZoneExit,
    Ready { instance_id: InstanceId },
}

impl InboundCommand {
    pub fn parse(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}

/// Transport-level replies sent on the control channel next to the
/// handshake messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Reply {
    Welcome { connection_id: u64 },
    Zone { outcome: &'static str },
    Error { message: String },
}

impl Reply {
    pub fn welcome(connection: ConnectionId) -> Self {
        Self::Welcome {
            connection_id: connection.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Telemetry {
    Staging {
        members: usize,
        capacity: usize,
        membership: String,
        seconds_remaining: f32,
        countdown: String,
        sealed: bool,
    },
}

impl Telemetry {
    pub fn from_view(view: &ViewState) -> Self {
        Self::Staging {
            members: view.member_count,
            capacity: view.capacity,
            membership: view.membership_text(),
            seconds_remaining: view.seconds_remaining,
            countdown: view.countdown_text(),
            sealed: view.sealed,
        }
    }
}
