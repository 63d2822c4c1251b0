//! Wire and state types shared between the supervisor, the controller, and
//! the HTTP surface.

use serde::{Deserialize, Serialize};

/// Heartbeat message sent by a node agent.
///
/// Every field is optional; an empty JSON object is a valid heartbeat and
/// only refreshes the liveness timestamps.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HeartbeatMessage {
    /// Identity of the running process image; adopted first-seen-wins
    pub cookie_exec: Option<String>,
    /// Identity of the data disk contents; adopted first-seen-wins
    pub cookie_data: Option<String>,
    /// Genesis block hash the agent is currently on
    pub genesis: Option<String>,
}

/// Reply returned for an accepted heartbeat.
#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatReply {
    pub cookie_exec: Option<String>,
    pub cookie_data: Option<String>,
    pub rnode_package_url: Option<String>,
    pub mode: HeartbeatMode,
    /// `rnode_addr` of the current leader; only present in follower mode
    #[serde(skip_serializing_if = "Option::is_none")]
    pub leader: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HeartbeatMode {
    Leader,
    Follower,
}

/// Timeout classification latched on a node by `check_failure`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NodeFailure {
    /// Host was up but heartbeats stopped arriving
    TimeoutHeartbeat,
    /// Host is up but the node agent never reported a genesis block
    TimeoutStartRnode,
    /// Host never came up at all
    TimeoutStartHost,
}

impl std::fmt::Display for NodeFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            NodeFailure::TimeoutHeartbeat => "heartbeat timeout",
            NodeFailure::TimeoutStartRnode => "rnode start timeout",
            NodeFailure::TimeoutStartHost => "host start timeout",
        };
        f.write_str(name)
    }
}

/// Teardown depth for a host restart. Ordering is significant: each level
/// destroys everything the previous level does plus one more resource class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CleanLevel {
    /// Stop the instance only
    Stop,
    /// Stop and destroy the instance with its boot disk
    Host,
    /// `Host` plus the data disk
    Data,
    /// `Data` plus the DNS record and the reserved address
    All,
}

impl std::fmt::Display for CleanLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CleanLevel::Stop => "stop",
            CleanLevel::Host => "host",
            CleanLevel::Data => "data",
            CleanLevel::All => "all",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_level_ordering() {
        assert!(CleanLevel::Stop < CleanLevel::Host);
        assert!(CleanLevel::Host < CleanLevel::Data);
        assert!(CleanLevel::Data < CleanLevel::All);
    }

    #[test]
    fn test_heartbeat_message_accepts_empty_object() {
        let msg: HeartbeatMessage = serde_json::from_str("{}").unwrap();
        assert!(msg.cookie_exec.is_none());
        assert!(msg.genesis.is_none());
    }

    #[test]
    fn test_reply_omits_leader_in_leader_mode() {
        let reply = HeartbeatReply {
            cookie_exec: Some("x".into()),
            cookie_data: None,
            rnode_package_url: None,
            mode: HeartbeatMode::Leader,
            leader: None,
        };
        let value = serde_json::to_value(&reply).unwrap();
        assert_eq!(value["mode"], "leader");
        assert!(value.get("leader").is_none());
        assert!(value["cookie_data"].is_null());
    }
}
