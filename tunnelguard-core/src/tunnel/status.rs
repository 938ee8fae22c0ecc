//! Tunnel status reported by the provisioning backend and the stage strings
//! the controller exposes to its subscriber.

use serde::{Deserialize, Serialize};

/// Live status of a tunnel as reported by a [`super::TunnelProvider`]
///
/// The controller never invents one of these; it only maps them to a
/// [`Stage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TunnelStatus {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Reasserting,
    Invalid,
}

impl TunnelStatus {
    /// A tunnel that is up or coming up
    pub fn is_live(self) -> bool {
        matches!(self, TunnelStatus::Connected | TunnelStatus::Connecting)
    }

    /// A tunnel that has settled down and may warrant drop recovery
    pub fn is_settled_down(self) -> bool {
        matches!(self, TunnelStatus::Disconnected | TunnelStatus::Invalid)
    }
}

/// Outward-facing stage delivered to the stage subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
    Reasserting,
    Invalid,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Connecting => "connecting",
            Stage::Connected => "connected",
            Stage::Disconnecting => "disconnecting",
            Stage::Disconnected => "disconnected",
            Stage::Reasserting => "reasserting",
            Stage::Invalid => "invalid",
        }
    }
}

impl From<TunnelStatus> for Stage {
    fn from(status: TunnelStatus) -> Self {
        match status {
            TunnelStatus::Disconnected => Stage::Disconnected,
            TunnelStatus::Connecting => Stage::Connecting,
            TunnelStatus::Connected => Stage::Connected,
            TunnelStatus::Disconnecting => Stage::Disconnecting,
            TunnelStatus::Reasserting => Stage::Reasserting,
            TunnelStatus::Invalid => Stage::Invalid,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_mapping_is_identity() {
        let pairs = [
            (TunnelStatus::Disconnected, "disconnected"),
            (TunnelStatus::Connecting, "connecting"),
            (TunnelStatus::Connected, "connected"),
            (TunnelStatus::Disconnecting, "disconnecting"),
            (TunnelStatus::Reasserting, "reasserting"),
            (TunnelStatus::Invalid, "invalid"),
        ];
        for (status, expected) in pairs {
            assert_eq!(Stage::from(status).to_string(), expected);
        }
    }

    #[test]
    fn test_live_and_settled() {
        assert!(TunnelStatus::Connected.is_live());
        assert!(TunnelStatus::Connecting.is_live());
        assert!(!TunnelStatus::Reasserting.is_live());

        assert!(TunnelStatus::Invalid.is_settled_down());
        assert!(TunnelStatus::Disconnected.is_settled_down());
        assert!(!TunnelStatus::Disconnecting.is_settled_down());
    }

    #[test]
    fn test_stage_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&Stage::Reasserting).unwrap(),
            "\"reasserting\""
        );
    }
}
