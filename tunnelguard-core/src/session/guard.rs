//! Ownership check for live tunnels and the forced-disconnect path
//!
//! A tunnel that is up or coming up must have been started by this
//! controller. Anything else (a restored system profile, another process, a
//! start that raced a `disconnect`) is torn down through
//! `force_disconnect`, the one place that strips such a session of
//! reconnect ownership.

use crate::session::actor::ControllerActor;
use crate::tunnel::{Stage, TunnelStatus};
use crate::types::ConnectionIntent;
use tracing::warn;

/// Verdict on an observed status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Authorization {
    /// Not live, or live and started by us
    Authorized,
    /// Live without a matching start from this controller
    Unauthorized,
}

/// Decide whether `status` is acceptable under `intent`
pub fn authorize(status: TunnelStatus, intent: ConnectionIntent) -> Authorization {
    if status.is_live() && !intent.app_initiated {
        Authorization::Unauthorized
    } else {
        Authorization::Authorized
    }
}

impl ControllerActor {
    /// Tear down a tunnel this controller does not own
    ///
    /// Stop failures are only logged; the intent is reset regardless.
    #[tracing::instrument(skip(self))]
    pub(super) fn force_disconnect(&mut self, trigger: &'static str) {
        warn!(trigger, "Live tunnel was not started by this controller, forcing disconnect");

        self.manual_disconnect = true;
        self.commit_intent_logged(ConnectionIntent::IDLE);
        self.scheduler.cancel();
        self.session_limit.cancel();
        self.enqueue_stop(trigger);
        self.stages.emit(Stage::Disconnected);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [TunnelStatus; 6] = [
        TunnelStatus::Disconnected,
        TunnelStatus::Connecting,
        TunnelStatus::Connected,
        TunnelStatus::Disconnecting,
        TunnelStatus::Reasserting,
        TunnelStatus::Invalid,
    ];

    #[test]
    fn test_live_without_ownership_is_unauthorized() {
        let intent = ConnectionIntent {
            should_be_connected: true,
            app_initiated: false,
        };
        assert_eq!(authorize(TunnelStatus::Connected, intent), Authorization::Unauthorized);
        assert_eq!(authorize(TunnelStatus::Connecting, intent), Authorization::Unauthorized);
    }

    #[test]
    fn test_owned_tunnel_is_authorized() {
        for status in ALL {
            assert_eq!(authorize(status, ConnectionIntent::CONNECT), Authorization::Authorized);
        }
    }

    #[test]
    fn test_settled_states_never_need_ownership() {
        for status in ALL.into_iter().filter(|s| !s.is_live()) {
            assert_eq!(authorize(status, ConnectionIntent::IDLE), Authorization::Authorized);
        }
    }
}
