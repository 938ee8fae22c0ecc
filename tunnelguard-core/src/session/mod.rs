//! Session lifecycle controller
//!
//! [`SessionController`] is a cheap, cloneable handle. All controller state
//! is owned by a single actor task; handle methods, provider status events,
//! reconnect fires, monitor ticks and provisioning results are all
//! [`ControllerCommand`]s on one queue, so no transition can interleave with
//! another.

mod actor;
pub mod guard;
mod lane;
pub mod limit;
pub mod monitor;
pub mod scheduler;
pub mod stage;

pub use guard::{authorize, Authorization};
pub use limit::SessionLimit;
pub use monitor::ConnectionMonitor;
pub use scheduler::ReconnectScheduler;
pub use stage::StageSink;

use crate::config::Timing;
use crate::error::{ProvisioningError, SessionError};
use crate::store::KeyValueStore;
use crate::tunnel::{find_profile, ProfileHandle, Stage, TunnelProvider, TunnelStatus};
use crate::types::{ConnectionIntent, IdentityParams, SessionConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

/// Who is waiting for a tunnel start
pub(crate) enum ConnectOrigin {
    /// An explicit `connect` call
    Caller(oneshot::Sender<Result<(), SessionError>>),
    /// A reconnect fire
    Reconnect,
}

/// Messages processed by the controller actor
pub(crate) enum ControllerCommand {
    Initialize {
        identity: IdentityParams,
        auto_reconnect: bool,
        reply: oneshot::Sender<Result<Stage, SessionError>>,
    },
    Connect {
        config: SessionConfig,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    SetAutoReconnect {
        enabled: bool,
    },
    Dispose {
        reply: oneshot::Sender<()>,
    },
    CurrentStage {
        reply: oneshot::Sender<Stage>,
    },
    ProviderStatusChanged {
        status: TunnelStatus,
    },
    SubscribeStages {
        subscriber: mpsc::UnboundedSender<Stage>,
    },
    UnsubscribeStages,
    ConnectionStatus {
        reply: oneshot::Sender<Result<Option<String>, SessionError>>,
    },
    Snapshot {
        reply: oneshot::Sender<ControllerSnapshot>,
    },
    StartSessionTimer {
        limit: Option<Duration>,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },

    // Re-entry from timers and the provisioning lane
    ReconnectFired {
        generation: u64,
    },
    MonitorTick {
        generation: u64,
    },
    SessionLimitReached {
        generation: u64,
    },
    ProfileResolved {
        generation: u64,
        identity: IdentityParams,
        auto_reconnect: bool,
        result: Result<ProfileHandle, SessionError>,
        reply: oneshot::Sender<Result<Stage, SessionError>>,
    },
    StartCompleted {
        attempt: u64,
        origin: ConnectOrigin,
        result: Result<(), ProvisioningError>,
    },
}

/// Point-in-time view of the controller state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerSnapshot {
    /// Bound profile, `None` until `initialize` completed
    pub profile: Option<ProfileHandle>,
    pub intent: ConnectionIntent,
    pub auto_reconnect: bool,
    pub manual_disconnect: bool,
    pub has_session_config: bool,
    /// Last status the provider reported, not authoritative
    pub last_status: Option<TunnelStatus>,
    pub reconnect_pending: bool,
    /// How often a reconnect was armed over the controller's lifetime
    pub reconnects_scheduled: u64,
    pub monitor_active: bool,
    pub stage_subscribed: bool,
    /// Time left on the session limit, `None` when unlimited
    pub session_limit_remaining: Option<Duration>,
}

impl ControllerSnapshot {
    pub fn is_initialized(&self) -> bool {
        self.profile.is_some()
    }
}

/// Handle to the session controller actor
///
/// Dropping every clone of the handle stops the actor; timers and the
/// provider subscription go with it.
#[derive(Clone)]
pub struct SessionController {
    commands: mpsc::UnboundedSender<ControllerCommand>,
    provider: Arc<dyn TunnelProvider>,
}

impl std::fmt::Debug for SessionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionController")
            .field("closed", &self.commands.is_closed())
            .finish_non_exhaustive()
    }
}

impl SessionController {
    /// Spawn a controller with the default timer policy
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(provider: Arc<dyn TunnelProvider>, store: Arc<dyn KeyValueStore>) -> Self {
        Self::with_timing(provider, store, Timing::default())
    }

    /// Spawn a controller with an explicit timer policy
    pub fn with_timing(
        provider: Arc<dyn TunnelProvider>,
        store: Arc<dyn KeyValueStore>,
        timing: Timing,
    ) -> Self {
        let (commands, inbox) = mpsc::unbounded_channel();
        let actor = actor::ControllerActor::new(
            Arc::clone(&provider),
            store,
            timing,
            commands.downgrade(),
        );
        tokio::spawn(actor.run(inbox));
        debug!(?timing, "Session controller started");

        Self { commands, provider }
    }

    /// Bind to the tunnel profile and restore the persisted intent
    ///
    /// Returns the live stage after binding. Calling it again re-binds and
    /// replaces the running monitor.
    pub async fn initialize(
        &self,
        identity: IdentityParams,
        auto_reconnect: bool,
    ) -> Result<Stage, SessionError> {
        self.request(|reply| ControllerCommand::Initialize {
            identity,
            auto_reconnect,
            reply,
        })
        .await?
    }

    /// Start the tunnel with `config` and remember it for reconnects
    ///
    /// Resolves once the provider accepted or rejected the start; progress
    /// after that arrives as stage notifications.
    pub async fn connect(&self, config: SessionConfig) -> Result<(), SessionError> {
        self.request(|reply| ControllerCommand::Connect { config, reply })
            .await?
    }

    /// Stop the tunnel and forget the intent to be connected
    pub async fn disconnect(&self) {
        if self
            .request(|reply| ControllerCommand::Disconnect { reply })
            .await
            .is_err()
        {
            debug!("Disconnect on a stopped controller");
        }
    }

    /// Toggle drop recovery; applies from the next status event on
    pub fn set_auto_reconnect(&self, enabled: bool) {
        let _ = self.send(ControllerCommand::SetAutoReconnect { enabled });
    }

    /// Cancel timers, unsubscribe from the provider and clear the intent
    ///
    /// Does not stop a running tunnel. Safe to call repeatedly.
    pub async fn dispose(&self) {
        if self
            .request(|reply| ControllerCommand::Dispose { reply })
            .await
            .is_err()
        {
            debug!("Dispose on a stopped controller");
        }
    }

    /// Live stage of the bound profile, `disconnected` without a binding
    pub async fn current_stage(&self) -> Stage {
        self.request(|reply| ControllerCommand::CurrentStage { reply })
            .await
            .unwrap_or(Stage::Disconnected)
    }

    /// Feed a status change into the controller
    ///
    /// The bound profile's subscription calls this path already; it is
    /// public for embedders that receive status through other channels.
    pub fn on_provider_status_changed(&self, status: TunnelStatus) {
        let _ = self.send(ControllerCommand::ProviderStatusChanged { status });
    }

    /// Register the stage subscriber, replacing any previous one
    pub fn subscribe_stages(&self) -> mpsc::UnboundedReceiver<Stage> {
        let (subscriber, stages) = mpsc::unbounded_channel();
        let _ = self.send(ControllerCommand::SubscribeStages { subscriber });
        stages
    }

    /// Drop the stage subscriber; fine when there is none
    pub fn unsubscribe_stages(&self) {
        let _ = self.send(ControllerCommand::UnsubscribeStages);
    }

    /// Whether a profile for `provider_id` has been provisioned
    pub async fn check_permission(&self, provider_id: &str) -> Result<bool, SessionError> {
        let profile = find_profile(self.provider.as_ref(), provider_id).await?;
        Ok(profile.is_some())
    }

    /// Provision a minimal profile for `provider_id` unless one exists
    pub async fn request_permission(
        &self,
        provider_id: &str,
        description: &str,
    ) -> Result<bool, SessionError> {
        if find_profile(self.provider.as_ref(), provider_id)
            .await?
            .is_some()
        {
            return Ok(true);
        }
        let profile = self
            .provider
            .create_profile(provider_id, description)
            .await?;
        info!(profile = %profile.id, provider_id, "Provisioned tunnel profile");
        Ok(true)
    }

    /// Disconnect once `limit` has elapsed; `None` lifts the limit
    ///
    /// Re-arming replaces the previous limit. `disconnect`, `dispose` and
    /// `initialize` cancel it.
    pub async fn start_session_timer(&self, limit: Option<Duration>) -> Result<(), SessionError> {
        self.request(|reply| ControllerCommand::StartSessionTimer { limit, reply })
            .await?
    }

    /// Latest traffic report written by the tunnel side
    pub async fn connection_status(&self) -> Result<Option<String>, SessionError> {
        self.request(|reply| ControllerCommand::ConnectionStatus { reply })
            .await?
    }

    pub async fn snapshot(&self) -> Result<ControllerSnapshot, SessionError> {
        self.request(|reply| ControllerCommand::Snapshot { reply })
            .await
    }

    fn send(&self, command: ControllerCommand) -> Result<(), SessionError> {
        self.commands
            .send(command)
            .map_err(|_| SessionError::ControllerGone)
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> ControllerCommand,
    ) -> Result<T, SessionError> {
        let (reply, response) = oneshot::channel();
        self.send(build(reply))?;
        response.await.map_err(|_| SessionError::ControllerGone)
    }
}
