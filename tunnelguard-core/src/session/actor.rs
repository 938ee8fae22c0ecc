//! The controller actor: sole owner of the session state

use crate::config::Timing;
use crate::error::SessionError;
use crate::session::guard::{authorize, Authorization};
use crate::session::lane::{self, ProvisioningJob};
use crate::session::{
    ConnectOrigin, ConnectionMonitor, ControllerCommand, ControllerSnapshot, ReconnectScheduler,
    SessionLimit, StageSink,
};
use crate::store::{KeyValueStore, PersistedIntentStore};
use crate::tunnel::{ProfileConfiguration, ProfileHandle, Stage, TunnelProvider, TunnelStatus};
use crate::types::{ConnectionIntent, IdentityParams, SessionConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// What to do once the live status settled to Disconnected/Invalid
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum DropAction {
    /// A tunnel we started went away underneath us
    ReconnectOwned,
    /// Generic recovery from the remembered session config
    ReconnectRecovery,
    /// Consequence of a deliberate stop, reset the intent
    SettleManualStop,
    Nothing,
}

/// Disconnection policy; the owned-drop branch wins ties
pub(super) fn drop_action(
    intent: ConnectionIntent,
    manual_disconnect: bool,
    auto_reconnect: bool,
    has_session_config: bool,
) -> DropAction {
    let wanted = intent.should_be_connected && !manual_disconnect && auto_reconnect;
    if wanted && intent.app_initiated {
        DropAction::ReconnectOwned
    } else if wanted && has_session_config {
        DropAction::ReconnectRecovery
    } else if manual_disconnect {
        DropAction::SettleManualStop
    } else {
        DropAction::Nothing
    }
}

/// Everything that only exists while bound to a profile
struct Binding {
    identity: IdentityParams,
    profile: ProfileHandle,
    store: PersistedIntentStore,
    forwarder: JoinHandle<()>,
}

impl Drop for Binding {
    fn drop(&mut self) {
        // Dropping the stream unregisters from the provider
        self.forwarder.abort();
    }
}

pub(crate) struct ControllerActor {
    provider: Arc<dyn TunnelProvider>,
    backend: Arc<dyn KeyValueStore>,
    inbox: mpsc::WeakUnboundedSender<ControllerCommand>,
    jobs: mpsc::UnboundedSender<ProvisioningJob>,
    binding: Option<Binding>,
    init_generation: u64,
    connect_attempt: u64,
    pub(super) intent: ConnectionIntent,
    pub(super) manual_disconnect: bool,
    auto_reconnect: bool,
    session_config: Option<SessionConfig>,
    last_status: Option<TunnelStatus>,
    pub(super) scheduler: ReconnectScheduler,
    pub(super) session_limit: SessionLimit,
    monitor: ConnectionMonitor,
    pub(super) stages: StageSink,
}

impl ControllerActor {
    pub(super) fn new(
        provider: Arc<dyn TunnelProvider>,
        backend: Arc<dyn KeyValueStore>,
        timing: Timing,
        inbox: mpsc::WeakUnboundedSender<ControllerCommand>,
    ) -> Self {
        let jobs = lane::spawn(Arc::clone(&provider), inbox.clone());
        Self {
            provider,
            backend,
            inbox,
            jobs,
            binding: None,
            init_generation: 0,
            connect_attempt: 0,
            intent: ConnectionIntent::IDLE,
            manual_disconnect: false,
            auto_reconnect: false,
            session_config: None,
            last_status: None,
            scheduler: ReconnectScheduler::new(timing.reconnect_delay),
            session_limit: SessionLimit::new(),
            monitor: ConnectionMonitor::new(timing.monitor_interval),
            stages: StageSink::default(),
        }
    }

    /// Process commands until every controller handle is dropped
    pub(super) async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<ControllerCommand>) {
        while let Some(command) = inbox.recv().await {
            self.handle(command);
        }
        self.scheduler.cancel();
        self.session_limit.cancel();
        self.monitor.stop();
        debug!("Session controller stopped");
    }

    fn handle(&mut self, command: ControllerCommand) {
        match command {
            ControllerCommand::Initialize {
                identity,
                auto_reconnect,
                reply,
            } => self.initialize(identity, auto_reconnect, reply),
            ControllerCommand::Connect { config, reply } => {
                self.start_connect(config, ConnectOrigin::Caller(reply))
            }
            ControllerCommand::Disconnect { reply } => {
                self.disconnect();
                let _ = reply.send(());
            }
            ControllerCommand::SetAutoReconnect { enabled } => {
                debug!(enabled, "Auto-reconnect updated");
                self.auto_reconnect = enabled;
            }
            ControllerCommand::Dispose { reply } => {
                self.dispose();
                let _ = reply.send(());
            }
            ControllerCommand::CurrentStage { reply } => {
                let _ = reply.send(self.current_stage());
            }
            ControllerCommand::ProviderStatusChanged { status } => self.on_status(status),
            ControllerCommand::SubscribeStages { subscriber } => self.stages.replace(subscriber),
            ControllerCommand::UnsubscribeStages => self.stages.clear(),
            ControllerCommand::ConnectionStatus { reply } => self.connection_status(reply),
            ControllerCommand::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            ControllerCommand::StartSessionTimer { limit, reply } => {
                let _ = reply.send(self.arm_session_limit(limit));
            }
            ControllerCommand::ReconnectFired { generation } => self.on_reconnect_fired(generation),
            ControllerCommand::MonitorTick { generation } => self.on_monitor_tick(generation),
            ControllerCommand::SessionLimitReached { generation } => {
                self.on_session_limit_reached(generation)
            }
            ControllerCommand::ProfileResolved {
                generation,
                identity,
                auto_reconnect,
                result,
                reply,
            } => {
                let outcome = self.bind(generation, identity, auto_reconnect, result);
                let _ = reply.send(outcome);
            }
            ControllerCommand::StartCompleted {
                attempt,
                origin,
                result,
            } => self.on_start_completed(attempt, origin, result),
        }
    }

    #[tracing::instrument(
        skip(self, reply),
        fields(provider_id = %identity.provider_id, group = %identity.group_id)
    )]
    fn initialize(
        &mut self,
        identity: IdentityParams,
        auto_reconnect: bool,
        reply: oneshot::Sender<Result<Stage, SessionError>>,
    ) {
        if let Err(e) = identity.validate() {
            let _ = reply.send(Err(e));
            return;
        }

        // Re-initialization starts from a clean slate
        self.monitor.stop();
        self.scheduler.cancel();
        self.session_limit.cancel();
        self.binding = None;
        self.init_generation += 1;
        self.auto_reconnect = auto_reconnect;

        self.submit(ProvisioningJob::Resolve {
            generation: self.init_generation,
            identity,
            auto_reconnect,
            reply,
        });
    }

    fn bind(
        &mut self,
        generation: u64,
        identity: IdentityParams,
        auto_reconnect: bool,
        resolved: Result<ProfileHandle, SessionError>,
    ) -> Result<Stage, SessionError> {
        if generation != self.init_generation {
            debug!(generation, "Initialization superseded before the profile resolved");
            return Err(SessionError::NotInitialized);
        }
        let profile = resolved?;

        let store = PersistedIntentStore::new(Arc::clone(&self.backend), identity.group_id.clone());
        self.intent = store.load()?;

        let forwarder = self.forward_status(&profile);
        self.binding = Some(Binding {
            identity,
            profile: profile.clone(),
            store,
            forwarder,
        });
        self.start_monitor();

        let live = self.provider.query_status(&profile);
        self.last_status = live;
        info!(
            profile = %profile.id,
            ?live,
            should_be_connected = self.intent.should_be_connected,
            app_initiated = self.intent.app_initiated,
            auto_reconnect,
            "Session controller bound to profile"
        );

        let settled = live.map_or(true, TunnelStatus::is_settled_down);
        if self.intent.should_be_connected && auto_reconnect && settled {
            info!("Restoring previous session, scheduling reconnect");
            self.schedule_reconnect();
        }

        Ok(live.map(Stage::from).unwrap_or(Stage::Disconnected))
    }

    #[tracing::instrument(skip_all, fields(attempt = self.connect_attempt + 1))]
    fn start_connect(&mut self, config: SessionConfig, origin: ConnectOrigin) {
        let Some(binding) = &self.binding else {
            reject(origin, SessionError::NotInitialized);
            return;
        };
        if config.config.trim().is_empty() {
            reject(
                origin,
                SessionError::MissingParameter {
                    field: "config".to_string(),
                },
            );
            return;
        }

        let profile = binding.profile.clone();
        let configuration = Box::new(ProfileConfiguration {
            config: config.config.clone(),
            group_id: binding.identity.group_id.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
            server_address: profile.description.clone(),
            disconnect_on_sleep: false,
            enabled: true,
        });

        let previous = self.intent;
        if let Err(e) = self.commit_intent(ConnectionIntent::CONNECT) {
            error!(error = %e, "Failed to persist connect intent");
            self.intent = previous;
            reject(origin, e.into());
            return;
        }
        // A new start supersedes a stop whose Disconnected never arrived
        self.manual_disconnect = false;
        self.scheduler.cancel();
        let credentials = config.credentials();
        self.session_config = Some(config);
        self.connect_attempt += 1;

        info!(profile = %profile.id, with_credentials = credentials.is_some(), "Starting tunnel");
        self.submit(ProvisioningJob::Start {
            attempt: self.connect_attempt,
            profile,
            configuration,
            credentials,
            origin,
        });
    }

    fn on_start_completed(
        &mut self,
        attempt: u64,
        origin: ConnectOrigin,
        result: Result<(), crate::error::ProvisioningError>,
    ) {
        let error = match result {
            Ok(()) => {
                debug!(attempt, "Tunnel start accepted");
                if let ConnectOrigin::Caller(reply) = origin {
                    let _ = reply.send(Ok(()));
                }
                return;
            }
            Err(e) => e,
        };

        warn!(attempt, error = %error, "Tunnel start failed");
        // Report first, then roll back
        reject(origin, error.into());

        if attempt == self.connect_attempt && self.intent.app_initiated {
            self.commit_intent_logged(ConnectionIntent::IDLE);
        }
    }

    #[tracing::instrument(skip(self))]
    fn disconnect(&mut self) {
        info!("Disconnect requested");
        self.manual_disconnect = true;
        self.commit_intent_logged(ConnectionIntent::IDLE);
        self.scheduler.cancel();
        self.session_limit.cancel();
        self.enqueue_stop("disconnect");
    }

    #[tracing::instrument(skip(self))]
    fn dispose(&mut self) {
        self.scheduler.cancel();
        self.session_limit.cancel();
        self.monitor.stop();
        self.commit_intent_logged(ConnectionIntent::IDLE);
        if let Some(binding) = self.binding.take() {
            info!(profile = %binding.profile.id, "Session controller disposed");
        }
        self.session_config = None;
        self.manual_disconnect = false;
        self.last_status = None;
        // Late provisioning results belong to the disposed session
        self.init_generation += 1;
        self.connect_attempt += 1;
    }

    fn current_stage(&self) -> Stage {
        self.binding
            .as_ref()
            .and_then(|binding| self.provider.query_status(&binding.profile))
            .map(Stage::from)
            .unwrap_or(Stage::Disconnected)
    }

    #[tracing::instrument(skip(self))]
    fn on_status(&mut self, status: TunnelStatus) {
        self.last_status = Some(status);

        if authorize(status, self.intent) == Authorization::Unauthorized {
            self.force_disconnect("status event");
            return;
        }

        match status {
            TunnelStatus::Connected => {
                self.commit_intent_logged(ConnectionIntent {
                    should_be_connected: true,
                    ..self.intent
                });
                self.scheduler.cancel();
                self.stages.emit(Stage::Connected);
            }
            TunnelStatus::Disconnected | TunnelStatus::Invalid => {
                self.stages.emit(Stage::from(status));
                self.handle_drop();
            }
            TunnelStatus::Connecting | TunnelStatus::Disconnecting | TunnelStatus::Reasserting => {
                self.stages.emit(Stage::from(status));
            }
        }
    }

    fn handle_drop(&mut self) {
        let action = drop_action(
            self.intent,
            self.manual_disconnect,
            self.auto_reconnect,
            self.session_config.is_some(),
        );
        debug!(?action, "Tunnel settled down");

        match action {
            DropAction::ReconnectOwned | DropAction::ReconnectRecovery => {
                info!("Tunnel dropped unexpectedly, scheduling reconnect");
                self.schedule_reconnect();
            }
            DropAction::SettleManualStop => {
                self.manual_disconnect = false;
                self.commit_intent_logged(ConnectionIntent::IDLE);
            }
            DropAction::Nothing => {}
        }
    }

    fn schedule_reconnect(&mut self) {
        let inbox = self.inbox.clone();
        self.scheduler.schedule(move |generation| {
            if let Some(tx) = inbox.upgrade() {
                let _ = tx.send(ControllerCommand::ReconnectFired { generation });
            }
        });
    }

    #[tracing::instrument(skip(self))]
    fn on_reconnect_fired(&mut self, generation: u64) {
        if !self.scheduler.take_fire(generation) {
            return;
        }
        match self.session_config.clone() {
            Some(config) => {
                info!("Reconnecting with the last session config");
                self.start_connect(config, ConnectOrigin::Reconnect);
            }
            None => debug!("No session config remembered, skipping reconnect"),
        }
    }

    #[tracing::instrument(skip(self))]
    fn arm_session_limit(&mut self, limit: Option<Duration>) -> Result<(), SessionError> {
        if self.binding.is_none() {
            return Err(SessionError::NotInitialized);
        }
        let Some(limit) = limit else {
            if self.session_limit.cancel() {
                info!("Session limit lifted");
            }
            return Ok(());
        };
        if limit.is_zero() {
            return Err(SessionError::MissingParameter {
                field: "duration_seconds".to_string(),
            });
        }

        let inbox = self.inbox.clone();
        self.session_limit.arm(limit, move |generation| {
            if let Some(tx) = inbox.upgrade() {
                let _ = tx.send(ControllerCommand::SessionLimitReached { generation });
            }
        });
        info!(limit_secs = limit.as_secs(), "Session limit armed");
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    fn on_session_limit_reached(&mut self, generation: u64) {
        if !self.session_limit.take_expiry(generation) {
            return;
        }
        info!("Session limit reached");
        self.disconnect();
    }

    fn start_monitor(&mut self) {
        let inbox = self.inbox.clone();
        self.monitor.start(move |generation| {
            inbox
                .upgrade()
                .is_some_and(|tx| tx.send(ControllerCommand::MonitorTick { generation }).is_ok())
        });
    }

    #[tracing::instrument(skip(self))]
    fn on_monitor_tick(&mut self, generation: u64) {
        if !self.monitor.accepts(generation) {
            return;
        }
        let Some(binding) = &self.binding else {
            return;
        };
        if let Some(status) = self.provider.query_status(&binding.profile) {
            if authorize(status, self.intent) == Authorization::Unauthorized {
                self.force_disconnect("monitor poll");
            }
        }
    }

    fn connection_status(&self, reply: oneshot::Sender<Result<Option<String>, SessionError>>) {
        match &self.binding {
            Some(binding) => self.submit(ProvisioningJob::Statistics {
                profile: binding.profile.clone(),
                store: binding.store.clone(),
                reply,
            }),
            None => {
                let _ = reply.send(Ok(None));
            }
        }
    }

    fn snapshot(&self) -> ControllerSnapshot {
        ControllerSnapshot {
            profile: self.binding.as_ref().map(|b| b.profile.clone()),
            intent: self.intent,
            auto_reconnect: self.auto_reconnect,
            manual_disconnect: self.manual_disconnect,
            has_session_config: self.session_config.is_some(),
            last_status: self.last_status,
            reconnect_pending: self.scheduler.is_pending(),
            reconnects_scheduled: self.scheduler.scheduled_total(),
            monitor_active: self.monitor.is_active(),
            stage_subscribed: self.stages.has_subscriber(),
            session_limit_remaining: self.session_limit.remaining(),
        }
    }

    fn forward_status(&self, profile: &ProfileHandle) -> JoinHandle<()> {
        let mut statuses = self.provider.subscribe(profile);
        let inbox = self.inbox.clone();
        tokio::spawn(async move {
            while let Some(status) = statuses.recv().await {
                let Some(tx) = inbox.upgrade() else { break };
                if tx
                    .send(ControllerCommand::ProviderStatusChanged { status })
                    .is_err()
                {
                    break;
                }
            }
        })
    }

    pub(super) fn enqueue_stop(&self, trigger: &'static str) {
        if let Some(binding) = &self.binding {
            self.submit(ProvisioningJob::Stop {
                profile: binding.profile.clone(),
                trigger,
            });
        }
    }

    fn submit(&self, job: ProvisioningJob) {
        if self.jobs.send(job).is_err() {
            error!("Provisioning lane is gone");
        }
    }

    /// Update the intent, writing through to the store when bound
    fn commit_intent(&mut self, intent: ConnectionIntent) -> Result<(), crate::error::StoreError> {
        if let Some(binding) = &self.binding {
            binding.store.save(&intent)?;
        }
        self.intent = intent;
        Ok(())
    }

    /// Like `commit_intent`, for paths without a caller to report to
    pub(super) fn commit_intent_logged(&mut self, intent: ConnectionIntent) {
        if let Err(e) = self.commit_intent(intent) {
            error!(
                error = %e,
                ?intent,
                "Failed to persist intent, continuing with in-memory state"
            );
            self.intent = intent;
        }
    }
}

fn reject(origin: ConnectOrigin, error: SessionError) {
    match origin {
        ConnectOrigin::Caller(reply) => {
            let _ = reply.send(Err(error));
        }
        ConnectOrigin::Reconnect => warn!(error = %error, "Reconnect attempt failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OWNED: ConnectionIntent = ConnectionIntent::CONNECT;
    const WANTED_NOT_OWNED: ConnectionIntent = ConnectionIntent {
        should_be_connected: true,
        app_initiated: false,
    };

    #[test]
    fn test_owned_drop_reconnects_without_config() {
        assert_eq!(drop_action(OWNED, false, true, false), DropAction::ReconnectOwned);
    }

    #[test]
    fn test_recovery_needs_config() {
        assert_eq!(
            drop_action(WANTED_NOT_OWNED, false, true, true),
            DropAction::ReconnectRecovery
        );
        assert_eq!(drop_action(WANTED_NOT_OWNED, false, true, false), DropAction::Nothing);
    }

    #[test]
    fn test_manual_stop_settles() {
        assert_eq!(drop_action(OWNED, true, true, true), DropAction::SettleManualStop);
        assert_eq!(
            drop_action(ConnectionIntent::IDLE, true, false, false),
            DropAction::SettleManualStop
        );
    }

    #[test]
    fn test_no_auto_reconnect_means_no_action() {
        assert_eq!(drop_action(OWNED, false, false, true), DropAction::Nothing);
        assert_eq!(drop_action(ConnectionIntent::IDLE, false, true, true), DropAction::Nothing);
    }
}
