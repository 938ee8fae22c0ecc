//! Provisioning lane
//!
//! Provider calls are asynchronous and may take seconds (spawning a process,
//! waiting on a profile save). They run on this worker, one at a time and in
//! submission order, so a stop queued before a start is also executed before
//! it. Results re-enter the controller as [`ControllerCommand`]s.

use crate::error::{ProvisioningError, SessionError};
use crate::session::{ConnectOrigin, ControllerCommand};
use crate::store::PersistedIntentStore;
use crate::tunnel::{
    resolve_or_create_profile, ProfileConfiguration, ProfileHandle, Stage, TunnelProvider,
};
use crate::types::{Credentials, IdentityParams};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Work item for the provisioning lane
pub(crate) enum ProvisioningJob {
    /// Bind to the profile for an `initialize` call
    Resolve {
        generation: u64,
        identity: IdentityParams,
        auto_reconnect: bool,
        reply: oneshot::Sender<Result<Stage, SessionError>>,
    },
    /// Deliver configuration, then start the tunnel
    Start {
        attempt: u64,
        profile: ProfileHandle,
        configuration: Box<ProfileConfiguration>,
        credentials: Option<Credentials>,
        origin: ConnectOrigin,
    },
    Stop {
        profile: ProfileHandle,
        trigger: &'static str,
    },
    /// Refresh and read the traffic report
    Statistics {
        profile: ProfileHandle,
        store: PersistedIntentStore,
        reply: oneshot::Sender<Result<Option<String>, SessionError>>,
    },
}

/// Spawn the lane worker and return its job queue
///
/// The worker ends once the controller drops the queue.
pub(crate) fn spawn(
    provider: Arc<dyn TunnelProvider>,
    controller: mpsc::WeakUnboundedSender<ControllerCommand>,
) -> mpsc::UnboundedSender<ProvisioningJob> {
    let (jobs_tx, mut jobs_rx) = mpsc::unbounded_channel::<ProvisioningJob>();

    tokio::spawn(async move {
        while let Some(job) = jobs_rx.recv().await {
            if let Some(completion) = run_job(provider.as_ref(), job).await {
                let delivered = controller
                    .upgrade()
                    .is_some_and(|tx| tx.send(completion).is_ok());
                if !delivered {
                    debug!("Controller gone, dropping provisioning result");
                }
            }
        }
        debug!("Provisioning lane stopped");
    });

    jobs_tx
}

async fn run_job(provider: &dyn TunnelProvider, job: ProvisioningJob) -> Option<ControllerCommand> {
    match job {
        ProvisioningJob::Resolve {
            generation,
            identity,
            auto_reconnect,
            reply,
        } => {
            let result = resolve_or_create_profile(provider, &identity).await;
            Some(ControllerCommand::ProfileResolved {
                generation,
                identity,
                auto_reconnect,
                result,
                reply,
            })
        }
        ProvisioningJob::Start {
            attempt,
            profile,
            configuration,
            credentials,
            origin,
        } => {
            let result =
                configure_and_start(provider, &profile, &configuration, credentials.as_ref())
                    .await;
            Some(ControllerCommand::StartCompleted {
                attempt,
                origin,
                result,
            })
        }
        ProvisioningJob::Stop { profile, trigger } => {
            // No caller to report to; intent was already updated
            if let Err(e) = provider.stop_tunnel(&profile).await {
                warn!(trigger, profile = %profile.id, error = %e, "Failed to stop tunnel");
            }
            None
        }
        ProvisioningJob::Statistics {
            profile,
            store,
            reply,
        } => {
            if let Err(e) = provider.request_statistics(&profile).await {
                debug!(error = %e, "Statistics refresh failed, returning last report");
            }
            let _ = reply.send(store.connection_update().map_err(SessionError::from));
            None
        }
    }
}

async fn configure_and_start(
    provider: &dyn TunnelProvider,
    profile: &ProfileHandle,
    configuration: &ProfileConfiguration,
    credentials: Option<&Credentials>,
) -> Result<(), ProvisioningError> {
    provider.update_profile_config(profile, configuration).await?;
    provider.start_tunnel(profile, credentials).await
}
