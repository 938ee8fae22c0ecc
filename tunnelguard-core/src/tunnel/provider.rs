//! Boundary to the tunnel provisioning subsystem
//!
//! Everything that actually establishes a tunnel lives behind
//! [`TunnelProvider`]. The session controller only binds to a profile,
//! delivers configuration, starts/stops the tunnel and listens to status.

use crate::error::{ProvisioningError, SessionError};
use crate::tunnel::TunnelStatus;
use crate::types::{Credentials, IdentityParams, TunnelPassword};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Stream of status changes for one profile
///
/// Delivery is at-least-once with best-effort ordering. Dropping the receiver
/// unregisters the subscription.
pub type StatusStream = mpsc::UnboundedReceiver<TunnelStatus>;

/// Stored tunnel profile the controller is bound to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileHandle {
    /// Backend specific identifier of the stored profile
    pub id: String,
    /// Provider the profile dispatches to (exact-match key)
    pub provider_id: String,
    pub description: String,
}

/// Configuration delivered to a profile before its tunnel is started
#[derive(Debug, Clone)]
pub struct ProfileConfiguration {
    /// Opaque tunnel configuration
    pub config: String,
    pub group_id: String,
    pub username: Option<String>,
    pub password: Option<TunnelPassword>,
    /// Displayed server address; the profile description
    pub server_address: String,
    pub disconnect_on_sleep: bool,
    pub enabled: bool,
}

/// Tunnel provisioning backend
#[async_trait]
pub trait TunnelProvider: Send + Sync {
    /// Load every stored profile
    async fn load_profiles(&self) -> Result<Vec<ProfileHandle>, ProvisioningError>;

    /// Create a minimal profile (no tunnel configuration yet)
    async fn create_profile(
        &self,
        provider_id: &str,
        description: &str,
    ) -> Result<ProfileHandle, ProvisioningError>;

    /// Save configuration and credentials; must complete before `start_tunnel`
    async fn update_profile_config(
        &self,
        profile: &ProfileHandle,
        configuration: &ProfileConfiguration,
    ) -> Result<(), ProvisioningError>;

    /// Ask the backend to bring the tunnel up
    ///
    /// Success means the attempt was accepted, not that the tunnel is up;
    /// progress is reported through the status stream.
    async fn start_tunnel(
        &self,
        profile: &ProfileHandle,
        credentials: Option<&Credentials>,
    ) -> Result<(), ProvisioningError>;

    /// Ask the backend to bring the tunnel down
    async fn stop_tunnel(&self, profile: &ProfileHandle) -> Result<(), ProvisioningError>;

    /// Live status, `None` when the backend has nothing to report
    fn query_status(&self, profile: &ProfileHandle) -> Option<TunnelStatus>;

    /// Subscribe to status changes of a profile
    fn subscribe(&self, profile: &ProfileHandle) -> StatusStream;

    /// Ask the tunnel to refresh its traffic report
    async fn request_statistics(&self, _profile: &ProfileHandle) -> Result<(), ProvisioningError> {
        Ok(())
    }
}

/// Find the profile whose provider id matches exactly
pub async fn find_profile(
    provider: &dyn TunnelProvider,
    provider_id: &str,
) -> Result<Option<ProfileHandle>, ProvisioningError> {
    let profiles = provider.load_profiles().await?;
    debug!(count = profiles.len(), provider_id, "Loaded tunnel profiles");
    Ok(profiles
        .into_iter()
        .find(|profile| profile.provider_id == provider_id))
}

/// Bind to the exact-match profile, creating it when none exists
///
/// Never falls back to an unrelated profile.
pub async fn resolve_or_create_profile(
    provider: &dyn TunnelProvider,
    identity: &IdentityParams,
) -> Result<ProfileHandle, SessionError> {
    if let Some(profile) = find_profile(provider, &identity.provider_id).await? {
        debug!(profile = %profile.id, "Found existing tunnel profile");
        return Ok(profile);
    }

    match provider
        .create_profile(&identity.provider_id, &identity.description)
        .await
    {
        Ok(profile) => {
            info!(
                profile = %profile.id,
                provider_id = %identity.provider_id,
                "Created tunnel profile"
            );
            Ok(profile)
        }
        Err(e) => {
            warn!(
                provider_id = %identity.provider_id,
                error = %e,
                "No tunnel profile could be created"
            );
            Err(SessionError::NoProfileAvailable {
                provider_id: identity.provider_id.clone(),
            })
        }
    }
}
