//! In-process tunnel provider
//!
//! `SimulatedProvider` keeps profiles and tunnel status in memory. It records
//! every call so tests can assert what the controller asked for, and lets the
//! caller inject status events, live status and failures. In autonomous mode
//! it walks through Connecting/Connected and Disconnecting/Disconnected on
//! its own, which is what `tunnelguard run --simulate` uses.

use crate::error::ProvisioningError;
use crate::tunnel::{
    ProfileConfiguration, ProfileHandle, StatusStream, TunnelProvider, TunnelStatus,
};
use crate::types::Credentials;
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::debug;

/// A call the controller made into the provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderCall {
    LoadProfiles,
    CreateProfile { provider_id: String },
    UpdateConfig { config: String },
    Start { config: String, with_credentials: bool },
    Stop,
    RequestStatistics,
}

#[derive(Debug, Default)]
struct Failures {
    load: Option<String>,
    create: Option<String>,
    update: Option<String>,
    start: Option<String>,
    stop: Option<String>,
}

#[derive(Debug, Default)]
struct SimState {
    profiles: Vec<ProfileHandle>,
    configuration: Option<ProfileConfiguration>,
    status: Option<TunnelStatus>,
    subscribers: Vec<mpsc::UnboundedSender<TunnelStatus>>,
    calls: Vec<ProviderCall>,
    failures: Failures,
    next_id: u32,
}

/// Shared in-memory provider; clones observe the same state
#[derive(Clone, Debug, Default)]
pub struct SimulatedProvider {
    state: Arc<Mutex<SimState>>,
    autonomous: bool,
}

impl SimulatedProvider {
    /// Provider that only changes status when told to
    pub fn new() -> Self {
        Self::default()
    }

    /// Provider that reports status transitions for start/stop by itself
    pub fn autonomous() -> Self {
        Self {
            autonomous: true,
            ..Self::default()
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        // A panic while holding the lock only happens inside a failing test
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Store a profile as if another process had provisioned it
    pub fn add_profile(&self, provider_id: &str, description: &str) -> ProfileHandle {
        let mut state = self.lock();
        let profile = next_profile(&mut state, provider_id, description);
        state.profiles.push(profile.clone());
        profile
    }

    pub fn profiles(&self) -> Vec<ProfileHandle> {
        self.lock().profiles.clone()
    }

    /// Change the live status without notifying subscribers
    pub fn set_status(&self, status: Option<TunnelStatus>) {
        self.lock().status = status;
    }

    /// Change the live status and notify every subscriber
    pub fn emit(&self, status: TunnelStatus) {
        let mut state = self.lock();
        publish(&mut state, status);
    }

    pub fn calls(&self) -> Vec<ProviderCall> {
        self.lock().calls.clone()
    }

    /// Configs passed to every accepted `start_tunnel`, oldest first
    pub fn started_configs(&self) -> Vec<String> {
        self.lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                ProviderCall::Start { config, .. } => Some(config.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn stop_count(&self) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|call| **call == ProviderCall::Stop)
            .count()
    }

    /// Last configuration delivered through `update_profile_config`
    pub fn configuration(&self) -> Option<ProfileConfiguration> {
        self.lock().configuration.clone()
    }

    /// Subscriptions whose receiver is still alive
    pub fn active_subscribers(&self) -> usize {
        let mut state = self.lock();
        state.subscribers.retain(|tx| !tx.is_closed());
        state.subscribers.len()
    }

    pub fn fail_load(&self, reason: Option<&str>) {
        self.lock().failures.load = reason.map(str::to_string);
    }

    pub fn fail_create(&self, reason: Option<&str>) {
        self.lock().failures.create = reason.map(str::to_string);
    }

    pub fn fail_update(&self, reason: Option<&str>) {
        self.lock().failures.update = reason.map(str::to_string);
    }

    pub fn fail_start(&self, reason: Option<&str>) {
        self.lock().failures.start = reason.map(str::to_string);
    }

    pub fn fail_stop(&self, reason: Option<&str>) {
        self.lock().failures.stop = reason.map(str::to_string);
    }
}

fn next_profile(state: &mut SimState, provider_id: &str, description: &str) -> ProfileHandle {
    state.next_id += 1;
    ProfileHandle {
        id: format!("sim-{}", state.next_id),
        provider_id: provider_id.to_string(),
        description: description.to_string(),
    }
}

fn publish(state: &mut SimState, status: TunnelStatus) {
    state.status = Some(status);
    state.subscribers.retain(|tx| tx.send(status).is_ok());
    debug!(?status, subscribers = state.subscribers.len(), "Simulated status change");
}

fn ensure_known(state: &SimState, profile: &ProfileHandle) -> Result<(), ProvisioningError> {
    if state.profiles.iter().any(|known| known.id == profile.id) {
        Ok(())
    } else {
        Err(ProvisioningError::ProfileMissing {
            profile: profile.id.clone(),
        })
    }
}

#[async_trait]
impl TunnelProvider for SimulatedProvider {
    async fn load_profiles(&self) -> Result<Vec<ProfileHandle>, ProvisioningError> {
        let mut state = self.lock();
        state.calls.push(ProviderCall::LoadProfiles);
        if let Some(reason) = state.failures.load.clone() {
            return Err(ProvisioningError::LoadFailed { reason });
        }
        Ok(state.profiles.clone())
    }

    async fn create_profile(
        &self,
        provider_id: &str,
        description: &str,
    ) -> Result<ProfileHandle, ProvisioningError> {
        let mut state = self.lock();
        state.calls.push(ProviderCall::CreateProfile {
            provider_id: provider_id.to_string(),
        });
        if let Some(reason) = state.failures.create.clone() {
            return Err(ProvisioningError::SaveFailed { reason });
        }
        let profile = next_profile(&mut state, provider_id, description);
        state.profiles.push(profile.clone());
        Ok(profile)
    }

    async fn update_profile_config(
        &self,
        profile: &ProfileHandle,
        configuration: &ProfileConfiguration,
    ) -> Result<(), ProvisioningError> {
        let mut state = self.lock();
        state.calls.push(ProviderCall::UpdateConfig {
            config: configuration.config.clone(),
        });
        if let Some(reason) = state.failures.update.clone() {
            return Err(ProvisioningError::SaveFailed { reason });
        }
        ensure_known(&state, profile)?;
        state.configuration = Some(configuration.clone());
        Ok(())
    }

    async fn start_tunnel(
        &self,
        profile: &ProfileHandle,
        credentials: Option<&Credentials>,
    ) -> Result<(), ProvisioningError> {
        let mut state = self.lock();
        let config = state
            .configuration
            .as_ref()
            .map(|c| c.config.clone())
            .unwrap_or_default();
        if let Some(reason) = state.failures.start.clone() {
            return Err(ProvisioningError::StartFailed { reason });
        }
        ensure_known(&state, profile)?;
        state.calls.push(ProviderCall::Start {
            config,
            with_credentials: credentials.is_some(),
        });
        if self.autonomous {
            publish(&mut state, TunnelStatus::Connecting);
            publish(&mut state, TunnelStatus::Connected);
        }
        Ok(())
    }

    async fn stop_tunnel(&self, _profile: &ProfileHandle) -> Result<(), ProvisioningError> {
        let mut state = self.lock();
        state.calls.push(ProviderCall::Stop);
        if let Some(reason) = state.failures.stop.clone() {
            return Err(ProvisioningError::StopFailed { reason });
        }
        if self.autonomous && state.status.is_some_and(TunnelStatus::is_live) {
            publish(&mut state, TunnelStatus::Disconnecting);
            publish(&mut state, TunnelStatus::Disconnected);
        }
        Ok(())
    }

    fn query_status(&self, _profile: &ProfileHandle) -> Option<TunnelStatus> {
        self.lock().status
    }

    fn subscribe(&self, _profile: &ProfileHandle) -> StatusStream {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().subscribers.push(tx);
        rx
    }

    async fn request_statistics(&self, _profile: &ProfileHandle) -> Result<(), ProvisioningError> {
        self.lock().calls.push(ProviderCall::RequestStatistics);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_records_calls_in_order() {
        let provider = SimulatedProvider::new();
        let profile = provider.create_profile("net.example", "Example").await.unwrap();
        let configuration = ProfileConfiguration {
            config: "cfg-a".to_string(),
            group_id: "g".to_string(),
            username: None,
            password: None,
            server_address: "Example".to_string(),
            disconnect_on_sleep: false,
            enabled: true,
        };
        provider
            .update_profile_config(&profile, &configuration)
            .await
            .unwrap();
        provider.start_tunnel(&profile, None).await.unwrap();
        provider.stop_tunnel(&profile).await.unwrap();

        assert_eq!(
            provider.calls(),
            vec![
                ProviderCall::CreateProfile {
                    provider_id: "net.example".to_string()
                },
                ProviderCall::UpdateConfig {
                    config: "cfg-a".to_string()
                },
                ProviderCall::Start {
                    config: "cfg-a".to_string(),
                    with_credentials: false
                },
                ProviderCall::Stop,
            ]
        );
        assert_eq!(provider.started_configs(), vec!["cfg-a".to_string()]);
    }

    #[tokio::test]
    async fn test_autonomous_start_reports_connected() {
        let provider = SimulatedProvider::autonomous();
        let profile = provider.add_profile("net.example", "Example");
        let mut events = provider.subscribe(&profile);

        provider.start_tunnel(&profile, None).await.unwrap();
        assert_eq!(events.recv().await, Some(TunnelStatus::Connecting));
        assert_eq!(events.recv().await, Some(TunnelStatus::Connected));
        assert_eq!(provider.query_status(&profile), Some(TunnelStatus::Connected));

        provider.stop_tunnel(&profile).await.unwrap();
        assert_eq!(events.recv().await, Some(TunnelStatus::Disconnecting));
        assert_eq!(events.recv().await, Some(TunnelStatus::Disconnected));
    }

    #[tokio::test]
    async fn test_dropped_subscription_is_pruned() {
        let provider = SimulatedProvider::new();
        let profile = provider.add_profile("net.example", "Example");
        let events = provider.subscribe(&profile);
        assert_eq!(provider.active_subscribers(), 1);

        drop(events);
        assert_eq!(provider.active_subscribers(), 0);
    }

    #[tokio::test]
    async fn test_injected_start_failure() {
        let provider = SimulatedProvider::new();
        let profile = provider.add_profile("net.example", "Example");
        provider.fail_start(Some("permission denied"));

        let result = provider.start_tunnel(&profile, None).await;
        assert_eq!(
            result,
            Err(ProvisioningError::StartFailed {
                reason: "permission denied".to_string()
            })
        );
        assert!(provider.started_configs().is_empty());
    }
}
