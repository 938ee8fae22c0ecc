//! OpenVPN process backed tunnel provider
//!
//! Profiles are TOML records in the state directory. Starting a tunnel spawns
//! the `openvpn` binary with the profile's config document; its output is
//! parsed into status transitions for subscribers, and the process exiting
//! is reported as `Disconnected`.

use crate::error::ProvisioningError;
use crate::store::{KeyValueStore, PersistedIntentStore};
use crate::tunnel::output_parser::{OutputEvent, OutputParser, TrafficStats};
use crate::tunnel::{
    ProfileConfiguration, ProfileHandle, StatusStream, TunnelProvider, TunnelStatus,
};
use crate::types::Credentials;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Grace period between SIGTERM and SIGKILL
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

const PROFILES_FILE: &str = "profiles.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ProfileRecord {
    id: String,
    provider_id: String,
    description: String,
    #[serde(default)]
    group_id: Option<String>,
    #[serde(default)]
    enabled: bool,
}

impl From<&ProfileRecord> for ProfileHandle {
    fn from(record: &ProfileRecord) -> Self {
        ProfileHandle {
            id: record.id.clone(),
            provider_id: record.provider_id.clone(),
            description: record.description.clone(),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ProfileFile {
    #[serde(default)]
    profiles: Vec<ProfileRecord>,
}

/// Timing of the current connection, carried in traffic reports
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct SessionClock {
    connected_since: Option<DateTime<Utc>>,
    /// Last statistics dump in which the received byte count grew
    last_packet_receive: Option<DateTime<Utc>>,
    last_byte_in: u64,
}

impl SessionClock {
    fn on_status(&mut self, status: TunnelStatus, now: DateTime<Utc>) {
        match status {
            TunnelStatus::Connected if self.connected_since.is_none() => {
                self.connected_since = Some(now);
            }
            TunnelStatus::Disconnected | TunnelStatus::Invalid => *self = Self::default(),
            _ => {}
        }
    }

    fn on_statistics(&mut self, stats: &TrafficStats, now: DateTime<Utc>) {
        if stats.byte_in > self.last_byte_in {
            self.last_byte_in = stats.byte_in;
            self.last_packet_receive = Some(now);
        }
    }

    fn duration_secs(&self, now: DateTime<Utc>) -> i64 {
        self.connected_since
            .map_or(0, |since| (now - since).num_seconds().max(0))
    }
}

#[derive(Debug, Default)]
struct ProcessState {
    status: Option<TunnelStatus>,
    pid: Option<u32>,
    group_id: Option<String>,
    clock: SessionClock,
    subscribers: Vec<mpsc::UnboundedSender<TunnelStatus>>,
}

/// Provider driving a local `openvpn` process
pub struct OpenVpnProvider {
    binary: PathBuf,
    state_dir: PathBuf,
    reports: Arc<dyn KeyValueStore>,
    parser: Arc<OutputParser>,
    process: Arc<Mutex<ProcessState>>,
}

impl OpenVpnProvider {
    /// Create a provider using `binary`, or the `openvpn` found on PATH
    ///
    /// Traffic reports are written into `reports` under the group id of the
    /// last delivered profile configuration.
    pub fn new(
        binary: Option<PathBuf>,
        state_dir: impl Into<PathBuf>,
        reports: Arc<dyn KeyValueStore>,
    ) -> Result<Self, ProvisioningError> {
        let binary = match binary {
            Some(binary) => binary,
            None => which::which("openvpn").map_err(|e| ProvisioningError::Process {
                reason: format!("openvpn binary not found: {}", e),
            })?,
        };
        let state_dir = state_dir.into();
        std::fs::create_dir_all(&state_dir).map_err(|e| ProvisioningError::LoadFailed {
            reason: format!("Failed to create state directory: {}", e),
        })?;

        debug!(binary = ?binary, state_dir = ?state_dir, "OpenVPN provider ready");
        Ok(Self {
            binary,
            state_dir,
            reports,
            parser: Arc::new(OutputParser::new()),
            process: Arc::new(Mutex::new(ProcessState::default())),
        })
    }

    fn process(&self) -> MutexGuard<'_, ProcessState> {
        lock_process(&self.process)
    }

    fn profiles_path(&self) -> PathBuf {
        self.state_dir.join(PROFILES_FILE)
    }

    fn profile_dir(&self, profile: &ProfileHandle) -> PathBuf {
        self.state_dir.join("profiles").join(&profile.id)
    }

    fn read_profiles(&self) -> Result<ProfileFile, ProvisioningError> {
        match std::fs::read_to_string(self.profiles_path()) {
            Ok(contents) => toml::from_str(&contents).map_err(|e| ProvisioningError::LoadFailed {
                reason: format!("Failed to parse profiles: {}", e),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ProfileFile::default()),
            Err(e) => Err(ProvisioningError::LoadFailed {
                reason: e.to_string(),
            }),
        }
    }

    fn write_profiles(&self, file: &ProfileFile) -> Result<(), ProvisioningError> {
        let contents = toml::to_string_pretty(file).map_err(|e| ProvisioningError::SaveFailed {
            reason: e.to_string(),
        })?;
        std::fs::write(self.profiles_path(), contents).map_err(|e| ProvisioningError::SaveFailed {
            reason: e.to_string(),
        })
    }

    fn find_record(&self, profile: &ProfileHandle) -> Result<ProfileRecord, ProvisioningError> {
        self.read_profiles()?
            .profiles
            .into_iter()
            .find(|record| record.id == profile.id)
            .ok_or_else(|| ProvisioningError::ProfileMissing {
                profile: profile.id.clone(),
            })
    }

    fn write_credentials(
        &self,
        profile: &ProfileHandle,
        credentials: &Credentials,
    ) -> Result<PathBuf, ProvisioningError> {
        use std::os::unix::fs::OpenOptionsExt;

        let path = self.profile_dir(profile).join("auth.txt");
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&path)
            .map_err(|e| ProvisioningError::StartFailed {
                reason: format!("Failed to write credentials: {}", e),
            })?;
        writeln!(
            file,
            "{}\n{}",
            credentials.username,
            credentials.password.expose()
        )
        .map_err(|e| ProvisioningError::StartFailed {
            reason: format!("Failed to write credentials: {}", e),
        })?;
        Ok(path)
    }
}

fn lock_process(process: &Mutex<ProcessState>) -> MutexGuard<'_, ProcessState> {
    process.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn publish(process: &Mutex<ProcessState>, status: TunnelStatus) {
    let mut state = lock_process(process);
    if state.status == Some(status) {
        return;
    }
    state.status = Some(status);
    state.clock.on_status(status, Utc::now());
    state.subscribers.retain(|tx| tx.send(status).is_ok());
    debug!(?status, "OpenVPN status change");
}

fn profile_id_for(provider_id: &str) -> String {
    provider_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect()
}

fn send_signal(pid: u32, signal: nix::sys::signal::Signal) -> Result<(), nix::errno::Errno> {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    kill(Pid::from_raw(pid as i32), signal)
}

/// Read OpenVPN output until the process exits
async fn monitor_output(
    parser: Arc<OutputParser>,
    process: Arc<Mutex<ProcessState>>,
    reports: Arc<dyn KeyValueStore>,
    mut child: tokio::process::Child,
) {
    let stdout = child.stdout.take();
    let mut stats = TrafficStats::default();

    if let Some(stdout) = stdout {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!("OpenVPN: {}", line);
            match parser.parse_line(&line) {
                OutputEvent::Status(status) => publish(&process, status),
                OutputEvent::AuthFailed { message } => {
                    warn!(%message, "OpenVPN authentication failed");
                    publish(&process, TunnelStatus::Disconnecting);
                }
                OutputEvent::StatisticsBegin => stats = TrafficStats::default(),
                OutputEvent::Counter { counter, value } => stats.record(counter, value),
                OutputEvent::StatisticsEnd => {
                    let now = Utc::now();
                    let (group, clock) = {
                        let mut state = lock_process(&process);
                        state.clock.on_statistics(&stats, now);
                        (state.group_id.clone(), state.clock)
                    };
                    if let Some(group) = group {
                        write_report(reports.clone(), &group, &stats, &clock, now);
                    }
                }
                OutputEvent::Unknown => {}
            }
        }
    }

    match child.wait().await {
        Ok(exit) => info!(?exit, "OpenVPN process exited"),
        Err(e) => error!("Failed to reap OpenVPN process: {}", e),
    }

    lock_process(&process).pid = None;
    publish(&process, TunnelStatus::Disconnected);
}

fn write_report(
    reports: Arc<dyn KeyValueStore>,
    group: &str,
    stats: &TrafficStats,
    clock: &SessionClock,
    now: DateTime<Utc>,
) {
    let report = serde_json::json!({
        "updated_at": now.to_rfc3339(),
        "connected_since": clock.connected_since.map(|t| t.to_rfc3339()),
        "duration_secs": clock.duration_secs(now),
        "last_packet_receive": clock.last_packet_receive.map(|t| t.to_rfc3339()),
        "byte_in": stats.byte_in,
        "byte_out": stats.byte_out,
        "tun_read_bytes": stats.tun_read_bytes,
        "tun_write_bytes": stats.tun_write_bytes,
    });
    let store = PersistedIntentStore::new(reports, group);
    if let Err(e) = store.set_connection_update(&report.to_string()) {
        warn!(group, "Failed to record traffic report: {}", e);
    }
}

#[async_trait]
impl TunnelProvider for OpenVpnProvider {
    async fn load_profiles(&self) -> Result<Vec<ProfileHandle>, ProvisioningError> {
        Ok(self
            .read_profiles()?
            .profiles
            .iter()
            .map(ProfileHandle::from)
            .collect())
    }

    async fn create_profile(
        &self,
        provider_id: &str,
        description: &str,
    ) -> Result<ProfileHandle, ProvisioningError> {
        let mut file = self.read_profiles()?;
        let record = ProfileRecord {
            id: profile_id_for(provider_id),
            provider_id: provider_id.to_string(),
            description: description.to_string(),
            group_id: None,
            enabled: true,
        };
        if file.profiles.iter().any(|existing| existing.id == record.id) {
            return Err(ProvisioningError::SaveFailed {
                reason: format!("profile {} already exists", record.id),
            });
        }
        let handle = ProfileHandle::from(&record);
        file.profiles.push(record);
        self.write_profiles(&file)?;
        info!(profile = %handle.id, "Created OpenVPN profile");
        Ok(handle)
    }

    async fn update_profile_config(
        &self,
        profile: &ProfileHandle,
        configuration: &ProfileConfiguration,
    ) -> Result<(), ProvisioningError> {
        let mut file = self.read_profiles()?;
        let record = file
            .profiles
            .iter_mut()
            .find(|record| record.id == profile.id)
            .ok_or_else(|| ProvisioningError::ProfileMissing {
                profile: profile.id.clone(),
            })?;
        record.description = configuration.server_address.clone();
        record.group_id = Some(configuration.group_id.clone());
        record.enabled = configuration.enabled;

        let dir = self.profile_dir(profile);
        std::fs::create_dir_all(&dir).map_err(|e| ProvisioningError::SaveFailed {
            reason: e.to_string(),
        })?;
        let config_path = profile_config_path(&self.state_dir, profile);
        std::fs::write(config_path, &configuration.config).map_err(|e| {
            ProvisioningError::SaveFailed {
                reason: format!("Failed to write tunnel config: {}", e),
            }
        })?;
        self.write_profiles(&file)?;

        self.process().group_id = Some(configuration.group_id.clone());
        debug!(profile = %profile.id, "Profile configuration saved");
        Ok(())
    }

    async fn start_tunnel(
        &self,
        profile: &ProfileHandle,
        credentials: Option<&Credentials>,
    ) -> Result<(), ProvisioningError> {
        let record = self.find_record(profile)?;
        if !record.enabled {
            return Err(ProvisioningError::StartFailed {
                reason: format!("profile {} is disabled", profile.id),
            });
        }
        if let Some(pid) = self.process().pid {
            return Err(ProvisioningError::StartFailed {
                reason: format!("tunnel already running with PID {}", pid),
            });
        }

        let config_path = profile_config_path(&self.state_dir, profile);
        if !config_path.exists() {
            return Err(ProvisioningError::StartFailed {
                reason: "profile has no tunnel configuration".to_string(),
            });
        }

        let mut cmd = Command::new(&self.binary);
        cmd.arg("--config").arg(&config_path).arg("--verb").arg("3");
        if let Some(credentials) = credentials {
            let auth_path = self.write_credentials(profile, credentials)?;
            cmd.arg("--auth-user-pass").arg(auth_path).arg("--auth-nocache");
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(false);

        let child = cmd.spawn().map_err(|e| ProvisioningError::StartFailed {
            reason: format!("Failed to spawn openvpn: {}", e),
        })?;
        let pid = child.id();
        info!(?pid, profile = %profile.id, "Spawned OpenVPN process");

        self.process().pid = pid;
        publish(&self.process, TunnelStatus::Connecting);

        tokio::spawn(monitor_output(
            Arc::clone(&self.parser),
            Arc::clone(&self.process),
            Arc::clone(&self.reports),
            child,
        ));
        Ok(())
    }

    async fn stop_tunnel(&self, _profile: &ProfileHandle) -> Result<(), ProvisioningError> {
        use nix::sys::signal::Signal;

        let Some(pid) = self.process().pid else {
            debug!("No OpenVPN process to stop");
            return Ok(());
        };

        publish(&self.process, TunnelStatus::Disconnecting);
        info!(pid, "Sending SIGTERM to OpenVPN process");
        send_signal(pid, Signal::SIGTERM).map_err(|e| ProvisioningError::StopFailed {
            reason: format!("Failed to send SIGTERM: {}", e),
        })?;

        // Escalate if the process ignores SIGTERM
        let process = Arc::clone(&self.process);
        tokio::spawn(async move {
            tokio::time::sleep(TERMINATE_GRACE).await;
            if lock_process(&process).pid == Some(pid) {
                warn!(pid, "Graceful shutdown timed out, sending SIGKILL");
                if let Err(e) = send_signal(pid, Signal::SIGKILL) {
                    error!(pid, "Failed to send SIGKILL: {}", e);
                }
            }
        });
        Ok(())
    }

    fn query_status(&self, _profile: &ProfileHandle) -> Option<TunnelStatus> {
        self.process().status
    }

    fn subscribe(&self, _profile: &ProfileHandle) -> StatusStream {
        let (tx, rx) = mpsc::unbounded_channel();
        self.process().subscribers.push(tx);
        rx
    }

    async fn request_statistics(&self, _profile: &ProfileHandle) -> Result<(), ProvisioningError> {
        let Some(pid) = self.process().pid else {
            return Ok(());
        };
        // OpenVPN dumps its statistics block on SIGUSR2
        send_signal(pid, nix::sys::signal::Signal::SIGUSR2).map_err(|e| {
            ProvisioningError::Process {
                reason: format!("Failed to request statistics: {}", e),
            }
        })
    }
}

impl std::fmt::Debug for OpenVpnProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenVpnProvider")
            .field("binary", &self.binary)
            .field("state_dir", &self.state_dir)
            .finish_non_exhaustive()
    }
}

/// Location of a profile's tunnel configuration inside `state_dir`
pub fn profile_config_path(state_dir: &Path, profile: &ProfileHandle) -> PathBuf {
    state_dir
        .join("profiles")
        .join(&profile.id)
        .join("config.ovpn")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use tempfile::tempdir;

    fn provider(dir: &Path) -> OpenVpnProvider {
        OpenVpnProvider::new(
            Some(PathBuf::from("/usr/sbin/openvpn")),
            dir,
            Arc::new(MemoryStore::new()),
        )
        .unwrap()
    }

    fn configuration(config: &str) -> ProfileConfiguration {
        ProfileConfiguration {
            config: config.to_string(),
            group_id: "group.office".to_string(),
            username: None,
            password: None,
            server_address: "Office VPN".to_string(),
            disconnect_on_sleep: false,
            enabled: true,
        }
    }

    #[tokio::test]
    async fn test_profiles_persist_across_instances() {
        let dir = tempdir().unwrap();
        let created = provider(dir.path())
            .create_profile("net.openvpn.client", "Office VPN")
            .await
            .unwrap();
        assert_eq!(created.id, "net-openvpn-client");

        let loaded = provider(dir.path()).load_profiles().await.unwrap();
        assert_eq!(loaded, vec![created]);
    }

    #[tokio::test]
    async fn test_duplicate_profile_is_rejected() {
        let dir = tempdir().unwrap();
        let provider = provider(dir.path());
        provider
            .create_profile("net.openvpn.client", "Office VPN")
            .await
            .unwrap();
        let duplicate = provider.create_profile("net.openvpn.client", "Office VPN").await;
        assert!(matches!(duplicate, Err(ProvisioningError::SaveFailed { .. })));
    }

    #[tokio::test]
    async fn test_update_writes_config_document() {
        let dir = tempdir().unwrap();
        let provider = provider(dir.path());
        let profile = provider
            .create_profile("net.openvpn.client", "Office VPN")
            .await
            .unwrap();

        provider
            .update_profile_config(&profile, &configuration("client\nremote vpn.example.com"))
            .await
            .unwrap();

        let written = std::fs::read_to_string(profile_config_path(dir.path(), &profile)).unwrap();
        assert_eq!(written, "client\nremote vpn.example.com");
    }

    #[tokio::test]
    async fn test_update_unknown_profile_fails() {
        let dir = tempdir().unwrap();
        let provider = provider(dir.path());
        let stray = ProfileHandle {
            id: "stray".to_string(),
            provider_id: "net.stray".to_string(),
            description: "Stray".to_string(),
        };
        let result = provider.update_profile_config(&stray, &configuration("x")).await;
        assert!(matches!(result, Err(ProvisioningError::ProfileMissing { .. })));
    }

    #[tokio::test]
    async fn test_idle_provider_has_no_status_and_stop_is_noop() {
        let dir = tempdir().unwrap();
        let provider = provider(dir.path());
        let profile = provider
            .create_profile("net.openvpn.client", "Office VPN")
            .await
            .unwrap();

        assert_eq!(provider.query_status(&profile), None);
        assert!(provider.stop_tunnel(&profile).await.is_ok());
        assert!(provider.request_statistics(&profile).await.is_ok());
    }

    #[tokio::test]
    async fn test_start_without_config_fails() {
        let dir = tempdir().unwrap();
        let provider = provider(dir.path());
        let profile = provider
            .create_profile("net.openvpn.client", "Office VPN")
            .await
            .unwrap();
        let result = provider.start_tunnel(&profile, None).await;
        assert!(matches!(result, Err(ProvisioningError::StartFailed { .. })));
    }

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_800_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_report_is_written_to_group() {
        let store = MemoryStore::new();
        let stats = TrafficStats {
            byte_in: 10,
            byte_out: 20,
            ..TrafficStats::default()
        };
        let mut clock = SessionClock::default();
        clock.on_status(TunnelStatus::Connected, at(0));
        clock.on_statistics(&stats, at(90));
        write_report(Arc::new(store.clone()), "group.office", &stats, &clock, at(125));

        let report = PersistedIntentStore::new(Arc::new(store), "group.office")
            .connection_update()
            .unwrap()
            .unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&report).unwrap();
        assert_eq!(parsed["byte_in"], 10);
        assert_eq!(parsed["byte_out"], 20);
        assert_eq!(parsed["duration_secs"], 125);
        assert_eq!(parsed["connected_since"], at(0).to_rfc3339());
        assert_eq!(parsed["last_packet_receive"], at(90).to_rfc3339());
    }

    #[test]
    fn test_clock_tracks_connection_and_received_traffic() {
        let mut clock = SessionClock::default();
        clock.on_status(TunnelStatus::Connecting, at(0));
        assert_eq!(clock.duration_secs(at(5)), 0);

        clock.on_status(TunnelStatus::Connected, at(2));
        // A soft restart keeps the original start time
        clock.on_status(TunnelStatus::Reasserting, at(30));
        clock.on_status(TunnelStatus::Connected, at(31));
        assert_eq!(clock.connected_since, Some(at(2)));
        assert_eq!(clock.duration_secs(at(62)), 60);

        let mut stats = TrafficStats {
            byte_in: 100,
            ..TrafficStats::default()
        };
        clock.on_statistics(&stats, at(40));
        // No new bytes received, the last packet time stays
        clock.on_statistics(&stats, at(50));
        assert_eq!(clock.last_packet_receive, Some(at(40)));
        stats.byte_in = 150;
        clock.on_statistics(&stats, at(60));
        assert_eq!(clock.last_packet_receive, Some(at(60)));

        clock.on_status(TunnelStatus::Disconnected, at(70));
        assert_eq!(clock, SessionClock::default());
    }
}
