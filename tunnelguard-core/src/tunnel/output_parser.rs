//! Pattern-based parser for OpenVPN log output
//!
//! Maps the lines OpenVPN prints to status transitions and picks the byte
//! counters out of the statistics block it dumps on SIGUSR2.

use crate::tunnel::TunnelStatus;
use regex::Regex;

/// What a single OpenVPN output line means to the provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputEvent {
    /// Line implies a status transition
    Status(TunnelStatus),
    /// Server rejected the credentials
    AuthFailed { message: String },
    /// Start of a statistics dump
    StatisticsBegin,
    /// One counter from a statistics dump
    Counter { counter: TrafficCounter, value: u64 },
    /// End of a statistics dump
    StatisticsEnd,
    /// Anything else
    Unknown,
}

/// Byte counters reported in an OpenVPN statistics dump
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrafficCounter {
    TunRead,
    TunWrite,
    LinkRead,
    LinkWrite,
}

/// Accumulated byte counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct TrafficStats {
    pub tun_read_bytes: u64,
    pub tun_write_bytes: u64,
    /// Bytes received from the VPN server
    pub byte_in: u64,
    /// Bytes sent to the VPN server
    pub byte_out: u64,
}

impl TrafficStats {
    pub fn record(&mut self, counter: TrafficCounter, value: u64) {
        match counter {
            TrafficCounter::TunRead => self.tun_read_bytes = value,
            TrafficCounter::TunWrite => self.tun_write_bytes = value,
            TrafficCounter::LinkRead => self.byte_in = value,
            TrafficCounter::LinkWrite => self.byte_out = value,
        }
    }
}

/// Parser for OpenVPN output
pub struct OutputParser {
    /// "Initialization Sequence Completed"
    connected_pattern: Regex,
    /// Link setup: "Attempting to establish TCP connection", "UDP link remote", ...
    connecting_pattern: Regex,
    /// Soft restarts: "SIGUSR1[soft,ping-restart] received", "Restart pause"
    reasserting_pattern: Regex,
    /// Shutdown: "SIGTERM[hard,] received, process exiting", "Exiting due to fatal error"
    disconnecting_pattern: Regex,
    /// "AUTH: Received control message: AUTH_FAILED"
    auth_failed_pattern: Regex,
    /// "TUN/TAP read bytes,1234"
    counter_pattern: Regex,
    statistics_begin_pattern: Regex,
    statistics_end_pattern: Regex,
}

impl OutputParser {
    /// Create a new OutputParser with compiled regex patterns
    pub fn new() -> Self {
        Self {
            connected_pattern: Regex::new(r"Initialization Sequence Completed")
                .expect("Failed to compile connected pattern"),
            connecting_pattern: Regex::new(
                concat!(
                    r"Attempting to establish TCP connection|UDP link remote",
                    r"|TCP connection established|Peer Connection Initiated",
                ),
            )
            .expect("Failed to compile connecting pattern"),
            reasserting_pattern: Regex::new(
                r"SIGUSR1\[soft,[^\]]*\] received|Restart pause|Connection reset, restarting",
            )
            .expect("Failed to compile reasserting pattern"),
            disconnecting_pattern: Regex::new(
                r"SIG(?:TERM|INT)\[[^\]]*\] received, process exiting|Exiting due to fatal error",
            )
            .expect("Failed to compile disconnecting pattern"),
            auth_failed_pattern: Regex::new(r"AUTH_FAILED")
                .expect("Failed to compile auth_failed pattern"),
            counter_pattern: Regex::new(r"(TUN/TAP|TCP/UDP) (read|write) bytes,(\d+)")
                .expect("Failed to compile counter pattern"),
            statistics_begin_pattern: Regex::new(r"OpenVPN STATISTICS")
                .expect("Failed to compile statistics_begin pattern"),
            statistics_end_pattern: Regex::new(r"(?:^|\s)END\s*$")
                .expect("Failed to compile statistics_end pattern"),
        }
    }

    /// Parse a line of OpenVPN output
    pub fn parse_line(&self, line: &str) -> OutputEvent {
        if self.auth_failed_pattern.is_match(line) {
            return OutputEvent::AuthFailed {
                message: line.trim().to_string(),
            };
        }

        if let Some(captures) = self.counter_pattern.captures(line) {
            let counter = match (&captures[1], &captures[2]) {
                ("TUN/TAP", "read") => TrafficCounter::TunRead,
                ("TUN/TAP", _) => TrafficCounter::TunWrite,
                (_, "read") => TrafficCounter::LinkRead,
                _ => TrafficCounter::LinkWrite,
            };
            if let Ok(value) = captures[3].parse::<u64>() {
                return OutputEvent::Counter { counter, value };
            }
            return OutputEvent::Unknown;
        }

        if self.statistics_begin_pattern.is_match(line) {
            return OutputEvent::StatisticsBegin;
        }
        if self.statistics_end_pattern.is_match(line) {
            return OutputEvent::StatisticsEnd;
        }

        if self.connected_pattern.is_match(line) {
            OutputEvent::Status(TunnelStatus::Connected)
        } else if self.disconnecting_pattern.is_match(line) {
            OutputEvent::Status(TunnelStatus::Disconnecting)
        } else if self.reasserting_pattern.is_match(line) {
            OutputEvent::Status(TunnelStatus::Reasserting)
        } else if self.connecting_pattern.is_match(line) {
            OutputEvent::Status(TunnelStatus::Connecting)
        } else {
            OutputEvent::Unknown
        }
    }
}

impl Default for OutputParser {
    fn default() -> Self {
        Self::new()
    }
}
