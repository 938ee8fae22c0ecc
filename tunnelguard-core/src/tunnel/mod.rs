//! Tunnel provisioning boundary
//!
//! Status/stage types, the provider trait the controller drives, and the two
//! bundled providers: a local OpenVPN process and an in-process simulation.

pub mod openvpn;
pub mod output_parser;
pub mod provider;
pub mod simulated;
pub mod status;

// Public re-exports
pub use openvpn::OpenVpnProvider;
pub use output_parser::OutputParser;
pub use provider::{
    find_profile, resolve_or_create_profile, ProfileConfiguration, ProfileHandle, StatusStream,
    TunnelProvider,
};
pub use simulated::{ProviderCall, SimulatedProvider};
pub use status::{Stage, TunnelStatus};
