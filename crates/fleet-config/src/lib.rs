//! Configuration for the mcp-fleet proxy: per-upstream entries and global
//! supervisor tunables.

mod settings;
mod upstream;

pub use settings::FleetSettings;
pub use upstream::{
    FleetRegistry, OAuthConfig, StartupMode, UpstreamConfig, UpstreamTransport,
    DEFAULT_CONNECTION_TIMEOUT_SECS,
};
