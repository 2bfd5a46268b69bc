//! Protocol constants and the configuration structs the core consults.
//!
//! The CLI and TOML-file loading that *populate* [`ServerProperties`] are
//! external collaborators (non-goal); this module only owns the shape of
//! the data and its defaults, matching the "Server CLI surface" in spec §6.

use serde::{Deserialize, Serialize};

/// Audio sample rate, in Hz. Fixed for the lifetime of a session.
pub const SAMPLE_RATE: u32 = 48_000;
/// Mono capture/playback; spatialization happens downstream of this core.
pub const CHANNELS: u16 = 1;
/// Nominal duration of one encoded speech frame.
pub const FRAME_SIZE_MS: u32 = 20;
/// `SAMPLE_RATE * FRAME_SIZE_MS / 1000`.
pub const SAMPLES_PER_FRAME: u32 = SAMPLE_RATE * FRAME_SIZE_MS / 1000;
/// Hard ceiling on one frame's encoded payload size (spec §4.2).
pub const MAX_ENCODED_BYTES: usize = 1024;
/// Hard ceiling on any length-prefixed string field in the wire protocol.
pub const MAX_STRING_LENGTH: usize = 256;
/// A talker with no audio above threshold for this long is considered silent.
pub const SILENCE_THRESHOLD_MS: u64 = 500;
/// Server main-loop tick period.
pub const TICK_RATE_MS: u64 = 20;
/// Client network-poll period (§4.7 `tick()`).
pub const CLIENT_POLL_MS: u64 = 15;

/// Protocol version carried in `LoginRequest` / compared against the
/// server's own. Only major/minor participate in the compatibility check
/// (spec §6 "Version negotiation").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolVersion {
    pub major: u16,
    pub minor: u16,
    pub build: u16,
}

impl ProtocolVersion {
    pub const CURRENT: ProtocolVersion = ProtocolVersion { major: 1, minor: 0, build: 0 };

    /// Server rejects a login if major or minor differ (build is informational).
    pub fn compatible_with(&self, other: &ProtocolVersion) -> bool {
        self.major == other.major && self.minor == other.minor
    }
}

/// Positioning model the server advertises to clients (external spatial
/// effects layer chooses the actual math; this is just the negotiated tag).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositioningType {
    Absolute,
    ServerSide,
}

/// Server-wide configuration reloadable at runtime by the (external) CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerProperties {
    pub port: u16,
    pub max_clients: usize,
    pub motd: String,
    pub positioning_type: PositioningType,
    pub language: String,
}

impl Default for ServerProperties {
    fn default() -> Self {
        Self {
            port: 9050,
            max_clients: 64,
            motd: String::new(),
            positioning_type: PositioningType::Absolute,
            language: "en".to_string(),
        }
    }
}

impl ServerProperties {
    /// Parse from a TOML document (loaded by the external CLI/config layer).
    pub fn from_toml(s: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(s)?)
    }
}

/// Per-client dial-out configuration for [`crate::client`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub user_id: String,
    pub server_addr: std::net::SocketAddr,
    /// Peak amplitude (0..1) above which captured audio is considered active.
    pub sensitivity: f32,
    pub silence_threshold_ms: u64,
}

impl ClientConfig {
    pub fn new(user_id: impl Into<String>, server_addr: std::net::SocketAddr) -> Self {
        Self {
            user_id: user_id.into(),
            server_addr,
            sensitivity: 0.02,
            silence_threshold_ms: SILENCE_THRESHOLD_MS,
        }
    }
}
