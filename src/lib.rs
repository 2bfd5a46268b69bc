//! Real-time spatial voice transport core.
//!
//! This crate implements the hard engineering underneath a multi-user
//! spatial voice chat system: an adaptive jitter buffer per remote talker,
//! an ECDH+AEAD secure session layer, a packet relay fabric over an
//! unreliable datagram transport, and network-quality telemetry feeding a
//! MOS-derived quality grade.
//!
//! Audio capture/playback devices, the speech codec itself, the underlying
//! reliable-datagram transport library, CLI/config loading, localization,
//! and spatial DSP are external collaborators. This crate only depends on
//! the small trait seams in [`traits`] for them.

pub mod config;
pub mod error;
pub mod codec;
pub mod z85;
pub mod pool;
pub mod sequence;
pub mod security;
pub mod stats;
pub mod jitter;
pub mod talker;
pub mod transport;
pub mod traits;
pub mod client;
pub mod server;

pub use error::{FramingError, JitterEvent, LifecycleError, ProtocolError, SecurityError};
