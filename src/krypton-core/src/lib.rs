//! # Krypton Core
//!
//! Client-side core of the Krypton privacy-preserving VPN: provisions a
//! cryptographic tunnel with a remote egress, supervises the encrypted
//! datapath that carries user IP traffic through it, and reports health to
//! the embedding application.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                        Embedder                            │
//! │        Start / Stop / SetNetwork / Telemetry               │
//! └───────────────┬────────────────────────────────────────────┘
//!                 │
//! ┌───────────────▼────────────────────────────────────────────┐
//! │                        Session                             │
//! │   state machine · reconnection · rekey · MTU · tunnel      │
//! │  ┌───────────────────────┐   ┌─────────────────────────┐   │
//! │  │       Provision       │   │     Datapath (PAL)      │   │
//! │  │  ┌──────┐ ┌────────┐  │   │  TUN ⇄ IPsec/Bridge ⇄   │   │
//! │  │  │ Auth │ │ Egress │  │   │       egress UDP        │   │
//! │  │  └──┬───┘ └───┬────┘  │   └─────────────────────────┘   │
//! │  └─────┼─────────┼───────┘                                 │
//! └────────┼─────────┼─────────────────────────────────────────┘
//!          │         │
//!     initial-data  brass          (HTTPS, JSON bodies)
//!        zinc
//! ```
//!
//! Each component runs its own [`looper::Looper`]; cross-component
//! messages are posts onto the destination looper, and notification sinks
//! are held weakly so the callback graph cannot leak.

/// Blind-signed authentication against initial-data and zinc.
pub mod auth;
/// Immutable client configuration.
pub mod config;
/// Egress allocation against brass.
pub mod egress;
/// Egress endpoint parsing and reattempt address selection.
pub mod endpoint;
/// HTTP fetcher abstraction over reqwest.
pub mod http;
/// Top-level assembly for embedders.
pub mod krypton;
/// Per-component cooperative executor.
pub mod looper;
/// Control-plane wire messages.
pub mod messages;
/// Network, IP range and TUN descriptors.
pub mod network;
/// Reusable packet buffers for the datapath hot path.
pub mod packet_pool;
/// Platform abstraction layer (VPN service, OAuth, datapath).
pub mod pal;
/// Provisioning: Auth then EgressManager.
pub mod provision;
/// Public metadata and its deterministic fingerprint.
pub mod public_metadata;
/// The session state machine.
pub mod session;
/// Status taxonomy for control-plane failures.
pub mod status;
/// Telemetry counters and debug snapshots.
pub mod telemetry;
/// Scheduled callbacks.
pub mod timer;

pub use config::{DatapathProtocol, IpGeoLevel, KryptonConfig};
pub use krypton::Krypton;
pub use network::{AddressFamily, NetworkInfo, NetworkType, TunFdData};
pub use session::{Session, SessionNotification, SessionState};
pub use status::{Code, DetailedError, Status};
pub use telemetry::{KryptonDebugInfo, KryptonTelemetry};
