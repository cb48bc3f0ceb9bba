//! # Tune - Live Parameter Sync Engine
//!
//! Expose selected in-process values to remote observers on the local
//! network and accept edited values back, live.
//!
//! ## Features
//!
//! - **Share by key path**: publish any value a store can resolve, under a stable wire name
//! - **Multi-observer fan-out**: every connected observer sees every shared value, isolated queues per observer
//! - **Bidirectional**: observers push writes back; the change notification loop rebroadcasts the result
//! - **Zero-config discovery**: UDP beacons advertise publishers, subscribers just browse
//! - **Length-prefixed CBOR framing**: self-describing values, chunk-agnostic decoding
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use dx_tune::{Observable, ParamStore, ParameterServer, Value, DEFAULT_PORT};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = Arc::new(ParamStore::new().with_value("gain", Value::Float(0.5)));
//!
//!     let server = ParameterServer::bind(DEFAULT_PORT).await?;
//!     server.share("gain", store.clone(), "mixer.gain");
//!
//!     // Local writes broadcast to every connected observer:
//!     store.set_value("gain", Value::Float(0.75))?;
//!
//!     std::future::pending::<()>().await;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod connection;
pub mod discovery;
pub mod error;
pub mod observe;
pub mod protocol;
pub mod server;

// Re-export main types for library consumers
pub use client::{ClientDelegate, ParameterClient};
pub use discovery::{browse, BrowseEvent, DiscoveryConfig, ServiceInfo};
pub use observe::{Observable, ParamStore};
pub use protocol::{Message, Value, DEFAULT_PORT, DISCOVERY_PORT, SERVICE_TYPE};
pub use server::ParameterServer;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
