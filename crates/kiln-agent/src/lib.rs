//! Game-server process supervision: adapters per game type, a registry keyed by server
//! identity, and the download and update workflows that feed them.

pub mod adapter;
pub mod ansi;
pub mod broadcast;
pub mod config;
pub mod download;
pub mod error;
pub mod error_payload;
pub mod factory;
pub mod fetch;
pub mod hytale;
pub mod jvm;
pub mod log_sink;
pub mod minecraft;
pub mod process_handle;
pub mod properties;
pub mod shutdown;
pub mod supervisor;
pub mod update;
pub mod versions;

pub use adapter::{GameVariant, ServerAdapter};
pub use broadcast::{BroadcastSink, TracingBroadcast};
pub use config::AgentConfig;
pub use error::{Result, SupervisorError};
pub use factory::AdapterFactory;
pub use supervisor::Supervisor;
