//! zygote: a preloading process supervisor.
//!
//! A loader process loads application code once, then forks workers from its
//! already-initialized image whenever the supervisor asks for one. Supervisor
//! and loader talk over a single inherited descriptor using newline-delimited
//! JSON (see [`bridge::protocol`]).
//!
//! The loader is strictly single-threaded: it forks, so it never starts a
//! runtime or helper threads.

#[cfg(not(unix))]
compile_error!("zygote forks worker processes and only supports unix targets");

pub mod bridge;
pub mod config;
pub mod env;
pub mod fork;
pub mod loader;
pub mod logging;
pub mod payload;
pub mod script;
pub mod status_log_layer;
pub mod worker_ack;
pub mod worker_set;

/// Version from Cargo.toml.
pub const ZYGOTE_VERSION: &str = env!("CARGO_PKG_VERSION");

pub use bridge::protocol::{Command, LogLevel, Reply, WorkerId};
pub use config::{Cli, LoaderConfig};
pub use fork::{ForkEngine, SpawnOutcome, WorkerSpawner};
pub use loader::{Loader, LoaderError};
pub use payload::{Payload, PayloadError, WorkerContext};
pub use script::ScriptPayload;
