pub mod app;
pub mod config;
pub mod core;
pub mod domain;
pub mod utils;

#[cfg(feature = "cli")]
pub use config::cli::CliArgs;
pub use config::{cli::LocalConfigStore, SupervisorConfig};

pub use app::{Dispatcher, Outbound};
pub use crate::core::{
    CommandLauncher, Orchestrator, PortAllocator, ProcessRegistry, SteamCmdFetcher,
};
pub use utils::error::{Result, SupervisorError};
