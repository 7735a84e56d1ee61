pub mod config_transform;
pub mod content_fetcher;
pub mod launcher;
pub mod orchestrator;
pub mod port_allocator;
pub mod registry;

pub use config_transform::{Extraction, ReferencePaths, Reinsertion};
pub use content_fetcher::SteamCmdFetcher;
pub use launcher::CommandLauncher;
pub use orchestrator::Orchestrator;
pub use port_allocator::PortAllocator;
pub use registry::{ProcessRegistry, StoppedProcess};
