pub mod cli;
pub mod commands;
pub mod config;
pub mod decide;
pub mod error;
pub mod exec;
pub mod hypervisor;
pub mod inventory;
pub mod lock;
pub mod paths;
pub mod plan;
pub mod pveconf;
pub mod restore;
pub mod storage;

// Re-export core types for convenience
pub use config::Settings;
pub use error::DiscoveryError;
pub use exec::{CommandOutput, CommandRunner};
