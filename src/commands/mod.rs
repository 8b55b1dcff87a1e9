pub mod restore;

pub use restore::cmd_restore;
