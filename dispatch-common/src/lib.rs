//! Shared CLI/config helpers used by `dispatch-daemon` and `dispatch-cli`.

pub mod config_override;
pub mod elapsed;

pub use config_override::CliConfigOverrides;
pub use elapsed::format_elapsed;
