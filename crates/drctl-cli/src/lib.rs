// drctl-cli: Clap commands, logging, HTTP stage endpoints
// Depends on drctl-core, drctl-runtime

pub mod commands;
pub mod display;
pub mod logging;
pub mod server;
pub mod ui;

pub use commands::run;
