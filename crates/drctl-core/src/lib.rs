// drctl-core: Pure types, naming rules, config, error taxonomy
// No internal drctl dependencies, no I/O

pub mod config;
pub mod error;
pub mod model;
pub mod naming;
pub mod protocol;

pub use error::{DrError, Result};
