//! # drctl: snapshot-to-VM disaster recovery
//!
//! Facade crate that re-exports the drctl workspace crates so consumers
//! can depend on a single `drctl` library.
//!
//! | Module | Crate | Purpose |
//! |--------|-------|---------|
//! | [`core`] | drctl-core | Records, status enums, naming rules, config, errors |
//! | [`runtime`] | drctl-runtime | Scripts, extraction, state store, array client, workflow |
//! | [`cli`] | drctl-cli | Command tree, logging, HTTP stage endpoints |

pub use drctl_cli as cli;
pub use drctl_core as core;
pub use drctl_runtime as runtime;
