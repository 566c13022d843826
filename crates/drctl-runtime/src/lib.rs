// drctl-runtime: everything that talks to vCenter, the array, or the store
// Depends on drctl-core

pub mod batch;
pub mod extract;
pub mod flasharray;
pub mod reply;
pub mod script;
pub mod shell;
pub mod shell_mock;
pub mod state;
pub mod workflow;
