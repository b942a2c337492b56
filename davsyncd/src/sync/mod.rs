pub mod engine;
pub mod local_fs;
pub mod orchestrator;
pub mod paths;
pub mod reconcile;
pub mod remote;
pub mod state_store;
#[cfg(test)]
mod testing;
