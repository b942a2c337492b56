pub mod daemon;
pub mod settings;
pub mod storage;
pub mod sync;
pub mod sync_log;
pub mod synchronizer;
