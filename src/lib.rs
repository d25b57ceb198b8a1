pub mod config;
pub mod error;
pub mod manager;
pub mod protocol;
pub mod queue;
pub mod shutdown;
pub mod worker;
