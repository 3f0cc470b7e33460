pub mod cli;
pub mod config;
pub mod orchestration;
pub mod provider;
pub mod reminders;
pub mod runtime;
pub mod shared;
pub mod storage;
pub mod telemetry;
