#![forbid(unsafe_code)]

pub mod config;
pub mod console;
pub mod listener;
pub mod manager;
pub mod recovery;
pub mod service;
pub mod supervisor;


#[cfg(test)]
mod service_tests;

#[cfg(test)]
mod supervisor_tests;

#[cfg(test)]
mod testutil;

pub use config::EngineConfig;
pub use listener::ListenerState;
pub use manager::ListenerManager;
pub use recovery::RecoveryReport;
pub use service::{ListenError, ListenOutcome, ListenService, ListenerStats};
pub use supervisor::Supervisor;
