pub mod client;
pub mod config;
pub mod error;
pub mod flock;
pub mod protocol;
pub mod queue;
pub mod scheduler;
pub mod server;
pub mod storage;

#[cfg(test)]
mod tmpfs;

pub use client::Client;
pub use config::{EvictOn, ServerConfig, StorageConfig};
pub use error::{Error, Result};
pub use server::{Server, ServerHandle, Shutdown, ShutdownMode};
