pub mod config;
pub mod error;
pub mod util;

pub use config::{DatabaseConfig, PoolConfig, QueueConfig};
pub use error::{Error, Result};
