pub mod consumer;
pub mod error;
pub mod publisher;
pub mod topology;

pub use consumer::Consumer;
pub use error::{Error, Result};
pub use publisher::Publisher;
pub use topology::{declare, open_channel, EXCHANGE, QUEUE_NAMES};
