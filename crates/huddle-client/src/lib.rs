//! Adapters binding the feed's source seams to the hosted backend: a REST
//! query client and a realtime websocket client.

pub mod config;
pub mod error;
pub mod realtime;
pub mod rest;

pub use config::ClientConfig;
pub use error::ClientError;
pub use realtime::RealtimeClient;
pub use rest::RestSource;
