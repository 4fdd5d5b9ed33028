//! Huddle channel feed
//!
//! Client-side view of a community channel: a TTL cache of channel message
//! lists, optimistic sends reconciled against the backend's realtime change
//! stream, and one live subscription pair for whichever channel is active.

pub mod cache;
pub mod config;
pub mod error;
pub mod feed;
pub mod fetcher;
pub mod reconcile;
pub mod source;
pub mod subscription;

pub use cache::MessageCache;
pub use config::FeedConfig;
pub use error::{FeedError, SourceError};
pub use feed::{ChannelFeed, FeedSnapshot, FeedSources, Notice};
pub use fetcher::Fetcher;
pub use source::{Identity, MessageSource, RealtimeSource, Subscription};
