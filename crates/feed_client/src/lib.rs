//! Upstream odds-feed protocol client.
//!
//! One persistent WebSocket to the provider, JSON request/response
//! correlation, push subscriptions with incremental delta merging, and lazy
//! reconnection. See `client` for the lifecycle, `wire` for the frame
//! grammar, `merge` for delta semantics.

pub mod client;
pub mod error;
pub mod merge;
pub mod subscription;
pub mod wire;

pub use client::{ClientConfig, ClientStats, FeedClient, SessionInfo, UpstreamFeed};
pub use error::{FeedError, Result};
pub use merge::merge_delta;
pub use subscription::{FeedUpdate, SubInfo, SubMeta, SubscriptionHandle};
