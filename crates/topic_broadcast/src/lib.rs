//! Downstream topic broadcasting.
//!
//! Turns shared upstream subscriptions (via the mux) into per-topic event
//! streams: one task per topic diffs consecutive snapshots with canonical
//! fingerprints, pushes only real changes, heartbeats idle consumers, and
//! tears itself down after a grace period with no consumers.

pub mod fingerprint;
pub mod hub;
pub mod sse;
pub mod topic;

pub use fingerprint::{fingerprint, fingerprint_each, FingerprintPolicy};
pub use hub::{Broadcaster, ConsumerHandle, ConsumerTx, TopicStats};
pub use sse::{EventName, StreamMessage};
pub use topic::{TopicConfig, TopicKey};
