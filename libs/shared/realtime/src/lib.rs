//! Push-based change feed shared by the cells.
//!
//! Every published value is a full snapshot of a document. Delivery is
//! at-least-once per subscriber; consumers pair a [`Subscription`] with a
//! [`SnapshotCursor`] to drop repeated or stale versions.

pub mod cursor;
pub mod feed;

pub use cursor::SnapshotCursor;
pub use feed::{ChangeFeed, Subscription, Topic};
