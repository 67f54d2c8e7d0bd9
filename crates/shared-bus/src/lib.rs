//! # Shared Bus - Event Bus for Network Components
//!
//! All communication between the connection layer, the wire layer and the
//! block downloader goes through this bus.
//!
//! ```text
//! ┌──────────────┐                    ┌──────────────────┐
//! │ Wire layer   │    publish()       │ Block downloader │
//! │              │ ──────┐            │                  │
//! └──────────────┘       │            └──────────────────┘
//!                        ▼                    ↑
//!                  ┌──────────────┐           │
//!                  │  Event Bus   │ ──────────┘
//!                  └──────────────┘  subscribe()
//! ```
//!
//! Delivery is best effort: a subscriber that falls more than the channel
//! capacity behind loses the oldest events and is told how many it missed.

// Nursery lints that are too strict
#![allow(clippy::missing_const_for_fn)]
// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::panic))]

pub mod events;
pub mod publisher;
pub mod subscriber;

// Re-export main types
pub use events::{EventFilter, EventOrigin, EventTopic, NetworkEvent};
pub use publisher::{EventPublisher, InMemoryEventBus};
pub use subscriber::{EventStream, EventSubscriber, Subscription};

/// Maximum events to buffer per subscriber before the oldest are dropped.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 4096;
