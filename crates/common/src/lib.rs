//! Shared types for the aggregate persistence core.

mod clock;
mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use types::{AggregateId, Version};
