//! Deduplicating, rate-limited work queue of resource keys
//!
//! Keys are `namespace/name` strings. The queue guarantees that no two
//! workers hold the same key at once, and that re-adds arriving while a key
//! is being processed are coalesced into exactly one follow-up delivery.

mod rate_limiter;
mod work_queue;


pub use rate_limiter::{RateLimiter, RateLimiterConfig};
pub use work_queue::{QueueStats, WorkQueue};
