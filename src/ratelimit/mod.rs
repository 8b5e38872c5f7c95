//! Rate limiting logic and state management.

mod clock;
mod key;
mod limiter;
mod policy;
mod report;
mod store;
mod tiers;

pub use clock::{Clock, ManualClock, SystemClock};
pub use key::{normalize_addr, KeyStrategy, RequestContext, StoreKey, UNKNOWN_ADDRESS_KEY};
pub use limiter::{Decision, DecisionSource, RateLimiter, StoreFailureMode};
pub use policy::{Bypass, CountingMode, Policy};
pub use report::{
    enforce, QuotaHeaders, HEADER_LIMIT, HEADER_REMAINING, HEADER_RESET, HEADER_RETRY_AFTER,
};
pub use store::{MemoryStore, WindowEntry, WindowStore};
pub use tiers::Tiers;
