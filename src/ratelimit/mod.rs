//! Sliding-window admission control.

mod identity;
mod limiter;
mod policy;
mod quota;

pub use identity::{Identity, IdentityScope};
pub use limiter::{SlidingWindowLimiter, WindowCheck};
pub use policy::{
    AdmissionDecision, AdmissionPolicy, AdmissionRejection, X_RATELIMIT_LIMIT, X_RATELIMIT_REMAINING,
    X_RATELIMIT_RESET,
};
pub use quota::{Quota, QuotaTable};
