// Admission control for ad-hoc commands

pub mod ratelimit;
pub mod validation;

pub use ratelimit::RateLimiter;
pub use validation::{is_dangerous, validate, CommandGuard};
