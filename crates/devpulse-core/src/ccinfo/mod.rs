//! Demand-driven cost, git and rate-limit cache behind the `cc_info` request

mod rate_limit;
mod service;
mod types;

pub use rate_limit::{AnthropicUsageClient, RateLimitSource};
pub use service::{CcInfoConfig, CcInfoTimer};
pub use types::{AnthropicRateLimitData, CcInfoCache, TimeRange, TimeWindow};
