//! Bid placement on open orders.
//!
//! Three independently paced duties: [`ProfileWatcher`] keeps the provider
//! profile current, [`BidScheduler`] admits and submits bids, and
//! [`BidReporter`] forwards every resolved bid to the callback sink.

mod profile;
mod rate_limit;
mod reporter;
mod scheduler;

pub use profile::{Capacity, FileProfileSource, Pricing, ProfileSource, ProfileWatcher, ProviderProfile};
pub use rate_limit::{DualWindowLimiter, Window};
pub use reporter::BidReporter;
pub use scheduler::{Admission, BidScheduler, MSG_CREATE_BID, SkipReason};
