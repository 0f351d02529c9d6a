//! A `Failover` range manager composes two `Land`s — a fast primary that
//! may run out of metadata, and an allocation-free secondary that
//! cannot — into a single `Land` that degrades gracefully instead of
//! losing track of free address ranges.
mod cbs;
mod failover;
mod freelist;
mod land;
mod range;

#[cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
mod debug_reentrancy;

pub use cbs::CoalescingBlockSet;
pub use failover::Failover;
pub use failover::FailoverConfig;
pub use freelist::InlineFreelist;
pub use land::DeleteError;
pub use land::Land;
pub use land::LandError;
pub use range::FindDelete;
pub use range::FindResult;
pub use range::Range;
pub use range::ZoneSet;
