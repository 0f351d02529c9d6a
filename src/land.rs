//! The abstract `Land` interface: a set of disjoint, non-empty address
//! ranges exposing insert/delete/iterate/find operations. `Failover`,
//! `CoalescingBlockSet`, and `InlineFreelist` all implement `Land`, and a
//! `Failover` can embed any other `Land` (including another `Failover`)
//! as a child.
#[cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
use contracts::*;
#[cfg(not(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
)))]
use disabled_contracts::*;

use std::fmt;

use crate::range::FindDelete;
use crate::range::FindResult;
use crate::range::Range;
use crate::range::ZoneSet;

/// Errors shared by every `Land` operation except `delete`/`delete_steal`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum LandError {
    /// A logically-expected negative outcome (e.g. overlap on insert, or
    /// a steal call that found nothing to steal).
    Fail,
    /// The child could not allocate metadata to represent the mutation.
    AllocFailure,
    /// Invalid input to a diagnostic entry point.
    Param,
    /// Propagated verbatim from a child; not one of the above kinds.
    Other(&'static str),
}

impl fmt::Display for LandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LandError::Fail => write!(f, "operation failed"),
            LandError::AllocFailure => write!(f, "land could not allocate metadata"),
            LandError::Param => write!(f, "invalid parameter"),
            LandError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for LandError {}

/// Errors specific to `delete`: unlike every other operation, an
/// allocation failure here must still hand back the pre-existing range
/// that contained the deletion target, so the caller can recover without
/// re-querying.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DeleteError {
    /// The range (or no range containing it) is not present.
    NotFound,
    /// The child found `old_range` but could not represent the residual
    /// fragments left after removing the requested range from it.
    AllocFailure { old_range: Range },
    /// Propagated verbatim from a child.
    Other(&'static str),
}

impl fmt::Display for DeleteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeleteError::NotFound => write!(f, "range not present"),
            DeleteError::AllocFailure { old_range } => write!(
                f,
                "could not represent the residual of {:?} after deletion",
                old_range
            ),
            DeleteError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for DeleteError {}

/// A set of disjoint, non-empty address ranges.
#[allow(clippy::inline_fn_without_body)]
#[contract_trait]
pub trait Land: fmt::Debug {
    /// Total bytes covered by this land's ranges.
    fn size(&self) -> usize;

    /// Adds `range`. The returned range may be larger than the input due
    /// to coalescing with existing neighbours.
    #[ensures(ret.is_ok() -> ret.unwrap().contains(range), "the inserted range always contains the input")]
    fn insert(&mut self, range: Range) -> Result<Range, LandError>;

    /// Like `insert`, but may clip `range` in place; the caller
    /// guarantees `range` came from this land's own vicinity, and only
    /// expects `Ok(())` or `Err(LandError::Fail)` back.
    fn insert_steal(&mut self, range: &mut Range) -> Result<(), LandError>;

    /// Removes `range`. `old_range` is the pre-existing range that
    /// contained it, so `range` is always a subset of it.
    #[ensures(ret.is_ok() -> ret.unwrap().contains(range), "the returned old range always contains the input")]
    fn delete(&mut self, range: Range) -> Result<Range, DeleteError>;

    /// Like `delete`, but tolerates "delete exactly what is there"
    /// semantics: no fragment-recovery path.
    fn delete_steal(&mut self, range: &mut Range) -> Result<(), LandError>;

    /// Visits every range; stops as soon as `visitor` returns `false`.
    /// Returns whether the full set was visited.
    fn iterate(&self, visitor: &mut dyn FnMut(Range) -> bool) -> bool;

    /// Finds the first (lowest-addressed) range of at least `size`
    /// bytes, optionally deleting part of it.
    fn find_first(
        &mut self,
        size: usize,
        find_delete: FindDelete,
    ) -> Result<Option<FindResult>, LandError>;

    /// Finds the last (highest-addressed) range of at least `size`
    /// bytes, optionally deleting part of it.
    fn find_last(
        &mut self,
        size: usize,
        find_delete: FindDelete,
    ) -> Result<Option<FindResult>, LandError>;

    /// Finds the largest range of at least `size` bytes, optionally
    /// deleting part of it.
    fn find_largest(
        &mut self,
        size: usize,
        find_delete: FindDelete,
    ) -> Result<Option<FindResult>, LandError>;

    /// Finds a range of at least `size` bytes all of whose addresses
    /// fall within `zones`. Searches from the high end when `high` is
    /// set, otherwise from the low end.
    fn find_in_zones(
        &mut self,
        size: usize,
        zones: ZoneSet,
        high: bool,
        find_delete: FindDelete,
    ) -> Result<Option<FindResult>, LandError>;

    /// Best-effort migration of this land's contents into `target`.
    /// Ranges that `target` can't admit are left behind; that is not an
    /// error.
    fn flush(&mut self, target: &mut dyn Land) -> Result<(), LandError>;

    /// Writes a short diagnostic record to `out`, indented by `depth`.
    fn describe(&self, out: &mut dyn fmt::Write, depth: usize) -> Result<(), LandError>;

    /// The concrete implementation's name, used by `describe`.
    fn class_name(&self) -> &'static str;
}
