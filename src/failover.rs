//! The `Failover` composition: a `Land` built from two child `Land`s, a
//! fast `primary` and an allocation-free `secondary`. Writes target the
//! primary; when the primary can't admit a mutation because its own
//! metadata allocator is exhausted, the Failover routes around the
//! failure through the secondary. Reads observe the union of both
//! children.
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

use crate::land::DeleteError;
use crate::land::Land;
use crate::land::LandError;
use crate::range::FindDelete;
use crate::range::FindResult;
use crate::range::Range;
use crate::range::ZoneSet;

#[cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
use crate::debug_reentrancy;

/// Construction arguments for a `Failover`: exactly two recognized
/// options, both required. Mirrors the way the rest of this crate's
/// ancestry (e.g. `ClassConfig`/`Class::new`) separates "the caller's
/// struct of options" from "the validated, built object".
#[derive(Default)]
pub struct FailoverConfig {
    pub primary: Option<Box<dyn Land>>,
    pub secondary: Option<Box<dyn Land>>,
}

/// A composite `Land` over a fast `primary` and an allocation-free
/// `secondary`.
pub struct Failover {
    alignment: usize,
    primary: Box<dyn Land>,
    secondary: Box<dyn Land>,
}

impl fmt::Debug for Failover {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Failover")
            .field("alignment", &self.alignment)
            .field("primary", &self.primary.class_name())
            .field("secondary", &self.secondary.class_name())
            .finish()
    }
}

#[cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
fn land_id(land: &dyn Land) -> usize {
    land as *const dyn Land as *const () as usize
}

impl Failover {
    /// Builds a `Failover` from two children, which must already exist
    /// (empty, or pre-populated consistently with the caller's own
    /// bookkeeping). Fails only if `config` is missing either child.
    pub fn from_config(alignment: usize, config: FailoverConfig) -> Result<Self, LandError> {
        let primary = config.primary.ok_or(LandError::Param)?;
        let secondary = config.secondary.ok_or(LandError::Param)?;
        Self::init(alignment, primary, secondary)
    }

    /// Builds a `Failover` directly from its two children.
    pub fn init(alignment: usize, primary: Box<dyn Land>, secondary: Box<dyn Land>) -> Result<Self, LandError> {
        Ok(Failover {
            alignment,
            primary,
            secondary,
        })
    }

    pub fn alignment(&self) -> usize {
        self.alignment
    }

    /// Consumes the `Failover`, returning its two children to the
    /// caller. Ownership of the children was never released by the
    /// Failover; this just hands it back.
    pub fn finish(self) -> (Box<dyn Land>, Box<dyn Land>) {
        (self.primary, self.secondary)
    }

    /// Calls `f` with the primary, recording it as busy first in
    /// contract-checked builds so a re-entrant call from inside `f`
    /// panics instead of silently corrupting state.
    fn with_primary<T>(&mut self, f: impl FnOnce(&mut dyn Land) -> T) -> T {
        #[cfg(any(
            all(test, feature = "check_contracts_in_tests"),
            feature = "check_contracts"
        ))]
        {
            let id = land_id(&*self.primary);
            let primary = &mut *self.primary;
            debug_reentrancy::guard(id, move || f(primary))
        }
        #[cfg(not(any(
            all(test, feature = "check_contracts_in_tests"),
            feature = "check_contracts"
        )))]
        {
            f(&mut *self.primary)
        }
    }

    /// Same as `with_primary`, but for the secondary child.
    fn with_secondary<T>(&mut self, f: impl FnOnce(&mut dyn Land) -> T) -> T {
        #[cfg(any(
            all(test, feature = "check_contracts_in_tests"),
            feature = "check_contracts"
        ))]
        {
            let id = land_id(&*self.secondary);
            let secondary = &mut *self.secondary;
            debug_reentrancy::guard(id, move || f(secondary))
        }
        #[cfg(not(any(
            all(test, feature = "check_contracts_in_tests"),
            feature = "check_contracts"
        )))]
        {
            f(&mut *self.secondary)
        }
    }

    /// Opportunistically moves the secondary's contents into the
    /// primary, to maximise coalescence before a read or write. A failed
    /// flush (primary out of metadata) leaves residue behind and is not
    /// an error.
    fn drain_secondary(&mut self) {
        let primary = &mut *self.primary;
        let _ = self.secondary.flush(primary);
    }
}

#[contract_trait]
impl Land for Failover {
    /// Never overflows in practice: the two children's address ranges
    /// are disjoint by the caller's insertion discipline, so their sizes
    /// can't sum past the address space.
    fn size(&self) -> usize {
        self.primary.size() + self.secondary.size()
    }

    /// Targets the primary; spills to the secondary only on a resource
    /// failure, not on a semantic refusal (e.g. overlap), since the
    /// latter would fail identically on the secondary.
    #[ensures(ret.is_ok() -> ret.unwrap().contains(range))]
    fn insert(&mut self, range: Range) -> Result<Range, LandError> {
        self.drain_secondary();

        match self.primary.insert(range) {
            Ok(inserted) => Ok(inserted),
            Err(LandError::Fail) => Err(LandError::Fail),
            Err(_) => self.secondary.insert(range),
        }
    }

    /// Only the primary is consulted: the caller guarantees `range` came
    /// from the primary's own vicinity.
    fn insert_steal(&mut self, range: &mut Range) -> Result<(), LandError> {
        self.primary.insert_steal(range)
    }

    /// Flushes, tries the primary, and if it found the range but
    /// couldn't represent what's left after removing it, deletes the
    /// whole pre-existing range from the primary and re-inserts the
    /// surviving fragments directly into a child — never back through
    /// `Failover::insert`, which would re-enter this same operation.
    fn delete(&mut self, range: Range) -> Result<Range, DeleteError> {
        self.drain_secondary();

        match self.primary.delete(range) {
            Ok(old_range) => Ok(old_range),
            Err(DeleteError::NotFound) => self.secondary.delete(range),
            Err(DeleteError::AllocFailure { old_range }) => {
                self.recover_split_delete(range, old_range)
            }
            Err(other @ DeleteError::Other(_)) => Err(other),
        }
    }

    /// Tries the primary, then the secondary; "delete exactly what is
    /// there", no fragment recovery.
    fn delete_steal(&mut self, range: &mut Range) -> Result<(), LandError> {
        match self.primary.delete_steal(range) {
            Ok(()) => Ok(()),
            Err(_) => self.secondary.delete_steal(range),
        }
    }

    /// Visits every range in the primary, then every range in the
    /// secondary, regardless of whether the primary's pass was cut
    /// short; returns the conjunction of both continuation flags.
    fn iterate(&self, visitor: &mut dyn FnMut(Range) -> bool) -> bool {
        let primary_complete = self.primary.iterate(visitor);
        let secondary_complete = self.secondary.iterate(visitor);
        primary_complete && secondary_complete
    }

    fn find_first(
        &mut self,
        size: usize,
        find_delete: FindDelete,
    ) -> Result<Option<FindResult>, LandError> {
        self.drain_secondary();
        if let Ok(Some(found)) = self.primary.find_first(size, find_delete) {
            return Ok(Some(found));
        }
        self.secondary.find_first(size, find_delete)
    }

    fn find_last(
        &mut self,
        size: usize,
        find_delete: FindDelete,
    ) -> Result<Option<FindResult>, LandError> {
        self.drain_secondary();
        if let Ok(Some(found)) = self.primary.find_last(size, find_delete) {
            return Ok(Some(found));
        }
        self.secondary.find_last(size, find_delete)
    }

    fn find_largest(
        &mut self,
        size: usize,
        find_delete: FindDelete,
    ) -> Result<Option<FindResult>, LandError> {
        self.drain_secondary();
        if let Ok(Some(found)) = self.primary.find_largest(size, find_delete) {
            return Ok(Some(found));
        }
        self.secondary.find_largest(size, find_delete)
    }

    /// Historically the least-exercised find variant; covered here with
    /// explicit tests rather than assumed correct.
    fn find_in_zones(
        &mut self,
        size: usize,
        zones: ZoneSet,
        high: bool,
        find_delete: FindDelete,
    ) -> Result<Option<FindResult>, LandError> {
        self.drain_secondary();
        if let Ok(Some(found)) = self.primary.find_in_zones(size, zones, high, find_delete) {
            return Ok(Some(found));
        }
        self.secondary.find_in_zones(size, zones, high, find_delete)
    }

    /// A `Failover` can itself be flushed into another `Land`, e.g. when
    /// it is a child of an enclosing `Failover`.
    fn flush(&mut self, target: &mut dyn Land) -> Result<(), LandError> {
        self.primary.flush(target)?;
        self.secondary.flush(target)
    }

    fn describe(&self, out: &mut dyn fmt::Write, depth: usize) -> Result<(), LandError> {
        let indent = " ".repeat(depth + 2);
        writeln!(
            out,
            "{}primary = {:p} ({})",
            indent,
            &*self.primary,
            self.primary.class_name()
        )
        .map_err(|_| LandError::Param)?;
        writeln!(
            out,
            "{}secondary = {:p} ({})",
            indent,
            &*self.secondary,
            self.secondary.class_name()
        )
        .map_err(|_| LandError::Param)
    }

    fn class_name(&self) -> &'static str {
        "Failover"
    }
}

impl Failover {
    /// Recovery for `delete` when the primary found `old_range` but
    /// couldn't represent the residual fragments after removing `range`
    /// from it.
    fn recover_split_delete(&mut self, range: Range, old_range: Range) -> Result<Range, DeleteError> {
        assert!(
            old_range.contains(range),
            "old_range {:?} does not contain {:?}",
            old_range,
            range
        );

        let (left, right) = old_range.split_around(range);

        // Deleting the entire old range only ever shrinks the primary's
        // metadata footprint. If this fails, the primary violated its
        // own contract; propagate rather than assert, since a buggy
        // child is not grounds to take the whole process down.
        if let Err(e) = self.with_primary(|primary| primary.delete(old_range)) {
            return Err(e);
        }

        for fragment in [left, right] {
            if fragment.is_empty() {
                continue;
            }

            // Fragments never go back through `Failover::insert`: that
            // would re-enter this operation. They go directly to
            // whichever child can take them.
            let inserted_in_primary = self
                .with_primary(|primary| primary.insert(fragment))
                .is_ok();

            if !inserted_in_primary {
                let inserted_in_secondary = self
                    .with_secondary(|secondary| secondary.insert(fragment))
                    .is_ok();

                assert!(
                    inserted_in_secondary,
                    "secondary insert of an already-free fragment must never fail"
                );
            }
        }

        Ok(old_range)
    }
}
