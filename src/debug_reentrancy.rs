//! This module tracks, in debug/contract-checked builds, whether a given
//! `Land` is currently "busy" (inside one of its own operations). The
//! `Failover`'s recovery path must never call back into a child that is
//! already busy; that invariant is otherwise impossible to check
//! mechanically from outside the child.
use std::collections::HashMap;
use std::sync::Mutex;

lazy_static::lazy_static! {
    static ref BUSY: Mutex<HashMap<usize, bool>> = Default::default();
}

/// Marks the land identified by `id` (typically its trait object's
/// address) as busy for the duration of `f`, and asserts that it was not
/// already busy (a re-entrant call) before running `f`.
pub fn guard<T>(id: usize, f: impl FnOnce() -> T) -> T {
    {
        let mut busy = BUSY.lock().unwrap();
        assert!(
            !*busy.get(&id).unwrap_or(&false),
            "re-entrant call into a Land that is already busy"
        );
        busy.insert(id, true);
    }

    let result = f();

    BUSY.lock().unwrap().insert(id, false);
    result
}
