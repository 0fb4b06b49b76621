//! Ready-made comparisons for [`QueryFunction::value_eq`](crate::QueryFunction::value_eq).
//!
//! Backdating only happens when `value_eq` returns `true`, so a comparison that
//! is too loose hides real changes from downstream queries. When in doubt,
//! return `false`.

use std::sync::Arc;

/// Plain `PartialEq` comparison.
pub fn eq<T: PartialEq>(old_value: &T, new_value: &T) -> bool {
    old_value == new_value
}

/// Never equal: every recomputation counts as a change.
///
/// Use this for values that have no meaningful equality.
pub fn never<T>(_old_value: &T, _new_value: &T) -> bool {
    false
}

/// Compare only the `Ok` values. Any `Err` counts as a change.
///
/// # Example
/// ```ignore
/// fn value_eq(old: &Result<Ast, ParseError>, new: &Result<Ast, ParseError>) -> bool {
///     memoflow::value_eq::ok_or_changed(old, new)
/// }
/// ```
pub fn ok_or_changed<T: PartialEq, E>(old_value: &Result<T, E>, new_value: &Result<T, E>) -> bool {
    match (old_value, new_value) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Compare `Ok` values, treat all `Err` as equal.
///
/// Use this when downstream queries only care whether the value failed, not
/// how.
pub fn ignore_err<T: PartialEq, E>(old_value: &Result<T, E>, new_value: &Result<T, E>) -> bool {
    match (old_value, new_value) {
        (Ok(a), Ok(b)) => a == b,
        (Err(_), Err(_)) => true,
        _ => false,
    }
}

/// Identity comparison for shared values.
pub fn ptr_eq<T: ?Sized>(old_value: &Arc<T>, new_value: &Arc<T>) -> bool {
    Arc::ptr_eq(old_value, new_value)
}
