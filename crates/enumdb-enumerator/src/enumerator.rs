//! Value-to-id enumeration contract.

use enumdb_common::Result;

/// Issues dense ids for values.
///
/// Ids start at 1 and are never reused; 0 stands for "no value". Every id
/// returned by [`enumerate`](Self::enumerate) keeps resolving to an equal
/// value through [`value_of`](Self::value_of).
pub trait DataEnumerator<T>: Send + Sync {
    /// Returns the id of `value`, assigning the next one if it is new.
    fn enumerate(&self, value: Option<&T>) -> Result<i32>;

    /// Returns the id of `value`, or 0 if it was never enumerated.
    fn try_enumerate(&self, value: Option<&T>) -> Result<i32>;

    /// Returns the value for `id`; 0 and unknown ids give `None`.
    fn value_of(&self, id: i32) -> Result<Option<T>>;

    /// Visits every `(id, value)` in id order until `visitor` returns false.
    ///
    /// Returns whether the traversal completed.
    fn for_each(&self, visitor: &mut dyn FnMut(i32, &T) -> bool) -> Result<bool>;

    /// Number of ids issued so far.
    fn records_count(&self) -> Result<i32>;
}
