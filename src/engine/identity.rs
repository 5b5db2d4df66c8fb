//! Optimistic counter for monotonically increasing identifiers
//!
//! The counter for a storage family lives in the store itself. A new value is
//! claimed by reading the current maximum and inserting `max + 1` under a
//! unique key; a concurrent writer that claimed the same value makes the
//! insert fail with [`DatastoreError::Conflict`], and the loop re-reads and
//! tries again. No lock is ever taken.

use tracing::{debug, trace};

use crate::error::{DatastoreError, Result};

/// Claim the next value of a counter
///
/// `read_max` returns the highest claimed value (`None` when the counter is
/// empty); `try_insert` attempts to claim a value and must fail with
/// `DatastoreError::Conflict` when it is already taken. Other errors abort
/// immediately. When `retries` conflicting attempts have been made the last
/// conflict is surfaced as a connection failure.
pub fn next_in_sequence<R, I>(retries: u32, mut read_max: R, mut try_insert: I) -> Result<i64>
where
    R: FnMut() -> Result<Option<i64>>,
    I: FnMut(i64) -> Result<()>,
{
    let attempts = retries.max(1);
    let mut last_conflict = None;

    for attempt in 1..=attempts {
        let candidate = read_max()?.unwrap_or(0) + 1;
        match try_insert(candidate) {
            Ok(()) => {
                trace!(candidate, attempt, "Claimed identifier");
                return Ok(candidate);
            }
            Err(DatastoreError::Conflict(message)) => {
                debug!(candidate, attempt, "Identifier already claimed, retrying");
                last_conflict = Some(message);
            }
            Err(other) => return Err(other),
        }
    }

    Err(DatastoreError::connection(format!(
        "could not claim an identifier after {} attempts: {}",
        attempts,
        last_conflict.unwrap_or_default()
    )))
}
