//! Shared scheduler helpers: task-id generation, cancellation checkpoints,
//! and the persistence retry used after irreversible side effects.

use asupersync::Cx;
use shoal_error::{Result, ShoalError};
use shoal_types::{TaskId, Vid};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

/// Characters of the random task-id suffix.
const TASK_ID_NONCE_LEN: usize = 10;

/// Delay between attempts of [`insist_on`].
const INSIST_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Generate a unique task id shaped `"<prefix>-<vid>-<nonce>"`.
#[must_use]
pub fn gen_task_id(prefix: &str, vid: Vid) -> TaskId {
    let nonce = Uuid::new_v4().simple().to_string();
    TaskId::new(format!("{prefix}-{vid}-{}", &nonce[..TASK_ID_NONCE_LEN]))
}

#[inline]
pub(crate) fn checkpoint(cx: &Cx) -> Result<()> {
    cx.checkpoint().map_err(|_| ShoalError::Cancelled)
}

/// Retry `f` until it succeeds.
///
/// Used where the preceding side effect cannot be rolled back (a committed
/// volume mapping, a re-allocated destination), so giving up would leave the
/// persisted record behind reality. Fatal errors and shutdown still abort.
pub(crate) fn insist_on<F>(stop: &AtomicBool, label: &str, mut f: F) -> Result<()>
where
    F: FnMut() -> Result<()>,
{
    let mut attempt: u64 = 0;
    loop {
        match f() {
            Ok(()) => return Ok(()),
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => {
                attempt += 1;
                warn!(event = "insist_retry", label, attempt, error = %err);
                if stop.load(Ordering::Acquire) {
                    return Err(ShoalError::Cancelled);
                }
                std::thread::sleep(INSIST_RETRY_DELAY);
            }
        }
    }
}
