//! Exponential backoff and per-node quarantine bookkeeping for the IO Service's
//! retry policy (§4.4).

use std::time::Duration;

use crate::cluster::node::Node;
use crate::error::CoreError;

/// `VBucketRetrySleepTime · 2^attempt`, the backoff schedule for `NotMyVBucket`,
/// `Busy`, `TemporaryFailure` and transport errors (§4.4).
pub fn backoff_for_attempt(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX))
}

/// Records the outcome of one attempt against `node`'s health counters, using a
/// rolling `io_error_check_interval` window (§4.4) so transport failures far enough
/// apart never accumulate into a quarantine together.
pub fn record_outcome(node: &Node, result: &Result<(), CoreError>, io_error_threshold: u32, io_error_check_interval: Duration) {
    match result {
        Ok(()) => node.record_success(),
        Err(err) if is_transport_error(err) => {
            let count = node.record_failure_within_window(io_error_check_interval);
            if count >= io_error_threshold {
                node.mark_down();
            }
        }
        Err(_) => {}
    }
}

fn is_transport_error(err: &CoreError) -> bool {
    matches!(
        err,
        CoreError::ConnectFailed(_)
            | CoreError::Io(_)
            | CoreError::OperationTimeout(_)
            | CoreError::TlsHandshakeFailed(_)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_each_attempt() {
        let base = Duration::from_millis(100);
        assert_eq!(backoff_for_attempt(base, 0), Duration::from_millis(100));
        assert_eq!(backoff_for_attempt(base, 1), Duration::from_millis(200));
        assert_eq!(backoff_for_attempt(base, 3), Duration::from_millis(800));
    }

    #[test]
    fn backoff_saturates_instead_of_overflowing() {
        let base = Duration::from_secs(1);
        assert_eq!(backoff_for_attempt(base, 40), Duration::MAX);
    }
}
