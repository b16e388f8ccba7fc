use std::time::Duration;

use crate::clock::{Clock, TimeoutWindow};
use std::sync::Arc;

/// Error type for polling operations
#[derive(Debug)]
pub enum PollError<E> {
    /// Operation timed out
    Timeout(Duration),
    /// Error occurred in the condition function
    ConditionError(E),
}

impl<E> std::fmt::Display for PollError<E>
where
    E: std::fmt::Display,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PollError::Timeout(elapsed) => write!(f, "Operation timed out after {elapsed:?}"),
            PollError::ConditionError(e) => write!(f, "Condition error: {}", e),
        }
    }
}

impl<E> std::error::Error for PollError<E>
where
    E: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PollError::Timeout(_) => None,
            PollError::ConditionError(e) => Some(e),
        }
    }
}

/// Poll a condition against `clock` until it holds or `timeout` expires.
///
/// `condition` returns `Ok(true)` when complete and `Ok(false)` to keep
/// polling; `poll_interval` is slept on the same clock between calls. The
/// condition is always evaluated at least once.
///
/// # Example
/// ```
/// use std::sync::Arc;
/// use std::time::Duration;
/// use stage_timelapse::clock::ManualClock;
/// use stage_timelapse::utils::poll_until;
///
/// let clock = Arc::new(ManualClock::new());
/// let mut calls = 0;
/// poll_until(
///     clock.clone(),
///     || {
///         calls += 1;
///         Ok::<bool, &str>(calls == 3)
///     },
///     Duration::from_secs(1),
///     Duration::from_millis(100),
/// )
/// .unwrap();
/// assert_eq!(clock.elapsed(), Duration::from_millis(200));
/// ```
pub fn poll_until<F, E>(
    clock: Arc<dyn Clock>,
    mut condition: F,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<(), PollError<E>>
where
    F: FnMut() -> Result<bool, E>,
{
    let window = TimeoutWindow::start(clock.clone(), timeout);

    loop {
        match condition() {
            Ok(true) => return Ok(()),
            Ok(false) => {}
            Err(e) => return Err(PollError::ConditionError(e)),
        }

        if !window.active() {
            return Err(PollError::Timeout(window.elapsed()));
        }
        clock.sleep(poll_interval.min(window.remaining()));
    }
}
