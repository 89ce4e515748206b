//! Injectable wait strategy for bounded sleep-poll loops.
//!
//! Every poll loop in the crate (MST table/ACT waits, DPIA response
//! waits, training-interval pacing) sleeps through a [`WaitStrategy`]
//! so tests run without wall-clock delays and a future cooperative port
//! can substitute a suspension point without touching algorithm logic.

use std::time::Duration;

/// A single suspension point. Implementations must not block longer than
/// roughly the requested duration; the poll loops own the retry budget.
pub trait WaitStrategy {
    fn wait(&mut self, d: Duration);
}

/// Production strategy: plain thread sleep.
#[derive(Debug, Default)]
pub struct SleepWait;

impl WaitStrategy for SleepWait {
    fn wait(&mut self, d: Duration) {
        std::thread::sleep(d);
    }
}

/// Test strategy: never sleeps, counts invocations.
#[derive(Debug, Default)]
pub struct NoopWait {
    pub waits: u32,
}

impl WaitStrategy for NoopWait {
    fn wait(&mut self, _d: Duration) {
        self.waits += 1;
    }
}

/// Run `probe` up to `attempts` times with `interval` between attempts.
///
/// Returns `Ok(value)` as soon as the probe yields `Some(value)`, or
/// `None` if the budget is exhausted. Probe errors abort immediately;
/// timeouts are the caller's policy decision, transport failures are not.
pub fn poll_until<T, E>(
    wait: &mut dyn WaitStrategy,
    attempts: u32,
    interval: Duration,
    mut probe: impl FnMut() -> Result<Option<T>, E>,
) -> Result<Option<T>, E> {
    for attempt in 0..attempts {
        if let Some(v) = probe()? {
            return Ok(Some(v));
        }
        if attempt + 1 < attempts {
            wait.wait(interval);
        }
    }
    Ok(None)
}
