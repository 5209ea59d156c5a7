//! Timeout supervision
//!
//! Cancellation is cooperative: a hook or body is raced against the test's
//! deadline and loses only at a suspension point. A tight synchronous loop
//! never yields, so a separate watchdog thread force-exits the worker once
//! the deadline is exceeded by a fixed slack.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use std::future::Future;

use crate::models::TestInfo;

/// Extra budget past the deadline before the watchdog kills the process.
const WATCHDOG_SLACK: Duration = Duration::from_secs(5);

/// Exit code used when teardown or a non-yielding body overruns its budget.
pub const OVERRUN_EXIT_CODE: i32 = 63;

/// Outcome of racing a future against the test deadline.
#[derive(Debug, PartialEq, Eq)]
pub enum Supervised<T> {
    Completed(T),
    TimedOut,
}

/// Resolves once the test's budget is exhausted, tracking `set_timeout` and
/// `slow` adjustments made while it waits.
pub async fn expired(info: &TestInfo) {
    loop {
        let deadline = tokio::time::Instant::from_std(info.deadline());
        if tokio::time::Instant::now() >= deadline {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => {}
            _ = info.timeout_changed() => {}
        }
    }
}

/// Race `future` against the deadline. The future is polled first, so work
/// that completes without suspending wins even with an exhausted budget.
pub async fn supervise<T>(info: &TestInfo, future: impl Future<Output = T>) -> Supervised<T> {
    tokio::pin!(future);
    tokio::select! {
        biased;
        value = &mut future => Supervised::Completed(value),
        _ = expired(info) => Supervised::TimedOut,
    }
}

/// Decide whether an armed watchdog should fire.
fn should_kill(armed: Option<Instant>, now: Instant) -> bool {
    armed.map(|kill_at| now >= kill_at).unwrap_or(false)
}

/// Watchdog thread killing the worker when a test overruns its deadline so
/// far that cooperative cancellation clearly cannot reach it.
pub struct Watchdog {
    armed: Arc<Mutex<Option<Instant>>>,
}

impl Watchdog {
    pub fn spawn() -> Self {
        let armed: Arc<Mutex<Option<Instant>>> = Arc::new(Mutex::new(None));
        let shared = Arc::clone(&armed);
        std::thread::Builder::new()
            .name("specrun-watchdog".into())
            .spawn(move || loop {
                std::thread::sleep(Duration::from_millis(100));
                let armed = *shared.lock().expect("watchdog lock poisoned");
                if should_kill(armed, Instant::now()) {
                    eprintln!("specrun worker: test overran its timeout without yielding; exiting");
                    std::process::exit(OVERRUN_EXIT_CODE);
                }
            })
            .expect("failed to spawn watchdog thread");
        Self { armed }
    }

    /// Arm for the given deadline (plus slack).
    pub fn arm(&self, deadline: Instant) {
        *self.armed.lock().expect("watchdog lock poisoned") = Some(deadline + WATCHDOG_SLACK);
    }

    pub fn disarm(&self) {
        *self.armed.lock().expect("watchdog lock poisoned") = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_info(timeout_ms: u64) -> TestInfo {
        TestInfo::new(
            "t", "t", "a.spec.rs", 1, 1, 0, 0, "", timeout_ms, false,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn body_past_deadline_is_timed_out() {
        let info = make_info(50);
        let outcome = supervise(&info, async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            1
        })
        .await;
        assert_eq!(outcome, Supervised::TimedOut);
    }

    #[tokio::test]
    async fn ready_future_completes_even_with_exhausted_budget() {
        let info = make_info(0);
        // Biased polling lets non-suspending work finish.
        let outcome = supervise(&info, async { 7 }).await;
        assert_eq!(outcome, Supervised::Completed(7));
    }

    #[tokio::test(start_paused = true)]
    async fn set_timeout_extends_a_waiting_race() {
        let info = make_info(50);
        let extender = {
            let info = info.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                info.set_timeout(60_000);
                tokio::time::sleep(Duration::from_millis(200)).await;
                42
            }
        };
        let outcome = supervise(&info, extender).await;
        assert_eq!(outcome, Supervised::Completed(42));
    }

    #[test]
    fn watchdog_fires_only_past_kill_point() {
        let now = Instant::now();
        assert!(!should_kill(None, now));
        assert!(!should_kill(Some(now + Duration::from_secs(1)), now));
        assert!(should_kill(Some(now), now));
    }
}
