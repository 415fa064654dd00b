//! Cooperative sleep with quit-flag and signalled wakeup.
//!
//! Every long-running loop sleeps through [`delay`]: it returns early when
//! the quit token fires or the trigger is signalled, and never sleeps more
//! than five seconds without observing the quit flag. The trigger carries a
//! generation counter so a signal posted just before the sleep begins is
//! not lost within the same epoch.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

const QUIT_POLL: Duration = Duration::from_secs(5);

/// Condition variable plus generation counter.
#[derive(Default)]
pub struct Trigger {
    notify: Notify,
    epoch: AtomicU64,
}

impl Trigger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal all current and near-future sleepers.
    pub fn signal(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }
}

/// Why a [`delay`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelayOutcome {
    Elapsed,
    Triggered,
    Quit,
}

/// Sleep for at most `duration`; wake early on trigger signal or quit.
///
/// Signals posted between the caller's last look at the trigger and this
/// call are lost; callers that check a condition first should sample
/// [`Trigger::epoch`] before the check and use [`delay_from`].
pub async fn delay(
    duration: Duration,
    trigger: Option<&Trigger>,
    quit: &CancellationToken,
) -> DelayOutcome {
    let epoch = trigger.map(|t| t.epoch());
    delay_from(duration, trigger, epoch, quit).await
}

/// Like [`delay`], but treats any signal after `observed_epoch` as a wakeup,
/// including signals posted before this call.
pub async fn delay_from(
    duration: Duration,
    trigger: Option<&Trigger>,
    observed_epoch: Option<u64>,
    quit: &CancellationToken,
) -> DelayOutcome {
    if quit.is_cancelled() {
        return DelayOutcome::Quit;
    }

    let start_epoch = observed_epoch;
    let deadline = tokio::time::Instant::now() + duration;

    loop {
        // A signal that raced the epoch read above still counts.
        if let (Some(trigger), Some(start)) = (trigger, start_epoch) {
            if trigger.epoch() != start {
                return DelayOutcome::Triggered;
            }
        }

        let now = tokio::time::Instant::now();
        if now >= deadline {
            return DelayOutcome::Elapsed;
        }
        let chunk = QUIT_POLL.min(deadline - now);

        match trigger {
            Some(trigger) => {
                tokio::select! {
                    _ = quit.cancelled() => return DelayOutcome::Quit,
                    _ = trigger.notify.notified() => return DelayOutcome::Triggered,
                    _ = tokio::time::sleep(chunk) => {}
                }
            }
            None => {
                tokio::select! {
                    _ = quit.cancelled() => return DelayOutcome::Quit,
                    _ = tokio::time::sleep(chunk) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_delay_elapses() {
        let quit = CancellationToken::new();
        let outcome = delay(Duration::from_secs(60), None, &quit).await;
        assert_eq!(outcome, DelayOutcome::Elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_returns_on_quit() {
        let quit = CancellationToken::new();
        let handle = {
            let quit = quit.clone();
            tokio::spawn(async move { delay(Duration::from_secs(3600), None, &quit).await })
        };
        tokio::task::yield_now().await;
        quit.cancel();
        assert_eq!(handle.await.unwrap(), DelayOutcome::Quit);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_returns_on_trigger() {
        let quit = CancellationToken::new();
        let trigger = Arc::new(Trigger::new());
        let handle = {
            let quit = quit.clone();
            let trigger = trigger.clone();
            tokio::spawn(async move {
                delay(Duration::from_secs(3600), Some(&trigger), &quit).await
            })
        };
        tokio::task::yield_now().await;
        trigger.signal();
        assert_eq!(handle.await.unwrap(), DelayOutcome::Triggered);
    }

    #[tokio::test(start_paused = true)]
    async fn test_signal_before_sleep_is_not_lost() {
        let quit = CancellationToken::new();
        let trigger = Trigger::new();

        // Caller samples the epoch, checks its condition, and the signal
        // races in before the sleep begins.
        let observed = trigger.epoch();
        trigger.signal();

        let outcome = delay_from(
            Duration::from_secs(3600),
            Some(&trigger),
            Some(observed),
            &quit,
        )
        .await;
        assert_eq!(outcome, DelayOutcome::Triggered);
    }
}
