//! Abortable timers on the tokio runtime.
//!
//! The engine arms three kinds of timers: per-segment retransmission, the
//! null-segment keepalive, and the delayed cumulative ack. All of them are
//! spawned tasks holding no lock while sleeping; cancelling aborts the task,
//! so a cancelled timer never runs its callback.

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time;

/// Handle to a scheduled timer. Dropping the handle cancels the timer.
#[derive(Debug)]
pub(crate) struct TimerHandle {
    handle: JoinHandle<()>,
}

impl TimerHandle {
    pub fn cancel(&self) {
        self.handle.abort();
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Runs `action` once after `delay`.
pub(crate) fn schedule_once<Fut>(delay: Duration, action: Fut) -> TimerHandle
where
    Fut: Future<Output = ()> + Send + 'static,
{
    TimerHandle {
        handle: tokio::spawn(async move {
            time::sleep(delay).await;
            action.await;
        }),
    }
}

/// Ties a background task's lifetime to its holders: the task is aborted
/// when the last holder drops, or explicitly via [`AbortOnDrop::abort`].
pub(crate) struct AbortOnDrop(JoinHandle<()>);

impl AbortOnDrop {
    pub(crate) fn new(handle: JoinHandle<()>) -> AbortOnDrop {
        AbortOnDrop(handle)
    }

    pub(crate) fn abort(&self) {
        self.0.abort();
    }
}

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Whether a repeating timer keeps running after a tick.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub(crate) enum TimerTick {
    Continue,
    Stop,
}

/// Runs `tick` every `period` (first tick after one full period) until it
/// returns [`TimerTick::Stop`] or the handle is cancelled.
pub(crate) fn schedule_repeating<F, Fut>(period: Duration, mut tick: F) -> TimerHandle
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = TimerTick> + Send,
{
    TimerHandle {
        handle: tokio::spawn(async move {
            loop {
                time::sleep(period).await;
                if tick().await == TimerTick::Stop {
                    break;
                }
            }
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::runtime::Builder;

    #[test]
    fn test_one_shot_fires_after_delay() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let fired = Arc::new(AtomicU32::new(0));
            let fired2 = fired.clone();
            let _handle = schedule_once(Duration::from_millis(100), async move {
                fired2.fetch_add(1, Ordering::SeqCst);
            });

            time::sleep(Duration::from_millis(50)).await;
            assert_eq!(fired.load(Ordering::SeqCst), 0);

            time::sleep(Duration::from_millis(60)).await;
            assert_eq!(fired.load(Ordering::SeqCst), 1);
        });
    }

    #[test]
    fn test_cancel_prevents_firing() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let fired = Arc::new(AtomicU32::new(0));
            let fired2 = fired.clone();
            let handle = schedule_once(Duration::from_millis(100), async move {
                fired2.fetch_add(1, Ordering::SeqCst);
            });

            handle.cancel();
            time::sleep(Duration::from_millis(200)).await;
            assert_eq!(fired.load(Ordering::SeqCst), 0);
        });
    }

    #[test]
    fn test_repeating_stops_on_request() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let ticks = Arc::new(AtomicU32::new(0));
            let ticks2 = ticks.clone();
            let _handle = schedule_repeating(Duration::from_millis(10), move || {
                let ticks = ticks2.clone();
                async move {
                    if ticks.fetch_add(1, Ordering::SeqCst) + 1 == 3 {
                        TimerTick::Stop
                    } else {
                        TimerTick::Continue
                    }
                }
            });

            time::sleep(Duration::from_millis(100)).await;
            assert_eq!(ticks.load(Ordering::SeqCst), 3);
        });
    }
}
