//! # Background Tasks
//!
//! Debounced disk touches and the periodic pruner. Tasks hold only weak
//! references to the coordinator, so they never keep a dropped cache alive,
//! and as ordinary spawned tasks they never block runtime shutdown. All
//! handles are owned by the coordinator and aborted on `close` and drop.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use crate::cache::Inner;

/// Window during which repeated memory hits coalesce into one disk touch.
pub(crate) const TOUCH_DEBOUNCE: Duration = Duration::from_secs(5);

/// Schedules one delayed disk touch for `key`.
///
/// A key with a touch already pending is left alone; the reads coalesce into
/// the single pending update. The task removes itself from the timer table
/// before touching so a concurrent cancel cannot race a fresh schedule.
pub(crate) fn schedule_touch(inner: &Arc<Inner>, key: String) {
    let mut timers = inner.touch_timers.lock();
    if timers.contains_key(&key) {
        return;
    }

    let weak = Arc::downgrade(inner);
    let task_key = key.clone();
    let handle = tokio::spawn(async move {
        tokio::time::sleep(TOUCH_DEBOUNCE).await;
        let Some(inner) = weak.upgrade() else {
            return;
        };
        inner.touch_timers.lock().remove(&task_key);
        if let Err(err) = inner.file.touch(&task_key).await {
            debug!(key = %task_key, error = %err, "debounced touch failed");
        }
    });
    timers.insert(key, handle);
}

/// Spawns the periodic prune loop.
///
/// Prune failures are logged and swallowed; the loop ends when the cache is
/// closed or dropped.
pub(crate) fn spawn_pruner(inner: &Arc<Inner>, every: Duration) -> JoinHandle<()> {
    let every = every.max(Duration::from_millis(1));
    let weak = Arc::downgrade(inner);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; skip it.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(inner) = weak.upgrade() else {
                break;
            };
            if inner.closed.load(Ordering::Acquire) {
                break;
            }
            inner.memory.lock().prune();
            if let Err(err) = inner.file.prune().await {
                debug!(error = %err, "periodic prune failed");
            }
        }
    })
}
