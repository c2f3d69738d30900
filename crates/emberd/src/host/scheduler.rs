//! Wall-clock timer bookkeeping for the host bridge.
//!
//! Timers are tokio tasks that sleep out their delay and then push a
//! [`AppEvent::Timer`] onto the owning app's queue. The table keeps the task
//! handles so cancellation can abort them; cancelling a fired or unknown
//! timer is a no-op.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use chrono::NaiveDateTime;
use chrono::NaiveTime;
use chrono::TimeDelta;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use super::AppEvent;
use super::TimerHandle;

type TimerMap = Arc<Mutex<HashMap<u64, JoinHandle<()>>>>;

pub struct Scheduler {
    tasks: TimerMap,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            tasks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// One-shot timer after a fixed delay.
    pub fn schedule_in(
        &self,
        handle: TimerHandle,
        delay: Duration,
        tx: mpsc::Sender<AppEvent>,
        tag: String,
        payload: Value,
    ) {
        let tasks = self.tasks.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if tx
                .send(AppEvent::Timer {
                    handle,
                    tag,
                    payload,
                })
                .await
                .is_err()
            {
                debug!("timer {:?} fired after its app went away", handle);
            }
            if let Ok(mut tasks) = tasks.lock() {
                tasks.remove(&handle.0);
            }
        });
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.insert(handle.0, task);
        }
    }

    /// One-shot timer at the next local occurrence of `at`.
    pub fn schedule_at(
        &self,
        handle: TimerHandle,
        now: NaiveDateTime,
        at: NaiveTime,
        tx: mpsc::Sender<AppEvent>,
        tag: String,
        payload: Value,
    ) {
        self.schedule_in(handle, delay_until(now, at), tx, tag, payload);
    }

    /// Recurring timer firing every day at the local time `at`.
    pub fn schedule_daily(
        &self,
        handle: TimerHandle,
        at: NaiveTime,
        tx: mpsc::Sender<AppEvent>,
        tag: String,
    ) {
        let tasks = self.tasks.clone();
        let task = tokio::spawn(async move {
            loop {
                let delay = delay_until(chrono::Local::now().naive_local(), at);
                tokio::time::sleep(delay).await;
                let event = AppEvent::Timer {
                    handle,
                    tag: tag.clone(),
                    payload: Value::Null,
                };
                if tx.send(event).await.is_err() {
                    break;
                }
            }
            if let Ok(mut tasks) = tasks.lock() {
                tasks.remove(&handle.0);
            }
        });
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.insert(handle.0, task);
        }
    }

    /// Cancel a timer. Fired and unknown handles are a no-op.
    pub fn cancel(&self, handle: TimerHandle) {
        if let Ok(mut tasks) = self.tasks.lock() {
            if let Some(task) = tasks.remove(&handle.0) {
                task.abort();
            }
        }
    }

    /// Abort every outstanding timer. Used at shutdown so timer tasks drop
    /// their app-queue senders and the app loops can drain.
    pub fn cancel_all(&self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for (_, task) in tasks.drain() {
                task.abort();
            }
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// `NaiveTime` for an on-the-hour wall-clock time.
pub fn at_hour(hour: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(hour % 24, 0, 0).unwrap_or(NaiveTime::MIN)
}

/// Delay from `now` until the next occurrence of the wall-clock time `at`
/// (today if still ahead, otherwise tomorrow).
pub fn delay_until(now: NaiveDateTime, at: NaiveTime) -> Duration {
    let mut target = now.date().and_time(at);
    if target <= now {
        target = target + TimeDelta::days(1);
    }
    (target - now).to_std().unwrap_or(Duration::ZERO)
}

/// Whether `now` falls inside the `[start_hour:00, end_hour:00]` window,
/// inclusive of both bounds, wrapping across midnight when start > end.
pub fn time_in_window(now: NaiveTime, start_hour: u32, end_hour: u32) -> bool {
    let (Some(start), Some(end)) = (
        NaiveTime::from_hms_opt(start_hour, 0, 0),
        NaiveTime::from_hms_opt(end_hour, 0, 0),
    ) else {
        return false;
    };

    if start <= end {
        now >= start && now <= end
    } else {
        now >= start || now <= end
    }
}
