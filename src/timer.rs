use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Poll period for idle timer workers, matching the original's
/// `kTimerResponsePeriodMillis`.
const RESPONSE_PERIOD: Duration = Duration::from_millis(5);

type Callback = Box<dyn FnOnce() + Send>;

struct Shared {
    items: Mutex<BTreeMap<i64, Vec<Callback>>>,
    running: AtomicBool,
    condvar: Condvar,
    condvar_lock: Mutex<()>,
}

/// A deadline-ordered timer queue, grounded on
/// `original_source/code_root/cc/shared/timer_queue.cc`: a
/// deadline-bucketed map serviced by a fixed pool of worker threads.
///
/// `stop()` is a forced flush: every pending callback fires immediately
/// regardless of whether its deadline has actually elapsed, matching the
/// original's `get_next_batch` behavior once `running_` goes false — the
/// smallest-deadline bucket is popped unconditionally on shutdown instead
/// of only when its deadline is due.
pub struct TimerQueue {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as i64
}

impl TimerQueue {
    pub fn new(thread_count: usize) -> Self {
        let shared = Arc::new(Shared {
            items: Mutex::new(BTreeMap::new()),
            running: AtomicBool::new(true),
            condvar: Condvar::new(),
            condvar_lock: Mutex::new(()),
        });
        let workers = (0..thread_count.max(1))
            .map(|_| {
                let shared = shared.clone();
                thread::spawn(move || worker_loop(shared))
            })
            .collect();
        Self { shared, workers }
    }

    /// Schedules `callback` to fire once the wall clock reaches
    /// `deadline_millis` (epoch milliseconds). Rejected silently if the
    /// queue has already been stopped, matching the original's `add_item`
    /// no-op-when-`!running_` behavior.
    pub fn add_item(&self, deadline_millis: i64, callback: impl FnOnce() + Send + 'static) {
        if !self.shared.running.load(Ordering::SeqCst) {
            return;
        }
        self.shared.items.lock().entry(deadline_millis).or_insert_with(Vec::new).push(Box::new(callback));
        self.wake();
    }

    /// Schedules a callback to fire `delay_millis` from now.
    pub fn add_item_after(&self, delay_millis: i64, callback: impl FnOnce() + Send + 'static) {
        self.add_item(now_millis() + delay_millis, callback);
    }

    fn wake(&self) {
        let _guard = self.shared.condvar_lock.lock();
        self.shared.condvar.notify_all();
    }

    /// Idempotent shutdown: stops accepting new items, forces every
    /// pending callback to fire regardless of deadline, and joins the
    /// worker threads.
    pub fn stop(&mut self) {
        if self.shared.running.swap(false, Ordering::SeqCst) {
            self.wake();
        }
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for TimerQueue {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        let running = shared.running.load(Ordering::SeqCst);
        let batch = next_batch(&shared, running);
        match batch {
            Some(callbacks) => {
                for callback in callbacks {
                    callback();
                }
            }
            None => {
                if !running && shared.items.lock().is_empty() {
                    return;
                }
                let mut guard = shared.condvar_lock.lock();
                shared.condvar.wait_for(&mut guard, RESPONSE_PERIOD);
            }
        }
    }
}

/// Pops the smallest-deadline bucket if it is due (or unconditionally when
/// `running` is false), mirroring `InnerTimerQueue::get_next_batch`: while
/// running, a not-yet-due smallest deadline means nothing is popped at
/// all, even if later buckets exist — the queue always drains in deadline
/// order.
fn next_batch(shared: &Shared, running: bool) -> Option<Vec<Callback>> {
    let mut items = shared.items.lock();
    let &deadline = items.keys().next()?;
    if running && deadline > now_millis() {
        return None;
    }
    items.remove(&deadline)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn stop_forces_flush_of_all_pending_timers() {
        let mut queue = TimerQueue::new(2);
        let fired = Arc::new(AtomicUsize::new(0));
        for i in 0..25 {
            let fired = fired.clone();
            // Deadlines far in the future: none would fire naturally.
            queue.add_item(now_millis() + 60_000 + i, move || {
                fired.fetch_add(1, Ordering::SeqCst);
            });
        }
        queue.stop();
        assert_eq!(fired.load(Ordering::SeqCst), 25);
    }

    #[test]
    fn due_timer_fires_without_explicit_stop() {
        let mut queue = TimerQueue::new(1);
        let fired = Arc::new(AtomicBool::new(false));
        let f2 = fired.clone();
        queue.add_item(now_millis() - 1, move || f2.store(true, Ordering::SeqCst));
        // Give the worker a moment to observe the already-due deadline.
        thread::sleep(Duration::from_millis(50));
        assert!(fired.load(Ordering::SeqCst));
        queue.stop();
    }
}
