//! Hashed timing wheel for delayed callbacks.
//!
//! A ring of slots ticks at a fixed period. Each scheduled task carries a
//! remaining-circle counter and an optional string key; a parallel
//! `key -> location` index makes cancellation and re-scheduling O(1),
//! which matters because every TTL reset cancels a previous placement.
//!
//! One worker drains four channels (tick, add, remove, stop). Due
//! callbacks run on fresh threads so a slow callback cannot stall the
//! wheel, and a callback never runs while the wheel holds any lock.

use std::sync::OnceLock;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, bounded, select, tick, unbounded};
use hashbrown::HashMap;
use tracing::{debug, error};

/// Deferred job executed when its wheel slot comes due.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

enum WheelMessage {
    Add {
        delay: Duration,
        key: String,
        job: Job,
    },
    Remove(String),
}

/// Handle to a running timing wheel.
#[derive(Debug, Clone)]
pub struct TimeWheel {
    message_tx: Sender<WheelMessage>,
    stop_tx: Sender<()>,
    tick_period: Duration,
}

impl TimeWheel {
    /// Starts a wheel with `slot_count` slots ticking every `tick_period`.
    #[must_use]
    pub fn start(tick_period: Duration, slot_count: usize) -> Self {
        let (message_tx, message_rx) = unbounded();
        let (stop_tx, stop_rx) = bounded(1);
        let period = tick_period.max(Duration::from_millis(1));
        let slots = slot_count.max(1);
        let _ = thread::Builder::new()
            .name("carmine-timewheel".to_owned())
            .spawn(move || WheelWorker::new(period, slots).run(&message_rx, &stop_rx));
        Self {
            message_tx,
            stop_tx,
            tick_period: period,
        }
    }

    /// Schedules `job` to run after `delay`.
    ///
    /// A non-empty `key` makes the placement addressable: scheduling the
    /// same key again cancels the previous placement first.
    pub fn delay(&self, delay: Duration, key: impl Into<String>, job: impl FnOnce() + Send + 'static) {
        let _ = self.message_tx.send(WheelMessage::Add {
            delay,
            key: key.into(),
            job: Box::new(job),
        });
    }

    /// Cancels the placement stored under `key`, if any.
    pub fn cancel(&self, key: impl Into<String>) {
        let key = key.into();
        if key.is_empty() {
            return;
        }
        let _ = self.message_tx.send(WheelMessage::Remove(key));
    }

    /// Stops the worker; queued placements are dropped.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(());
    }

    /// Returns the tick period the wheel runs at.
    #[must_use]
    pub fn tick_period(&self) -> Duration {
        self.tick_period
    }
}

struct ScheduledTask {
    circle: usize,
    key: String,
    job: Job,
}

struct WheelWorker {
    tick_period: Duration,
    slots: Vec<HashMap<u64, ScheduledTask>>,
    /// key -> (slot, task id) for O(1) cancel and reschedule.
    timer: HashMap<String, (usize, u64)>,
    current: usize,
    next_task_id: u64,
}

impl WheelWorker {
    fn new(tick_period: Duration, slot_count: usize) -> Self {
        Self {
            tick_period,
            slots: (0..slot_count).map(|_| HashMap::new()).collect(),
            timer: HashMap::new(),
            current: 0,
            next_task_id: 0,
        }
    }

    fn run(mut self, message_rx: &Receiver<WheelMessage>, stop_rx: &Receiver<()>) {
        let ticker = tick(self.tick_period);
        loop {
            select! {
                recv(ticker) -> _ => self.on_tick(),
                recv(message_rx) -> message => match message {
                    Ok(WheelMessage::Add { delay, key, job }) => self.add_task(delay, key, job),
                    Ok(WheelMessage::Remove(key)) => self.remove_task(&key),
                    Err(_) => return,
                },
                recv(stop_rx) -> _ => {
                    debug!("timing wheel stopped");
                    return;
                }
            }
        }
    }

    fn on_tick(&mut self) {
        let scanned = self.current;
        self.current = (self.current + 1) % self.slots.len();

        let due: Vec<u64> = self.slots[scanned]
            .iter_mut()
            .filter_map(|(id, task)| {
                if task.circle > 0 {
                    task.circle -= 1;
                    None
                } else {
                    Some(*id)
                }
            })
            .collect();

        for id in due {
            let Some(task) = self.slots[scanned].remove(&id) else {
                continue;
            };
            if !task.key.is_empty() {
                let _ = self.timer.remove(&task.key);
            }
            // Fresh thread per callback; the wheel holds no lock here and
            // a panicking job must not take the worker down.
            let _ = thread::Builder::new()
                .name("carmine-timewheel-job".to_owned())
                .spawn(move || {
                    if std::panic::catch_unwind(std::panic::AssertUnwindSafe(task.job)).is_err() {
                        error!("timing wheel callback panicked");
                    }
                });
        }
    }

    fn add_task(&mut self, delay: Duration, key: String, job: Job) {
        let ticks = (delay.as_millis() / self.tick_period.as_millis().max(1)) as usize;
        let circle = ticks / self.slots.len();
        let slot = (self.current + ticks) % self.slots.len();

        if !key.is_empty() && self.timer.contains_key(&key) {
            self.remove_task(&key);
        }

        let id = self.next_task_id;
        self.next_task_id = self.next_task_id.wrapping_add(1);
        if !key.is_empty() {
            let _ = self.timer.insert(key.clone(), (slot, id));
        }
        let _ = self.slots[slot].insert(id, ScheduledTask { circle, key, job });
    }

    fn remove_task(&mut self, key: &str) {
        if let Some((slot, id)) = self.timer.remove(key) {
            let _ = self.slots[slot].remove(&id);
        }
    }
}

static GLOBAL_WHEEL: OnceLock<TimeWheel> = OnceLock::new();

fn global_wheel() -> &'static TimeWheel {
    GLOBAL_WHEEL.get_or_init(|| TimeWheel::start(Duration::from_millis(100), 3600))
}

/// Schedules a job on the process-wide wheel.
pub fn delay(duration: Duration, key: impl Into<String>, job: impl FnOnce() + Send + 'static) {
    global_wheel().delay(duration, key, job);
}

/// Cancels a keyed placement on the process-wide wheel.
pub fn cancel(key: impl Into<String>) {
    global_wheel().cancel(key);
}

#[cfg(test)]
mod tests {
    use super::TimeWheel;
    use googletest::prelude::*;
    use rstest::rstest;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn test_wheel() -> TimeWheel {
        TimeWheel::start(Duration::from_millis(10), 8)
    }

    fn wait_until(deadline: Duration, condition: impl Fn() -> bool) -> bool {
        let start = std::time::Instant::now();
        while start.elapsed() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    #[rstest]
    fn fires_after_requested_delay() {
        let wheel = test_wheel();
        let fired = Arc::new(AtomicUsize::new(0));
        let flag = Arc::clone(&fired);
        wheel.delay(Duration::from_millis(30), "job", move || {
            let _ = flag.fetch_add(1, Ordering::SeqCst);
        });
        assert_that!(
            wait_until(Duration::from_secs(2), || fired.load(Ordering::SeqCst) == 1),
            eq(true)
        );
        wheel.stop();
    }

    #[rstest]
    fn cancelled_job_never_fires() {
        let wheel = test_wheel();
        let fired = Arc::new(AtomicUsize::new(0));
        let flag = Arc::clone(&fired);
        wheel.delay(Duration::from_millis(50), "doomed", move || {
            let _ = flag.fetch_add(1, Ordering::SeqCst);
        });
        wheel.cancel("doomed");
        std::thread::sleep(Duration::from_millis(200));
        assert_that!(fired.load(Ordering::SeqCst), eq(0_usize));
        wheel.stop();
    }

    #[rstest]
    fn rescheduling_replaces_previous_placement() {
        let wheel = test_wheel();
        let counter = Arc::new(AtomicUsize::new(0));
        for round in 0..3_usize {
            let counter = Arc::clone(&counter);
            wheel.delay(Duration::from_millis(40), "same-key", move || {
                let _ = counter.fetch_add(round + 1, Ordering::SeqCst);
            });
        }
        assert_that!(
            wait_until(Duration::from_secs(2), || counter.load(Ordering::SeqCst) > 0),
            eq(true)
        );
        std::thread::sleep(Duration::from_millis(150));
        // Only the last placement survives, contributing exactly 3.
        assert_that!(counter.load(Ordering::SeqCst), eq(3_usize));
        wheel.stop();
    }

    #[rstest]
    fn long_delays_wrap_with_circle_counter() {
        // 8 slots x 10ms per tick: 250ms needs at least 3 full circles.
        let wheel = test_wheel();
        let fired = Arc::new(AtomicUsize::new(0));
        let flag = Arc::clone(&fired);
        wheel.delay(Duration::from_millis(250), "far", move || {
            let _ = flag.fetch_add(1, Ordering::SeqCst);
        });
        std::thread::sleep(Duration::from_millis(100));
        assert_that!(fired.load(Ordering::SeqCst), eq(0_usize));
        assert_that!(
            wait_until(Duration::from_secs(3), || fired.load(Ordering::SeqCst) == 1),
            eq(true)
        );
        wheel.stop();
    }

    #[rstest]
    fn panicking_job_does_not_kill_the_wheel() {
        let wheel = test_wheel();
        wheel.delay(Duration::from_millis(20), "boom", || panic!("job blew up"));
        let fired = Arc::new(AtomicUsize::new(0));
        let flag = Arc::clone(&fired);
        wheel.delay(Duration::from_millis(60), "after", move || {
            let _ = flag.fetch_add(1, Ordering::SeqCst);
        });
        assert_that!(
            wait_until(Duration::from_secs(2), || fired.load(Ordering::SeqCst) == 1),
            eq(true)
        );
        wheel.stop();
    }
}
