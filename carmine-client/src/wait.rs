//! Counter-style wait group for draining in-flight requests.

use std::sync::{Arc, Condvar, Mutex};

/// Tracks outstanding work items; `wait` blocks until the count is zero.
#[derive(Debug, Clone)]
pub(crate) struct WaitGroup {
    state: Arc<(Mutex<usize>, Condvar)>,
}

impl WaitGroup {
    pub(crate) fn new() -> Self {
        Self {
            state: Arc::new((Mutex::new(0), Condvar::new())),
        }
    }

    pub(crate) fn add(&self, delta: usize) {
        let (count, _) = &*self.state;
        *count.lock().expect("wait group mutex poisoned") += delta;
    }

    pub(crate) fn done(&self) {
        let (count, signal) = &*self.state;
        let mut count = count.lock().expect("wait group mutex poisoned");
        *count = count.saturating_sub(1);
        if *count == 0 {
            signal.notify_all();
        }
    }

    pub(crate) fn wait(&self) {
        let (count, signal) = &*self.state;
        let mut count = count.lock().expect("wait group mutex poisoned");
        while *count > 0 {
            count = signal.wait(count).expect("wait group mutex poisoned");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::WaitGroup;
    use rstest::rstest;
    use std::thread;
    use std::time::Duration;

    // Hanging here means `done` failed to wake the waiter.
    #[rstest]
    fn wait_returns_once_all_work_is_done() {
        let group = WaitGroup::new();
        group.add(2);
        let worker = group.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            worker.done();
            worker.done();
        });
        group.wait();
        handle.join().expect("worker finishes");
    }

    #[rstest]
    fn wait_on_idle_group_returns_immediately() {
        WaitGroup::new().wait();
    }
}
