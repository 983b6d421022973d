// Licensed under the MIT License.

//! A cooperative background task that re-runs a closure at a fixed period.

use parking_lot::Condvar;
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// A named background thread invoking a closure once per period until ended.
///
/// The doorbell watcher is one of these; multithreaded tests step it with
/// [`LoopingTask::wait_for_flip`].
pub struct LoopingTask {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

struct Shared {
    state: Mutex<State>,
    condvar: Condvar,
}

struct State {
    running: bool,
    iterations: u64,
}

impl LoopingTask {
    /// Spawns the task, running `body` every `period` until [`Self::end`].
    pub fn spawn(name: &str, period: Duration, mut body: impl FnMut() + Send + 'static) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                running: true,
                iterations: 0,
            }),
            condvar: Condvar::new(),
        });
        let thread = std::thread::Builder::new()
            .name(name.to_owned())
            .spawn({
                let shared = shared.clone();
                move || {
                    loop {
                        if !shared.state.lock().running {
                            break;
                        }
                        body();
                        let mut state = shared.state.lock();
                        state.iterations += 1;
                        shared.condvar.notify_all();
                        if !state.running {
                            break;
                        }
                        // The condvar doubles as the sleep: end() notifies to
                        // cut the nap short. A flip waiter's wakeup landing
                        // here only shortens one period, which is harmless
                        // for a poller.
                        let _ = shared.condvar.wait_for(&mut state, period);
                    }
                }
            })
            .expect("failed to spawn watcher thread");
        Self {
            shared,
            thread: Some(thread),
        }
    }

    /// Blocks until an iteration that started after this call has completed.
    ///
    /// Two completions are awaited because one may already have been in
    /// flight when the call was made.
    pub fn wait_for_flip(&self) {
        let mut state = self.shared.state.lock();
        let target = state.iterations + 2;
        while state.iterations < target && state.running {
            self.shared.condvar.wait(&mut state);
        }
    }

    /// Stops the task. The current iteration finishes before the thread
    /// exits.
    pub fn end(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.running = false;
            self.shared.condvar.notify_all();
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for LoopingTask {
    fn drop(&mut self) {
        self.end();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;
    use std::sync::atomic::Ordering;

    #[test]
    fn runs_and_flips() {
        let count = Arc::new(AtomicU64::new(0));
        let task = {
            let count = count.clone();
            LoopingTask::spawn("test-loop", Duration::from_millis(1), move || {
                count.fetch_add(1, Ordering::SeqCst);
            })
        };
        task.wait_for_flip();
        assert!(count.load(Ordering::SeqCst) >= 1);
        let before = count.load(Ordering::SeqCst);
        task.wait_for_flip();
        assert!(count.load(Ordering::SeqCst) > before);
    }

    #[test]
    fn end_stops_the_loop() {
        let count = Arc::new(AtomicU64::new(0));
        let mut task = {
            let count = count.clone();
            LoopingTask::spawn("test-loop", Duration::from_millis(1), move || {
                count.fetch_add(1, Ordering::SeqCst);
            })
        };
        task.wait_for_flip();
        task.end();
        let after = count.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(count.load(Ordering::SeqCst), after);
    }
}
