//! The background task scheduler.
//!
//! The region engine treats this as an opaque queue: closures submitted with
//! [`schedule`] eventually run on some worker thread. Workers are started
//! lazily on first use and live for the rest of the process. [`wait_idle`]
//! blocks until the queue has drained and no task is running, which is how
//! tests reach a quiescent point before checking the heap.
use region_utils::sync::{Condvar, Mutex, OnceLock};
use std::collections::VecDeque;
use std::sync::Once;
use std::thread;

type Task = Box<dyn FnOnce() + Send + 'static>;

struct Inner {
    queue: VecDeque<Task>,
    active: usize,
}

pub struct Scheduler {
    inner: Mutex<Inner>,
    work_available: Condvar,
    idle: Condvar,
}

static SCHEDULER: OnceLock<Scheduler> = OnceLock::new();
static WORKERS: Once = Once::new();

impl Scheduler {
    fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                active: 0,
            }),
            work_available: Condvar::new(),
            idle: Condvar::new(),
        }
    }

    fn global() -> &'static Scheduler {
        let sched = SCHEDULER.get_or_init(Scheduler::new);
        WORKERS.call_once(|| {
            let n = thread::available_parallelism().map(|n| n.get()).unwrap_or(2);
            for i in 0..n {
                thread::Builder::new()
                    .name(format!("region-gc-{i}"))
                    .spawn(move || sched_worker())
                    .expect("failed to spawn scheduler worker");
            }
        });
        sched
    }

    fn worker(&'static self) {
        loop {
            let task = {
                let mut inner = self.inner.lock();
                loop {
                    if let Some(task) = inner.queue.pop_front() {
                        inner.active += 1;
                        break task;
                    }
                    self.work_available.wait(&mut inner);
                }
            };
            task();
            let mut inner = self.inner.lock();
            inner.active -= 1;
            if inner.active == 0 && inner.queue.is_empty() {
                self.idle.notify_all();
            }
        }
    }
}

fn sched_worker() {
    Scheduler::global().worker();
}

/// Submit a closure to run on some worker thread, eventually.
pub fn schedule(task: impl FnOnce() + Send + 'static) {
    let sched = Scheduler::global();
    let mut inner = sched.inner.lock();
    inner.queue.push_back(Box::new(task));
    sched.work_available.notify_one();
}

/// Block until all submitted work has finished.
///
/// For testing and debugging purposes only: tasks submitted concurrently
/// with this call may or may not be waited for.
pub fn wait_idle() {
    let sched = Scheduler::global();
    let mut inner = sched.inner.lock();
    while inner.active > 0 || !inner.queue.is_empty() {
        sched.idle.wait(&mut inner);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use region_utils::sync::{Arc, AtomicUsize, Ordering};

    #[test]
    fn test_scheduled_work_runs() {
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..64 {
            let counter = counter.clone();
            schedule(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            });
        }
        wait_idle();
        assert_eq!(counter.load(Ordering::Relaxed), 64);
    }

    #[test]
    fn test_wait_idle_with_empty_queue_returns() {
        wait_idle();
    }
}
