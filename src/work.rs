//! The outer work-scheduler contract: the dispatcher depends only on a
//! `Spawner`, not on a specific thread-pool implementation. `ThreadPoolSpawner`
//! is the bundled default so the crate is usable standalone.

use std::io;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use concurrent_queue::ConcurrentQueue;

pub type Job = Box<dyn FnOnce() + Send>;

/// Bridges the event dispatcher to an outer (or bundled) worker-thread pool.
pub trait Spawner: Send + Sync {
    fn spawn(&self, job: Job);
}

/// Status passed to a queued callback when it runs outside its normal
/// dispatch pathway — currently only on manager shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkStatus {
    Normal,
    Cancelled,
}

struct Inner {
    jobs: ConcurrentQueue<Job>,
    pending: Mutex<usize>,
    ready: Condvar,
    closed: Mutex<bool>,
}

/// Small fixed worker pool: a lock-free job queue (`concurrent-queue`, the
/// same dependency the teacher's `Queue<T>` readiness bridge uses) plus a
/// pending-count/condvar pair so idle workers park instead of spinning.
pub struct ThreadPoolSpawner {
    inner: Arc<Inner>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl ThreadPoolSpawner {
    pub fn new(worker_count: usize) -> io::Result<ThreadPoolSpawner> {
        let inner = Arc::new(Inner {
            jobs: ConcurrentQueue::unbounded(),
            pending: Mutex::new(0),
            ready: Condvar::new(),
            closed: Mutex::new(false),
        });

        let workers = (0..worker_count.max(1))
            .map(|id| {
                let inner = inner.clone();
                thread::Builder::new()
                    .name(format!("conmgr-worker-{id}"))
                    .spawn(move || worker_loop(inner))
            })
            .collect::<io::Result<Vec<_>>>()?;

        Ok(ThreadPoolSpawner { inner, workers })
    }

    pub fn shutdown(self) {
        *self.inner.closed.lock().unwrap() = true;
        self.inner.ready.notify_all();
        for worker in self.workers {
            let _ = worker.join();
        }
    }
}

impl Spawner for ThreadPoolSpawner {
    fn spawn(&self, job: Job) {
        let _ = self.inner.jobs.push(job);
        *self.inner.pending.lock().unwrap() += 1;
        self.inner.ready.notify_one();
    }
}

fn worker_loop(inner: Arc<Inner>) {
    loop {
        let mut pending = inner.pending.lock().unwrap();
        while *pending == 0 {
            if *inner.closed.lock().unwrap() {
                return;
            }
            pending = inner.ready.wait(pending).unwrap();
        }
        *pending -= 1;
        drop(pending);

        match inner.jobs.pop() {
            Ok(job) => job(),
            Err(_) => continue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn runs_every_submitted_job() {
        let pool = ThreadPoolSpawner::new(2).unwrap();
        let count = Arc::new(AtomicUsize::new(0));

        for _ in 0..16 {
            let count = count.clone();
            pool.spawn(Box::new(move || {
                count.fetch_add(1, Ordering::SeqCst);
            }));
        }

        pool.shutdown();
        assert_eq!(count.load(Ordering::SeqCst), 16);
    }
}
