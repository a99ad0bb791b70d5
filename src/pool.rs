use crate::prelude::*;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::thread;

// A bounded pool of OS threads for network-bound work, with two properties
// the usual thread-pool crates don't give us together:
//
// - submit() hands back a Task<T> that any number of callers can wait on
//   (the memo maps hold one clone, the drain loop another), and
// - bump() moves a still-queued job to the front of the ready list, so the
//   job the drain loop is about to block on doesn't sit behind a pile of
//   speculative prefetches.
//
// Jobs never wait on other tasks, only the drain thread waits, so any pool
// size down to 1 is deadlock-free.

type Job = Box<dyn FnOnce() + Send + 'static>;

struct PoolQueue {
    jobs: VecDeque<(u64, Job)>,
    shutdown: bool,
}

struct PoolShared {
    queue: Mutex<PoolQueue>,
    added: Condvar,
}

pub struct Pool {
    shared: Arc<PoolShared>,
    next_id: AtomicU64,
}

impl Pool {
    pub fn new(parallelism: usize) -> Pool {
        let shared = Arc::new(PoolShared {
            queue: Mutex::new(PoolQueue {
                jobs: VecDeque::new(),
                shutdown: false,
            }),
            added: Condvar::new(),
        });
        for i in 0..parallelism.max(1) {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name(format!("depwalk-io-{i}"))
                .spawn(move || worker_loop(shared))
                .expect("failed to spawn worker thread");
        }
        Pool {
            shared,
            next_id: AtomicU64::new(0),
        }
    }

    pub fn submit<T, F>(&self, f: F) -> Task<T>
    where
        T: Clone + Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let task = Task {
            id,
            shared: Arc::new(TaskShared {
                slot: Mutex::new(None),
                done: Condvar::new(),
            }),
        };
        let completion = task.clone();
        let job: Job = Box::new(move || completion.complete(f()));
        {
            let mut queue = self.shared.queue.lock().unwrap();
            queue.jobs.push_back((id, job));
        }
        self.shared.added.notify_one();
        task
    }

    /// Move a still-queued task to the front of the ready list. A task that
    /// already started (or finished) is left alone.
    pub fn bump<T>(&self, task: &Task<T>) {
        let mut queue = self.shared.queue.lock().unwrap();
        if let Some(pos) = queue.jobs.iter().position(|(id, _)| *id == task.id) {
            if let Some(entry) = queue.jobs.remove(pos) {
                queue.jobs.push_front(entry);
            }
        }
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        // Workers drain whatever is still queued and then exit on their own;
        // joining here could deadlock if the last reference to an enclosing
        // struct is dropped from a worker thread.
        let mut queue = self.shared.queue.lock().unwrap();
        queue.shutdown = true;
        drop(queue);
        self.shared.added.notify_all();
    }
}

fn worker_loop(shared: Arc<PoolShared>) {
    loop {
        let job = {
            let mut queue = shared.queue.lock().unwrap();
            loop {
                if let Some((_, job)) = queue.jobs.pop_front() {
                    break job;
                }
                if queue.shutdown {
                    return;
                }
                queue = shared.added.wait(queue).unwrap();
            }
        };
        job();
    }
}

/// A joinable handle on a submitted job. Clones share the result.
pub struct Task<T> {
    id: u64,
    shared: Arc<TaskShared<T>>,
}

struct TaskShared<T> {
    slot: Mutex<Option<Result<T, Arc<eyre::Report>>>>,
    done: Condvar,
}

impl<T> Clone for Task<T> {
    fn clone(&self) -> Self {
        Task {
            id: self.id,
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Clone> Task<T> {
    fn complete(&self, result: Result<T>) {
        let mut slot = self.shared.slot.lock().unwrap();
        *slot = Some(result.map_err(Arc::new));
        self.shared.done.notify_all();
    }

    /// Block until the job finishes. Every waiter observes the same
    /// outcome; a failure is re-reported to each of them.
    pub fn wait(&self) -> Result<T> {
        let mut slot = self.shared.slot.lock().unwrap();
        loop {
            if let Some(result) = slot.as_ref() {
                return match result {
                    Ok(value) => Ok(value.clone()),
                    Err(report) => Err(eyre!("{report:#}")),
                };
            }
            slot = self.shared.done.wait(slot).unwrap();
        }
    }
}
