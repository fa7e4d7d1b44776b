// Copyright 2017 Anvil project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::thread;

use crossbeam_channel::Sender;
use parking_lot::Mutex;

type Job = Box<dyn FnOnce() + Send + 'static>;

struct PoolInner {
    sender: Sender<Job>,
    workers: Vec<thread::JoinHandle<()>>,
}

///
/// A fixed-size pool of named worker threads, sized to the machine's cpu count.
///
/// Intrinsic tasks and host rule dispatches run here; the scheduler thread itself never blocks
/// on a task. The pool is created lazily, and needs to be re-creatable after a fork, so it is
/// protected by a lock.
///
pub struct CpuPool {
    name_prefix: String,
    inner: Mutex<Option<PoolInner>>,
}

impl CpuPool {
    pub fn new(name_prefix: &str) -> CpuPool {
        CpuPool {
            name_prefix: name_prefix.to_string(),
            inner: Mutex::new(None),
        }
    }

    fn create(&self) -> PoolInner {
        let (sender, receiver) = crossbeam_channel::unbounded::<Job>();
        let workers = (0..num_cpus::get())
            .map(|i| {
                let receiver = receiver.clone();
                thread::Builder::new()
                    .name(format!("{}{}", self.name_prefix, i))
                    .spawn(move || {
                        while let Ok(job) = receiver.recv() {
                            job();
                        }
                    })
                    .expect("Failed to spawn a worker thread.")
            })
            .collect();
        PoolInner { sender, workers }
    }

    pub fn spawn<F: FnOnce() + Send + 'static>(&self, job: F) {
        let mut inner = self.inner.lock();
        if inner.is_none() {
            *inner = Some(self.create());
        }
        inner
            .as_ref()
            .unwrap()
            .sender
            .send(Box::new(job))
            .expect("The worker pool has shut down.");
    }

    ///
    /// Runs all queued jobs to completion and joins the workers. The pool is re-created lazily
    /// by the next `spawn`, so a controlling process may safely fork in between.
    ///
    pub fn reset(&self) {
        let inner = self.inner.lock().take();
        if let Some(PoolInner { sender, workers }) = inner {
            drop(sender);
            for worker in workers {
                let _ = worker.join();
            }
        }
    }
}

impl Drop for CpuPool {
    fn drop(&mut self) {
        self.reset();
    }
}
