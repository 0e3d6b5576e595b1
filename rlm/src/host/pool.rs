//! A small fixed-size thread pool for backend calls.
//!
//! Contract: a pool is created with [`WorkerPool::new`], jobs go in with
//! [`WorkerPool::submit`], and [`WorkerPool::shutdown`] (or drop) closes the
//! queue. Shutdown never joins: a job stuck in a slow backend call finishes on
//! its own thread and its result is discarded.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, warn};

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct WorkerPool {
    name: String,
    size: usize,
    sender: Option<Sender<Job>>,
}

impl WorkerPool {
    /// Spawn `size` threads (at least one) named `<name>-<i>`.
    pub fn new(name: &str, size: usize) -> Result<Self> {
        let size = size.max(1);
        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));
        for index in 0..size {
            let receiver = Arc::clone(&receiver);
            thread::Builder::new()
                .name(format!("{name}-{index}"))
                .spawn(move || worker_loop(&receiver))
                .with_context(|| format!("spawn pool thread {name}-{index}"))?;
        }
        debug!(pool = name, size, "pool started");
        Ok(Self {
            name: name.to_string(),
            size,
            sender: Some(sender),
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Queue `job`. The receiver yields exactly one result; a panic inside the
    /// job becomes an error.
    pub fn submit<T, F>(&self, job: F) -> Result<Receiver<Result<T>>>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| anyhow!("pool {} is shut down", self.name))?;
        let (tx, rx) = mpsc::channel();
        let wrapped: Job = Box::new(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(job))
                .unwrap_or_else(|payload| Err(anyhow!("job panicked: {}", panic_message(&*payload))));
            // The caller may have given up waiting.
            let _ = tx.send(outcome);
        });
        sender
            .send(wrapped)
            .map_err(|_| anyhow!("pool {} is shut down", self.name))?;
        Ok(rx)
    }

    /// Close the queue. Idle threads exit; busy threads exit after their job.
    pub fn shutdown(&mut self) {
        if self.sender.take().is_some() {
            debug!(pool = %self.name, "pool shut down");
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.sender.is_none()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(receiver: &Mutex<Receiver<Job>>) {
    loop {
        // Hold the lock only while waiting for the next job.
        let job = receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .recv();
        match job {
            Ok(job) => job(),
            Err(_) => return,
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        return (*text).to_string();
    }
    if let Some(text) = payload.downcast_ref::<String>() {
        return text.clone();
    }
    warn!("panic payload is not a string");
    "unknown panic".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn runs_jobs_and_returns_results() {
        let pool = WorkerPool::new("test-pool", 2).expect("pool");
        let receivers: Vec<_> = (0..4)
            .map(|i| pool.submit(move || Ok(i * 10)).expect("submit"))
            .collect();
        let results: Vec<i32> = receivers
            .into_iter()
            .map(|rx| rx.recv_timeout(Duration::from_secs(5)).expect("result").expect("ok"))
            .collect();
        assert_eq!(results, vec![0, 10, 20, 30]);
    }

    #[test]
    fn panics_become_errors() {
        let pool = WorkerPool::new("panic-pool", 1).expect("pool");
        let rx = pool
            .submit(|| -> Result<()> { panic!("boom") })
            .expect("submit");
        let err = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("result")
            .expect_err("panic");
        assert!(err.to_string().contains("boom"));

        // The thread survives the panic.
        let rx = pool.submit(|| Ok(1)).expect("submit");
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).expect("result").expect("ok"), 1);
    }

    #[test]
    fn submit_after_shutdown_fails() {
        let mut pool = WorkerPool::new("closed-pool", 0).expect("pool");
        assert_eq!(pool.size(), 1);
        pool.shutdown();
        pool.shutdown();
        assert!(pool.is_shut_down());
        assert!(pool.submit(|| Ok(())).is_err());
    }
}
