//! Shared delayed-job scheduler
//!
//! One thread, shared by every peripheral, that runs deferred jobs. Its only
//! engine duty is issuing the delayed "start discovery" request: some stacks
//! misbehave when discovery is requested from the same context that is about
//! to receive the link-established callback, so the request is deliberately
//! made from here instead of the peripheral worker.

use log::warn;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};

struct Job {
    due: Instant,
    run: Box<dyn FnOnce() + Send>,
}

/// Handle to the scheduler thread. Cloning shares the same thread; the
/// thread exits once every handle is dropped and all pending jobs have run.
#[derive(Clone)]
pub(crate) struct Scheduler {
    tx: Sender<Job>,
}

impl Scheduler {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel::<Job>();

        let spawned = thread::Builder::new()
            .name("gattq-sched".into())
            .spawn(move || {
                let mut pending: Vec<Job> = Vec::new();
                let mut closed = false;

                loop {
                    // Run everything that is due
                    let now = Instant::now();
                    let mut i = 0;
                    while i < pending.len() {
                        if pending[i].due <= now {
                            let job = pending.swap_remove(i);
                            (job.run)();
                        } else {
                            i += 1;
                        }
                    }

                    let next_due = pending.iter().map(|j| j.due).min();
                    match (closed, next_due) {
                        (true, None) => break,
                        (true, Some(due)) => {
                            thread::sleep(due.saturating_duration_since(Instant::now()));
                        }
                        (false, None) => match rx.recv() {
                            Ok(job) => pending.push(job),
                            Err(_) => closed = true,
                        },
                        (false, Some(due)) => {
                            let timeout = due.saturating_duration_since(Instant::now());
                            match rx.recv_timeout(timeout) {
                                Ok(job) => pending.push(job),
                                Err(RecvTimeoutError::Timeout) => {}
                                Err(RecvTimeoutError::Disconnected) => closed = true,
                            }
                        }
                    }
                }
            });

        if let Err(e) = spawned {
            warn!("failed to spawn scheduler thread: {}", e);
        }

        Scheduler { tx }
    }

    /// Run `job` after `delay` on the scheduler thread
    pub fn schedule<F>(&self, delay: Duration, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let job = Job {
            due: Instant::now() + delay,
            run: Box::new(job),
        };

        // Only fails if the thread is gone, which means shutdown
        let _ = self.tx.send(job);
    }
}
