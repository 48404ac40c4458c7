//! A small producer/consumer worker pool dedicated to finite-difference
//! derivative jobs (spec §4.5): one job per declared parameter, workers
//! each holding their own model scratch bound at construction.
//!
//! Grounded in the teacher's plain `std::thread`-based concurrency
//! (the teacher crate carries no async runtime); this is also the one
//! module `SPEC_FULL.md` calls out as a deliberate stdlib choice, since
//! no crate in the corpus offers this exact bounded,
//! cooperatively-cancellable producer/consumer shape.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::errors::FitError;
use crate::fit_model::FitStorage;

/// One finite-difference job: derive declared parameter `param_index`
/// into `column`, given the base residuals `f0` and the already-packed
/// parameter vector (perturbation happens inside the worker, since it
/// needs a private copy of `packed`).
pub struct DerivativeJob {
    pub param_index: usize,
    pub packed: Vec<f64>,
    pub f0: Vec<f64>,
}

pub type DerivativeResult = Result<(usize, Vec<f64>), FitError>;

/// `perform` computes one job's column given (job, scratch) and
/// returns it tagged by `param_index` so results can be reassembled in
/// any order.
type PerformFn = dyn Fn(&DerivativeJob, &mut dyn FitStorage) -> Result<Vec<f64>, FitError>
    + Send
    + Sync;

struct Shared {
    queue: Mutex<VecDeque<DerivativeJob>>,
    results: Mutex<Vec<DerivativeResult>>,
    in_flight: Mutex<usize>,
    cv: Condvar,
    terminate: Mutex<bool>,
    perform: Arc<PerformFn>,
}

/// A worker pool bound to one fit evaluation: `threads` workers, each
/// with its own cloned model scratch (via `Fit::copy_storage`),
/// processing `DerivativeJob`s pulled off a shared queue.
pub struct DerivativeQueue {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

const POLL_INTERVAL: Duration = Duration::from_millis(500);

impl DerivativeQueue {
    /// `scratches` must have exactly `threads` entries, one private
    /// scratch per worker (the caller builds these via
    /// `Fit::copy_storage` so each worker has its own copy, per §5's
    /// "thread-local scratch" rule).
    pub fn new(
        threads: usize,
        scratches: Vec<Box<dyn FitStorage>>,
        perform: Arc<PerformFn>,
    ) -> Self {
        assert_eq!(scratches.len(), threads, "one scratch per worker required");

        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            results: Mutex::new(Vec::new()),
            in_flight: Mutex::new(0),
            cv: Condvar::new(),
            terminate: Mutex::new(false),
            perform,
        });

        let mut workers = Vec::with_capacity(threads);
        for mut scratch in scratches {
            let shared = Arc::clone(&shared);
            workers.push(std::thread::spawn(move || worker_loop(shared, &mut *scratch)));
        }

        DerivativeQueue { shared, workers }
    }

    /// Posts one job per declared parameter onto the shared queue.
    pub fn post(&self, job: DerivativeJob) {
        let mut in_flight = self.shared.in_flight.lock().unwrap();
        *in_flight += 1;
        self.shared.queue.lock().unwrap().push_back(job);
        self.shared.cv.notify_all();
    }

    /// Blocks until both the pending queue and the in-flight counter
    /// reach zero, polling every 500ms to avoid a missed-wakeup hang
    /// (§4.5). Returns every job's result, tagged by `param_index`,
    /// collected in completion order (workers may finish in any
    /// order).
    pub fn wait_for_jobs_done(&self) -> Vec<DerivativeResult> {
        loop {
            let in_flight = self.shared.in_flight.lock().unwrap();
            let queue_empty = self.shared.queue.lock().unwrap().is_empty();
            if *in_flight == 0 && queue_empty {
                break;
            }
            drop(in_flight);
            std::thread::sleep(POLL_INTERVAL);
        }
        std::mem::take(&mut *self.shared.results.lock().unwrap())
    }

    /// Wakes every worker and unwinds their loops (§4.5 cancellation).
    /// Safe to call even if jobs are still queued; queued-but-not-
    /// started jobs are simply dropped.
    pub fn signal_termination(&mut self) {
        *self.shared.terminate.lock().unwrap() = true;
        self.shared.cv.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl Drop for DerivativeQueue {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            self.signal_termination();
        }
    }
}

/// Internal control-flow signal used to unwind a worker's loop on
/// cancellation, mirroring the source's `TerminateException`.
struct TerminateSignal;

fn worker_loop(shared: Arc<Shared>, scratch: &mut dyn FitStorage) {
    loop {
        let job = {
            let mut queue = shared.queue.lock().unwrap();
            loop {
                if *shared.terminate.lock().unwrap() {
                    return;
                }
                if let Some(job) = queue.pop_front() {
                    break job;
                }
                let (guard, _timeout) = shared
                    .cv
                    .wait_timeout(queue, POLL_INTERVAL)
                    .unwrap();
                queue = guard;
            }
        };

        let outcome = match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            if *shared.terminate.lock().unwrap() {
                return Err(TerminateSignal);
            }
            Ok((shared.perform)(&job, scratch))
        })) {
            Ok(Ok(result)) => Some(result.map(|col| (job.param_index, col))),
            Ok(Err(TerminateSignal)) => None,
            Err(_) => Some(Err(FitError::internal("derivative worker panicked"))),
        };

        if let Some(result) = outcome {
            shared.results.lock().unwrap().push(result);
        }
        *shared.in_flight.lock().unwrap() -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jobs_complete_and_results_collected() {
        let perform: Arc<PerformFn> = Arc::new(|job: &DerivativeJob, _: &mut dyn FitStorage| {
            Ok(job.packed.iter().map(|v| v * 2.0).collect())
        });
        let scratches: Vec<Box<dyn FitStorage>> = vec![Box::new(()), Box::new(())];
        let queue = DerivativeQueue::new(2, scratches, perform);

        for i in 0..5 {
            queue.post(DerivativeJob {
                param_index: i,
                packed: vec![i as f64],
                f0: vec![0.0],
            });
        }
        let mut results = queue.wait_for_jobs_done();
        results.sort_by_key(|r| r.as_ref().unwrap().0);
        assert_eq!(results.len(), 5);
        for (i, r) in results.into_iter().enumerate() {
            let (idx, col) = r.unwrap();
            assert_eq!(idx, i);
            assert_eq!(col, vec![i as f64 * 2.0]);
        }
    }

    #[test]
    fn test_termination_unwinds_workers() {
        let perform: Arc<PerformFn> =
            Arc::new(|_job: &DerivativeJob, _: &mut dyn FitStorage| Ok(vec![]));
        let scratches: Vec<Box<dyn FitStorage>> = vec![Box::new(())];
        let mut queue = DerivativeQueue::new(1, scratches, perform);
        queue.signal_termination();
        assert!(queue.workers.is_empty());
    }

    #[test]
    fn test_error_propagates_through_results() {
        let perform: Arc<PerformFn> = Arc::new(|_job: &DerivativeJob, _: &mut dyn FitStorage| {
            Err(FitError::range("k", 1e10))
        });
        let scratches: Vec<Box<dyn FitStorage>> = vec![Box::new(())];
        let queue = DerivativeQueue::new(1, scratches, perform);
        queue.post(DerivativeJob {
            param_index: 0,
            packed: vec![],
            f0: vec![],
        });
        let results = queue.wait_for_jobs_done();
        assert_eq!(results.len(), 1);
        assert!(results[0].is_err());
    }
}
