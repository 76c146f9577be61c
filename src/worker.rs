//! Background analysis runs
//!
//! An [`AnalysisRunner`] runs at most one analysis at a time on a worker
//! thread. The caller keeps an [`AnalysisHandle`] to cancel or join the run.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{debug, info};

use crate::config::AnalysisOptions;
use crate::dataset::Dataset;
use crate::params::AnalysisParams;
use crate::pipeline::run_analysis_with_cancel;
use crate::report::AnalysisReport;
use crate::CausalError;

/// Cooperative cancellation flag shared between a caller and a run.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    /// `Err(Cancelled)` once cancellation was requested
    pub fn check(&self) -> Result<(), CausalError> {
        if self.is_cancelled() {
            Err(CausalError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Serializes analysis triggers: a second start while a run is in flight is
/// refused instead of queued.
#[derive(Debug, Clone, Default)]
pub struct AnalysisRunner {
    in_flight: Arc<AtomicBool>,
}

/// Clears the in-flight flag when the worker thread ends, panics included.
struct InFlightGuard(Arc<AtomicBool>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl AnalysisRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Start an analysis on a worker thread.
    pub fn try_start(
        &self,
        dataset: Dataset,
        params: AnalysisParams,
        options: AnalysisOptions,
    ) -> Result<AnalysisHandle<AnalysisReport>, CausalError> {
        self.spawn_job(move |cancel| run_analysis_with_cancel(&dataset, &params, &options, cancel))
    }

    fn spawn_job<T, F>(&self, job: F) -> Result<AnalysisHandle<T>, CausalError>
    where
        T: Send + 'static,
        F: FnOnce(&CancellationToken) -> Result<T, CausalError> + Send + 'static,
    {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("analysis trigger ignored, a run is in flight");
            return Err(CausalError::RunInFlight);
        }

        let guard = InFlightGuard(Arc::clone(&self.in_flight));
        let token = CancellationToken::new();
        let worker_token = token.clone();
        // a failed spawn drops the closure and with it the guard
        let thread = thread::Builder::new()
            .name("causal-analysis".to_string())
            .spawn(move || {
                let _guard = guard;
                info!("analysis worker started");
                job(&worker_token)
            })?;

        Ok(AnalysisHandle {
            thread,
            cancel: token,
        })
    }
}

/// Handle to one in-flight run
#[derive(Debug)]
pub struct AnalysisHandle<T = AnalysisReport> {
    thread: JoinHandle<Result<T, CausalError>>,
    cancel: CancellationToken,
}

impl<T> AnalysisHandle<T> {
    /// Ask the run to stop at its next checkpoint.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Wait for the run and return its outcome.
    pub fn join(self) -> Result<T, CausalError> {
        self.thread.join().map_err(|_| CausalError::WorkerPanicked)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_token_is_shared_between_clones() {
        let token = CancellationToken::new();
        let clone = token.clone();
        assert!(token.check().is_ok());
        clone.cancel();
        assert!(token.is_cancelled());
        assert!(matches!(token.check(), Err(CausalError::Cancelled)));
    }

    #[test]
    fn test_second_trigger_is_refused_while_running() {
        let runner = AnalysisRunner::new();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        let handle = runner
            .spawn_job(move |_| {
                release_rx.recv().ok();
                Ok(7)
            })
            .unwrap();
        assert!(runner.is_busy());
        assert!(matches!(
            runner.spawn_job(|_| Ok(8)),
            Err(CausalError::RunInFlight)
        ));

        release_tx.send(()).unwrap();
        assert_eq!(handle.join().unwrap(), 7);
        assert!(!runner.is_busy());

        let again = runner.spawn_job(|_| Ok(9)).unwrap();
        assert_eq!(again.join().unwrap(), 9);
    }

    #[test]
    fn test_cancel_reaches_the_job() {
        let runner = AnalysisRunner::new();
        let handle = runner
            .spawn_job(|cancel| loop {
                cancel.check()?;
                thread::sleep(Duration::from_millis(1));
            })
            .unwrap();
        handle.cancel();
        let result: Result<(), CausalError> = handle.join();
        assert!(matches!(result, Err(CausalError::Cancelled)));
    }

    #[test]
    fn test_panicking_job_releases_runner() {
        let runner = AnalysisRunner::new();
        let handle = runner
            .spawn_job::<(), _>(|_| panic!("boom"))
            .unwrap();
        assert!(matches!(handle.join(), Err(CausalError::WorkerPanicked)));
        assert!(!runner.is_busy());
    }
}
