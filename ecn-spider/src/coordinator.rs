use std::future::pending;
use std::sync::Arc;

use chrono::Utc;
use clap::ValueEnum;
use log::{debug, info, warn};
use spider_models::{RunRequest, RunResult};
use tokio::select;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::capture::{PacketCapture, PacketRouter};
use crate::error::{EngineError, RunError};
use crate::pool::{self, Completed, Mode, ProbePool};
use crate::probe::ProbeSender;

/// Order of the results of a run.
#[derive(ValueEnum, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ResultOrder {
    /// As the workers complete them.
    #[default]
    Arrival,
    /// As the jobs were given in the request.
    Input,
}

/// At most one run at a time, per engine instance. Taking it never waits.
#[derive(Clone, Default)]
pub struct RunLock {
    slot: Arc<Mutex<()>>,
}

/// Held for the duration of a run. Dropping it, on whatever path, frees the lock.
pub struct RunToken {
    _guard: OwnedMutexGuard<()>,
}

impl RunLock {
    pub fn try_acquire(&self) -> Result<RunToken, RunError> {
        Arc::clone(&self.slot)
            .try_lock_owned()
            .map(|guard| RunToken { _guard: guard })
            .map_err(|_| RunError::AlreadyRunning)
    }

    #[cfg(test)]
    pub fn is_held(&self) -> bool {
        self.slot.try_lock().is_err()
    }
}

/// Turns run requests into run results, one run at a time.
pub struct Coordinator {
    lock: RunLock,
    pool: pool::Params,
    mode: Mode,
    with_flows: bool,
    sender: Arc<dyn ProbeSender>,
    capture: Arc<dyn PacketCapture>,
}

impl Coordinator {
    pub fn new(
        pool: pool::Params,
        mode: Mode,
        sender: Arc<dyn ProbeSender>,
        capture: Arc<dyn PacketCapture>,
    ) -> Self {
        Self {
            lock: RunLock::default(),
            pool,
            mode,
            with_flows: false,
            sender,
            capture,
        }
    }

    /// Attach the chain fields of both flows to every result.
    pub fn with_flow_details(mut self, with_flows: bool) -> Self {
        self.with_flows = with_flows;
        self
    }

    #[cfg(test)]
    pub fn is_running(&self) -> bool {
        self.lock.is_held()
    }

    /// Probes every destination of the request and collects one result per job.
    ///
    /// Fails right away if another run is in progress or the request is malformed.
    /// Cancelling `stop` stops starting new jobs; jobs already in flight finish and
    /// their results are returned, marked as cancelled. Failure of capture or of the
    /// pool itself abandons the run, without partial results.
    pub async fn start_run(
        &self,
        request: RunRequest,
        stop: &CancellationToken,
    ) -> Result<RunResult, RunError> {
        let _token = self.lock.try_acquire()?;
        let family = request.family;
        let jobs = request.into_jobs()?;
        let total = jobs.len();
        let started_at = Utc::now();
        info!("Starting {} run over {} destinations", family, total);

        let router = Arc::new(PacketRouter::default());
        let mut capture = CaptureSession::start(self.capture.as_ref(), &router)?;
        let pool = ProbePool::new(
            self.pool.clone(),
            self.mode,
            self.with_flows,
            Arc::clone(&self.sender),
            Arc::clone(&router),
        );
        let mut run = pool.spawn(jobs, family, stop)?;

        let mut collected: Vec<Completed> = Vec::with_capacity(total);
        let capture_failure = loop {
            let received = select! {
                biased;
                e = capture.failure() => break Some(e),
                received = run.results.recv() => received,
            };
            match received {
                Some(completed) => collected.push(completed),
                None => break None,
            }
        };
        if let Some(e) = capture_failure {
            warn!("Abandoning run, capture failed: {}", e);
            run.halt();
            run.results.close();
            if let Err(e) = run.done.await {
                debug!("Pool did not shut down cleanly: {}", e);
            }
            return Err(e.into());
        }

        let pool_outcome = run
            .done
            .await
            .map_err(|e| EngineError::WorkerLost(e.to_string()))
            .and_then(|it| it);
        capture.shutdown().await?;
        pool_outcome?;
        debug!("{} flows left subscribed after the pool exited", router.active_flows());

        if self.pool.result_order == ResultOrder::Input {
            collected.sort_by_key(|it| it.index);
        }
        let cancelled = stop.is_cancelled();
        let result = RunResult {
            results: collected.into_iter().map(|it| it.result).collect(),
            started_at,
            stopped_at: Utc::now(),
            cancelled,
        };
        info!(
            "Run finished with {} of {} results after {}ms{}",
            result.results.len(),
            total,
            result.duration().num_milliseconds(),
            if cancelled { " (cancelled)" } else { "" }
        );
        Ok(result)
    }
}

/// Capture running for the duration of one run. Stopped when dropped.
struct CaptureSession {
    handle: Option<JoinHandle<Result<(), EngineError>>>,
    stop: CancellationToken,
    _stop_on_drop: DropGuard,
}

impl CaptureSession {
    fn start(capture: &dyn PacketCapture, router: &Arc<PacketRouter>) -> Result<Self, EngineError> {
        let stop = CancellationToken::new();
        let handle = capture.start(Arc::clone(router), stop.clone())?;
        Ok(Self {
            handle: Some(handle),
            _stop_on_drop: stop.clone().drop_guard(),
            stop,
        })
    }

    /// Resolves only if capture fails. Safe to drop & call again.
    async fn failure(&mut self) -> EngineError {
        let Some(handle) = self.handle.as_mut() else {
            return pending().await;
        };
        let outcome = handle.await;
        self.handle = None;
        match outcome {
            Ok(Err(e)) => e,
            Err(e) => EngineError::WorkerLost(format!("capture: {}", e)),
            Ok(Ok(())) => {
                debug!("Capture ended before the run did");
                pending().await
            }
        }
    }

    async fn shutdown(mut self) -> Result<(), EngineError> {
        self.stop.cancel();
        match self.handle.take() {
            Some(handle) => handle
                .await
                .map_err(|e| EngineError::WorkerLost(format!("capture: {}", e)))?,
            None => Ok(()),
        }
    }
}
