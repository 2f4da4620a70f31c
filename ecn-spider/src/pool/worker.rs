use std::net::SocketAddr;
use std::sync::Arc;

use chrono::Utc;
use log::{debug, error, trace};
use spider_models::{Job, RawResult};
use tokio::select;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use crate::error::EngineError;
use crate::flow::{FlowKey, FlowRecord};
use crate::probe::{PortSlice, Probe, Treatment};

use super::{fold, Completed, Mode, WorkerContext};

/// Shared FIFO of jobs with their index in the request. Whoever holds the lock gets
/// the next job, so no job is handed out twice.
pub(super) type JobQueue = Arc<Mutex<mpsc::Receiver<(usize, Job)>>>;

pub(super) struct Worker {
    pub id: usize,
    pub ports: PortSlice,
    pub ctx: Arc<WorkerContext>,
    pub queue: JobQueue,
    pub results: mpsc::Sender<Completed>,
    pub halt: CancellationToken,
}

/// When a flow is done listening.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Listen {
    /// Until the connection is accepted, refused or unreachable.
    UntilResolved,
    /// For the whole timeout, since every probe of a burst may get its own reply.
    FullTimeout,
}

impl Worker {
    pub async fn run(mut self) -> Result<(), EngineError> {
        trace!("Worker {} up with {} source ports", self.id, self.ports.len());
        let mut handled = 0usize;
        loop {
            let next = select! {
                biased;
                _ = self.halt.cancelled() => None,
                job = next_job(&self.queue) => job,
            };
            let Some((index, job)) = next else {
                break;
            };
            let result = match self.probe(&job).await {
                Ok(result) => result,
                Err(e) => {
                    error!("Worker {} failed on {}: {}", self.id, job.target(), e);
                    self.halt.cancel();
                    return Err(e);
                }
            };
            handled += 1;
            if self.results.send(Completed { index, result }).await.is_err() {
                debug!("Nobody collects results anymore, worker {} exiting", self.id);
                break;
            }
        }
        debug!("Worker {} done after {} jobs", self.id, handled);
        Ok(())
    }

    async fn probe(&mut self, job: &Job) -> Result<RawResult, EngineError> {
        let baseline = self
            .run_flow(job, &[Treatment::Baseline], Listen::UntilResolved)
            .await?;
        let result = match self.ctx.mode {
            Mode::Ecn => {
                let treated = self
                    .run_flow(job, &[Treatment::EcnSetup], Listen::UntilResolved)
                    .await?;
                fold::ecn(job, &baseline, &treated, self.ctx.with_flows)
            }
            Mode::Trace { min_ttl, max_ttl } => {
                let burst: Vec<Treatment> = (min_ttl..=max_ttl)
                    .map(|ttl| Treatment::HopLimited { ttl })
                    .collect();
                let traced = self.run_flow(job, &burst, Listen::FullTimeout).await?;
                fold::trace(job, &baseline, &traced, &self.ctx.bands, self.ctx.with_flows)
            }
        };
        trace!("{} -> {:?}", job.target(), result.connectivity_state);
        Ok(result)
    }

    /// Sends the probes of one flow and feeds what comes back through the chains until
    /// the timeout. A probe the kernel refuses is just a flow that never hears back.
    async fn run_flow(
        &mut self,
        job: &Job,
        treatments: &[Treatment],
        listen: Listen,
    ) -> Result<FlowRecord, EngineError> {
        let key = FlowKey {
            local: SocketAddr::new(self.ctx.source, self.ports.next_port()),
            remote: job.target(),
        };
        let mut subscription = self.ctx.router.subscribe(key);
        let mut record = FlowRecord::new(key, Utc::now());
        self.ctx.chains.init(&mut record);

        let mut sent = 0usize;
        for treatment in treatments {
            match self.ctx.sender.send(&Probe::new(key, *treatment)) {
                Ok(()) => sent += 1,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => debug!("{}: {}", key, e),
            }
        }
        if sent == 0 {
            return Ok(record);
        }

        let deadline = Instant::now() + self.ctx.timeout;
        loop {
            select! {
                _ = sleep_until(deadline) => break,
                packet = subscription.recv() => {
                    let Some(packet) = packet else {
                        break;
                    };
                    self.ctx.chains.observe(&mut record, &packet);
                    if listen == Listen::UntilResolved && record.is_resolved() {
                        break;
                    }
                }
            }
        }
        Ok(record)
    }
}

async fn next_job(queue: &JobQueue) -> Option<(usize, Job)> {
    queue.lock().await.recv().await
}
