use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use futures::stream::{FuturesUnordered, StreamExt};
use log::{debug, info};
use spider_models::{AddressFamily, Job, RawResult};
use tokio::select;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::capture::PacketRouter;
use crate::chain::{ChainSet, TtlBands};
use crate::coordinator::ResultOrder;
use crate::error::EngineError;
use crate::probe::{ports, ProbeSender};

use self::worker::{JobQueue, Worker};

/// Folds the flows of one job into its result.
mod fold;
mod worker;

/// Completed results waiting to be collected before workers block on sending more.
const RESULT_BUFFER: usize = 1024;

#[derive(Args, Clone, Debug)]
#[group(id = "pool")]
pub struct Params {
    /// How many destinations to probe concurrently.
    #[arg(long, default_value = "20", env = "WORKERS")]
    pub workers: usize,

    /// How long to wait for a reply to each connection attempt. Jobs make two of these,
    /// one after the other.
    #[arg(long = "timeout-ms", default_value = "2000", env = "CONNECTION_TIMEOUT_MS")]
    pub timeout_ms: u64,

    /// Local address to probe IPv4 destinations from
    #[arg(long, env = "SOURCE_IP4")]
    pub source_ip4: Option<Ipv4Addr>,

    /// Local address to probe IPv6 destinations from
    #[arg(long, env = "SOURCE_IP6")]
    pub source_ip6: Option<Ipv6Addr>,

    /// Lowest local port to use. The range is split evenly between workers, so make
    /// sure nothing else on this host uses it and the kernel does not hand it out as
    /// ephemeral ports.
    #[arg(long, default_value = "61000", env = "SOURCE_PORT_MIN")]
    pub source_port_min: u16,

    #[arg(long, default_value = "65000", env = "SOURCE_PORT_MAX")]
    pub source_port_max: u16,

    /// Order of the results in the output: as they complete, or as the jobs were given.
    #[arg(long, value_enum, default_value = "arrival", env = "RESULT_ORDER")]
    pub result_order: ResultOrder,

    /// Initial TTLs assumed when estimating the return path length from a reply's TTL.
    #[arg(long, default_value = "32,64,128,255", env = "TTL_BANDS")]
    pub ttl_bands: TtlBands,
}

impl Params {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn source_for(&self, family: AddressFamily) -> Result<IpAddr, EngineError> {
        match family {
            AddressFamily::V4 => self.source_ip4.map(IpAddr::V4),
            AddressFamily::V6 => self.source_ip6.map(IpAddr::V6),
        }
        .ok_or(EngineError::NoSourceAddress(family))
    }
}

/// What the second flow of each job does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// ECN-setup SYN, compared against the plain baseline.
    Ecn,
    /// Burst of hop-limited SYNs, one per TTL.
    Trace { min_ttl: u8, max_ttl: u8 },
}

impl Mode {
    pub fn chains(&self) -> ChainSet {
        match self {
            Mode::Ecn => ChainSet::for_ecn(),
            Mode::Trace { .. } => ChainSet::for_traceroute(),
        }
    }
}

#[derive(Debug)]
pub struct Completed {
    /// Position of the job in the run request.
    pub index: usize,
    pub result: RawResult,
}

/// Read-only state shared by all workers of a pool.
pub(crate) struct WorkerContext {
    pub source: IpAddr,
    pub timeout: Duration,
    pub mode: Mode,
    pub chains: ChainSet,
    pub bands: TtlBands,
    pub with_flows: bool,
    pub sender: Arc<dyn ProbeSender>,
    pub router: Arc<PacketRouter>,
}

pub struct ProbePool {
    params: Params,
    mode: Mode,
    with_flows: bool,
    sender: Arc<dyn ProbeSender>,
    router: Arc<PacketRouter>,
}

/// A pool at work. Results arrive in completion order; `done` resolves once every
/// worker has exited, with the first fatal error if there was one. Dropping this
/// stops the workers after their current job.
pub struct PoolRun {
    pub results: mpsc::Receiver<Completed>,
    pub done: JoinHandle<Result<(), EngineError>>,
    halt: CancellationToken,
    _halt_on_drop: DropGuard,
}

impl PoolRun {
    /// Stop handing out jobs; workers finish what they're on.
    pub fn halt(&self) {
        self.halt.cancel();
    }
}

impl ProbePool {
    pub fn new(
        params: Params,
        mode: Mode,
        with_flows: bool,
        sender: Arc<dyn ProbeSender>,
        router: Arc<PacketRouter>,
    ) -> Self {
        Self {
            params,
            mode,
            with_flows,
            sender,
            router,
        }
    }

    /// Starts `params.workers` workers on the jobs. Fails without starting anything if
    /// local resources are lacking. Cancelling `stop` stops handing out jobs.
    pub fn spawn(
        self,
        jobs: Vec<Job>,
        family: AddressFamily,
        stop: &CancellationToken,
    ) -> Result<PoolRun, EngineError> {
        let slices = ports::split(
            self.params.source_port_min,
            self.params.source_port_max,
            self.params.workers,
        )?;
        let ctx = Arc::new(WorkerContext {
            source: self.params.source_for(family)?,
            timeout: self.params.connection_timeout(),
            mode: self.mode,
            chains: self.mode.chains(),
            bands: self.params.ttl_bands.clone(),
            with_flows: self.with_flows,
            sender: self.sender,
            router: self.router,
        });
        info!(
            "Probing {} destinations with {} workers from {}",
            jobs.len(),
            slices.len(),
            ctx.source
        );

        let halt = stop.child_token();
        // bounded, so a stop leaves the remaining jobs unsubmitted
        let (job_tx, job_rx) = mpsc::channel(slices.len());
        let queue: JobQueue = Arc::new(Mutex::new(job_rx));
        let (result_tx, result_rx) = mpsc::channel(RESULT_BUFFER);

        let feeder = tokio::spawn(feed(jobs, job_tx, halt.clone()));
        let workers = slices
            .into_iter()
            .enumerate()
            .map(|(id, ports)| {
                let worker = Worker {
                    id,
                    ports,
                    ctx: Arc::clone(&ctx),
                    queue: Arc::clone(&queue),
                    results: result_tx.clone(),
                    halt: halt.clone(),
                };
                tokio::spawn(worker.run())
            })
            .collect();
        let done = tokio::spawn(supervise(feeder, workers, halt.clone()));

        Ok(PoolRun {
            results: result_rx,
            done,
            _halt_on_drop: halt.clone().drop_guard(),
            halt,
        })
    }
}

async fn feed(jobs: Vec<Job>, tx: mpsc::Sender<(usize, Job)>, halt: CancellationToken) {
    let total = jobs.len();
    for (index, job) in jobs.into_iter().enumerate() {
        select! {
            biased;
            _ = halt.cancelled() => {
                info!("Stopped submitting jobs, {} of {} were never started", total - index, total);
                return;
            }
            sent = tx.send((index, job)) => if sent.is_err() {
                debug!("All workers gone, stop feeding");
                return;
            }
        }
    }
    debug!("All {} jobs submitted", total);
}

async fn supervise(
    feeder: JoinHandle<()>,
    workers: Vec<JoinHandle<Result<(), EngineError>>>,
    halt: CancellationToken,
) -> Result<(), EngineError> {
    let mut first_failure = None;
    let mut pending: FuturesUnordered<_> = workers.into_iter().collect();
    while let Some(joined) = pending.next().await {
        let outcome = joined
            .map_err(|e| EngineError::WorkerLost(e.to_string()))
            .and_then(|it| it);
        if let Err(e) = outcome {
            halt.cancel();
            first_failure.get_or_insert(e);
        }
    }
    // might still be waiting for queue space nobody will make
    feeder.abort();
    match first_failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
