//! Background-job engine: two autoscaled worker pools (high priority for
//! client reads/writes and chunk operations, low priority for replication,
//! info and move jobs) with per-task statistics, cancellable job handles,
//! stall detection and a hysteresis load classifier.
//!
//! The engine is payload-generic: it schedules `(OpKind, A)` pairs and leaves
//! interpretation of `A` to the [`JobRunner`] installed by the embedder.

mod job;
mod pool;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

pub use job::{Callback, OpKind, SubmitMode, TaskType, TASK_COUNT};
pub use pool::{JobId, JobPool, PoolInfo, TaskStat};

/// Executes a job's operation against the external world (chunk store,
/// replicator, client sockets). Handlers may block internally only through
/// `spawn_blocking`; the returned status byte is what the completion
/// callback receives.
pub trait JobRunner<A>: Send + Sync + 'static {
    fn run(&self, op: OpKind, args: A) -> Pin<Box<dyn Future<Output = u8> + Send>>;
}

/// Worker limits applied to each pool.
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    pub workers_max: u32,
    pub workers_himark: u32,
    pub workers_lomark: u32,
    pub workers_max_idle: u32,
}

impl EngineConfig {
    pub const DEFAULT_WORKERS_MAX: u32 = 250;
    pub const DEFAULT_WORKERS_MAX_IDLE: u32 = 40;

    pub fn with_workers_max(workers_max: u32) -> Self {
        Self {
            workers_max,
            workers_himark: workers_max * 3 / 4,
            workers_lomark: workers_max / 2,
            workers_max_idle: Self::DEFAULT_WORKERS_MAX_IDLE,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::with_workers_max(Self::DEFAULT_WORKERS_MAX)
    }
}

/// Load class reported to the master. The engine itself only ever reports
/// `Ok` or `Overloaded`; the rebalance classes are substituted by the master
/// connection from store state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HlStatus {
    Ok = 0,
    Overloaded = 1,
    LsRebalance = 2,
    HsRebalance = 3,
}

impl HlStatus {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// The two-pool engine plus its maintenance tasks.
pub struct Engine<A> {
    hp: JobPool<A>,
    lp: JobPool<A>,
    hl_rx: watch::Receiver<HlStatus>,
    maintenance: Vec<JoinHandle<()>>,
}

impl<A: Send + 'static> Engine<A> {
    /// Starts both pools and the periodic maintenance tasks: the load
    /// classifier (1 s), the stall scanner (10 s) and the per-minute
    /// counter shift.
    pub fn start(config: EngineConfig, runner: Arc<dyn JobRunner<A>>) -> Self {
        let ids = pool::JobIds::new();
        let hp = JobPool::new("hi", config, ids.clone(), runner.clone());
        let lp = JobPool::new("lo", config, ids, runner);
        let (hl_tx, hl_rx) = watch::channel(HlStatus::Ok);

        let mut maintenance = Vec::new();
        {
            let hp = hp.clone();
            let lp = lp.clone();
            maintenance.push(tokio::spawn(async move {
                let mut tick = tokio::time::interval(Duration::from_secs(1));
                tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tick.tick().await;
                    if let Some(next) = classify_load(&hp, &lp, *hl_tx.borrow()) {
                        let _ = hl_tx.send(next);
                    }
                }
            }));
        }
        {
            let hp = hp.clone();
            let lp = lp.clone();
            maintenance.push(tokio::spawn(async move {
                let mut tick = tokio::time::interval(Duration::from_secs(10));
                tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tick.tick().await;
                    hp.stall_scan();
                    lp.stall_scan();
                }
            }));
        }
        {
            let hp = hp.clone();
            let lp = lp.clone();
            maintenance.push(tokio::spawn(async move {
                let mut tick = tokio::time::interval(Duration::from_secs(60));
                tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tick.tick().await;
                    hp.shift_counters();
                    lp.shift_counters();
                }
            }));
        }

        Self {
            hp,
            lp,
            hl_rx,
            maintenance,
        }
    }

    /// High-priority pool: client reads/writes, chunk operations.
    pub fn hp(&self) -> &JobPool<A> {
        &self.hp
    }

    /// Low-priority pool: replication, chunk info, chunk move.
    pub fn lp(&self) -> &JobPool<A> {
        &self.lp
    }

    /// Total jobs queued or running across both pools.
    pub fn load(&self) -> u32 {
        self.hp.jobs_count() + self.lp.jobs_count()
    }

    /// Subscribes to load-class changes (Ok/Overloaded with hysteresis).
    pub fn hlstatus(&self) -> watch::Receiver<HlStatus> {
        self.hl_rx.clone()
    }

    /// Disables a job wherever it lives; see [`JobPool::disable`].
    pub fn disable(&self, jobid: JobId) {
        self.hp.disable(jobid);
        self.lp.disable(jobid);
    }

    /// Rewrites a job's callback wherever it lives.
    pub fn change_callback(&self, jobid: JobId, callback: Option<Callback>) {
        // a jobid names at most one job across both pools; the boxed
        // callback can only be handed to one of them
        if let Some(pool) = self.find_pool(jobid) {
            pool.change_callback(jobid, callback);
        }
    }

    fn find_pool(&self, jobid: JobId) -> Option<&JobPool<A>> {
        if self.hp.contains(jobid) {
            Some(&self.hp)
        } else if self.lp.contains(jobid) {
            Some(&self.lp)
        } else {
            None
        }
    }

    /// Applies reloaded worker limits to both pools.
    pub fn set_limits(&self, config: EngineConfig) {
        self.hp.set_limits(config);
        self.lp.set_limits(config);
    }

    pub async fn shutdown(&self) {
        for task in &self.maintenance {
            task.abort();
        }
        self.hp.shutdown().await;
        self.lp.shutdown().await;
    }
}

/// Hysteresis: overloaded when either pool is above its high mark, back to
/// ok only when both are below their low marks, otherwise keep the last
/// reported class.
fn classify_load<A: Send + 'static>(hp: &JobPool<A>, lp: &JobPool<A>, current: HlStatus) -> Option<HlStatus> {
    let (hp_busy, hp_himark, hp_lomark) = hp.busy_and_marks();
    let (lp_busy, lp_himark, lp_lomark) = lp.busy_and_marks();
    let next = if hp_busy > hp_himark || lp_busy > lp_himark {
        HlStatus::Overloaded
    } else if hp_busy < hp_lomark && lp_busy < lp_lomark {
        HlStatus::Ok
    } else {
        current
    };
    (next != current).then_some(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chunkd_proto::status;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct NopRunner;

    impl JobRunner<()> for NopRunner {
        fn run(&self, _op: OpKind, _args: ()) -> Pin<Box<dyn Future<Output = u8> + Send>> {
            Box::pin(async { status::OK })
        }
    }

    #[tokio::test]
    async fn engine_runs_jobs_on_both_pools() {
        let engine = Engine::start(EngineConfig::default(), Arc::new(NopRunner));
        let hits = Arc::new(AtomicU32::new(0));
        for pool in [engine.hp(), engine.lp()] {
            let hits = hits.clone();
            let submitted = pool.submit(
                OpKind::ChunkOp,
                1,
                (),
                Some(Box::new(move |status| {
                    assert_eq!(status, status::OK);
                    hits.fetch_add(1, Ordering::Relaxed);
                })),
                status::NOT_DONE,
                SubmitMode::AlwaysDo,
            );
            assert!(submitted.is_ok());
        }
        for _ in 0..200 {
            if hits.load(Ordering::Relaxed) == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(hits.load(Ordering::Relaxed), 2);
        engine.shutdown().await;
    }
}
