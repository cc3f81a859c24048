use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tracing::{info, warn};

use crate::job::{Callback, Job, JobState, OpKind, SubmitMode, TASK_COUNT};
use crate::JobRunner;

pub type JobId = u32;

/// A job running longer than this is reported as stalled (once).
const STALL_AFTER: Duration = Duration::from_secs(600);

/// Shared jobid allocator. Ids are never zero and wrap from `u32::MAX`
/// back to 1, so a jobid uniquely names a job across both pools.
pub(crate) struct JobIds {
    next: Mutex<u32>,
}

impl JobIds {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self { next: Mutex::new(1) })
    }

    fn alloc(&self) -> JobId {
        let mut next = self.next.lock();
        let id = *next;
        *next = if id == u32::MAX { 1 } else { id + 1 };
        id
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskStat {
    pub count: u32,
    pub time_us: u64,
    pub max_us: u64,
}

/// Point-in-time view of a pool, for introspection output.
#[derive(Debug, Clone)]
pub struct PoolInfo {
    pub workers_max: u32,
    pub workers_himark: u32,
    pub workers_lomark: u32,
    pub workers_max_idle: u32,
    pub workers_total: u32,
    pub workers_avail: u32,
    pub queued: u32,
    /// Per-task counters for the previous full minute.
    pub last_minute: [TaskStat; TASK_COUNT],
    /// Per-task maximum times since start.
    pub max_us: [u64; TASK_COUNT],
}

struct PoolState<A> {
    workers_max: u32,
    workers_himark: u32,
    workers_lomark: u32,
    workers_max_idle: u32,
    workers_avail: u32,
    workers_total: u32,
    last_notify: u32,
    jobs: HashMap<JobId, Job<A>>,
    cur: [TaskStat; TASK_COUNT],
    prev: [TaskStat; TASK_COUNT],
    max_glob: [u64; TASK_COUNT],
}

struct Shared<A> {
    name: &'static str,
    state: Mutex<PoolState<A>>,
    queue_tx: async_channel::Sender<(JobId, OpKind)>,
    queue_rx: async_channel::Receiver<(JobId, OpKind)>,
    status_tx: mpsc::UnboundedSender<(JobId, u8)>,
    runner: Arc<dyn JobRunner<A>>,
    ids: Arc<JobIds>,
    drained: Notify,
    deliver_callbacks: AtomicBool,
}

/// A single-priority pool of autoscaled worker tasks.
///
/// Cloning is cheap; all clones drive the same pool.
pub struct JobPool<A> {
    shared: Arc<Shared<A>>,
}

impl<A> Clone for JobPool<A> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<A: Send + 'static> JobPool<A> {
    pub(crate) fn new(
        name: &'static str,
        limits: crate::EngineConfig,
        ids: Arc<JobIds>,
        runner: Arc<dyn JobRunner<A>>,
    ) -> Self {
        let (queue_tx, queue_rx) = async_channel::unbounded();
        let (status_tx, status_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            name,
            state: Mutex::new(PoolState {
                workers_max: limits.workers_max,
                workers_himark: limits.workers_himark,
                workers_lomark: limits.workers_lomark,
                workers_max_idle: limits.workers_max_idle,
                workers_avail: 0,
                workers_total: 0,
                last_notify: 0,
                jobs: HashMap::new(),
                cur: Default::default(),
                prev: Default::default(),
                max_glob: Default::default(),
            }),
            queue_tx,
            queue_rx,
            status_tx,
            runner,
            ids,
            drained: Notify::new(),
            deliver_callbacks: AtomicBool::new(true),
        });
        {
            let mut state = shared.state.lock();
            spawn_worker(&shared, &mut state);
        }
        tokio::spawn(dispatcher_loop(shared.clone(), status_rx));
        Self { shared }
    }

    /// Submits a job. `Err` is returned only when admission control sheds
    /// the job under [`SubmitMode::LimitedReturn`]; the payload comes back
    /// so the caller can answer synchronously.
    pub fn submit(
        &self,
        op: OpKind,
        chunkid: u64,
        args: A,
        callback: Option<Callback>,
        err_status: u8,
        mode: SubmitMode,
    ) -> Result<JobId, A> {
        let shared = &self.shared;
        let jobid = shared.ids.alloc();
        let overloaded = {
            let mut state = shared.state.lock();
            state.jobs.insert(
                jobid,
                Job {
                    op,
                    task_type: op.task_type(),
                    chunkid,
                    state: JobState::Enabled,
                    started_at: None,
                    finished: false,
                    stalled: false,
                    callback,
                    args: Some(args),
                },
            );
            let busy = state.workers_total - state.workers_avail;
            shared.queue_tx.len() as u32 + busy > state.workers_max
        };
        if overloaded && mode != SubmitMode::AlwaysDo {
            if mode == SubmitMode::LimitedReturn {
                let args = shared
                    .state
                    .lock()
                    .jobs
                    .remove(&jobid)
                    .and_then(|job| job.args)
                    .expect("unqueued job retains its payload");
                return Err(args);
            }
            let _ = shared.status_tx.send((jobid, err_status));
        } else {
            let _ = shared.queue_tx.try_send((jobid, op));
        }
        Ok(jobid)
    }

    /// Marks a queued job disabled. An in-progress job is not aborted; a
    /// worker picking up a disabled job synthesizes its disabled status
    /// without running the operation. Calling this twice is the same as once.
    pub fn disable(&self, jobid: JobId) {
        let mut state = self.shared.state.lock();
        if let Some(job) = state.jobs.get_mut(&jobid) {
            if job.state == JobState::Enabled {
                job.state = JobState::Disabled;
            }
        }
    }

    /// Whether a job with this id is currently known to the pool.
    pub fn contains(&self, jobid: JobId) -> bool {
        self.shared.state.lock().jobs.contains_key(&jobid)
    }

    /// Rewrites (or removes) the completion callback of a pending job.
    pub fn change_callback(&self, jobid: JobId, callback: Option<Callback>) {
        let mut state = self.shared.state.lock();
        if let Some(job) = state.jobs.get_mut(&jobid) {
            job.callback = callback;
        }
    }

    /// Jobs queued plus jobs being executed.
    pub fn jobs_count(&self) -> u32 {
        let state = self.shared.state.lock();
        (state.workers_total - state.workers_avail) + self.shared.queue_tx.len() as u32
    }

    /// Busy workers, for the load classifier.
    pub(crate) fn busy_and_marks(&self) -> (u32, u32, u32) {
        let state = self.shared.state.lock();
        (
            state.workers_total - state.workers_avail,
            state.workers_himark,
            state.workers_lomark,
        )
    }

    pub fn info(&self) -> PoolInfo {
        let state = self.shared.state.lock();
        PoolInfo {
            workers_max: state.workers_max,
            workers_himark: state.workers_himark,
            workers_lomark: state.workers_lomark,
            workers_max_idle: state.workers_max_idle,
            workers_total: state.workers_total,
            workers_avail: state.workers_avail,
            queued: self.shared.queue_tx.len() as u32,
            last_minute: state.prev,
            max_us: state.max_glob,
        }
    }

    /// Rolls the per-task minute counters over and clears the current window.
    pub fn shift_counters(&self) {
        let mut state = self.shared.state.lock();
        state.prev = state.cur;
        state.cur = Default::default();
    }

    /// Flags and logs jobs that have been in progress longer than the stall
    /// threshold. Each job is reported once.
    pub fn stall_scan(&self) {
        let mut state = self.shared.state.lock();
        let now = Instant::now();
        for job in state.jobs.values_mut() {
            if job.finished || job.stalled {
                continue;
            }
            if let Some(started) = job.started_at {
                if now.duration_since(started) > STALL_AFTER {
                    if job.chunkid != 0 {
                        warn!(
                            "stalled job '{}' on chunk {:016X} detected",
                            job.task_type.name(),
                            job.chunkid
                        );
                    } else {
                        warn!("stalled job '{}' detected", job.task_type.name());
                    }
                    job.stalled = true;
                }
            }
        }
    }

    /// Applies new worker limits (config reload).
    pub fn set_limits(&self, limits: crate::EngineConfig) {
        let mut state = self.shared.state.lock();
        state.workers_max = limits.workers_max;
        state.workers_himark = limits.workers_himark;
        state.workers_lomark = limits.workers_lomark;
        state.workers_max_idle = limits.workers_max_idle;
    }

    /// Closes the work queue and waits for every worker to exit. Remaining
    /// statuses are drained without invoking callbacks.
    pub async fn shutdown(&self) {
        self.shared
            .deliver_callbacks
            .store(false, Ordering::Relaxed);
        self.shared.queue_rx.close();
        loop {
            let notified = self.shared.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.shared.state.lock().workers_total == 0 {
                break;
            }
            notified.await;
        }
    }
}

fn spawn_worker<A: Send + 'static>(shared: &Arc<Shared<A>>, state: &mut PoolState<A>) {
    state.workers_avail += 1;
    state.workers_total += 1;
    if state.workers_total % 10 == 0 && state.last_notify != state.workers_total {
        info!("{} pool workers: {}+", shared.name, state.workers_total);
        state.last_notify = state.workers_total;
    }
    tokio::spawn(worker_loop(shared.clone()));
}

fn close_worker<A>(shared: &Shared<A>, state: &mut PoolState<A>) {
    state.workers_avail -= 1;
    state.workers_total -= 1;
    if state.workers_total == 0 {
        shared.drained.notify_waiters();
    }
    if state.workers_total % 10 == 0 && state.last_notify != state.workers_total {
        info!("{} pool workers: {}-", shared.name, state.workers_total);
        state.last_notify = state.workers_total;
    }
}

async fn worker_loop<A: Send + 'static>(shared: Arc<Shared<A>>) {
    loop {
        let (jobid, op) = match shared.queue_rx.recv().await {
            Ok(item) => item,
            Err(_) => {
                let mut state = shared.state.lock();
                close_worker(&shared, &mut state);
                return;
            }
        };
        if op == OpKind::Exit {
            let mut state = shared.state.lock();
            close_worker(&shared, &mut state);
            return;
        }
        let (disabled, args) = {
            let mut state = shared.state.lock();
            state.workers_avail -= 1;
            if state.workers_avail == 0 && state.workers_total < state.workers_max {
                spawn_worker(&shared, &mut state);
            }
            match state.jobs.get_mut(&jobid) {
                Some(job) => {
                    if job.state == JobState::Enabled {
                        job.state = JobState::InProgress;
                        job.started_at = Some(Instant::now());
                    }
                    (job.state == JobState::Disabled, job.args.take())
                }
                None => (true, None),
            }
        };
        let status = if op == OpKind::Inval {
            // synthesized error, runs whether disabled or not
            op.disabled_status()
        } else if disabled {
            op.disabled_status()
        } else {
            match args {
                Some(args) => shared.runner.run(op, args).await,
                None => op.disabled_status(),
            }
        };
        {
            let mut state = shared.state.lock();
            let finished = state.jobs.get_mut(&jobid).map(|job| {
                job.finished = true;
                (job.task_type.index(), job.started_at.take())
            });
            if let Some((task, Some(started))) = finished {
                let us = started.elapsed().as_micros() as u64;
                let stat = &mut state.cur[task];
                stat.count += 1;
                stat.time_us += us;
                stat.max_us = stat.max_us.max(us);
                state.max_glob[task] = state.max_glob[task].max(us);
            }
        }
        let _ = shared.status_tx.send((jobid, status));
        {
            let mut state = shared.state.lock();
            state.workers_avail += 1;
            if state.workers_avail > state.workers_max_idle {
                close_worker(&shared, &mut state);
                return;
            }
        }
    }
}

async fn dispatcher_loop<A>(shared: Arc<Shared<A>>, mut rx: mpsc::UnboundedReceiver<(JobId, u8)>) {
    while let Some((jobid, status)) = rx.recv().await {
        let callback = {
            let mut state = shared.state.lock();
            state.jobs.remove(&jobid).and_then(|job| job.callback)
        };
        if shared.deliver_callbacks.load(Ordering::Relaxed) {
            if let Some(callback) = callback {
                callback(status);
            }
        }
    }
}
