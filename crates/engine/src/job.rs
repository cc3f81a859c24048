use std::time::Instant;

use chunkd_proto::status;

/// Completion callback for a job, invoked with the handler's status byte.
pub type Callback = Box<dyn FnOnce(u8) + Send + 'static>;

/// Operation a job executes. The payload carried alongside is opaque to the
/// engine; the runner installed by the embedder interprets it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Inval,
    ChunkOp,
    ServRead,
    ServWrite,
    ReplicateSimple,
    ReplicateSplit,
    ReplicateRecover,
    ReplicateJoin,
    GetInfo,
    ChunkMove,
    Exit,
}

impl OpKind {
    pub fn task_type(self) -> TaskType {
        match self {
            OpKind::ChunkOp => TaskType::ChunkOp,
            OpKind::ServRead => TaskType::Read,
            OpKind::ServWrite => TaskType::Write,
            OpKind::ReplicateSimple
            | OpKind::ReplicateSplit
            | OpKind::ReplicateRecover
            | OpKind::ReplicateJoin => TaskType::Replicate,
            OpKind::ChunkMove => TaskType::Move,
            _ => TaskType::Info,
        }
    }

    /// Status synthesized when a disabled job reaches a worker.
    pub fn disabled_status(self) -> u8 {
        match self {
            OpKind::Inval => status::EINVAL,
            OpKind::ServRead | OpKind::ServWrite => 0,
            _ => status::NOT_DONE,
        }
    }
}

/// Statistics class a job is accounted under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskType {
    Read,
    Write,
    Replicate,
    ChunkOp,
    Info,
    Move,
}

pub const TASK_COUNT: usize = 6;

impl TaskType {
    pub fn index(self) -> usize {
        match self {
            TaskType::Read => 0,
            TaskType::Write => 1,
            TaskType::Replicate => 2,
            TaskType::ChunkOp => 3,
            TaskType::Info => 4,
            TaskType::Move => 5,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            TaskType::Read => "read",
            TaskType::Write => "write",
            TaskType::Replicate => "replicate",
            TaskType::ChunkOp => "chunk operation",
            TaskType::Info => "chunk info",
            TaskType::Move => "chunk move",
        }
    }
}

/// Admission behavior when the pool is saturated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitMode {
    /// Always enqueue, regardless of load.
    AlwaysDo,
    /// Drop the job and return `None` so the caller can answer synchronously.
    LimitedReturn,
    /// Keep the job but complete it immediately with the submitter's
    /// error status through the normal status path.
    LimitedQueue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum JobState {
    Enabled,
    Disabled,
    InProgress,
}

pub(crate) struct Job<A> {
    pub(crate) op: OpKind,
    pub(crate) task_type: TaskType,
    pub(crate) chunkid: u64,
    pub(crate) state: JobState,
    pub(crate) started_at: Option<Instant>,
    pub(crate) finished: bool,
    pub(crate) stalled: bool,
    pub(crate) callback: Option<Callback>,
    pub(crate) args: Option<A>,
}
