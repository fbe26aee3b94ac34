// Engine — Dependency-tracked asynchronous scheduler
//
// Every operation on array storage is submitted here together with the set of
// variables (storage chunks) it reads and the set it writes. The engine runs
// it once every earlier conflicting operation has finished:
//
//   read  after write  — waits for the write
//   write after read   — waits for all earlier reads
//   write after write  — waits for the earlier write
//
// Operations on disjoint variables run concurrently on the worker pool.
//
// BOOKKEEPING:
//
//   Each variable owns a FIFO of (op, access) requests. The head of the queue
//   is granted when it no longer conflicts with what is running on that
//   variable; consecutive reads are granted together. An op counts how many of
//   its variables still have to grant it and is dispatched when that reaches 0.
//   Because requests are queued in submission order, every variable observes
//   its operations in submission order.
//
// FAILURES:
//
//   An op that fails (or panics) marks the variables it writes as failed.
//   Ops reading a failed variable are skipped and forward the failure to their
//   own writes, including an op that reads and writes the same variable. A
//   later successful write that does not read it clears it. Waits report the failure
//   of the variable they wait on; wait_for_all reports the first failure since
//   the previous wait_for_all.
//
// All bookkeeping lives behind one mutex. Op bodies never run under it.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Condvar, Mutex, MutexGuard};

use crate::bail;
use crate::error::{Error, Result};

/// Environment variable read by [`EngineConfig::from_env`].
pub const WORKERS_ENV: &str = "STRATA_ENGINE_WORKERS";

// Configuration

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of worker threads. 0 runs every operation synchronously on the
    /// thread that made it ready.
    pub num_workers: usize,
    /// Prefix for worker thread names.
    pub thread_name_prefix: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            num_workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            thread_name_prefix: "strata-engine".to_string(),
        }
    }
}

impl EngineConfig {
    /// Default configuration, with the worker count overridden by
    /// `STRATA_ENGINE_WORKERS` when it is set to a valid number.
    pub fn from_env() -> Self {
        let config = Self::default();
        match std::env::var(WORKERS_ENV) {
            Ok(value) => match value.trim().parse::<usize>() {
                Ok(n) => config.num_workers(n),
                Err(_) => {
                    log::warn!("ignoring {WORKERS_ENV}={value:?}: not a worker count");
                    config
                }
            },
            Err(_) => config,
        }
    }

    /// Set the number of worker threads.
    pub fn num_workers(mut self, n: usize) -> Self {
        self.num_workers = n;
        self
    }

    /// Set the worker thread name prefix.
    pub fn thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }
}

// Variables and operations

/// Engine-level identity of one storage location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Var(u64);

type OpFn = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

enum Task {
    Run(OpFn),
    /// Wait request: reports the variable state to a blocked caller.
    Signal(mpsc::Sender<Result<()>>),
}

#[derive(Debug, Clone, Copy)]
enum Access {
    Read,
    Write,
}

#[derive(Debug, Clone)]
struct Failure {
    op: String,
    reason: String,
}

impl Failure {
    fn from_error(op: &str, err: Error) -> Self {
        match err {
            Error::OperationFailed { op, reason } => Failure { op, reason },
            other => Failure {
                op: op.to_string(),
                reason: other.to_string(),
            },
        }
    }

    fn to_error(&self) -> Error {
        Error::op_failed(self.op.clone(), self.reason.clone())
    }
}

struct PendingOp {
    name: String,
    task: Option<Task>,
    reads: Vec<Var>,
    writes: Vec<Var>,
    /// Written variables the op also reads; their failures are inherited.
    read_writes: Vec<Var>,
    /// Variables that have not granted this op yet.
    wait: usize,
    /// Wait requests hold write access but never change the data.
    mutates: bool,
}

#[derive(Default)]
struct VarState {
    queue: VecDeque<(u64, Access)>,
    running_reads: usize,
    running_write: bool,
    failure: Option<Failure>,
    deleted: bool,
}

impl VarState {
    fn idle(&self) -> bool {
        self.queue.is_empty() && self.running_reads == 0 && !self.running_write
    }
}

struct ReadyOp {
    id: u64,
    name: String,
    task: Task,
    upstream: Option<Failure>,
}

#[derive(Default)]
struct EngineState {
    vars: HashMap<Var, VarState>,
    ops: HashMap<u64, PendingOp>,
    next_op: u64,
    pending: usize,
    unobserved: Option<Failure>,
}

impl EngineState {
    fn enqueue(&mut self, var: Var, op: u64, access: Access, ready: &mut Vec<u64>) {
        if let Some(state) = self.vars.get_mut(&var) {
            state.queue.push_back((op, access));
        }
        self.grant(var, ready);
    }

    /// Grant as many queued requests on `var` as the running set allows.
    fn grant(&mut self, var: Var, ready: &mut Vec<u64>) {
        let EngineState { vars, ops, .. } = self;
        let Some(state) = vars.get_mut(&var) else {
            return;
        };
        while let Some(&(op, access)) = state.queue.front() {
            match access {
                Access::Read if !state.running_write => {
                    state.running_reads += 1;
                }
                Access::Write if !state.running_write && state.running_reads == 0 => {
                    state.running_write = true;
                }
                _ => break,
            }
            state.queue.pop_front();
            if let Some(pending) = ops.get_mut(&op) {
                pending.wait -= 1;
                if pending.wait == 0 {
                    ready.push(op);
                }
            }
            if matches!(access, Access::Write) {
                break;
            }
        }
    }

    fn remove_if_dead(&mut self, var: Var) {
        if self
            .vars
            .get(&var)
            .is_some_and(|state| state.deleted && state.idle())
        {
            self.vars.remove(&var);
        }
    }

    /// Move ready ops out of the table, noting failures they inherit.
    fn take_ready(&mut self, ids: Vec<u64>) -> Vec<ReadyOp> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(op) = self.ops.get_mut(&id) else {
                continue;
            };
            let Some(task) = op.task.take() else {
                continue;
            };
            // Data ops only care about what they read; a wait reports every variable it holds.
            let watched: Vec<Var> = match task {
                Task::Run(_) => op.reads.iter().chain(&op.read_writes).copied().collect(),
                Task::Signal(_) => op.reads.iter().chain(&op.writes).copied().collect(),
            };
            let upstream = watched
                .iter()
                .find_map(|v| self.vars.get(v).and_then(|s| s.failure.clone()));
            out.push(ReadyOp {
                id,
                name: op.name.clone(),
                task,
                upstream,
            });
        }
        out
    }
}

// Engine

struct EngineShared {
    state: Mutex<EngineState>,
    all_done: Condvar,
    pool: Option<rayon::ThreadPool>,
    num_workers: usize,
    next_var: AtomicU64,
}

impl EngineShared {
    fn lock(&self) -> MutexGuard<'_, EngineState> {
        // Op bodies never run under this lock, so a poisoned lock still holds
        // consistent bookkeeping.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn complete(&self, id: u64, result: Result<()>) -> Vec<ReadyOp> {
        let mut state = self.lock();
        let Some(op) = state.ops.remove(&id) else {
            return Vec::new();
        };
        let failure = result.err().map(|e| Failure::from_error(&op.name, e));
        if let Some(f) = &failure {
            log::warn!("engine: op '{}' failed: {}", op.name, f.reason);
            if state.unobserved.is_none() {
                state.unobserved = Some(f.clone());
            }
        } else {
            log::trace!("engine: op #{id} '{}' done", op.name);
        }

        for v in &op.reads {
            if let Some(var) = state.vars.get_mut(v) {
                var.running_reads -= 1;
            }
        }
        for v in &op.writes {
            if let Some(var) = state.vars.get_mut(v) {
                var.running_write = false;
                if op.mutates {
                    var.failure = failure.clone();
                }
            }
        }

        let mut ready = Vec::new();
        for &v in op.reads.iter().chain(&op.writes) {
            state.grant(v, &mut ready);
            state.remove_if_dead(v);
        }

        state.pending -= 1;
        if state.pending == 0 {
            self.all_done.notify_all();
        }
        state.take_ready(ready)
    }

    /// Run (or hand to the pool) every ready op, following the chain of ops
    /// they make ready in synchronous mode.
    fn run_ready(self: &Arc<Self>, batch: Vec<ReadyOp>) {
        let mut work: VecDeque<ReadyOp> = batch.into();
        while let Some(op) = work.pop_front() {
            let ReadyOp {
                id,
                name,
                task,
                upstream,
            } = op;
            match task {
                Task::Signal(tx) => {
                    // The waiter may have gone away; nothing to report then.
                    let _ = tx.send(upstream.map_or(Ok(()), |f| Err(f.to_error())));
                    work.extend(self.complete(id, Ok(())));
                }
                Task::Run(func) => {
                    if let Some(f) = upstream {
                        log::debug!("engine: skipping '{name}', input failed in '{}'", f.op);
                        drop(func);
                        work.extend(self.complete(id, Err(f.to_error())));
                        continue;
                    }
                    match &self.pool {
                        Some(pool) => {
                            let shared = Arc::clone(self);
                            pool.spawn(move || {
                                let result = execute(&name, func);
                                let next = shared.complete(id, result);
                                shared.run_ready(next);
                            });
                        }
                        None => {
                            let result = execute(&name, func);
                            work.extend(self.complete(id, result));
                        }
                    }
                }
            }
        }
    }
}

fn execute(name: &str, func: OpFn) -> Result<()> {
    match catch_unwind(AssertUnwindSafe(func)) {
        Ok(result) => result,
        Err(panic) => {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "operation panicked".to_string());
            Err(Error::op_failed(name, reason))
        }
    }
}

/// Handle to a dependency engine.
///
/// Cloning is cheap and every clone drives the same scheduler. Arrays keep a
/// clone, so the engine lives as long as any storage created on it.
///
/// Waits (`wait_to_read`, `wait_to_write`, `wait_for_all`) block the calling
/// thread and must not be called from inside an operation body.
#[derive(Clone)]
pub struct Engine {
    shared: Arc<EngineShared>,
}

impl Engine {
    /// Start an engine with the given configuration.
    pub fn new(config: EngineConfig) -> Result<Self> {
        let pool = if config.num_workers == 0 {
            None
        } else {
            let prefix = config.thread_name_prefix.clone();
            Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(config.num_workers)
                    .thread_name(move |i| format!("{prefix}-{i}"))
                    .build()?,
            )
        };
        log::debug!(
            "engine: started with {} worker(s){}",
            config.num_workers,
            if pool.is_none() { " (synchronous)" } else { "" }
        );
        Ok(Engine {
            shared: Arc::new(EngineShared {
                state: Mutex::new(EngineState::default()),
                all_done: Condvar::new(),
                pool,
                num_workers: config.num_workers,
                next_var: AtomicU64::new(0),
            }),
        })
    }

    /// A synchronous engine: every operation runs on the submitting thread.
    pub fn synchronous() -> Result<Self> {
        Self::new(EngineConfig::default().num_workers(0))
    }

    /// Number of worker threads (0 for a synchronous engine).
    pub fn num_workers(&self) -> usize {
        self.shared.num_workers
    }

    /// Whether two handles drive the same engine.
    pub fn same(&self, other: &Engine) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Register a new storage location.
    pub fn new_variable(&self) -> Var {
        let var = Var(self.shared.next_var.fetch_add(1, Ordering::Relaxed));
        self.shared.lock().vars.insert(var, VarState::default());
        var
    }

    /// Forget a storage location once every operation queued on it has finished.
    pub fn delete_variable(&self, var: Var) {
        let mut state = self.shared.lock();
        if let Some(v) = state.vars.get_mut(&var) {
            v.deleted = true;
        }
        state.remove_if_dead(var);
    }

    /// Submit an operation that reads `reads` and writes `writes`.
    ///
    /// Returns immediately. A variable listed in both sets is scheduled as a
    /// write, and a failure recorded on it is inherited like any input's.
    pub fn push<F>(&self, name: impl Into<String>, reads: &[Var], writes: &[Var], f: F) -> Result<()>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        self.submit(name.into(), reads, writes, Task::Run(Box::new(f)), true)
    }

    fn submit(
        &self,
        name: String,
        reads: &[Var],
        writes: &[Var],
        task: Task,
        mutates: bool,
    ) -> Result<()> {
        let mut writes = writes.to_vec();
        writes.sort_unstable();
        writes.dedup();
        let (mut read_writes, mut reads): (Vec<Var>, Vec<Var>) = reads
            .iter()
            .copied()
            .partition(|v| writes.binary_search(v).is_ok());
        read_writes.sort_unstable();
        read_writes.dedup();
        reads.sort_unstable();
        reads.dedup();

        let ready = {
            let mut state = self.shared.lock();
            if let Some(missing) = reads
                .iter()
                .chain(&writes)
                .find(|v| !state.vars.get(v).is_some_and(|s| !s.deleted))
            {
                bail!("engine variable {missing:?} used by '{name}' does not exist");
            }

            let id = state.next_op;
            state.next_op += 1;
            state.pending += 1;
            log::trace!(
                "engine: push #{id} '{name}' reads={} writes={}",
                reads.len(),
                writes.len()
            );
            let wait = reads.len() + writes.len();
            state.ops.insert(
                id,
                PendingOp {
                    name,
                    task: Some(task),
                    reads: reads.clone(),
                    writes: writes.clone(),
                    read_writes,
                    wait,
                    mutates,
                },
            );

            let mut ready = Vec::new();
            if wait == 0 {
                ready.push(id);
            }
            for &v in &reads {
                state.enqueue(v, id, Access::Read, &mut ready);
            }
            for &v in &writes {
                state.enqueue(v, id, Access::Write, &mut ready);
            }
            state.take_ready(ready)
        };
        self.shared.run_ready(ready);
        Ok(())
    }

    fn wait_for_var(&self, var: Var, access: Access) -> Result<()> {
        let (tx, rx) = mpsc::channel();
        let (reads, writes, name) = match access {
            Access::Read => (vec![var], vec![], "wait_to_read"),
            Access::Write => (vec![], vec![var], "wait_to_write"),
        };
        self.submit(name.to_string(), &reads, &writes, Task::Signal(tx), false)?;
        rx.recv()
            .map_err(|_| Error::msg("engine dropped a wait request"))?
    }

    /// Block until every write submitted earlier on `var` has completed.
    pub fn wait_to_read(&self, var: Var) -> Result<()> {
        self.wait_for_var(var, Access::Read)
    }

    /// Block until every read and write submitted earlier on `var` has completed.
    pub fn wait_to_write(&self, var: Var) -> Result<()> {
        self.wait_for_var(var, Access::Write)
    }

    /// Block until every submitted operation has completed.
    ///
    /// Returns the first operation failure recorded since the previous call.
    pub fn wait_for_all(&self) -> Result<()> {
        let mut state = self.shared.lock();
        while state.pending > 0 {
            state = self
                .shared
                .all_done
                .wait(state)
                .unwrap_or_else(|e| e.into_inner());
        }
        match state.unobserved.take() {
            Some(f) => Err(f.to_error()),
            None => Ok(()),
        }
    }

    /// Number of submitted operations that have not completed.
    pub fn pending(&self) -> usize {
        self.shared.lock().pending
    }

    /// Number of live variables.
    pub fn num_variables(&self) -> usize {
        self.shared.lock().vars.len()
    }

    /// Drain all outstanding work. The handle stays usable afterwards.
    pub fn shutdown(&self) -> Result<()> {
        let result = self.wait_for_all();
        log::debug!("engine: drained");
        result
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("num_workers", &self.shared.num_workers)
            .field("pending", &self.pending())
            .finish()
    }
}
