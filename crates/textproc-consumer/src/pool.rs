//! Process-Pool Runtime (C8): a fixed set of `workers_num` pre-forked OS child
//! processes, each running one job at a time, communicating over a JSON-lines
//! stdin/stdout protocol.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{oneshot, Mutex, Notify};

/// One line sent to a worker-process child's stdin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    pub task_id: String,
    /// The raw (already-serialized) broker message body, carried as a UTF-8 string
    /// so the whole job fits on one JSON line.
    pub body: String,
}

/// One line read back from a worker-process child's stdout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub task_id: String,
    pub outcome: JobOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobOutcome {
    Success,
    Deterministic { cause: String },
    Transient { cause: String },
}

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("failed to spawn worker-process child: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("worker-process child exited before replying")]
    ChildDied,
    #[error("pool is draining; no new submissions are accepted")]
    Draining,
}

struct Worker {
    child: Child,
    stdin: ChildStdin,
    /// Set by `submit` to the task currently checked out on this child, and
    /// cleared by the reader task once that task's result line arrives. If the
    /// child's stdout closes while this is still `Some`, the reader task uses it
    /// to fail the orphaned job instead of leaving its oneshot unresolved.
    current_task: Arc<Mutex<Option<String>>>,
    /// Flipped by the reader task when the child's stdout closes. A worker
    /// checked back in with this set is discarded rather than reused.
    dead: Arc<AtomicBool>,
}

type Pending = Arc<Mutex<std::collections::HashMap<String, oneshot::Sender<JobOutcome>>>>;

/// Dispatches jobs to the least-recently-used idle child. A child that exits
/// unexpectedly mid-job resolves that job as a transient error (so the consumer
/// nacks+requeues it) and is replaced; the pool never runs more than `size`
/// children concurrently, so a submission that arrives with none idle waits for
/// one to free up rather than over-provisioning.
pub struct WorkerPool {
    program: std::ffi::OsString,
    worker_args: Vec<String>,
    idle: Arc<Mutex<VecDeque<Worker>>>,
    idle_notify: Arc<Notify>,
    pending: Pending,
    size: usize,
    draining: Arc<AtomicBool>,
}

impl WorkerPool {
    /// Spawns `size` worker-process children by re-invoking `program` with
    /// `worker_args` (e.g. `["worker-process"]`).
    pub async fn spawn(
        program: impl Into<std::ffi::OsString>,
        worker_args: Vec<String>,
        size: usize,
    ) -> Result<Self, PoolError> {
        let program = program.into();
        let pending = Arc::new(Mutex::new(std::collections::HashMap::new()));
        let mut idle = VecDeque::with_capacity(size);
        for _ in 0..size {
            idle.push_back(spawn_child(&program, &worker_args, pending.clone())?);
        }

        Ok(Self {
            program,
            worker_args,
            idle: Arc::new(Mutex::new(idle)),
            idle_notify: Arc::new(Notify::new()),
            pending,
            size,
            draining: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Submits a job to the least-recently-used idle child and awaits its result.
    /// If no child is idle, waits for one of the `size` children to free up
    /// instead of spawning beyond the pool's fixed size. Returns once the child
    /// either replies or dies mid-job (resolved as a transient error in the
    /// latter case).
    pub async fn submit(&self, task_id: String, body: String) -> Result<JobOutcome, PoolError> {
        if self.draining.load(Ordering::SeqCst) {
            return Err(PoolError::Draining);
        }

        let mut worker = self.checkout_worker().await?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(task_id.clone(), tx);
        *worker.current_task.lock().await = Some(task_id.clone());

        let request = JobRequest { task_id: task_id.clone(), body };
        let mut line = serde_json::to_string(&request).expect("JobRequest always serializes");
        line.push('\n');

        let write_result = worker.stdin.write_all(line.as_bytes()).await;
        if write_result.is_err() {
            self.pending.lock().await.remove(&task_id);
            self.respawn_and_return(worker).await?;
            return Ok(JobOutcome::Transient {
                cause: "worker-process stdin closed".to_string(),
            });
        }

        let outcome = match rx.await {
            Ok(outcome) => outcome,
            Err(_) => {
                self.pending.lock().await.remove(&task_id);
                JobOutcome::Transient {
                    cause: "worker-process exited before replying".to_string(),
                }
            }
        };

        if worker.dead.load(Ordering::SeqCst) {
            self.respawn_and_return(worker).await?;
        } else {
            self.idle.lock().await.push_back(worker);
            self.idle_notify.notify_one();
        }
        Ok(outcome)
    }

    /// Pops an idle worker, or waits for one to be checked back in. Bounds the
    /// pool at exactly `size` concurrently-running children.
    async fn checkout_worker(&self) -> Result<Worker, PoolError> {
        loop {
            {
                let mut idle = self.idle.lock().await;
                if let Some(worker) = idle.pop_front() {
                    return Ok(worker);
                }
            }
            if self.draining.load(Ordering::SeqCst) {
                return Err(PoolError::Draining);
            }
            self.idle_notify.notified().await;
        }
    }

    async fn respawn_and_return(&self, dead: Worker) -> Result<(), PoolError> {
        drop(dead);
        let replacement = spawn_child(&self.program, &self.worker_args, self.pending.clone())?;
        self.idle.lock().await.push_back(replacement);
        self.idle_notify.notify_one();
        Ok(())
    }

    /// Stops accepting submissions, awaits all in-flight jobs, then closes each
    /// child's stdin and waits (bounded) for clean exit before killing stragglers.
    pub async fn drain(self, timeout: std::time::Duration) {
        self.draining.store(true, Ordering::SeqCst);
        self.idle_notify.notify_one();

        // Any job whose oneshot sender is still pending will be dropped along with
        // `self.pending` once this function returns, which resolves its `submit`
        // caller's `rx.await` as transient -- but callers are expected to have
        // already awaited their submissions before shutdown reaches this point
        // (the consumer's semaphore + per-message handler await guarantee this).
        let mut idle = self.idle.lock().await;
        while let Some(mut worker) = idle.pop_front() {
            let _ = worker.stdin.shutdown().await;
            let wait = tokio::time::timeout(timeout, worker.child.wait()).await;
            if wait.is_err() {
                let _ = worker.child.kill().await;
            }
        }
    }
}

fn spawn_child(
    program: &std::ffi::OsStr,
    args: &[String],
    pending: Pending,
) -> Result<Worker, PoolError> {
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit());

    let mut child = command.spawn()?;
    let stdin = child.stdin.take().expect("piped stdin");
    let stdout = child.stdout.take().expect("piped stdout");

    let current_task = Arc::new(Mutex::new(None));
    let dead = Arc::new(AtomicBool::new(false));

    let reader_current_task = current_task.clone();
    let reader_dead = dead.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let Ok(result) = serde_json::from_str::<JobResult>(&line) else {
                        tracing::warn!(event = "pool.child.malformed_line", "unparseable worker-process output");
                        continue;
                    };
                    *reader_current_task.lock().await = None;
                    if let Some(tx) = pending.lock().await.remove(&result.task_id) {
                        let _ = tx.send(result.outcome);
                    }
                }
                Ok(None) | Err(_) => {
                    reader_dead.store(true, Ordering::SeqCst);
                    if let Some(task_id) = reader_current_task.lock().await.take() {
                        if let Some(tx) = pending.lock().await.remove(&task_id) {
                            let _ = tx.send(JobOutcome::Transient {
                                cause: "worker-process exited unexpectedly".to_string(),
                            });
                        }
                    }
                    break;
                }
            }
        }
    });

    Ok(Worker {
        child,
        stdin,
        current_task,
        dead,
    })
}
