//! `worker-process` subcommand: the internal long-lived C8 child entrypoint.
//! Not intended for direct operator use; the parent spawns one of these per pool
//! slot by re-invoking the current executable.

use sqlx::postgres::PgPoolOptions;
use textproc_consumer::pool::{JobOutcome, JobRequest, JobResult};
use textproc_core::config::AppConfig;
use textproc_core::TaskStore;
use textproc_worker::WorkerError;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

pub async fn run(cfg: &AppConfig) -> anyhow::Result<()> {
    let pool = PgPoolOptions::new()
        .max_connections(2)
        .connect(&cfg.database_url)
        .await?;
    let store = TaskStore::new(pool);

    let stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(stdin).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let request: JobRequest = match serde_json::from_str(&line) {
            Ok(req) => req,
            Err(err) => {
                tracing::error!(event = "worker_process.malformed_request", %err, "dropping unparseable job line");
                continue;
            }
        };

        let outcome = match textproc_worker::process_job(
            &request.task_id,
            request.body.as_bytes(),
            &store,
        )
        .await
        {
            Ok(()) => JobOutcome::Success,
            Err(WorkerError::Deterministic(cause)) => JobOutcome::Deterministic { cause },
            Err(WorkerError::Transient(cause)) => JobOutcome::Transient { cause },
        };

        let result = JobResult {
            task_id: request.task_id,
            outcome,
        };
        let mut out_line = serde_json::to_string(&result)?;
        out_line.push('\n');
        stdout.write_all(out_line.as_bytes()).await?;
        stdout.flush().await?;
    }

    Ok(())
}
