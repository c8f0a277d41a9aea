//! Exercises `WorkerPool` against a fake worker-process child (a shell script that
//! echoes back a fixed `JobResult` line per request) rather than the real binary,
//! so this test has no dependency on Postgres or a broker.

use textproc_consumer::pool::{JobOutcome, WorkerPool};

fn fake_worker_script(outcome_json: &str) -> tempfile_like::ScriptFile {
    tempfile_like::ScriptFile::new(&format!(
        r#"#!/bin/sh
while IFS= read -r line; do
  task_id=$(printf '%s' "$line" | sed -n 's/.*"task_id":"\([^"]*\)".*/\1/p')
  printf '{{"task_id":"%s","outcome":{outcome_json}}}\n' "$task_id"
done
"#
    ))
}

/// Minimal stand-in for the `tempfile` crate: writes an executable script to a
/// path under the system temp dir and removes it on drop.
mod tempfile_like {
    use std::io::Write;
    use std::path::PathBuf;

    pub struct ScriptFile {
        pub path: PathBuf,
    }

    impl ScriptFile {
        pub fn new(contents: &str) -> Self {
            let path = std::env::temp_dir().join(format!(
                "textproc-fake-worker-{}.sh",
                uuid::Uuid::new_v4().simple()
            ));
            let mut file = std::fs::File::create(&path).expect("create script file");
            file.write_all(contents.as_bytes()).expect("write script");
            drop(file);

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
                    .expect("chmod script");
            }

            Self { path }
        }
    }

    impl Drop for ScriptFile {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

#[tokio::test]
async fn submit_returns_success_outcome_from_child() {
    let script = fake_worker_script(r#"{"kind":"success"}"#);

    let pool = WorkerPool::spawn(script.path.clone().into_os_string(), Vec::new(), 2)
        .await
        .expect("spawn pool");

    let outcome = pool
        .submit("task-1".to_string(), "{}".to_string())
        .await
        .expect("submit");
    assert!(matches!(outcome, JobOutcome::Success));

    pool.drain(std::time::Duration::from_secs(5)).await;
}

#[tokio::test]
async fn submit_returns_deterministic_outcome_from_child() {
    let script = fake_worker_script(r#"{"kind":"deterministic","cause":"bad input"}"#);

    let pool = WorkerPool::spawn(script.path.clone().into_os_string(), Vec::new(), 1)
        .await
        .expect("spawn pool");

    let outcome = pool
        .submit("task-2".to_string(), "{}".to_string())
        .await
        .expect("submit");
    match outcome {
        JobOutcome::Deterministic { cause } => assert_eq!(cause, "bad input"),
        other => panic!("expected Deterministic, got {other:?}"),
    }

    pool.drain(std::time::Duration::from_secs(5)).await;
}

#[tokio::test]
async fn submit_resolves_transient_when_child_dies_mid_job() {
    let script = tempfile_like::ScriptFile::new("#!/bin/sh\nread -r line\nexit 1\n");

    let pool = WorkerPool::spawn(script.path.clone().into_os_string(), Vec::new(), 1)
        .await
        .expect("spawn pool");

    let outcome = pool
        .submit("task-dies".to_string(), "{}".to_string())
        .await
        .expect("submit does not hang when the child dies mid-job");
    assert!(matches!(outcome, JobOutcome::Transient { .. }));

    pool.drain(std::time::Duration::from_secs(5)).await;
}

#[tokio::test]
async fn submit_never_spawns_beyond_pool_size() {
    let marker = std::env::temp_dir().join(format!(
        "textproc-pool-marker-{}",
        uuid::Uuid::new_v4().simple()
    ));
    let marker_path = marker.display();
    let script = tempfile_like::ScriptFile::new(&format!(
        r#"#!/bin/sh
echo "$$" >> {marker_path}
while IFS= read -r line; do
  task_id=$(printf '%s' "$line" | sed -n 's/.*"task_id":"\([^"]*\)".*/\1/p')
  sleep 0.2
  printf '{{"task_id":"%s","outcome":{{"kind":"success"}}}}\n' "$task_id"
done
"#
    ));

    let pool = WorkerPool::spawn(script.path.clone().into_os_string(), Vec::new(), 1)
        .await
        .expect("spawn pool");

    let (r0, r1) = tokio::join!(
        pool.submit("task-a".to_string(), "{}".to_string()),
        pool.submit("task-b".to_string(), "{}".to_string()),
    );
    assert!(matches!(r0.expect("submit"), JobOutcome::Success));
    assert!(matches!(r1.expect("submit"), JobOutcome::Success));

    let started = std::fs::read_to_string(&marker).unwrap_or_default();
    assert_eq!(
        started.lines().count(),
        1,
        "a size-1 pool must never run more than one child concurrently"
    );
    let _ = std::fs::remove_file(&marker);

    pool.drain(std::time::Duration::from_secs(5)).await;
}

#[tokio::test]
async fn distinct_task_ids_can_run_concurrently_across_pool_slots() {
    let script = fake_worker_script(r#"{"kind":"success"}"#);

    let pool = WorkerPool::spawn(script.path.clone().into_os_string(), Vec::new(), 3)
        .await
        .expect("spawn pool");

    let (r0, r1, r2) = tokio::join!(
        pool.submit("task-0".to_string(), "{}".to_string()),
        pool.submit("task-1".to_string(), "{}".to_string()),
        pool.submit("task-2".to_string(), "{}".to_string()),
    );

    for outcome in [r0, r1, r2] {
        assert!(matches!(outcome.expect("submit"), JobOutcome::Success));
    }
    pool.drain(std::time::Duration::from_secs(5)).await;
}
