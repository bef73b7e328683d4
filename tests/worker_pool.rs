use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::Notify;

use shellq::{CommandOutput, CommandRunner, JobId, JobQueue, JobSpec, JobState, RunError};

/// Succeeds for commands starting with "ok", fails everything else.
#[derive(Default)]
struct ScriptedRunner {
    runs: AtomicUsize,
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, command: &str, _timeout: Option<Duration>) -> Result<CommandOutput, RunError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        if command.starts_with("ok") {
            Ok(CommandOutput::default())
        } else if command == "hang" {
            Err(RunError::Timeout(Duration::from_secs(1)))
        } else {
            Ok(CommandOutput {
                exit_code: 1,
                stdout: String::new(),
                stderr: "boom\n".to_string(),
            })
        }
    }
}

/// Blocks every run until the test releases it.
#[derive(Default)]
struct GatedRunner {
    started: Notify,
    release: Notify,
}

#[async_trait]
impl CommandRunner for GatedRunner {
    async fn run(&self, _command: &str, _timeout: Option<Duration>) -> Result<CommandOutput, RunError> {
        self.started.notify_one();
        self.release.notified().await;
        Ok(CommandOutput::default())
    }
}

async fn open_queue(dir: &TempDir, runner: Arc<ScriptedRunner>) -> JobQueue {
    let queue = JobQueue::open(dir.path().join("queue.db"))
        .await
        .unwrap()
        .with_runner(runner)
        .with_poll_interval(Duration::from_millis(20));
    queue.set_config("backoff_base", "0.001").await.unwrap();
    queue
}

async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !check().await {
        assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pool_completes_and_dead_letters_jobs() {
    let dir = TempDir::new().unwrap();
    let runner = Arc::new(ScriptedRunner::default());
    let mut queue = open_queue(&dir, Arc::clone(&runner)).await;

    queue.enqueue(JobSpec::new("ok 1").with_id("good")).await.unwrap();
    queue
        .enqueue(JobSpec::new("fail").with_id("bad").with_max_retries(1))
        .await
        .unwrap();

    assert_eq!(queue.start_workers(Some(2)).await.unwrap(), 2);

    wait_until(|| async {
        let status = queue.status().await.unwrap();
        status.completed == 1 && status.dlq_total == 1
    })
    .await;
    queue.stop_workers(true).await;

    let good = queue.get_job(&JobId::from("good")).await.unwrap();
    assert_eq!(good.state, JobState::Completed);
    assert_eq!(good.attempts, 0);
    assert!(good.claimed_by.is_none());

    let dead = queue.dlq_list().await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].job.id.as_str(), "bad");
    assert_eq!(dead[0].job.attempts, 2);
    assert_eq!(dead[0].job.last_error.as_deref(), Some("Exit code 1: boom"));

    // One run for the good job, two for the bad one.
    assert_eq!(runner.runs.load(Ordering::SeqCst), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_timeout_counts_as_failure() {
    let dir = TempDir::new().unwrap();
    let runner = Arc::new(ScriptedRunner::default());
    let mut queue = open_queue(&dir, runner).await;

    queue
        .enqueue(JobSpec::new("hang").with_id("slow").with_max_retries(0))
        .await
        .unwrap();
    queue.start_workers(Some(1)).await.unwrap();

    wait_until(|| async { queue.status().await.unwrap().dlq_total == 1 }).await;
    queue.stop_workers(true).await;

    let dead = queue.dlq_list().await.unwrap();
    assert_eq!(dead[0].job.last_error.as_deref(), Some("Command timed out after 1s"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_request_from_another_handle_stops_pool() {
    let dir = TempDir::new().unwrap();
    let runner = Arc::new(ScriptedRunner::default());
    let mut queue = open_queue(&dir, Arc::clone(&runner)).await;

    queue.start_workers(Some(2)).await.unwrap();

    let other = JobQueue::open(dir.path().join("queue.db")).await.unwrap();
    other.request_stop().await.unwrap();

    tokio::time::timeout(Duration::from_secs(10), queue.wait_for_shutdown())
        .await
        .expect("pool should stop after a stop request");

    other.enqueue(JobSpec::new("ok late").with_id("late")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let late = other.get_job(&JobId::from("late")).await.unwrap();
    assert_eq!(late.state, JobState::Pending);
    assert_eq!(runner.runs.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_request_before_start_is_ignored() {
    let dir = TempDir::new().unwrap();
    let runner = Arc::new(ScriptedRunner::default());
    let mut queue = open_queue(&dir, runner).await;

    queue.request_stop().await.unwrap();
    queue.enqueue(JobSpec::new("ok").with_id("job")).await.unwrap();
    queue.start_workers(None).await.unwrap();

    wait_until(|| async { queue.status().await.unwrap().completed == 1 }).await;
    queue.stop_workers(true).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_later_start_does_not_cancel_pending_stop() {
    let dir = TempDir::new().unwrap();
    let mut first = open_queue(&dir, Arc::new(ScriptedRunner::default())).await;
    first.start_workers(Some(1)).await.unwrap();

    let stopper = JobQueue::open(dir.path().join("queue.db")).await.unwrap();
    stopper.request_stop().await.unwrap();

    // A second process starting after the request must not swallow it.
    let mut second = open_queue(&dir, Arc::new(ScriptedRunner::default())).await;
    second.start_workers(Some(1)).await.unwrap();

    tokio::time::timeout(Duration::from_secs(10), first.wait_for_shutdown())
        .await
        .expect("first pool should still stop");

    second.enqueue(JobSpec::new("ok").with_id("after")).await.unwrap();
    wait_until(|| async { second.status().await.unwrap().completed == 1 }).await;
    second.stop_workers(true).await;
}

async fn open_gated(dir: &TempDir, runner: Arc<GatedRunner>) -> JobQueue {
    let queue = JobQueue::open(dir.path().join("queue.db"))
        .await
        .unwrap()
        .with_runner(runner)
        .with_poll_interval(Duration::from_millis(20));
    queue.enqueue(JobSpec::new("ok").with_id("gated")).await.unwrap();
    queue
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_waits_for_running_job_to_report() {
    let dir = TempDir::new().unwrap();
    let runner = Arc::new(GatedRunner::default());
    let mut queue = open_gated(&dir, Arc::clone(&runner)).await;

    queue.start_workers(Some(1)).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), runner.started.notified())
        .await
        .expect("job should start");

    let release = {
        let runner = Arc::clone(&runner);
        async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            runner.release.notify_one();
        }
    };
    tokio::join!(queue.stop_workers(true), release);

    let job = queue.get_job(&JobId::from("gated")).await.unwrap();
    assert_eq!(job.state, JobState::Completed);
    assert!(job.claimed_by.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_request_lets_running_job_finish() {
    let dir = TempDir::new().unwrap();
    let runner = Arc::new(GatedRunner::default());
    let mut queue = open_gated(&dir, Arc::clone(&runner)).await;

    queue.start_workers(Some(1)).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), runner.started.notified())
        .await
        .expect("job should start");

    let other = JobQueue::open(dir.path().join("queue.db")).await.unwrap();
    other.request_stop().await.unwrap();

    let release = {
        let runner = Arc::clone(&runner);
        async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            runner.release.notify_one();
        }
    };
    let (stopped, ()) = tokio::join!(
        tokio::time::timeout(Duration::from_secs(10), queue.wait_for_shutdown()),
        release,
    );
    stopped.expect("pool should stop once the job reports");

    let job = other.get_job(&JobId::from("gated")).await.unwrap();
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.attempts, 0);
    assert_eq!(other.status().await.unwrap().processing, 0);
}
