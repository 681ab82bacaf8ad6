//! Bounded worker pool for image builds.
//!
//! The task list is loaded into a closed queue up front. `max_processes`
//! workers drain it; each worker optionally waits on an [`AdmissionGate`]
//! before starting a task, then runs the blocking build primitive to
//! completion. One failing build never affects its siblings.

use super::{
    AdmissionGate, BuildError, BuildResult, BuildStatus, BuildTask, ImageBuilder, PushHandle,
    PushManager, PushResult, PushStatus, Summary,
};
use crate::observability::metrics::{record_admission_wait, record_build};
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, warn};

/// Pause between admission checks while resources are over threshold.
pub const ADMISSION_BACKOFF: Duration = Duration::from_millis(500);

/// Worker pool settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub max_processes: usize,
    /// Give up on admission after this long. `None` waits forever.
    pub admission_timeout: Option<Duration>,
    pub admission_backoff: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { max_processes: 4, admission_timeout: None, admission_backoff: ADMISSION_BACKOFF }
    }
}

/// A finished task whose push, if any, may still be in flight.
struct Completed {
    result: BuildResult,
    push: Option<PushHandle>,
}

/// Runs build tasks on a fixed-size pool.
pub struct BuildScheduler {
    config: SchedulerConfig,
    builder: Arc<dyn ImageBuilder>,
    gate: Option<Arc<dyn AdmissionGate>>,
    pusher: Option<Arc<PushManager>>,
}

impl BuildScheduler {
    pub fn new(config: SchedulerConfig, builder: Arc<dyn ImageBuilder>) -> Self {
        Self { config, builder, gate: None, pusher: None }
    }

    /// Check `gate` before starting each task.
    pub fn with_gate(mut self, gate: Arc<dyn AdmissionGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Queue a push for every successful build.
    pub fn with_push_manager(mut self, pusher: Arc<PushManager>) -> Self {
        self.pusher = Some(pusher);
        self
    }

    /// Run every task and wait for all of them.
    ///
    /// Results arrive in completion order. The summary duration covers the
    /// whole run, not the sum of task durations.
    pub async fn run(
        &self,
        tasks: Vec<BuildTask>,
    ) -> Result<(Vec<BuildResult>, Summary), BuildError> {
        if self.config.max_processes == 0 {
            return Err(BuildError::InvalidConfig("max_processes must be at least 1".to_string()));
        }

        let started = Instant::now();
        let total = tasks.len();
        info!(
            tasks = total,
            max_processes = self.config.max_processes,
            resource_aware = self.gate.is_some(),
            "Starting parallel builds"
        );

        if total == 0 {
            return Ok((Vec::new(), Summary::from_results(&[], started.elapsed())));
        }

        let (task_tx, task_rx) = mpsc::channel(total);
        for task in tasks {
            task_tx.send(task).await.map_err(|e| BuildError::Join(e.to_string()))?;
        }
        drop(task_tx);
        let queue = Arc::new(Mutex::new(task_rx));

        let (result_tx, mut result_rx) = mpsc::channel(total);
        let mut workers = Vec::with_capacity(self.config.max_processes);
        for worker_id in 0..self.config.max_processes.min(total) {
            let worker = Worker {
                id: worker_id,
                queue: Arc::clone(&queue),
                results: result_tx.clone(),
                builder: Arc::clone(&self.builder),
                gate: self.gate.clone(),
                pusher: self.pusher.clone(),
                admission_timeout: self.config.admission_timeout,
                admission_backoff: self.config.admission_backoff,
            };
            workers.push(tokio::spawn(worker.run()));
        }
        drop(result_tx);

        for worker in workers {
            if let Err(e) = worker.await {
                error!(error = %e, "Build worker ended abnormally");
            }
        }

        let mut completed = Vec::with_capacity(total);
        while let Some(done) = result_rx.recv().await {
            completed.push(done);
        }

        let mut results = Vec::with_capacity(completed.len());
        for Completed { mut result, push } in completed {
            if let Some(handle) = push {
                result.push = Some(handle.wait().await);
            }
            results.push(result);
        }

        let summary = Summary::from_results(&results, started.elapsed());
        info!(
            total = summary.total_services,
            successful = summary.successful_builds,
            failed = summary.failed_builds,
            skipped = summary.skipped_builds,
            failed_pushes = summary.failed_pushes,
            duration_ms = summary.duration.as_millis() as u64,
            "Builds finished"
        );
        Ok((results, summary))
    }
}

struct Worker {
    id: usize,
    queue: Arc<Mutex<mpsc::Receiver<BuildTask>>>,
    results: mpsc::Sender<Completed>,
    builder: Arc<dyn ImageBuilder>,
    gate: Option<Arc<dyn AdmissionGate>>,
    pusher: Option<Arc<PushManager>>,
    admission_timeout: Option<Duration>,
    admission_backoff: Duration,
}

impl Worker {
    async fn run(self) {
        loop {
            let task = self.queue.lock().await.recv().await;
            let Some(task) = task else { break };

            let done = self.execute(task).await;
            if self.results.send(done).await.is_err() {
                break;
            }
        }
        tracing::debug!(worker_id = self.id, "Build worker exiting");
    }

    /// Poll the gate until it admits, or until the timeout passes.
    async fn admit(&self, gate: &dyn AdmissionGate, task: &BuildTask) -> Result<(), Duration> {
        let started = Instant::now();
        let mut logged = false;

        while !gate.can_schedule() {
            let waited = started.elapsed();
            if self.admission_timeout.is_some_and(|timeout| waited >= timeout) {
                return Err(waited);
            }
            if !logged {
                info!(
                    service = %task.service_path.display(),
                    "Resources over threshold, waiting for admission"
                );
                logged = true;
            }
            record_admission_wait();
            tokio::time::sleep(self.admission_backoff).await;
        }
        Ok(())
    }

    async fn execute(&self, task: BuildTask) -> Completed {
        let start_time = Utc::now();
        let service = task.service_path.display().to_string();

        if !task.needs_build {
            info!(service = %service, "Skipping build (no changes)");
            record_build(BuildStatus::Skipped.as_str(), 0.0);
            let result = BuildResult {
                service,
                image: String::new(),
                status: BuildStatus::Skipped,
                build_output: None,
                push: None,
                start_time,
                end_time: Utc::now(),
            };
            return Completed { result, push: None };
        }

        let image = task.image_reference();

        if let Some(gate) = &self.gate {
            if let Err(waited) = self.admit(gate.as_ref(), &task).await {
                warn!(
                    service = %service,
                    waited_ms = waited.as_millis() as u64,
                    "Admission timed out"
                );
                record_build(BuildStatus::Failed.as_str(), 0.0);
                let result = BuildResult {
                    service,
                    image,
                    status: BuildStatus::Failed,
                    build_output: Some(format!("resource admission timed out after {:?}", waited)),
                    push: None,
                    start_time,
                    end_time: Utc::now(),
                };
                return Completed { result, push: None };
            }
        }

        let builder = Arc::clone(&self.builder);
        let build_task = task.clone();
        let outcome = tokio::task::spawn_blocking(move || builder.build(&build_task))
            .await
            .unwrap_or_else(|e| Err(BuildError::Join(e.to_string())));

        let (status, build_output) = match outcome {
            Ok(_) => {
                info!(service = %service, image = %image, "Built image");
                (BuildStatus::Success, None)
            }
            Err(e) => {
                error!(service = %service, image = %image, error = %e, "Build failed");
                (BuildStatus::Failed, Some(e.to_string()))
            }
        };

        // A push that cannot be queued is reported as failed, never dropped.
        let (push, rejected) = match (&self.pusher, status) {
            (Some(pusher), BuildStatus::Success) => {
                match pusher.queue_push(image.clone(), task.service_path.clone()).await {
                    Ok(handle) => (Some(handle), None),
                    Err(e) => {
                        error!(service = %service, error = %e, "Could not queue push");
                        let failed = PushResult {
                            image: image.clone(),
                            status: PushStatus::Failed,
                            output: e.to_string(),
                            retry_count: 0,
                        };
                        (None, Some(failed))
                    }
                }
            }
            _ => (None, None),
        };

        let end_time = Utc::now();
        let elapsed = (end_time - start_time).to_std().unwrap_or(Duration::ZERO);
        record_build(status.as_str(), elapsed.as_secs_f64());

        let result = BuildResult {
            service,
            image,
            status,
            build_output,
            push: rejected,
            start_time,
            end_time,
        };
        Completed { result, push }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{ImageNaming, ImagePusher, PushConfig};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Build stub that records peak concurrency and can fail chosen services.
    #[derive(Default)]
    struct CountingBuilder {
        running: AtomicUsize,
        peak: AtomicUsize,
        calls: AtomicUsize,
        fail: Vec<String>,
        delay_ms: u64,
    }

    impl ImageBuilder for CountingBuilder {
        fn build(&self, task: &BuildTask) -> Result<String, BuildError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(self.delay_ms));
            self.running.fetch_sub(1, Ordering::SeqCst);

            if self.fail.contains(&task.service_name) {
                return Err(BuildError::CommandFailed {
                    program: "docker build".to_string(),
                    code: Some(1),
                    output: "COPY failed".to_string(),
                });
            }
            Ok(String::new())
        }
    }

    struct SwitchGate(AtomicBool);

    impl AdmissionGate for SwitchGate {
        fn can_schedule(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    struct RejectingPusher;

    impl ImagePusher for RejectingPusher {
        fn push(&self, _image: &str) -> Result<String, BuildError> {
            Err(BuildError::CommandFailed {
                program: "docker push".to_string(),
                code: Some(1),
                output: "unauthorized".to_string(),
            })
        }
    }

    fn task(name: &str, needs_build: bool) -> BuildTask {
        BuildTask {
            service_path: PathBuf::from(format!("services/{}", name)),
            service_name: name.to_string(),
            image_name: name.to_string(),
            tag: "latest".to_string(),
            naming: ImageNaming::Local,
            current_hash: None,
            changed_files: Vec::new(),
            needs_build,
        }
    }

    fn config(max_processes: usize) -> SchedulerConfig {
        SchedulerConfig {
            max_processes,
            admission_timeout: None,
            admission_backoff: Duration::from_millis(10),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_parallelism_is_bounded() {
        let builder = Arc::new(CountingBuilder { delay_ms: 60, ..Default::default() });
        let scheduler = BuildScheduler::new(config(2), builder.clone());
        let tasks = (0..5).map(|i| task(&format!("svc{}", i), true)).collect();

        let (results, summary) = scheduler.run(tasks).await.unwrap();

        assert_eq!(results.len(), 5);
        assert_eq!(summary.successful_builds, 5);
        let peak = builder.peak.load(Ordering::SeqCst);
        assert!((1..=2).contains(&peak), "peak concurrency was {}", peak);
    }

    #[tokio::test]
    async fn test_failure_is_isolated() {
        let builder =
            Arc::new(CountingBuilder { fail: vec!["bad".to_string()], ..Default::default() });
        let scheduler = BuildScheduler::new(config(3), builder);
        let tasks = vec![task("good", true), task("bad", true), task("also-good", true)];

        let (results, summary) = scheduler.run(tasks).await.unwrap();

        assert_eq!(summary.successful_builds, 2);
        assert_eq!(summary.failed_builds, 1);
        let failed = results.iter().find(|r| r.status == BuildStatus::Failed).unwrap();
        assert_eq!(failed.service, "services/bad");
        assert!(failed.build_output.as_deref().unwrap().contains("COPY failed"));
    }

    #[tokio::test]
    async fn test_skipped_tasks_do_not_build() {
        let builder = Arc::new(CountingBuilder::default());
        let scheduler = BuildScheduler::new(config(2), builder.clone());

        let (results, summary) =
            scheduler.run(vec![task("api", false), task("web", true)]).await.unwrap();

        assert_eq!(builder.calls.load(Ordering::SeqCst), 1);
        assert_eq!(summary.skipped_builds, 1);
        assert_eq!(summary.successful_builds, 1);
        let skipped = results.iter().find(|r| r.status == BuildStatus::Skipped).unwrap();
        assert!(skipped.image.is_empty());
    }

    #[tokio::test]
    async fn test_gate_holds_tasks_until_open() {
        let builder = Arc::new(CountingBuilder::default());
        let gate = Arc::new(SwitchGate(AtomicBool::new(false)));
        let scheduler =
            Arc::new(BuildScheduler::new(config(2), builder.clone()).with_gate(gate.clone()));

        let runner = {
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move {
                scheduler.run((0..4).map(|i| task(&format!("svc{}", i), true)).collect()).await
            })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(builder.calls.load(Ordering::SeqCst), 0, "gate closed, nothing may start");

        gate.0.store(true, Ordering::SeqCst);
        let (results, summary) = runner.await.unwrap().unwrap();

        assert_eq!(builder.calls.load(Ordering::SeqCst), 4);
        assert_eq!(results.len(), 4);
        assert_eq!(summary.successful_builds, 4);
    }

    #[tokio::test]
    async fn test_admission_timeout_fails_without_building() {
        let builder = Arc::new(CountingBuilder::default());
        let gate = Arc::new(SwitchGate(AtomicBool::new(false)));
        let mut cfg = config(1);
        cfg.admission_timeout = Some(Duration::from_millis(30));
        let scheduler = BuildScheduler::new(cfg, builder.clone()).with_gate(gate);

        let (results, summary) = scheduler.run(vec![task("api", true)]).await.unwrap();

        assert_eq!(builder.calls.load(Ordering::SeqCst), 0);
        assert_eq!(summary.failed_builds, 1);
        let output = results[0].build_output.as_deref().unwrap();
        assert!(output.starts_with("resource admission timed out"));
    }

    #[tokio::test]
    async fn test_push_follows_successful_builds_only() {
        let builder =
            Arc::new(CountingBuilder { fail: vec!["bad".to_string()], ..Default::default() });
        let pusher = Arc::new(PushManager::new(
            PushConfig { max_concurrent: 1, max_retries: 2, retry_delay: Duration::from_millis(1) },
            Arc::new(RejectingPusher),
        ));
        pusher.start();
        let scheduler = BuildScheduler::new(config(2), builder).with_push_manager(pusher.clone());

        let (results, summary) =
            scheduler.run(vec![task("good", true), task("bad", true)]).await.unwrap();
        pusher.stop().await;

        assert_eq!(summary.failed_pushes, 1);
        let good = results.iter().find(|r| r.service == "services/good").unwrap();
        let push = good.push.as_ref().unwrap();
        assert_eq!(push.status, PushStatus::Failed);
        assert_eq!(push.retry_count, 2);
        let bad = results.iter().find(|r| r.service == "services/bad").unwrap();
        assert!(bad.push.is_none());
    }

    #[tokio::test]
    async fn test_push_to_stopped_manager_is_reported_failed() {
        let pusher = Arc::new(PushManager::new(PushConfig::default(), Arc::new(RejectingPusher)));
        let scheduler = BuildScheduler::new(config(1), Arc::new(CountingBuilder::default()))
            .with_push_manager(pusher);

        let (results, summary) = scheduler.run(vec![task("api", true)]).await.unwrap();

        assert_eq!(summary.successful_builds, 1);
        assert_eq!(summary.failed_pushes, 1);
        let push = results[0].push.as_ref().unwrap();
        assert_eq!(push.status, PushStatus::Failed);
        assert_eq!(push.retry_count, 0);
        assert_eq!(push.image, "api:latest");
        assert_eq!(push.output, BuildError::PushQueueClosed.to_string());
    }

    #[tokio::test]
    async fn test_empty_and_invalid_runs() {
        let scheduler = BuildScheduler::new(config(2), Arc::new(CountingBuilder::default()));
        let (results, summary) = scheduler.run(Vec::new()).await.unwrap();
        assert!(results.is_empty());
        assert_eq!(summary.total_services, 0);

        let zero = BuildScheduler::new(config(0), Arc::new(CountingBuilder::default()));
        let outcome = zero.run(vec![task("api", true)]).await;
        assert!(matches!(outcome, Err(BuildError::InvalidConfig(_))));
    }
}
