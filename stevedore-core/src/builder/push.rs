//! Throttled, retried image pushes.
//!
//! Pushes run on their own worker pool, independent of the build pool. Each
//! request gets a [`PushHandle`] that resolves once every attempt for it has
//! finished, so no failure is dropped on the floor.

use super::{BuildError, ImagePusher, PushStatus};
use crate::observability::metrics::record_push_attempt;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

pub const DEFAULT_MAX_CONCURRENT_PUSHES: usize = 2;
pub const DEFAULT_PUSH_RETRIES: u32 = 3;
pub const DEFAULT_PUSH_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Pending requests buffered ahead of the workers.
pub const PUSH_QUEUE_CAPACITY: usize = 100;

/// Push pool settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushConfig {
    pub max_concurrent: usize,
    /// Total attempts per image, including the first.
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT_PUSHES,
            max_retries: DEFAULT_PUSH_RETRIES,
            retry_delay: DEFAULT_PUSH_RETRY_DELAY,
        }
    }
}

/// Final outcome of one push request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PushResult {
    pub image: String,
    pub status: PushStatus,
    /// Output of the last attempt.
    pub output: String,
    /// Number of attempts made.
    pub retry_count: u32,
}

/// Push manager settings, for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushStats {
    pub max_concurrent: usize,
    pub retry_delay: Duration,
    pub max_retries: u32,
}

impl std::fmt::Display for PushStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "max_concurrent={}, retry_delay={:?}, max_retries={}",
            self.max_concurrent, self.retry_delay, self.max_retries
        )
    }
}

struct PushRequest {
    image: String,
    service_path: PathBuf,
    reply: oneshot::Sender<PushResult>,
}

/// Waits for the result of one queued push.
#[derive(Debug)]
pub struct PushHandle {
    image: String,
    rx: oneshot::Receiver<PushResult>,
}

impl PushHandle {
    pub fn image(&self) -> &str {
        &self.image
    }

    pub async fn wait(self) -> PushResult {
        let image = self.image;
        self.rx.await.unwrap_or_else(|_| PushResult {
            image,
            status: PushStatus::Failed,
            output: "push worker exited before reporting a result".to_string(),
            retry_count: 0,
        })
    }
}

/// Fixed pool of push workers draining a bounded queue.
pub struct PushManager {
    config: PushConfig,
    pusher: Arc<dyn ImagePusher>,
    queue: Mutex<Option<mpsc::Sender<PushRequest>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl PushManager {
    pub fn new(mut config: PushConfig, pusher: Arc<dyn ImagePusher>) -> Self {
        if config.max_concurrent == 0 {
            config.max_concurrent = DEFAULT_MAX_CONCURRENT_PUSHES;
        }
        config.max_retries = config.max_retries.max(1);
        Self { config, pusher, queue: Mutex::new(None), workers: Mutex::new(Vec::new()) }
    }

    /// Spawn the worker pool. Does nothing if already started.
    pub fn start(&self) {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        if queue.is_some() {
            return;
        }

        let (tx, rx) = mpsc::channel(PUSH_QUEUE_CAPACITY);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        for worker_id in 0..self.config.max_concurrent {
            let rx = Arc::clone(&rx);
            let pusher = Arc::clone(&self.pusher);
            let config = self.config.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    let request = rx.lock().await.recv().await;
                    let Some(request) = request else { break };
                    let result = push_with_retry(&pusher, &config, &request).await;
                    // The caller may have dropped its handle.
                    let _ = request.reply.send(result);
                }
                tracing::debug!(worker_id, "Push worker exiting");
            }));
        }
        *queue = Some(tx);

        info!(stats = %self.stats(), "Push manager started");
    }

    /// Queue an image push. Waits for room when the queue is full.
    pub async fn queue_push(
        &self,
        image: impl Into<String>,
        service_path: impl Into<PathBuf>,
    ) -> Result<PushHandle, BuildError> {
        let sender = self
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(BuildError::PushQueueClosed)?;

        let image = image.into();
        let (reply, rx) = oneshot::channel();
        let request =
            PushRequest { image: image.clone(), service_path: service_path.into(), reply };
        sender.send(request).await.map_err(|_| BuildError::PushQueueClosed)?;

        Ok(PushHandle { image, rx })
    }

    /// Close the queue and wait for every queued and in-flight push.
    pub async fn stop(&self) {
        drop(self.queue.lock().unwrap_or_else(PoisonError::into_inner).take());

        let workers: Vec<_> =
            self.workers.lock().unwrap_or_else(PoisonError::into_inner).drain(..).collect();
        for worker in workers {
            if let Err(e) = worker.await {
                error!(error = %e, "Push worker ended abnormally");
            }
        }
        info!("Push manager stopped");
    }

    pub fn stats(&self) -> PushStats {
        PushStats {
            max_concurrent: self.config.max_concurrent,
            retry_delay: self.config.retry_delay,
            max_retries: self.config.max_retries,
        }
    }
}

async fn push_with_retry(
    pusher: &Arc<dyn ImagePusher>,
    config: &PushConfig,
    request: &PushRequest,
) -> PushResult {
    let image = &request.image;
    let mut output = String::new();

    for attempt in 1..=config.max_retries {
        info!(
            image = %image,
            service = %request.service_path.display(),
            attempt,
            max_retries = config.max_retries,
            "Pushing image"
        );

        let pusher = Arc::clone(pusher);
        let target = image.clone();
        let outcome = tokio::task::spawn_blocking(move || pusher.push(&target))
            .await
            .unwrap_or_else(|e| Err(BuildError::Join(e.to_string())));

        match outcome {
            Ok(out) => {
                record_push_attempt("success");
                info!(image = %image, attempt, "Pushed image");
                return PushResult {
                    image: image.clone(),
                    status: PushStatus::Success,
                    output: out,
                    retry_count: attempt,
                };
            }
            Err(e) => {
                record_push_attempt("failed");
                output = e.to_string();
                if attempt < config.max_retries {
                    warn!(
                        image = %image,
                        attempt,
                        error = %e,
                        retry_in = ?config.retry_delay,
                        "Push failed, retrying"
                    );
                    tokio::time::sleep(config.retry_delay).await;
                }
            }
        }
    }

    error!(image = %image, attempts = config.max_retries, "Push failed after all attempts");
    PushResult {
        image: image.clone(),
        status: PushStatus::Failed,
        output,
        retry_count: config.max_retries,
    }
}
