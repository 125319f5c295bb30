use std::sync::Arc;
use std::time::Duration;

use common::Connection;

use crate::events::EventBus;
use crate::hasher;
use crate::remote::{AssetClient, RemoteError, UploadReceipt};
use crate::scanner::FileCandidate;

/// Total attempts per file (initial try included) for retryable failures.
pub const MAX_ATTEMPTS: u32 = 3;

/// Base delay for exponential backoff: 500ms, 1s, 2s, ...
pub const BACKOFF_BASE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState {
    Hashing,
    CheckingDuplicate,
    Uploading,
    Retrying(u32),
    Duplicate,
    Succeeded,
    Failed(String),
}

impl TaskState {
    /// No further transition happens in the current pass.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Duplicate | TaskState::Succeeded | TaskState::Failed(_)
        )
    }
}

/// Exactly one per file per scan pass.
#[derive(Debug)]
pub struct UploadTask {
    pub candidate: FileCandidate,
    pub digest: Option<String>,
    pub state: TaskState,
}

enum AttemptOutcome {
    Duplicate,
    Uploaded(UploadReceipt),
}

pub fn backoff_delay(attempt: u32) -> Duration {
    BACKOFF_BASE * 2u32.saturating_pow(attempt.saturating_sub(1))
}

/// Drives a single file through hash -> duplicate check -> upload. The
/// check-plus-upload pair is one attempt unit for retry purposes.
#[derive(Clone)]
pub struct UploadWorker {
    client: Arc<AssetClient>,
    bus: Arc<EventBus>,
}

impl UploadWorker {
    pub fn new(client: Arc<AssetClient>, bus: Arc<EventBus>) -> Self {
        Self { client, bus }
    }

    /// Process one file to a terminal state. Failures are absorbed into the
    /// returned task and the event stream; this never aborts a batch.
    pub async fn process(&self, conn: &Connection, candidate: FileCandidate) -> UploadTask {
        let mut task = UploadTask {
            candidate,
            digest: None,
            state: TaskState::Hashing,
        };

        let path = task.candidate.path.clone();
        let digest = match tokio::task::spawn_blocking(move || hasher::sha1_hex(&path)).await {
            Ok(Ok(digest)) => digest,
            Ok(Err(e)) => {
                self.bus.error(format!(
                    "Cannot hash {}: {}",
                    task.candidate.path.display(),
                    e
                ));
                task.state = TaskState::Failed(format!("hashing failed: {}", e));
                return task;
            }
            Err(e) => {
                self.bus.error(format!(
                    "Hashing task for {} aborted: {}",
                    task.candidate.path.display(),
                    e
                ));
                task.state = TaskState::Failed(format!("hashing aborted: {}", e));
                return task;
            }
        };
        task.digest = Some(digest.clone());

        let mut attempt = 1u32;
        loop {
            match self.attempt(conn, &mut task, &digest).await {
                Ok(AttemptOutcome::Duplicate) => {
                    self.bus.info(format!(
                        "Skipping {}: content already on the server",
                        task.candidate.file_name
                    ));
                    task.state = TaskState::Duplicate;
                    return task;
                }
                Ok(AttemptOutcome::Uploaded(receipt)) => {
                    if receipt.duplicate {
                        self.bus.info(format!(
                            "Server reported {} as a duplicate (asset {})",
                            task.candidate.file_name, receipt.asset_id
                        ));
                        task.state = TaskState::Duplicate;
                    } else {
                        self.bus.success(format!(
                            "Uploaded {} ({} bytes, asset {})",
                            task.candidate.file_name, task.candidate.size, receipt.asset_id
                        ));
                        task.state = TaskState::Succeeded;
                    }
                    return task;
                }
                Err(RemoteError::Unauthorized) => {
                    // Credentials are not self-healing; retrying would only
                    // hammer the server with the same bad key.
                    self.bus.error(format!(
                        "Upload of {} rejected as unauthorized; check the API key and re-authenticate",
                        task.candidate.file_name
                    ));
                    task.state = TaskState::Failed("unauthorized".to_string());
                    return task;
                }
                Err(e) if e.is_retryable() && attempt < MAX_ATTEMPTS => {
                    let delay = backoff_delay(attempt);
                    log::warn!(
                        "Attempt {}/{} for {} failed ({}); retrying in {:?}",
                        attempt,
                        MAX_ATTEMPTS,
                        task.candidate.file_name,
                        e,
                        delay
                    );
                    task.state = TaskState::Retrying(attempt);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    self.bus.error(format!(
                        "Failed to upload {}: {}",
                        task.candidate.file_name, e
                    ));
                    task.state = TaskState::Failed(e.to_string());
                    return task;
                }
            }
        }
    }

    async fn attempt(
        &self,
        conn: &Connection,
        task: &mut UploadTask,
        digest: &str,
    ) -> Result<AttemptOutcome, RemoteError> {
        task.state = TaskState::CheckingDuplicate;
        if self.client.check_duplicate(conn, digest).await? {
            return Ok(AttemptOutcome::Duplicate);
        }

        task.state = TaskState::Uploading;
        let receipt = self.client.upload(conn, &task.candidate).await?;
        Ok(AttemptOutcome::Uploaded(receipt))
    }
}
