use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};

use serde::Serialize;
use tracing::{info, warn};

use crate::error::ProxyError;

/// Request to rescan a changed asset in a managed repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanTask {
    pub repository_id: String,
    pub asset_path: String,
    pub scan_all: bool,
    pub update_related: bool,
}

impl ScanTask {
    pub fn for_asset(repository_id: &str, asset_path: &str) -> Self {
        Self {
            repository_id: repository_id.to_string(),
            asset_path: asset_path.to_string(),
            scan_all: true,
            update_related: true,
        }
    }
}

/// Executor boundary for repository scans.
pub trait TaskQueue: Send + Sync {
    fn enqueue(&self, task: &ScanTask) -> Result<(), ProxyError>;
}

/// Hands tasks to a bounded channel drained by a scan worker.
pub struct ChannelTaskQueue {
    sender: SyncSender<ScanTask>,
}

impl ChannelTaskQueue {
    pub fn bounded(capacity: usize) -> (Self, Receiver<ScanTask>) {
        let (sender, receiver) = mpsc::sync_channel(capacity);
        (Self { sender }, receiver)
    }
}

impl TaskQueue for ChannelTaskQueue {
    fn enqueue(&self, task: &ScanTask) -> Result<(), ProxyError> {
        self.sender.try_send(task.clone()).map_err(|err| match err {
            TrySendError::Full(_) => ProxyError::Queue("scan queue is full".to_string()),
            TrySendError::Disconnected(_) => {
                ProxyError::Queue("scan worker is not running".to_string())
            }
        })
    }
}

/// Used when no scan executor is attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingTaskQueue;

impl TaskQueue for LoggingTaskQueue {
    fn enqueue(&self, task: &ScanTask) -> Result<(), ProxyError> {
        info!(
            repository = %task.repository_id,
            path = %task.asset_path,
            "scan requested"
        );
        Ok(())
    }
}

pub struct PostFetchNotifier {
    queue: Box<dyn TaskQueue>,
}

impl PostFetchNotifier {
    pub fn new(queue: Box<dyn TaskQueue>) -> Self {
        Self { queue }
    }

    /// Never fails the fetch; queue errors are logged.
    pub fn notify(&self, repository_id: &str, asset_path: &str) {
        let task = ScanTask::for_asset(repository_id, asset_path);
        if let Err(err) = self.queue.enqueue(&task) {
            warn!(repository = repository_id, path = asset_path, %err, "failed to queue scan");
        }
    }
}

impl Default for PostFetchNotifier {
    fn default() -> Self {
        Self::new(Box::new(LoggingTaskQueue))
    }
}
