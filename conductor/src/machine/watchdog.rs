//! Stage timeout watchdogs.
//!
//! Every dispatch arms one timer per pipeline. When it fires, a
//! [`PipelineEvent::StageTimedOut`] is sent to the state machine, which
//! decides whether the pipeline is still waiting on that task.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::core::PipelineEvent;

#[derive(Debug)]
struct ArmedTimer {
    task_id: String,
    handle: JoinHandle<()>,
}

/// One timer per pipeline, replaced on every dispatch.
#[derive(Debug)]
pub struct TimeoutWatchdog {
    armed: Arc<DashMap<String, ArmedTimer>>,
    sender: mpsc::UnboundedSender<PipelineEvent>,
}

impl TimeoutWatchdog {
    /// Creates a watchdog and the receiver its timeouts are delivered on.
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<PipelineEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                armed: Arc::new(DashMap::new()),
                sender,
            },
            receiver,
        )
    }

    /// Arms the timer for `task_id`, replacing any timer of the pipeline.
    pub fn arm(&self, pipeline_id: &str, stage: &str, task_id: &str, timeout_ms: u64, after: Duration) {
        let event = PipelineEvent::StageTimedOut {
            pipeline_id: pipeline_id.to_string(),
            stage: stage.to_string(),
            task_id: task_id.to_string(),
            timeout_ms,
        };
        let sender = self.sender.clone();
        let armed = Arc::clone(&self.armed);
        let key = pipeline_id.to_string();
        let owner = task_id.to_string();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            armed.remove_if(&key, |_, timer| timer.task_id == owner);
            debug!(pipeline_id = %key, task_id = %owner, timeout_ms, "Stage watchdog fired");
            if sender.send(event).is_err() {
                debug!(pipeline_id = %key, task_id = %owner, "Timeout listener gone, stage timeout dropped");
            }
        });

        let timer = ArmedTimer {
            task_id: task_id.to_string(),
            handle,
        };
        if let Some(previous) = self.armed.insert(pipeline_id.to_string(), timer) {
            previous.handle.abort();
        }
    }

    /// Cancels the pipeline's timer. Returns true if one was armed.
    pub fn disarm(&self, pipeline_id: &str) -> bool {
        match self.armed.remove(pipeline_id) {
            Some((_, timer)) => {
                timer.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Task the pipeline's timer is armed for.
    #[must_use]
    pub fn armed_task(&self, pipeline_id: &str) -> Option<String> {
        self.armed.get(pipeline_id).map(|timer| timer.task_id.clone())
    }

    /// Number of armed timers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.armed.len()
    }

    /// Returns true if no timer is armed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.armed.is_empty()
    }

    /// Cancels every timer.
    pub fn shutdown(&self) {
        self.armed.retain(|_, timer| {
            timer.handle.abort();
            false
        });
    }
}

impl Drop for TimeoutWatchdog {
    fn drop(&mut self) {
        self.shutdown();
    }
}
