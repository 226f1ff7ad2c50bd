//! A task executor driven by a script of outcomes.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;

use crate::contracts::{ResultError, TaskEnvelope};
use crate::worker::TaskExecutor;

type Outcome = Result<serde_json::Value, ResultError>;

/// Returns scripted outcomes in order; the last one repeats.
#[derive(Debug)]
pub struct ScriptedExecutor {
    script: Mutex<VecDeque<Outcome>>,
    delay: Option<Duration>,
    executed: Mutex<Vec<String>>,
}

impl ScriptedExecutor {
    /// Plays `outcomes` in order.
    #[must_use]
    pub fn new(outcomes: impl IntoIterator<Item = Outcome>) -> Self {
        Self {
            script: Mutex::new(outcomes.into_iter().collect()),
            delay: None,
            executed: Mutex::new(Vec::new()),
        }
    }

    /// Always succeeds with `result`.
    #[must_use]
    pub fn succeeding(result: serde_json::Value) -> Self {
        Self::new([Ok(result)])
    }

    /// Always fails with `error`.
    #[must_use]
    pub fn failing(error: ResultError) -> Self {
        Self::new([Err(error)])
    }

    /// Sleeps before answering.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Task ids executed so far.
    #[must_use]
    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().clone()
    }

    fn next_outcome(&self) -> Outcome {
        let mut script = self.script.lock();
        match script.len() {
            0 => Ok(serde_json::Value::Null),
            1 => script[0].clone(),
            _ => script.pop_front().unwrap_or(Ok(serde_json::Value::Null)),
        }
    }
}

#[async_trait]
impl TaskExecutor for ScriptedExecutor {
    async fn execute(&self, task: &TaskEnvelope) -> Result<serde_json::Value, ResultError> {
        self.executed.lock().push(task.task_id.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.next_outcome()
    }
}
