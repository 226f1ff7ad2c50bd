//! Reconnecting driver for live (pub/sub) subscriptions.
//!
//! A pub/sub connection can end at any time. The driver feeds every frame to
//! the handler and, when the frame stream ends, resubscribes with backoff. It
//! only returns when the reconnect policy is exhausted; callers stop it by
//! aborting its task.

use futures::stream::BoxStream;
use futures::StreamExt;
use std::future::Future;
use std::sync::Arc;
use tracing::{error, info, warn};

use super::{BusError, BusMessage, MessageHandler};
use crate::resilience::{RetryConfig, RetryState};

/// One pub/sub frame: the text payload, or why it could not be read as text.
pub(crate) type LiveFrame = Result<String, String>;

/// Frames of one pub/sub connection.
pub(crate) type LiveFrames = BoxStream<'static, LiveFrame>;

/// Delivers frames to `handler` until the stream ends. Returns how many
/// frames were received.
async fn pump(mut frames: LiveFrames, topic: &str, handler: &dyn MessageHandler) -> usize {
    let mut received = 0;
    while let Some(frame) = frames.next().await {
        received += 1;
        let text = match frame {
            Ok(text) => text,
            Err(reason) => {
                warn!(topic, error = %reason, "Dropping non-text pub/sub message");
                continue;
            }
        };
        let payload = match serde_json::from_str(&text) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(topic, error = %err, raw_payload = %text, "Dropping non-JSON pub/sub message");
                continue;
            }
        };
        if let Err(err) = handler.handle(&BusMessage::live(topic, payload)).await {
            warn!(topic, error = %err, "Subscriber failed to handle message");
        }
    }
    received
}

/// Runs a live subscription starting from `first`, resubscribing through
/// `connect` whenever the frame stream ends or a connect attempt fails.
pub(crate) async fn run_live_subscription<C, Fut>(
    topic: String,
    handler: Arc<dyn MessageHandler>,
    reconnect: RetryConfig,
    first: LiveFrames,
    mut connect: C,
) where
    C: FnMut() -> Fut,
    Fut: Future<Output = Result<LiveFrames, BusError>>,
{
    let mut state = RetryState::new();
    let mut frames = Some(first);

    loop {
        if let Some(current) = frames.take() {
            if pump(current, &topic, handler.as_ref()).await > 0 {
                state.reset();
            }
            warn!(topic = %topic, "Pub/sub stream ended, resubscribing");
        }

        let Some(delay) = state.next_delay(&reconnect) else {
            error!(topic = %topic, attempts = state.attempt, "Pub/sub subscription giving up");
            return;
        };
        tokio::time::sleep(delay).await;

        match connect().await {
            Ok(next) => {
                info!(topic = %topic, attempt = state.attempt, "Pub/sub subscription reconnected");
                frames = Some(next);
            }
            Err(err) => {
                warn!(
                    topic = %topic,
                    error = %err,
                    attempt = state.attempt,
                    "Pub/sub resubscribe failed"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingHandler;
    use futures::stream;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::time::Duration;

    fn frames(texts: &[&str]) -> LiveFrames {
        let items: Vec<LiveFrame> = texts.iter().map(|text| Ok((*text).to_string())).collect();
        stream::iter(items).boxed()
    }

    fn reconnect() -> RetryConfig {
        RetryConfig::unbounded().with_base_delay_ms(10).with_max_delay_ms(100)
    }

    #[tokio::test(start_paused = true)]
    async fn test_resubscribes_after_stream_ends_and_connect_failure() {
        let handler = Arc::new(RecordingHandler::new());
        let attempts = Arc::new(Mutex::new(VecDeque::from([
            Err(BusError::Unavailable("connection refused".into())),
            Ok(stream::iter(vec![Ok::<_, String>(r#"{"n":2}"#.to_string())])
                .chain(stream::pending())
                .boxed()),
        ])));

        let task = {
            let attempts = Arc::clone(&attempts);
            tokio::spawn(run_live_subscription(
                "tasks.compiler".to_string(),
                handler.clone(),
                reconnect(),
                frames(&[r#"{"n":1}"#]),
                move || {
                    let next = attempts.lock().pop_front();
                    async move {
                        next.unwrap_or_else(|| Err(BusError::Unavailable("script exhausted".into())))
                    }
                },
            ))
        };

        handler.wait_for(2, Duration::from_secs(5)).await;
        assert_eq!(handler.payloads(), vec![json!({"n": 1}), json!({"n": 2})]);
        assert!(attempts.lock().is_empty());
        assert!(!task.is_finished());
        task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_undecodable_frames_are_skipped() {
        let handler = Arc::new(RecordingHandler::new());
        let first: LiveFrames = stream::iter(vec![
            Err("binary frame".to_string()),
            Ok("not json".to_string()),
            Ok(r#"{"ok":true}"#.to_string()),
        ])
        .chain(stream::pending())
        .boxed();

        let task = tokio::spawn(run_live_subscription(
            "tasks.tester".to_string(),
            handler.clone(),
            reconnect(),
            first,
            || async { Err(BusError::Unavailable("unused".into())) },
        ));

        handler.wait_for(1, Duration::from_secs(1)).await;
        assert_eq!(handler.payloads(), vec![json!({"ok": true})]);
        task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_when_reconnect_policy_is_exhausted() {
        let handler = Arc::new(RecordingHandler::new());
        let calls = Arc::new(Mutex::new(0usize));

        let counter = Arc::clone(&calls);
        run_live_subscription(
            "tasks.scaffold".to_string(),
            handler.clone(),
            reconnect().with_max_attempts(3),
            frames(&[]),
            move || {
                *counter.lock() += 1;
                async { Err(BusError::Unavailable("down".into())) }
            },
        )
        .await;

        assert_eq!(*calls.lock(), 2);
        assert_eq!(handler.call_count(), 0);
    }
}
