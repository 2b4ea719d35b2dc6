//! End-to-end pipeline scenarios over recording fakes
//!
//! These tests drive the batch processor and the validator + dispatcher
//! composition exactly the way the broker consumer does, with a recording
//! sink standing in for the Kafka client.

use async_trait::async_trait;
use fleetwatch::consumer::{
    BatchProcessor, BatchSink, CommitHandle, ConsumerError, ConsumerResult, InboundMessage,
    MessageHandler, TelemetryMessageHandler,
};
use fleetwatch::dispatch::{EventDispatcher, TelemetryHandler};
use fleetwatch::handlers::{AlertNotifier, SentryAlert, SentryAlertHandler};
use fleetwatch::message::TelemetryMessage;
use fleetwatch::retry::{RetryManager, RetryPolicy};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const TOPIC: &str = "vehicle-telemetry";

#[derive(Default)]
struct RecordingSink {
    commits: Mutex<Vec<String>>,
    resolves: Mutex<Vec<String>>,
    heartbeats: AtomicUsize,
    commit_flushes: AtomicUsize,
}

#[async_trait]
impl BatchSink for RecordingSink {
    async fn commit_offset(&self, message: &InboundMessage) -> ConsumerResult<()> {
        self.commits.lock().push(message.correlation_id());
        Ok(())
    }

    async fn resolve_offset(&self, message: &InboundMessage) -> ConsumerResult<()> {
        self.resolves.lock().push(message.correlation_id());
        Ok(())
    }

    async fn heartbeat(&self) -> ConsumerResult<()> {
        self.heartbeats.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn commit_if_necessary(&self) -> ConsumerResult<()> {
        self.commit_flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Handler that fails a scripted number of times per offset and commits on
/// success, mirroring the real handler contract.
#[derive(Default)]
struct ScriptedHandler {
    calls: Mutex<Vec<String>>,
    failures: Mutex<HashMap<i64, u32>>,
}

impl ScriptedHandler {
    fn fail_times(&self, offset: i64, times: u32) {
        self.failures.lock().insert(offset, times);
    }

    fn fail_always(&self, offset: i64) {
        self.fail_times(offset, u32::MAX);
    }

    fn calls_for(&self, offset: i64) -> usize {
        let id = format!("{TOPIC}-0-{offset}");
        self.calls.lock().iter().filter(|call| **call == id).count()
    }
}

#[async_trait]
impl MessageHandler for ScriptedHandler {
    async fn handle(&self, message: &InboundMessage, commit: &CommitHandle) -> ConsumerResult<()> {
        self.calls.lock().push(message.correlation_id());

        let should_fail = {
            let mut failures = self.failures.lock();
            match failures.get_mut(&message.offset) {
                Some(remaining) if *remaining > 0 => {
                    if *remaining != u32::MAX {
                        *remaining -= 1;
                    }
                    true
                }
                _ => false,
            }
        };
        if should_fail {
            return Err(ConsumerError::Processing("scripted failure".to_string()));
        }

        commit.commit().await?;
        Ok(())
    }
}

fn retry_policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        base_delay: Duration::from_millis(1000),
        max_delay: Duration::from_millis(30_000),
    }
}

struct Harness {
    processor: BatchProcessor,
    sink: Arc<RecordingSink>,
    handler: Arc<ScriptedHandler>,
    retry: Arc<RetryManager>,
    connected: Arc<AtomicBool>,
}

fn harness(max_concurrency: usize, max_attempts: u32) -> Harness {
    let sink = Arc::new(RecordingSink::default());
    let handler = Arc::new(ScriptedHandler::default());
    let retry = Arc::new(RetryManager::new(retry_policy(max_attempts)));
    let connected = Arc::new(AtomicBool::new(true));
    let processor = BatchProcessor::new(
        handler.clone(),
        sink.clone() as Arc<dyn BatchSink>,
        retry.clone(),
        max_concurrency,
        connected.clone(),
    );
    Harness {
        processor,
        sink,
        handler,
        retry,
        connected,
    }
}

fn raw_message(offset: i64) -> InboundMessage {
    InboundMessage::new(TOPIC, 0, offset, Some(b"{}".to_vec()))
}

#[tokio::test]
async fn successful_batch_resolves_heartbeats_and_commits_once() {
    let h = harness(10, 3);

    h.processor.process(vec![raw_message(1), raw_message(2)]).await;

    let mut resolves = h.sink.resolves.lock().clone();
    resolves.sort();
    assert_eq!(resolves, vec![format!("{TOPIC}-0-1"), format!("{TOPIC}-0-2")]);
    assert_eq!(h.sink.heartbeats.load(Ordering::SeqCst), 2);
    assert_eq!(h.sink.commit_flushes.load(Ordering::SeqCst), 1);

    let mut commits = h.sink.commits.lock().clone();
    commits.sort();
    assert_eq!(commits, vec![format!("{TOPIC}-0-1"), format!("{TOPIC}-0-2")]);
    assert_eq!(h.retry.pending_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn failed_message_enters_retry_without_stalling_the_batch() {
    let h = harness(10, 2);
    h.handler.fail_always(1);

    h.processor.process(vec![raw_message(1), raw_message(2)]).await;

    // The batch loop finished while message 1's retry chain is pending.
    assert_eq!(h.retry.pending_count(), 1);
    assert_eq!(h.sink.commits.lock().clone(), vec![format!("{TOPIC}-0-2")]);

    // Both offsets were resolved and heartbeaten, failure included.
    assert_eq!(h.sink.resolves.lock().len(), 2);
    assert_eq!(h.sink.heartbeats.load(Ordering::SeqCst), 2);
    assert_eq!(h.sink.commit_flushes.load(Ordering::SeqCst), 1);

    // Drain the whole backoff ladder: the manager invokes the handler
    // exactly max_attempts times, then abandons the chain.
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(h.handler.calls_for(1), 1 + 2);
    assert_eq!(h.retry.pending_count(), 0);
    assert_eq!(h.sink.commits.lock().clone(), vec![format!("{TOPIC}-0-2")]);

    // Permanently abandoned: nothing fires later.
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(h.handler.calls_for(1), 3);
}

#[tokio::test(start_paused = true)]
async fn retried_message_commits_once_it_succeeds() {
    let h = harness(10, 3);
    h.handler.fail_times(7, 1);

    h.processor.process(vec![raw_message(7)]).await;

    // The retry chain's first attempt runs immediately and succeeds; the
    // failed batch attempt itself never committed.
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(h.handler.calls_for(7), 2);
    assert_eq!(h.sink.commits.lock().clone(), vec![format!("{TOPIC}-0-7")]);
    assert_eq!(h.retry.pending_count(), 0);
}

#[tokio::test]
async fn messages_are_skipped_entirely_while_disconnected() {
    let h = harness(10, 3);
    h.connected.store(false, Ordering::SeqCst);

    h.processor.process(vec![raw_message(1), raw_message(2)]).await;

    assert!(h.handler.calls.lock().is_empty());
    assert!(h.sink.resolves.lock().is_empty());
    assert!(h.sink.commits.lock().is_empty());
    assert_eq!(h.sink.heartbeats.load(Ordering::SeqCst), 0);
    assert_eq!(h.retry.pending_count(), 0);
}

#[tokio::test]
async fn concurrency_ceiling_of_one_still_processes_every_message() {
    let h = harness(1, 3);

    h.processor
        .process(vec![raw_message(1), raw_message(2), raw_message(3)])
        .await;

    assert_eq!(h.handler.calls.lock().len(), 3);
    assert_eq!(h.sink.commits.lock().len(), 3);
    assert_eq!(h.sink.commit_flushes.load(Ordering::SeqCst), 1);
}

// --- validator + dispatcher composition -----------------------------------

struct CountingTelemetryHandler {
    calls: AtomicUsize,
    fail: bool,
}

#[async_trait]
impl TelemetryHandler for CountingTelemetryHandler {
    fn name(&self) -> &str {
        "counting"
    }

    async fn handle(&self, _message: &TelemetryMessage) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            anyhow::bail!("downstream rejected the message")
        }
        Ok(())
    }
}

#[derive(Default)]
struct RecordingNotifier {
    alerts: Mutex<Vec<SentryAlert>>,
}

#[async_trait]
impl AlertNotifier for RecordingNotifier {
    async fn notify(&self, alert: &SentryAlert) -> anyhow::Result<()> {
        self.alerts.lock().push(alert.clone());
        Ok(())
    }
}

struct Composition {
    sink: Arc<RecordingSink>,
    counting: Arc<CountingTelemetryHandler>,
    notifier: Arc<RecordingNotifier>,
    handler: TelemetryMessageHandler,
}

fn composition(counting_fails: bool) -> Composition {
    let sink = Arc::new(RecordingSink::default());
    let counting = Arc::new(CountingTelemetryHandler {
        calls: AtomicUsize::new(0),
        fail: counting_fails,
    });
    let notifier = Arc::new(RecordingNotifier::default());
    let handlers: Vec<Arc<dyn TelemetryHandler>> = vec![
        Arc::new(SentryAlertHandler::new(notifier.clone())),
        counting.clone(),
    ];
    let handler = TelemetryMessageHandler::new(Arc::new(EventDispatcher::new(handlers)));
    Composition {
        sink,
        counting,
        notifier,
        handler,
    }
}

async fn run_payload(c: &Composition, payload: Option<&[u8]>) -> ConsumerResult<()> {
    let message = Arc::new(InboundMessage::new(
        TOPIC,
        0,
        1,
        payload.map(<[u8]>::to_vec),
    ));
    let commit = CommitHandle::new(c.sink.clone() as Arc<dyn BatchSink>, message.clone());
    c.handler.handle(&message, &commit).await
}

fn telemetry_payload(sentry_state: Option<&str>, is_resend: bool) -> Vec<u8> {
    let data = match sentry_state {
        Some(state) => serde_json::json!([
            { "key": "SentryMode", "value": { "sentryModeStateValue": state } }
        ]),
        None => serde_json::json!([
            { "key": "Gear", "value": { "stringValue": "P" } }
        ]),
    };
    serde_json::to_vec(&serde_json::json!({
        "vin": "5YJ3E1EA7KF000001",
        "createdAt": "2024-03-01T12:00:00Z",
        "isResend": is_resend,
        "data": data,
    }))
    .unwrap()
}

#[tokio::test]
async fn malformed_payloads_never_commit_and_never_reach_handlers() {
    let c = composition(false);

    // Missing payload, empty payload, unparsable JSON, invalid structure.
    assert!(run_payload(&c, None).await.is_ok());
    assert!(run_payload(&c, Some(b"")).await.is_ok());
    assert!(run_payload(&c, Some(b"not json at all")).await.is_ok());
    assert!(run_payload(&c, Some(b"{\"vin\": 42}")).await.is_ok());

    assert_eq!(c.counting.calls.load(Ordering::SeqCst), 0);
    assert!(c.notifier.alerts.lock().is_empty());
    assert!(c.sink.commits.lock().is_empty());
}

#[tokio::test]
async fn valid_payload_without_sentry_data_commits_but_never_alerts() {
    let c = composition(false);

    run_payload(&c, Some(&telemetry_payload(None, false)))
        .await
        .unwrap();

    assert_eq!(c.counting.calls.load(Ordering::SeqCst), 1);
    assert!(c.notifier.alerts.lock().is_empty());
    assert_eq!(c.sink.commits.lock().len(), 1);
}

#[tokio::test]
async fn non_attention_sentry_states_do_not_alert() {
    let c = composition(false);

    for state in ["Off", "Idle", "Armed", "Panic", "Quiet", "Unknown"] {
        run_payload(&c, Some(&telemetry_payload(Some(state), false)))
            .await
            .unwrap();
    }

    assert!(c.notifier.alerts.lock().is_empty());
    assert_eq!(c.sink.commits.lock().len(), 6);
}

#[tokio::test]
async fn aware_state_alerts_and_commits() {
    let c = composition(false);

    run_payload(&c, Some(&telemetry_payload(Some("Aware"), false)))
        .await
        .unwrap();

    let alerts = c.notifier.alerts.lock();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].vin, "5YJ3E1EA7KF000001");
    assert_eq!(c.sink.commits.lock().len(), 1);
}

#[tokio::test]
async fn partial_handler_failure_fails_the_message_without_committing() {
    let c = composition(true);

    let result = run_payload(&c, Some(&telemetry_payload(Some("Aware"), false))).await;

    // One of two handlers rejected: the message is failed (retry-eligible)
    // and its offset stays uncommitted.
    let error = result.unwrap_err();
    assert!(
        error.to_string().contains("1 of 2 telemetry handlers failed"),
        "unexpected error: {error}"
    );
    assert!(c.sink.commits.lock().is_empty());

    // The failing handler did not stop the alert route from running.
    assert_eq!(c.notifier.alerts.lock().len(), 1);
    assert_eq!(c.counting.calls.load(Ordering::SeqCst), 1);
}
