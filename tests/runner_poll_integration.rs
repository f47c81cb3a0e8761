//! Integration tests for the polling runner against a live coordinator.
//!
//! A coordinator is served on a random port, a runner talks to it over HTTP
//! with the real client, and results are observed on the bus.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use secrecy::SecretString;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;

use runner_relay::bus::{Bus, BusMessage, FnHandler, LocalBus, Subscription, new_inbox};
use runner_relay::config::{CoordinatorConfig, RunnerConfig};
use runner_relay::coordinator::{Coordinator, MemoryStore};
use runner_relay::error::{BusError, RunnerError};
use runner_relay::relay::WorkKind;
use runner_relay::runner::{
    CoordinatorClient, ExecutionContext, HttpCoordinatorClient, Runner, RunnerTask, TaskExecutor,
    TaskResult,
};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper-cases the payload.
struct Shout;

#[async_trait]
impl TaskExecutor for Shout {
    async fn execute(&self, _context: &ExecutionContext, task: &RunnerTask) -> Result<Bytes, RunnerError> {
        Ok(Bytes::from(task.payload.to_ascii_uppercase()))
    }
}

async fn start_coordinator(token: Option<&str>) -> (String, LocalBus, Arc<Coordinator>) {
    let bus = LocalBus::new();
    let config = CoordinatorConfig {
        runner_token: token.map(|t| SecretString::from(t.to_string())),
        ..CoordinatorConfig::default()
    };
    let coordinator = Arc::new(Coordinator::new(
        &config,
        Arc::new(bus.clone()),
        Arc::new(MemoryStore::new()),
    ));
    let app = coordinator.router();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    (format!("http://127.0.0.1:{port}"), bus, coordinator)
}

fn runner_config(api_host: &str, token: &str, memory: u64) -> RunnerConfig {
    RunnerConfig {
        runner_id: "r1".into(),
        api_host: api_host.into(),
        api_token: SecretString::from(token.to_string()),
        memory_bytes: memory,
        poll_interval: Duration::from_millis(20),
        report_interval: Duration::from_millis(50),
        eviction_interval: Duration::from_millis(50),
        ..RunnerConfig::default()
    }
}

/// Collect everything published on `subject`.
fn listen(bus: &LocalBus, subject: &str) -> (Subscription, mpsc::UnboundedReceiver<TaskResult>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let subscription = bus
        .subscribe(
            subject,
            Arc::new(FnHandler(move |msg: BusMessage| {
                let tx = tx.clone();
                async move {
                    if let Ok(result) = serde_json::from_slice::<TaskResult>(&msg.payload) {
                        let _ = tx.send(result);
                    }
                    Ok::<(), BusError>(())
                }
            })),
        )
        .unwrap();
    (subscription, rx)
}

#[tokio::test]
async fn polled_task_result_reaches_the_requester() {
    timeout(TEST_TIMEOUT, async {
        let (api, bus, coordinator) = start_coordinator(Some("tok")).await;
        let inbox = new_inbox();
        let (_sub, mut results) = listen(&bus, &inbox);

        let client = HttpCoordinatorClient::new(&api, SecretString::from("tok".to_string())).unwrap();
        let runner = Runner::new(runner_config(&api, "tok", 1_000), Arc::new(client), Arc::new(Shout));
        runner.initialize().await.unwrap();
        assert!(coordinator.registry().get("r1").await.is_some());

        let task = RunnerTask::new(WorkKind::Tool, "hello")
            .with_memory(100)
            .with_reply(inbox.clone());
        coordinator.tasks().push(task.clone()).await;

        let handle = tokio::spawn(Arc::clone(&runner).run());
        let result = results.recv().await.unwrap();
        assert_eq!(result.task_id, task.id);
        assert!(result.is_success());
        assert_eq!(&result.payload[..], b"HELLO");

        // The next report shows the idle context that served the task.
        let reported = loop {
            let state = coordinator.registry().get("r1").await.unwrap();
            if !state.model_instances.is_empty() {
                break state;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        };
        assert_eq!(reported.free_memory, 900);

        runner.shutdown();
        handle.await.unwrap();
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn oversized_task_comes_back_as_failure() {
    timeout(TEST_TIMEOUT, async {
        let (api, bus, coordinator) = start_coordinator(None).await;
        let inbox = new_inbox();
        let (_sub, mut results) = listen(&bus, &inbox);

        let client = HttpCoordinatorClient::new(&api, SecretString::from(String::new())).unwrap();
        let runner = Runner::new(runner_config(&api, "", 1_000), Arc::new(client), Arc::new(Shout));

        // No state reported yet, so the coordinator hands out the task as is.
        coordinator
            .tasks()
            .push(RunnerTask::new(WorkKind::Script, "x").with_memory(5_000).with_reply(inbox))
            .await;

        assert!(runner.run_once().await.unwrap());
        let result = results.recv().await.unwrap();
        assert!(!result.is_success());
        assert!(result.error.unwrap().contains("Not enough memory"));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn client_errors_on_bad_token() {
    timeout(TEST_TIMEOUT, async {
        let (api, _bus, _coordinator) = start_coordinator(Some("tok")).await;
        let client = HttpCoordinatorClient::new(&api, SecretString::from("nope".to_string())).unwrap();

        let err = client.next_task("r1").await.unwrap_err();
        assert!(matches!(err, RunnerError::Coordinator(msg) if msg.contains("401")));

        let client = HttpCoordinatorClient::new(&api, SecretString::from("tok".to_string())).unwrap();
        assert!(client.next_task("r1").await.unwrap().is_none());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn initialize_fails_without_coordinator() {
    timeout(TEST_TIMEOUT, async {
        // Bind and drop to get a port nothing listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let api = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);

        let client = HttpCoordinatorClient::new(&api, SecretString::from(String::new())).unwrap();
        let runner = Runner::new(runner_config(&api, "", 1_000), Arc::new(client), Arc::new(Shout));
        assert!(runner.initialize().await.is_err());
    })
    .await
    .expect("test timed out");
}
