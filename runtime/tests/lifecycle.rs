//! Timeouts, cancellation, and client shutdown.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use courier_core::{Destination, DispatchError, Method, Protocol, RequestDescriptor, StatusCode};
use courier_runtime::{Client, OperationState};
use courier_testing::helpers::{self, eventually};
use courier_testing::{MockTransport, OutcomeRecorder, Reply};
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

fn get_with_timeout(url: &str, timeout: Duration) -> RequestDescriptor {
    RequestDescriptor::builder(Method::Get, url)
        .timeout(timeout)
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_every_operation_finishes_exactly_once() {
    helpers::init_tracing();
    let transport = MockTransport::new()
        .with_protocol(Protocol::Http2, 100)
        .with_response_latency(Duration::from_millis(2));
    let client = helpers::client(&transport);
    let recorder = OutcomeRecorder::new();

    let mut operations = Vec::new();
    for i in 0..200 {
        let url = format!("http://mock.test/{i}");
        let descriptor = if i % 3 == 0 {
            get_with_timeout(&url, Duration::from_millis(1))
        } else {
            helpers::get(&url)
        };
        let operation = client.submit(descriptor).unwrap();
        recorder.watch(&operation);
        operations.push(operation);
    }

    let cancelled: Vec<_> = operations.iter().step_by(5).cloned().collect();
    let canceller = std::thread::spawn(move || {
        for operation in cancelled {
            operation.cancel();
        }
    });
    canceller.join().unwrap();

    assert!(recorder.wait_for(200, WAIT).await);
    // Give stray late results a chance to show up as double deliveries.
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(recorder.len(), 200);
    assert!(recorder.delivery_counts().values().all(|count| *count == 1));
    assert!(operations.iter().all(|op| op.is_terminal()));
    assert!(eventually(|| client.outstanding() == 0, WAIT).await);
}

#[tokio::test]
async fn test_sub_millisecond_timeout_still_fires() {
    let transport = MockTransport::new().with_reply("/hang", Reply::Hang);
    let client = helpers::client(&transport);

    let after = Duration::from_micros(500);
    let result = client
        .send(get_with_timeout("http://mock.test/hang", after))
        .await;

    assert_eq!(result, Err(DispatchError::Timeout { after }));
}

#[tokio::test]
async fn test_timeout_wins_over_late_response() {
    let transport = MockTransport::new().with_response_latency(Duration::from_millis(100));
    let client = helpers::client(&transport);

    let operation = client
        .submit(get_with_timeout(
            "http://mock.test/slow",
            Duration::from_millis(10),
        ))
        .unwrap();

    let outcome = operation.wait().await;
    assert!(matches!(outcome, Err(DispatchError::Timeout { .. })));
    assert_eq!(operation.state(), OperationState::Failed);

    assert!(eventually(|| transport.released_streams() == 1, WAIT).await);
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(operation.outcome().unwrap().unwrap_err().is_timeout());
}

#[tokio::test]
async fn test_response_before_timeout_disarms_timer() {
    let transport = MockTransport::new();
    let client = helpers::client(&transport);

    let response = client
        .send(get_with_timeout("http://mock.test/fast", Duration::from_millis(30)))
        .await
        .unwrap();
    assert_eq!(response.status, StatusCode::OK);

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(client.outstanding(), 0);
}

#[tokio::test]
async fn test_cancel_before_dispatch_never_reaches_transport() {
    let transport = MockTransport::new().with_connect_latency(Duration::from_millis(50));
    let client = helpers::single_slot_client(&transport);

    let first = client.submit(helpers::get("http://mock.test/a")).unwrap();
    let second = client.submit(helpers::get("http://mock.test/b")).unwrap();
    assert!(second.cancel());
    assert!(!second.cancel());

    first.wait().await.unwrap();
    assert_eq!(second.wait().await, Err(DispatchError::Cancelled));
    assert_eq!(second.state(), OperationState::Cancelled);

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(transport.dispatched_paths(), vec!["/a"]);
}

#[tokio::test]
async fn test_cancel_releases_active_stream() {
    let transport = MockTransport::new().with_reply("/hang", Reply::Hang);
    let client = helpers::single_slot_client(&transport);

    let hung = client.submit(helpers::get("http://mock.test/hang")).unwrap();
    assert!(eventually(|| hung.state() == OperationState::Active, WAIT).await);
    assert!(hung.cancel());

    assert!(eventually(|| transport.released_streams() == 1, WAIT).await);

    // The freed slot serves the next request on the same connection.
    client.send(helpers::get("http://mock.test/next")).await.unwrap();
    assert_eq!(transport.connect_count(), 1);
}

#[tokio::test]
async fn test_close_drains_in_flight_work() {
    let transport = MockTransport::new().with_response_latency(Duration::from_millis(30));
    let client = helpers::client(&transport);

    let operations: Vec<_> = (0..3)
        .map(|i| {
            client
                .submit(helpers::get(&format!("http://mock.test/{i}")))
                .unwrap()
        })
        .collect();
    client.close();
    client.close();

    assert!(client.is_closed());
    assert_eq!(
        client.submit(helpers::get("http://mock.test/late")).unwrap_err(),
        DispatchError::ShuttingDown
    );

    client.wait_idle(WAIT).await.unwrap();
    for operation in &operations {
        assert!(operation.wait().await.is_ok());
    }
    assert!(eventually(|| transport.open_connections() == 0, WAIT).await);
    assert!(!transport.dispatched_paths().contains(&"/late".to_string()));
}

#[tokio::test]
async fn test_kill_fails_outstanding_operations() {
    let transport = MockTransport::new()
        .with_reply("/hang", Reply::Hang)
        .with_connect_latency(Duration::from_millis(5));
    let client = helpers::single_slot_client(&transport);

    let active = client.submit(helpers::get("http://mock.test/hang")).unwrap();
    let queued = client.submit(helpers::get("http://mock.test/queued")).unwrap();
    assert!(eventually(|| active.state() == OperationState::Active, WAIT).await);

    client.kill();

    assert_eq!(active.wait().await, Err(DispatchError::Killed));
    assert_eq!(queued.wait().await, Err(DispatchError::Killed));
    assert!(eventually(|| transport.open_connections() == 0, WAIT).await);
    assert!(eventually(|| transport.released_streams() == 1, WAIT).await);
    assert_eq!(transport.dispatched_paths(), vec!["/hang"]);
    assert_eq!(
        client.submit(helpers::get("http://mock.test/after")).unwrap_err(),
        DispatchError::ShuttingDown
    );
}

#[tokio::test]
async fn test_kill_reaches_sessions_created_by_queued_dispatches() {
    let transport = MockTransport::new().with_connect_latency(Duration::from_millis(20));
    let client = helpers::client(&transport);

    let operations: Vec<_> = (0..20)
        .map(|i| {
            client
                .submit(helpers::get(&format!("http://host{i}.test/")))
                .unwrap()
        })
        .collect();
    client.kill();

    for operation in &operations {
        assert_eq!(operation.wait().await, Err(DispatchError::Killed));
    }
    assert_eq!(transport.dispatch_count(), 0);
    let all_killed = || {
        (0..20).all(|i| {
            let destination: Destination = format!("http://host{i}.test").parse().unwrap();
            client
                .session(&destination)
                .is_none_or(|session| session.is_closed())
        })
    };
    assert!(eventually(all_killed, WAIT).await);
}

#[tokio::test]
async fn test_stopped_event_loop_fails_outstanding_operations() {
    let transport = MockTransport::new()
        .with_reply("/hang", Reply::Hang)
        .with_connect_latency(Duration::from_millis(5));
    let client = helpers::single_slot_client(&transport);

    let active = client.submit(helpers::get("http://mock.test/hang")).unwrap();
    let queued = client.submit(helpers::get("http://mock.test/queued")).unwrap();
    assert!(eventually(|| active.state() == OperationState::Active, WAIT).await);

    client.event_loop().shutdown().unwrap();

    let outcome = tokio::time::timeout(WAIT, active.wait()).await.unwrap();
    assert_eq!(outcome, Err(DispatchError::ShuttingDown));
    let outcome = tokio::time::timeout(WAIT, queued.wait()).await.unwrap();
    assert_eq!(outcome, Err(DispatchError::ShuttingDown));
    assert_eq!(client.outstanding(), 0);
    assert_eq!(transport.released_streams(), 1);
    assert_eq!(
        client.submit(helpers::get("http://mock.test/after")).unwrap_err(),
        DispatchError::ShuttingDown
    );
}

#[tokio::test]
async fn test_shutdown_kills_after_grace_period() {
    let transport = MockTransport::new().with_reply("/hang", Reply::Hang);
    let client = helpers::client(&transport);

    let hung = client.submit(helpers::get("http://mock.test/hang")).unwrap();
    let result = client.shutdown(Duration::from_millis(50)).await;

    assert_eq!(
        result,
        Err(DispatchError::Timeout {
            after: Duration::from_millis(50)
        })
    );
    assert_eq!(hung.wait().await, Err(DispatchError::Killed));
}

#[tokio::test]
async fn test_dropping_client_kills_outstanding_operations() {
    let transport = MockTransport::new().with_reply("/hang", Reply::Hang);
    let client = Client::new(helpers::config(2, 2), transport.shared());

    let hung = client.submit(helpers::get("http://mock.test/hang")).unwrap();
    assert!(eventually(|| transport.dispatch_count() == 1, WAIT).await);
    drop(client);

    let outcome = tokio::time::timeout(WAIT, hung.wait()).await.unwrap();
    assert_eq!(outcome, Err(DispatchError::Killed));
    assert!(eventually(|| transport.open_connections() == 0, WAIT).await);
}

#[tokio::test]
async fn test_listener_may_query_client_state() {
    let transport = MockTransport::new();
    let client = helpers::client(&transport);
    let (sender, receiver) = tokio::sync::oneshot::channel();

    let operation = client.submit(helpers::get("http://mock.test/a")).unwrap();
    let observer = client.clone();
    operation.on_complete(move |outcome| {
        let stats = observer
            .session(&"http://mock.test".parse().unwrap())
            .map(|session| session.stats());
        let _ = sender.send((outcome.is_ok(), stats.is_some()));
    });

    let (ok, saw_session) = tokio::time::timeout(WAIT, receiver).await.unwrap().unwrap();
    assert!(ok);
    assert!(saw_session);
}
