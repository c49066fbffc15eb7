//! Retries after transport failures and redirect following.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use courier_core::{
    Body, Bytes, ClientConfiguration, DispatchError, Method, RequestDescriptor, RetryPolicy,
    StatusCode, TransportError, TransportErrorKind,
};
use courier_runtime::Client;
use courier_testing::helpers;
use courier_testing::{MockTransport, Reply};
use std::time::Duration;

fn reset() -> Reply {
    Reply::Fail(TransportError::retriable(
        TransportErrorKind::Reset,
        "stream reset by peer",
    ))
}

#[tokio::test]
async fn test_retriable_failure_is_retried() {
    helpers::init_tracing();
    let transport = MockTransport::new().with_reply("/flaky", reset());
    let client = helpers::client(&transport);

    let operation = client.submit(helpers::get("http://mock.test/flaky")).unwrap();
    let response = operation.wait().await.unwrap();

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(operation.retry_count(), 1);
    assert_eq!(transport.dispatched_paths(), vec!["/flaky", "/flaky"]);
}

#[tokio::test]
async fn test_post_is_not_retried() {
    let transport = MockTransport::new().with_reply("/submit", reset());
    let client = helpers::client(&transport);

    let result = client
        .send(helpers::post("http://mock.test/submit", b"payload"))
        .await;

    match result {
        Err(DispatchError::Transport(error)) => {
            assert_eq!(error.kind(), TransportErrorKind::Reset);
        }
        other => panic!("expected transport failure, got {other:?}"),
    }
    assert_eq!(transport.dispatch_count(), 1);
}

#[tokio::test]
async fn test_idempotent_post_is_retried() {
    let transport = MockTransport::new().with_reply("/put-like", reset());
    let client = helpers::client(&transport);

    let descriptor = RequestDescriptor::builder(Method::Post, "http://mock.test/put-like")
        .body_buffers([Bytes::from_static(b"x")])
        .idempotent(true)
        .build()
        .unwrap();

    assert_eq!(client.send(descriptor).await.unwrap().status, StatusCode::OK);
    assert_eq!(transport.dispatch_count(), 2);
}

#[tokio::test]
async fn test_non_retriable_failure_fails_immediately() {
    let transport = MockTransport::new().with_reply(
        "/broken",
        Reply::Fail(TransportError::new(TransportErrorKind::Protocol, "bad frame")),
    );
    let client = helpers::client(&transport);

    let error = client
        .send(helpers::get("http://mock.test/broken"))
        .await
        .unwrap_err();

    assert!(matches!(error, DispatchError::Transport(ref e) if !e.is_retriable()));
    assert_eq!(transport.dispatch_count(), 1);
}

#[tokio::test]
async fn test_retry_budget_is_bounded() {
    let transport = MockTransport::new();
    for _ in 0..10 {
        transport.push_reply("/down", reset());
    }
    let client = helpers::client(&transport);

    let operation = client.submit(helpers::get("http://mock.test/down")).unwrap();
    let outcome = operation.wait().await;

    assert!(matches!(outcome, Err(DispatchError::Transport(_))));
    // One attempt plus three retries from `helpers::fast_retry(3)`.
    assert_eq!(transport.dispatch_count(), 4);
    assert_eq!(operation.retry_count(), 3);
}

#[tokio::test]
async fn test_connect_failure_is_retried() {
    let transport = MockTransport::new().with_connect_failure(TransportError::retriable(
        TransportErrorKind::Connect,
        "connection refused",
    ));
    let client = helpers::client(&transport);

    let operation = client.submit(helpers::get("http://mock.test/a")).unwrap();
    assert_eq!(operation.wait().await.unwrap().status, StatusCode::OK);
    assert_eq!(transport.connect_count(), 2);
    assert_eq!(operation.retry_count(), 1);
}

#[tokio::test]
async fn test_connect_timeout_fails_operation() {
    let transport = MockTransport::new().with_connect_latency(Duration::from_secs(1));
    let config = ClientConfiguration::builder()
        .connect_timeout(Duration::from_millis(20))
        .retry(RetryPolicy::disabled())
        .build()
        .unwrap();
    let client = Client::new(config, transport.shared());

    let error = client
        .send(helpers::get("http://mock.test/a"))
        .await
        .unwrap_err();

    match error {
        DispatchError::Transport(error) => assert_eq!(error.kind(), TransportErrorKind::Connect),
        other => panic!("expected connect failure, got {other:?}"),
    }
    assert_eq!(transport.dispatch_count(), 0);
}

#[tokio::test]
async fn test_same_destination_redirect_is_followed() {
    let transport = MockTransport::new().with_reply("/old", Reply::redirect(301, "/new"));
    let client = helpers::client(&transport);

    let operation = client.submit(helpers::get("http://mock.test/old")).unwrap();
    let response = operation.wait().await.unwrap();

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(&response.body[..], b"/new");
    assert_eq!(operation.redirect_count(), 1);
    assert_eq!(operation.descriptor().target().path(), "/new");
    assert_eq!(transport.dispatched_paths(), vec!["/old", "/new"]);
}

#[tokio::test]
async fn test_cross_destination_redirect_moves_sessions() {
    let transport = MockTransport::new().with_reply(
        "/start",
        Reply::redirect(302, "http://other.test/landing"),
    );
    let client = helpers::client(&transport);

    let response = client
        .send(
            RequestDescriptor::builder(Method::Get, "http://mock.test/start")
                .header("Authorization", "Bearer secret")
                .build()
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(&response.body[..], b"/landing");
    assert_eq!(client.session_count(), 2);
    assert!(client.session(&"http://other.test".parse().unwrap()).is_some());

    let dispatches = transport.dispatched();
    assert!(dispatches[1].request.headers().get("authorization").is_none());
}

#[tokio::test]
async fn test_redirect_honors_aliases() {
    let transport = MockTransport::new().with_reply(
        "/start",
        Reply::redirect(302, "http://mirror.test/landing"),
    );
    let client = helpers::client(&transport);
    client.add_alias(
        "http://mirror.test".parse().unwrap(),
        "http://mock.test".parse().unwrap(),
    );

    client.send(helpers::get("http://mock.test/start")).await.unwrap();

    assert_eq!(client.session_count(), 1);
}

#[tokio::test]
async fn test_see_other_turns_post_into_get() {
    let transport = MockTransport::new().with_reply("/form", Reply::redirect(303, "/result"));
    let client = helpers::client(&transport);

    client
        .send(helpers::post("http://mock.test/form", b"a=1"))
        .await
        .unwrap();

    let dispatches = transport.dispatched();
    assert_eq!(dispatches[1].request.method(), Method::Get);
    assert!(matches!(dispatches[1].request.body(), Body::Empty));
}

#[tokio::test]
async fn test_temporary_redirect_preserves_post() {
    let transport = MockTransport::new().with_reply("/upload", Reply::redirect(307, "/upload2"));
    let client = helpers::client(&transport);

    client
        .send(helpers::post("http://mock.test/upload", b"payload"))
        .await
        .unwrap();

    let dispatches = transport.dispatched();
    assert_eq!(dispatches[1].request.method(), Method::Post);
    assert_eq!(dispatches[1].request.body().content_length(), Some(7));
}

#[tokio::test]
async fn test_streamed_body_cannot_follow_method_preserving_redirect() {
    let transport = MockTransport::new().with_reply("/stream", Reply::redirect(307, "/elsewhere"));
    let client = helpers::client(&transport);

    let descriptor = RequestDescriptor::builder(Method::Post, "http://mock.test/stream")
        .body_stream(futures::stream::iter(vec![Ok::<_, std::io::Error>(
            Bytes::from_static(b"chunk"),
        )]))
        .build()
        .unwrap();
    let response = client.send(descriptor).await.unwrap();

    assert_eq!(response.status, StatusCode::TEMPORARY_REDIRECT);
    assert_eq!(transport.dispatch_count(), 1);
}

#[tokio::test]
async fn test_redirect_limit_fails_operation() {
    let transport = MockTransport::new();
    for _ in 0..5 {
        transport.push_reply("/loop", Reply::redirect(302, "/loop"));
    }
    let client = helpers::client(&transport);

    let result = client
        .send(
            RequestDescriptor::builder(Method::Get, "http://mock.test/loop")
                .max_redirects(2)
                .build()
                .unwrap(),
        )
        .await;

    assert_eq!(result, Err(DispatchError::TooManyRedirects { limit: 2 }));
    assert_eq!(transport.dispatch_count(), 3);
}

#[tokio::test]
async fn test_redirects_can_be_disabled() {
    let transport = MockTransport::new().with_reply("/old", Reply::redirect(301, "/new"));
    let config = ClientConfiguration::builder()
        .follow_redirects(false)
        .retry(helpers::fast_retry(3))
        .build()
        .unwrap();
    let client = Client::new(config, transport.shared());

    let response = client.send(helpers::get("http://mock.test/old")).await.unwrap();

    assert_eq!(response.status, StatusCode::MOVED_PERMANENTLY);
    assert_eq!(response.location(), Some("/new"));
    assert_eq!(transport.dispatched_paths(), vec!["/old"]);
}
