//! End-to-end tests of the body-retry stage over a scripted transport.

use crate::error::{BodyRetryError, BoxError, PolicyRejection, StreamError};
use crate::retry::{
    BodyRetry, BodyRetryConfig, LogDetail, ResponseBody, RetryBody, RetryLog, RetryResponse,
    RetryScheduler, EVENT_OVERFLOW, EVENT_RETRY,
};
use crate::transport::Transport;
use crate::types::{
    AbortContext, ByteStream, DispatchContext, Payload, RequestDescriptor, ResponseDescriptor,
    SinglePassStream,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{future, stream, StreamExt};
use http::header::CONTENT_LENGTH;
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

const TARGET: &str = "http://origin.test/report";

// ========== Test Doubles ==========

enum Step {
    Respond(ResponseDescriptor),
    Fail(&'static str),
    Panic(&'static str),
    Hang,
    /// Close the parked consumer body, then respond
    CloseThenRespond(ResponseDescriptor),
}

#[derive(Default)]
struct ScriptedTransport {
    steps: Mutex<VecDeque<Step>>,
    calls: AtomicUsize,
    contexts: Mutex<Vec<DispatchContext>>,
    consumer: Mutex<Option<RetryBody>>,
}

impl ScriptedTransport {
    fn new(steps: Vec<Step>) -> Arc<Self> {
        Arc::new(ScriptedTransport {
            steps: Mutex::new(steps.into()),
            ..Default::default()
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn attempt(
        &self,
        _request: &RequestDescriptor,
        ctx: &DispatchContext,
    ) -> Result<ResponseDescriptor, BoxError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.contexts.lock().push(ctx.clone());
        let step = self.steps.lock().pop_front();
        match step {
            Some(Step::Respond(response)) => Ok(response),
            Some(Step::Fail(message)) => Err(message.into()),
            Some(Step::Panic(message)) => panic!("{}", message),
            Some(Step::Hang) => future::pending().await,
            Some(Step::CloseThenRespond(response)) => {
                if let Some(mut body) = self.consumer.lock().take() {
                    body.close();
                }
                Ok(response)
            }
            None => Err("script exhausted".into()),
        }
    }
}

enum Tail {
    End,
    Fail(&'static str),
    Hang,
}

fn source(chunks: &[&'static str], tail: Tail) -> ByteStream {
    let items: Vec<Result<Bytes, BoxError>> = chunks
        .iter()
        .map(|chunk| Ok(Bytes::from_static(chunk.as_bytes())))
        .collect();
    let head = stream::iter(items);
    match tail {
        Tail::End => Box::pin(head),
        Tail::Fail(message) => Box::pin(head.chain(stream::once(async move {
            Err::<Bytes, BoxError>(message.into())
        }))),
        Tail::Hang => Box::pin(head.chain(stream::pending())),
    }
}

struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Wrap a source so that dropping it raises the returned flag.
fn tracked(inner: ByteStream) -> (ByteStream, Arc<AtomicBool>) {
    let dropped = Arc::new(AtomicBool::new(false));
    let guard = DropFlag(dropped.clone());
    let stream = inner.map(move |item| {
        let _guard = &guard;
        item
    });
    (Box::pin(stream), dropped)
}

fn respond(chunks: &[&'static str], tail: Tail) -> Step {
    Step::Respond(ResponseDescriptor::ok(source(chunks, tail)))
}

fn with_length(body: ByteStream, length: u64) -> Step {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_LENGTH, HeaderValue::from(length));
    Step::Respond(ResponseDescriptor::ok(body).with_headers(headers))
}

#[derive(Default)]
struct RecordingScheduler {
    delays: Mutex<Vec<Duration>>,
}

#[async_trait]
impl RetryScheduler for Arc<RecordingScheduler> {
    async fn delay(&self, delay: Duration) {
        self.delays.lock().push(delay);
    }
}

/// Signals when a delay starts, then never finishes it.
struct StallingScheduler {
    entered: Arc<Notify>,
}

#[async_trait]
impl RetryScheduler for StallingScheduler {
    async fn delay(&self, _delay: Duration) {
        self.entered.notify_one();
        future::pending::<()>().await;
    }
}

#[derive(Default)]
struct RecordingLog {
    events: Mutex<Vec<(&'static str, LogDetail)>>,
}

impl RetryLog for Arc<RecordingLog> {
    fn log(&self, event: &'static str, detail: &dyn Fn() -> LogDetail) -> Result<(), StreamError> {
        self.events.lock().push((event, detail()));
        Ok(())
    }
}

struct FailingLog;

impl RetryLog for FailingLog {
    fn log(&self, _event: &'static str, _detail: &dyn Fn() -> LogDetail) -> Result<(), StreamError> {
        Err(StreamError::new("log sink unavailable"))
    }
}

// ========== Helpers ==========

fn request() -> RequestDescriptor {
    RequestDescriptor::get(TARGET.parse().unwrap())
}

fn config(retry_budget: u32) -> BodyRetryConfig {
    BodyRetryConfig::default().with_retry_budget(retry_budget)
}

fn wrapped(response: RetryResponse) -> RetryBody {
    match response.body {
        Some(ResponseBody::Wrapped(body)) => body,
        other => panic!("expected wrapped body, got {:?}", other),
    }
}

async fn run(
    transport: &Arc<ScriptedTransport>,
    config: BodyRetryConfig,
) -> crate::Result<Bytes> {
    let stage = BodyRetry::new(transport.clone(), config);
    let response = stage.execute(request(), DispatchContext::default()).await?;
    wrapped(response).collect_bytes().await
}

async fn drain(body: &mut RetryBody) -> (Vec<Bytes>, Option<BodyRetryError>) {
    let mut chunks = Vec::new();
    while let Some(item) = body.next().await {
        match item {
            Ok(chunk) => chunks.push(chunk),
            Err(e) => {
                assert!(body.next().await.is_none(), "items after terminal error");
                return (chunks, Some(e));
            }
        }
    }
    (chunks, None)
}

async fn join_driver(body: &mut RetryBody) {
    let driver = body.take_driver().unwrap();
    tokio::time::timeout(Duration::from_secs(5), driver)
        .await
        .expect("driver did not stop")
        .unwrap();
}

// ========== Gate ==========

#[tokio::test]
async fn test_zero_budget_rejected_before_dispatch() {
    let transport = ScriptedTransport::new(vec![respond(&["abc"], Tail::End)]);
    let stage = BodyRetry::new(transport.clone(), config(0));

    let err = stage
        .execute(request(), DispatchContext::default())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        BodyRetryError::PolicyRejected(PolicyRejection::NonPositiveBudget)
    ));
    assert_eq!(transport.calls(), 0);
}

#[tokio::test]
async fn test_unsafe_method_rejected_before_dispatch() {
    let transport = ScriptedTransport::new(vec![respond(&["abc"], Tail::End)]);
    let stage = BodyRetry::new(transport.clone(), config(2));
    let post = RequestDescriptor::new(Method::POST, TARGET.parse().unwrap());

    let err = stage
        .execute(post, DispatchContext::default())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        BodyRetryError::PolicyRejected(PolicyRejection::UnsafeMethod)
    ));
    assert_eq!(transport.calls(), 0);
}

#[tokio::test]
async fn test_stream_payload_rejected_before_dispatch() {
    let transport = ScriptedTransport::new(vec![respond(&["abc"], Tail::End)]);
    let stage = BodyRetry::new(transport.clone(), config(2));
    let put = RequestDescriptor::new(Method::PUT, TARGET.parse().unwrap()).with_payload(
        Payload::Stream(SinglePassStream::new(source(&["upload"], Tail::End))),
    );

    let err = stage
        .execute(put, DispatchContext::default())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        BodyRetryError::PolicyRejected(PolicyRejection::NonReplayablePayload)
    ));
    assert_eq!(transport.calls(), 0);
}

#[tokio::test]
async fn test_allow_unsafe_retry_wraps_post() {
    let transport = ScriptedTransport::new(vec![
        respond(&["par"], Tail::Fail("reset")),
        respond(&["created"], Tail::End),
    ]);
    let stage = BodyRetry::new(transport.clone(), config(1).with_allow_unsafe_retry(true));
    let post = RequestDescriptor::new(Method::POST, TARGET.parse().unwrap())
        .with_payload(Payload::Text("{}".to_string()));

    let response = stage.execute(post, DispatchContext::default()).await.unwrap();
    let bytes = wrapped(response).collect_bytes().await.unwrap();

    assert_eq!(bytes, Bytes::from_static(b"created"));
    assert_eq!(transport.calls(), 2);
}

// ========== Pass-through ==========

#[tokio::test]
async fn test_unsuccessful_first_response_is_not_wrapped() {
    let transport = ScriptedTransport::new(vec![Step::Respond(
        ResponseDescriptor::status(StatusCode::NOT_FOUND)
            .with_body(source(&["missing"], Tail::End)),
    )]);
    let stage = BodyRetry::new(transport.clone(), config(2));

    let response = stage
        .execute(request(), DispatchContext::default())
        .await
        .unwrap();

    assert!(!response.ok);
    assert_eq!(response.status, StatusCode::NOT_FOUND);
    assert!(!response.is_wrapped());
    assert_eq!(transport.calls(), 1);
}

#[tokio::test]
async fn test_bodiless_first_response_is_returned_as_is() {
    let transport =
        ScriptedTransport::new(vec![Step::Respond(ResponseDescriptor::status(StatusCode::NO_CONTENT))]);
    let stage = BodyRetry::new(transport.clone(), config(2));

    let response = stage
        .execute(request(), DispatchContext::default())
        .await
        .unwrap();

    assert!(response.ok);
    assert!(response.body.is_none());
}

#[tokio::test]
async fn test_first_dispatch_failure_is_returned() {
    let transport = ScriptedTransport::new(vec![Step::Fail("connection refused")]);
    let stage = BodyRetry::new(transport.clone(), config(2));

    let err = stage
        .execute(request(), DispatchContext::default())
        .await
        .unwrap_err();

    match err {
        BodyRetryError::Dispatch(e) => assert_eq!(e.message(), "connection refused"),
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(transport.calls(), 1);
}

#[tokio::test]
async fn test_declared_length_over_ceiling_skips_wrapping() {
    let transport = ScriptedTransport::new(vec![with_length(source(&["0123456789ab"], Tail::End), 12)]);
    let stage = BodyRetry::new(
        transport.clone(),
        config(2).with_max_buffered_bytes_per_attempt(10),
    );

    let response = stage
        .execute(request(), DispatchContext::default())
        .await
        .unwrap();

    assert!(!response.is_wrapped());
    let bytes = response.body.unwrap().collect_bytes().await.unwrap();
    assert_eq!(bytes, Bytes::from_static(b"0123456789ab"));
    assert_eq!(transport.calls(), 1);
}

#[tokio::test]
async fn test_unwrapped_body_failure_is_a_stream_error() {
    let transport = ScriptedTransport::new(vec![with_length(
        source(&["0123"], Tail::Fail("reset")),
        64,
    )]);
    let stage = BodyRetry::new(
        transport.clone(),
        config(2).with_max_buffered_bytes_per_attempt(10),
    );

    let response = stage
        .execute(request(), DispatchContext::default())
        .await
        .unwrap();
    let err = response.body.unwrap().collect_bytes().await.unwrap_err();

    assert!(matches!(err, BodyRetryError::Stream(_)));
    assert_eq!(transport.calls(), 1);
}

#[tokio::test]
async fn test_active_marker_passes_through() {
    let transport = ScriptedTransport::new(vec![respond(&["inner"], Tail::End)]);
    // A zero budget would be rejected if the gate ran.
    let stage = BodyRetry::new(transport.clone(), config(0));

    let response = stage
        .execute(request(), DispatchContext::default().wrapped())
        .await
        .unwrap();

    assert!(!response.is_wrapped());
    assert_eq!(transport.calls(), 1);
    assert!(transport.contexts.lock()[0].body_retry_active);
}

#[tokio::test]
async fn test_nested_stage_does_not_double_wrap() {
    let transport = ScriptedTransport::new(vec![
        respond(&["ab"], Tail::Fail("reset")),
        respond(&["abcd"], Tail::End),
    ]);
    let inner = Arc::new(BodyRetry::new(transport.clone(), config(3)));
    let outer = BodyRetry::new(NestedTransport(inner), config(1));

    let response = outer
        .execute(request(), DispatchContext::default())
        .await
        .unwrap();
    let bytes = wrapped(response).collect_bytes().await.unwrap();

    assert_eq!(bytes, Bytes::from_static(b"abcd"));
    assert_eq!(transport.calls(), 2);
}

/// Presents a stage as a transport, as a nested pipeline would.
struct NestedTransport(Arc<BodyRetry>);

#[async_trait]
impl Transport for NestedTransport {
    async fn attempt(
        &self,
        request: &RequestDescriptor,
        ctx: &DispatchContext,
    ) -> Result<ResponseDescriptor, BoxError> {
        let response = self.0.execute(request.clone(), ctx.clone()).await?;
        assert!(!response.is_wrapped());
        let body = response.body.map(|body| -> ByteStream {
            Box::pin(body.map(|item| item.map_err(|e| Box::new(e) as BoxError)))
        });
        Ok(ResponseDescriptor {
            ok: response.ok,
            status: response.status,
            headers: response.headers,
            body,
        })
    }
}

// ========== Buffering and retry ==========

#[tokio::test]
async fn test_single_clean_attempt() {
    let transport = ScriptedTransport::new(vec![respond(&["hel", "lo"], Tail::End)]);

    let bytes = run(&transport, config(2)).await.unwrap();

    assert_eq!(bytes, Bytes::from_static(b"hello"));
    assert_eq!(transport.calls(), 1);
}

#[tokio::test]
async fn test_failed_attempt_bytes_are_discarded() {
    let transport = ScriptedTransport::new(vec![
        respond(&["abc"], Tail::Fail("reset")),
        respond(&["def"], Tail::End),
    ]);

    let bytes = run(&transport, config(1)).await.unwrap();

    assert_eq!(bytes, Bytes::from_static(b"def"));
    assert_eq!(transport.calls(), 2);
}

#[tokio::test]
async fn test_budget_exhausted_reports_last_failure() {
    let transport = ScriptedTransport::new(vec![
        respond(&["abc"], Tail::Fail("first reset")),
        respond(&["de"], Tail::Fail("second reset")),
    ]);

    let err = run(&transport, config(1)).await.unwrap_err();

    match err {
        BodyRetryError::RetryBudgetExhausted { attempts, source } => {
            assert_eq!(attempts, 2);
            assert_eq!(source.message(), "second reset");
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(transport.calls(), 2);
}

#[tokio::test]
async fn test_no_bytes_reach_output_before_failure() {
    let transport = ScriptedTransport::new(vec![
        respond(&["abc"], Tail::Fail("reset")),
        respond(&["x"], Tail::Fail("reset")),
        respond(&["y"], Tail::Fail("reset")),
    ]);
    let stage = BodyRetry::new(transport.clone(), config(2));

    let response = stage
        .execute(request(), DispatchContext::default())
        .await
        .unwrap();
    let (chunks, err) = drain(&mut wrapped(response)).await;

    assert!(chunks.is_empty());
    assert!(matches!(
        err,
        Some(BodyRetryError::RetryBudgetExhausted { attempts: 3, .. })
    ));
    assert_eq!(transport.calls(), 3);
}

#[tokio::test]
async fn test_premature_close_is_retried() {
    let transport = ScriptedTransport::new(vec![
        with_length(source(&["abc"], Tail::End), 6),
        with_length(source(&["abc", "def"], Tail::End), 6),
    ]);

    let bytes = run(&transport, config(1)).await.unwrap();

    assert_eq!(bytes, Bytes::from_static(b"abcdef"));
    assert_eq!(transport.calls(), 2);
}

#[tokio::test]
async fn test_empty_chunks_are_not_forwarded() {
    let transport = ScriptedTransport::new(vec![respond(&["", "ab", "", "c"], Tail::End)]);
    let stage = BodyRetry::new(transport.clone(), config(1));

    let response = stage
        .execute(request(), DispatchContext::default())
        .await
        .unwrap();
    let (chunks, err) = drain(&mut wrapped(response)).await;

    assert!(err.is_none());
    assert!(chunks.iter().all(|chunk| !chunk.is_empty()));
    assert_eq!(chunks.concat(), b"abc".to_vec());
}

#[tokio::test]
async fn test_retries_share_request_identity() {
    let transport = ScriptedTransport::new(vec![
        respond(&["a"], Tail::Fail("reset")),
        respond(&["b"], Tail::End),
    ]);
    let ctx = DispatchContext::default();
    let request_id = ctx.request_id;
    let stage = BodyRetry::new(transport.clone(), config(1));

    let response = stage.execute(request(), ctx).await.unwrap();
    wrapped(response).collect_bytes().await.unwrap();

    let contexts = transport.contexts.lock();
    assert_eq!(contexts.len(), 2);
    assert!(contexts.iter().all(|ctx| ctx.body_retry_active));
    assert!(contexts.iter().all(|ctx| ctx.request_id == request_id));
}

#[tokio::test]
async fn test_outcome_is_deterministic() {
    let mut outcomes = Vec::new();
    for _ in 0..3 {
        let transport = ScriptedTransport::new(vec![
            respond(&["abc"], Tail::Fail("reset")),
            respond(&["de", "f"], Tail::End),
        ]);
        let bytes = run(&transport, config(1)).await.unwrap();
        outcomes.push((bytes, transport.calls()));
    }

    assert!(outcomes.windows(2).all(|pair| pair[0] == pair[1]));
}

#[tokio::test]
async fn test_output_available_before_first_attempt_ends() {
    let transport = ScriptedTransport::new(vec![respond(&["abc"], Tail::Hang)]);
    let stage = BodyRetry::new(transport.clone(), config(1));

    let response = stage
        .execute(request(), DispatchContext::default())
        .await
        .unwrap();
    let mut body = wrapped(response);

    let mut next = tokio_test::task::spawn(body.next());
    tokio_test::assert_pending!(next.poll());
    tokio::task::yield_now().await;
    tokio_test::assert_pending!(next.poll());
}

#[tokio::test]
async fn test_head_response_length_is_not_a_promise() {
    let transport = ScriptedTransport::new(vec![
        with_length(source(&[], Tail::End), 5),
        with_length(source(&[], Tail::End), 5),
    ]);
    let stage = BodyRetry::new(transport.clone(), config(1));
    let head = RequestDescriptor::new(Method::HEAD, TARGET.parse().unwrap());

    let response = stage.execute(head, DispatchContext::default()).await.unwrap();
    let bytes = wrapped(response).collect_bytes().await.unwrap();

    assert!(bytes.is_empty());
    assert_eq!(transport.calls(), 1);
}

#[tokio::test]
async fn test_no_content_length_is_not_a_promise() {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_LENGTH, HeaderValue::from(5u64));
    let no_content = || {
        Step::Respond(
            ResponseDescriptor::status(StatusCode::NO_CONTENT)
                .with_headers(headers.clone())
                .with_body(source(&[], Tail::End)),
        )
    };
    let transport = ScriptedTransport::new(vec![no_content(), no_content()]);

    let bytes = run(&transport, config(1)).await.unwrap();

    assert!(bytes.is_empty());
    assert_eq!(transport.calls(), 1);
}

#[tokio::test]
async fn test_not_modified_retry_ends_cleanly() {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_LENGTH, HeaderValue::from(5u64));
    let transport = ScriptedTransport::new(vec![
        respond(&["ab"], Tail::Fail("reset")),
        Step::Respond(ResponseDescriptor {
            ok: true,
            status: StatusCode::NOT_MODIFIED,
            headers,
            body: Some(source(&[], Tail::End)),
        }),
    ]);

    let bytes = run(&transport, config(1)).await.unwrap();

    assert!(bytes.is_empty());
    assert_eq!(transport.calls(), 2);
}

// ========== Ceiling ==========

#[tokio::test]
async fn test_overflow_streams_without_retry() {
    let transport = ScriptedTransport::new(vec![respond(&["abc", "def"], Tail::End)]);
    let log = Arc::new(RecordingLog::default());
    let stage = BodyRetry::new(
        transport.clone(),
        config(1).with_max_buffered_bytes_per_attempt(2),
    )
    .with_log(log.clone());

    let response = stage
        .execute(request(), DispatchContext::default())
        .await
        .unwrap();
    let bytes = wrapped(response).collect_bytes().await.unwrap();

    assert_eq!(bytes, Bytes::from_static(b"abcdef"));
    assert_eq!(transport.calls(), 1);
    let events = log.events.lock();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].0, EVENT_OVERFLOW);
}

#[tokio::test]
async fn test_failure_after_overflow_is_terminal() {
    let transport = ScriptedTransport::new(vec![
        respond(&["abc"], Tail::Fail("reset")),
        respond(&["never"], Tail::End),
    ]);
    let stage = BodyRetry::new(
        transport.clone(),
        config(1).with_max_buffered_bytes_per_attempt(2),
    );

    let response = stage
        .execute(request(), DispatchContext::default())
        .await
        .unwrap();
    let (chunks, err) = drain(&mut wrapped(response)).await;

    assert_eq!(chunks, vec![Bytes::from_static(b"abc")]);
    match err {
        Some(BodyRetryError::OverflowStream(e)) => assert_eq!(e.message(), "reset"),
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(transport.calls(), 1);
}

#[tokio::test]
async fn test_exact_ceiling_keeps_buffering() {
    let transport = ScriptedTransport::new(vec![
        respond(&["ab"], Tail::Fail("reset")),
        respond(&["cd"], Tail::End),
    ]);

    let bytes = run(&transport, config(1).with_max_buffered_bytes_per_attempt(2))
        .await
        .unwrap();

    assert_eq!(bytes, Bytes::from_static(b"cd"));
    assert_eq!(transport.calls(), 2);
}

// ========== Abort and cancellation ==========

#[tokio::test]
async fn test_failure_while_aborted_is_not_retried() {
    let transport = ScriptedTransport::new(vec![
        respond(&["abc"], Tail::Fail("reset")),
        respond(&["def"], Tail::End),
    ]);
    let signal = CancellationToken::new();
    signal.cancel();
    let ctx = DispatchContext::new(AbortContext::none().with_context_signal(signal));
    let stage = BodyRetry::new(transport.clone(), config(1));

    let response = stage.execute(request(), ctx).await.unwrap();
    let err = wrapped(response).collect_bytes().await.unwrap_err();

    match err {
        BodyRetryError::Aborted { source } => assert_eq!(source.message(), "reset"),
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(transport.calls(), 1);
}

#[tokio::test]
async fn test_close_releases_current_source() {
    let (body, dropped) = tracked(source(&["abc"], Tail::Hang));
    let transport = ScriptedTransport::new(vec![Step::Respond(ResponseDescriptor::ok(body))]);
    let stage = BodyRetry::new(transport.clone(), config(1));

    let response = stage
        .execute(request(), DispatchContext::default())
        .await
        .unwrap();
    let mut body = wrapped(response);
    body.close();
    join_driver(&mut body).await;

    assert!(dropped.load(Ordering::SeqCst));
    assert!(body.is_closed());
    assert!(body.next().await.is_none());
    assert_eq!(transport.calls(), 1);
}

#[tokio::test]
async fn test_drop_releases_current_source() {
    let (body, dropped) = tracked(source(&["abc"], Tail::Hang));
    let transport = ScriptedTransport::new(vec![Step::Respond(ResponseDescriptor::ok(body))]);
    let stage = BodyRetry::new(transport.clone(), config(1));

    let response = stage
        .execute(request(), DispatchContext::default())
        .await
        .unwrap();
    let mut body = wrapped(response);
    let driver = body.take_driver().unwrap();
    drop(body);
    tokio::time::timeout(Duration::from_secs(5), driver)
        .await
        .unwrap()
        .unwrap();

    assert!(dropped.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_close_during_delay_abandons_retry() {
    let (first, dropped) = tracked(source(&["abc"], Tail::Fail("reset")));
    let transport = ScriptedTransport::new(vec![
        Step::Respond(ResponseDescriptor::ok(first)),
        respond(&["def"], Tail::End),
    ]);
    let entered = Arc::new(Notify::new());
    let stage = BodyRetry::new(transport.clone(), config(1).with_retry_delay_ms(1_000))
        .with_scheduler(StallingScheduler {
            entered: entered.clone(),
        });

    let response = stage
        .execute(request(), DispatchContext::default())
        .await
        .unwrap();
    let mut body = wrapped(response);

    entered.notified().await;
    assert!(dropped.load(Ordering::SeqCst));
    body.close();
    join_driver(&mut body).await;

    assert_eq!(transport.calls(), 1);
}

#[tokio::test]
async fn test_close_during_retry_dispatch_abandons_retry() {
    let transport = ScriptedTransport::new(vec![
        respond(&["abc"], Tail::Fail("reset")),
        Step::Hang,
    ]);
    let stage = BodyRetry::new(transport.clone(), config(1));

    let response = stage
        .execute(request(), DispatchContext::default())
        .await
        .unwrap();
    let mut body = wrapped(response);

    while transport.calls() < 2 {
        tokio::task::yield_now().await;
    }
    body.close();
    join_driver(&mut body).await;

    assert_eq!(transport.calls(), 2);
}

#[tokio::test]
async fn test_response_arriving_after_close_is_released() {
    let (orphan, dropped) = tracked(source(&["late"], Tail::Hang));
    let transport = ScriptedTransport::new(vec![
        respond(&["abc"], Tail::Fail("reset")),
        Step::CloseThenRespond(ResponseDescriptor::ok(orphan)),
    ]);
    let stage = BodyRetry::new(transport.clone(), config(1));

    let response = stage
        .execute(request(), DispatchContext::default())
        .await
        .unwrap();
    let mut body = wrapped(response);
    let driver = body.take_driver().unwrap();
    *transport.consumer.lock() = Some(body);

    tokio::time::timeout(Duration::from_secs(5), driver)
        .await
        .expect("driver did not stop")
        .unwrap();

    assert!(dropped.load(Ordering::SeqCst));
    assert_eq!(transport.calls(), 2);
}

// ========== Retry dispatch ==========

#[tokio::test]
async fn test_retry_dispatch_failure_is_terminal() {
    let transport = ScriptedTransport::new(vec![
        respond(&["abc"], Tail::Fail("reset")),
        Step::Fail("connection refused"),
        respond(&["def"], Tail::End),
    ]);

    let err = run(&transport, config(3)).await.unwrap_err();

    match err {
        BodyRetryError::Dispatch(e) => assert_eq!(e.message(), "connection refused"),
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(transport.calls(), 2);
}

#[tokio::test]
async fn test_unsuccessful_retry_response_names_target() {
    let transport = ScriptedTransport::new(vec![
        respond(&["abc"], Tail::Fail("reset")),
        Step::Respond(ResponseDescriptor::status(StatusCode::SERVICE_UNAVAILABLE)),
    ]);

    let err = run(&transport, config(3)).await.unwrap_err();

    match err {
        BodyRetryError::RetryFailed {
            target,
            status,
            reason,
        } => {
            assert_eq!(target, TARGET);
            assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
            assert_eq!(reason, "unsuccessful response");
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(transport.calls(), 2);
}

#[tokio::test]
async fn test_bodiless_retry_response_fails() {
    let transport = ScriptedTransport::new(vec![
        respond(&["abc"], Tail::Fail("reset")),
        Step::Respond(ResponseDescriptor::status(StatusCode::NO_CONTENT)),
    ]);

    let err = run(&transport, config(3)).await.unwrap_err();

    assert!(matches!(
        err,
        BodyRetryError::RetryFailed {
            reason: "response has no body",
            ..
        }
    ));
}

#[tokio::test]
async fn test_driver_panic_becomes_internal_error() {
    let transport = ScriptedTransport::new(vec![
        respond(&["abc"], Tail::Fail("reset")),
        Step::Panic("transport exploded"),
    ]);

    let err = run(&transport, config(1)).await.unwrap_err();

    match err {
        BodyRetryError::Internal(message) => assert_eq!(message, "transport exploded"),
        other => panic!("unexpected error: {:?}", other),
    }
}

// ========== Scheduler and log ==========

#[tokio::test]
async fn test_configured_delay_goes_through_scheduler() {
    let transport = ScriptedTransport::new(vec![
        respond(&["a"], Tail::Fail("reset")),
        respond(&["b"], Tail::Fail("reset")),
        respond(&["c"], Tail::End),
    ]);
    let scheduler = Arc::new(RecordingScheduler::default());
    let stage = BodyRetry::new(transport.clone(), config(2).with_retry_delay_ms(250))
        .with_scheduler(scheduler.clone());

    let response = stage
        .execute(request(), DispatchContext::default())
        .await
        .unwrap();
    let bytes = wrapped(response).collect_bytes().await.unwrap();

    assert_eq!(bytes, Bytes::from_static(b"c"));
    assert_eq!(
        *scheduler.delays.lock(),
        vec![Duration::from_millis(250), Duration::from_millis(250)]
    );
}

#[tokio::test]
async fn test_zero_delay_skips_scheduler() {
    let transport = ScriptedTransport::new(vec![
        respond(&["a"], Tail::Fail("reset")),
        respond(&["b"], Tail::End),
    ]);
    let scheduler = Arc::new(RecordingScheduler::default());
    let stage = BodyRetry::new(transport.clone(), config(1)).with_scheduler(scheduler.clone());

    let response = stage
        .execute(request(), DispatchContext::default())
        .await
        .unwrap();
    wrapped(response).collect_bytes().await.unwrap();

    assert!(scheduler.delays.lock().is_empty());
}

#[tokio::test]
async fn test_retry_is_logged_with_detail() {
    let transport = ScriptedTransport::new(vec![
        respond(&["abc"], Tail::Fail("reset")),
        respond(&["def"], Tail::End),
    ]);
    let log = Arc::new(RecordingLog::default());
    let ctx = DispatchContext::default();
    let request_id = ctx.request_id;
    let stage = BodyRetry::new(transport.clone(), config(1).with_retry_delay_ms(0))
        .with_log(log.clone());

    let response = stage.execute(request(), ctx).await.unwrap();
    wrapped(response).collect_bytes().await.unwrap();

    let events = log.events.lock();
    assert_eq!(events.len(), 1);
    let (event, detail) = &events[0];
    assert_eq!(*event, EVENT_RETRY);
    assert_eq!(detail.request_id, request_id);
    assert_eq!(detail.url, TARGET);
    assert_eq!(detail.attempt, 1);
    assert_eq!(detail.max_attempts, 2);
    assert_eq!(detail.received_bytes, 3);
    assert_eq!(detail.error.as_deref(), Some("reset"));
}

#[tokio::test]
async fn test_log_failure_errors_output() {
    let transport = ScriptedTransport::new(vec![
        respond(&["abc"], Tail::Fail("reset")),
        respond(&["def"], Tail::End),
    ]);
    let stage = BodyRetry::new(transport.clone(), config(1)).with_log(FailingLog);

    let response = stage
        .execute(request(), DispatchContext::default())
        .await
        .unwrap();
    let err = wrapped(response).collect_bytes().await.unwrap_err();

    match err {
        BodyRetryError::Log(e) => assert_eq!(e.message(), "log sink unavailable"),
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(transport.calls(), 1);
}
