//! End-to-end tests through the full HTTP → FastCGI path.

mod common;
use common::{MockAction, MockBackend};

#[tokio::test]
async fn test_status_and_body_are_reconstructed() {
    let socket = common::temp_socket("reconstruct.sock");
    let backend = MockBackend::start(
        &socket,
        0,
        vec![MockAction::Respond(
            "Status: 404 Not Found\r\nContent-Type: text/plain\r\n\r\nnope",
        )],
    )
    .await;
    let (url, _shutdown) = common::start_gateway(&socket).await;

    let response = reqwest::Client::new()
        .get(format!("{}/foo?x=1", url))
        .header("X-Test", "a")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 404);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "text/plain"
    );
    assert_eq!(response.text().await.unwrap(), "nope");

    let requests = backend.requests();
    assert_eq!(requests.len(), 1);
    let request = &requests[0];
    assert_eq!(request.param("REQUEST_METHOD"), Some("GET"));
    assert_eq!(request.param("PATH_INFO"), Some("/foo"));
    assert_eq!(request.param("QUERY_STRING"), Some("x=1"));
    assert_eq!(request.param("HTTP_X_TEST"), Some("a"));
    assert!(request.stdin.is_empty());
}

#[tokio::test]
async fn test_default_status_with_bare_lf_header_break() {
    let socket = common::temp_socket("bare-lf.sock");
    let _backend = MockBackend::start(
        &socket,
        0,
        vec![MockAction::Respond("Content-Type: text/plain\n\nhello")],
    )
    .await;
    let (url, _shutdown) = common::start_gateway(&socket).await;

    let response = reqwest::get(format!("{}/", url)).await.unwrap();
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(response.text().await.unwrap(), "hello");
}

#[tokio::test]
async fn test_stray_records_do_not_disturb_the_live_request() {
    let socket = common::temp_socket("stray.sock");
    let backend = MockBackend::start(
        &socket,
        0,
        vec![MockAction::RespondWithNoise(
            "Status: 200 OK\r\nContent-Type: text/plain\r\n\r\nclean",
        )],
    )
    .await;
    let (url, _shutdown) = common::start_gateway(&socket).await;

    // Unknown-id stdout, stderr, and management records all arrive before
    // the real response; none of them may leak into it.
    let response = reqwest::get(format!("{}/", url)).await.unwrap();
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(response.text().await.unwrap(), "clean");

    // The session survived the noise: a follow-up request still works.
    let response = reqwest::get(format!("{}/again", url)).await.unwrap();
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(response.text().await.unwrap(), "ok");
    assert_eq!(backend.requests().len(), 2);
}

#[tokio::test]
async fn test_post_body_reaches_backend_stdin() {
    let socket = common::temp_socket("post-body.sock");
    let backend = MockBackend::start(&socket, 0, Vec::new()).await;
    let (url, _shutdown) = common::start_gateway(&socket).await;

    let response = reqwest::Client::new()
        .post(format!("{}/submit", url))
        .header("Content-Type", "application/octet-stream")
        .body("payload")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);

    let requests = backend.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].stdin, b"payload");
    assert_eq!(requests[0].param("CONTENT_LENGTH"), Some("7"));
    assert_eq!(
        requests[0].param("CONTENT_TYPE"),
        Some("application/octet-stream")
    );
}

#[tokio::test]
async fn test_non_multiplexed_backend_serializes_requests() {
    let socket = common::temp_socket("serialized.sock");
    let backend = MockBackend::start(
        &socket,
        0,
        vec![
            MockAction::RespondDelayed(100, common::DEFAULT_RESPONSE),
            MockAction::RespondDelayed(100, common::DEFAULT_RESPONSE),
        ],
    )
    .await;
    let (url, _shutdown) = common::start_gateway(&socket).await;

    let client = reqwest::Client::new();
    let (first, second) = tokio::join!(
        client.get(format!("{}/a", url)).send(),
        client.get(format!("{}/b", url)).send(),
    );
    assert_eq!(first.unwrap().status().as_u16(), 200);
    assert_eq!(second.unwrap().status().as_u16(), 200);

    // Without FCGI_MPXS_CONNS the second request must wait its turn, and
    // the connection is not reused.
    assert_eq!(backend.max_in_progress(), 1);
    assert!(backend.requests().iter().all(|r| !r.keep_connection));
}

#[tokio::test]
async fn test_multiplexed_backend_interleaves_requests() {
    let socket = common::temp_socket("multiplexed.sock");
    let backend = MockBackend::start(
        &socket,
        1,
        vec![
            MockAction::RespondDelayed(150, common::DEFAULT_RESPONSE),
            MockAction::Respond(common::DEFAULT_RESPONSE),
        ],
    )
    .await;
    let (url, _shutdown) = common::start_gateway(&socket).await;

    let client = reqwest::Client::new();
    let (first, second) = tokio::join!(
        client.get(format!("{}/slow", url)).send(),
        client.get(format!("{}/fast", url)).send(),
    );
    assert_eq!(first.unwrap().status().as_u16(), 200);
    assert_eq!(second.unwrap().status().as_u16(), 200);

    assert_eq!(backend.max_in_progress(), 2);
    assert!(backend.requests().iter().all(|r| r.keep_connection));
}

#[tokio::test]
async fn test_end_request_before_header_break_is_bad_gateway() {
    let socket = common::temp_socket("truncated-head.sock");
    // The backend completes the request without ever finishing its header
    // section; there is nothing coherent to forward.
    let _backend = MockBackend::start(
        &socket,
        0,
        vec![MockAction::Respond("Status: 200 OK\r\nContent-Ty")],
    )
    .await;
    let (url, _shutdown) = common::start_gateway(&socket).await;

    let response = reqwest::get(format!("{}/", url)).await.unwrap();
    assert_eq!(response.status().as_u16(), 502);
}
