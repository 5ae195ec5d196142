//! HTTP server setup and gateway dispatch.
//!
//! # Responsibilities
//! - Create the Axum router with the catch-all bridge handler
//! - Wire up middleware (tracing)
//! - Translate each HTTP request into a bridged backend request
//! - Stream the reconstructed response back to the client

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    response::{IntoResponse, Response},
    routing::any,
    Router,
};
use futures_util::TryStreamExt;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::trace::TraceLayer;

use crate::config::GatewayConfig;
use crate::gateway::request::{cgi_params, BodyStream, BoxError};
use crate::gateway::{BridgeRequest, GatewayHandle, ServerInfo};
use crate::lifecycle::Shutdown;

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub gateway: GatewayHandle,
    pub server: ServerInfo,
}

/// HTTP front end of the gateway.
pub struct HttpServer {
    router: Router,
}

impl HttpServer {
    /// Create a new HTTP server bridging to the given gateway.
    ///
    /// `port` is the bound listener port, advertised to the backend as
    /// SERVER_PORT.
    pub fn new(config: &GatewayConfig, gateway: GatewayHandle, port: u16) -> Self {
        let state = AppState {
            gateway,
            server: ServerInfo::new(&config.server, port),
        };
        // Every path goes to the backend; there is no routing table.
        let router = Router::new()
            .route("/{*path}", any(bridge_handler))
            .route("/", any(bridge_handler))
            .with_state(state)
            .layer(TraceLayer::new_for_http());
        Self { router }
    }

    /// Run the server, accepting connections on the given listener.
    pub async fn run(self, listener: TcpListener, shutdown: Shutdown) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTP server starting");

        let mut stop = shutdown.subscribe();
        axum::serve(listener, self.router)
            .with_graceful_shutdown(async move {
                let _ = stop.recv().await;
            })
            .await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

/// Catch-all handler: bridge the request and stream the response back.
async fn bridge_handler(State(state): State<AppState>, request: Request<Body>) -> Response {
    let (parts, body) = request.into_parts();
    let method = parts.method.clone();
    let target = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_owned())
        .unwrap_or_else(|| parts.uri.path().to_owned());
    let params = cgi_params(&parts, &state.server);

    // Only methods that carry a body get a stdin stream; everything else
    // closes stdin immediately on dispatch.
    let body = if BridgeRequest::method_has_body(&method) {
        let stream = body
            .into_data_stream()
            .map_err(|err| Box::new(err) as BoxError);
        Some(Box::pin(stream) as BodyStream)
    } else {
        None
    };

    let (reply, reply_rx) = oneshot::channel();
    let bridged = BridgeRequest {
        method,
        target,
        params,
        body,
        reply,
    };
    if !state.gateway.dispatch(bridged) {
        return bad_gateway("Gateway is shut down");
    }

    match reply_rx.await {
        Ok(head) => {
            let mut builder = Response::builder().status(head.status);
            for (name, value) in &head.headers {
                builder = builder.header(name, value);
            }
            match builder.body(Body::from_stream(ReceiverStream::new(head.body))) {
                Ok(response) => response,
                Err(err) => {
                    tracing::error!(error = %err, "Invalid backend response head");
                    bad_gateway("Invalid backend response")
                }
            }
        }
        // The gateway dropped the reply: the request was aborted before any
        // headers were produced.
        Err(_) => bad_gateway("Backend request failed"),
    }
}

fn bad_gateway(reason: &'static str) -> Response {
    (StatusCode::BAD_GATEWAY, reason).into_response()
}
