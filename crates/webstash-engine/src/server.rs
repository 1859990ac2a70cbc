//! The axum adapter: converts HTTP traffic to and from the engine's request
//! types and drives graceful shutdown.

use crate::engine::{Engine, ProxyRequest, ProxyResponse};
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::Response;
use axum::Router;
use std::sync::Arc;
use tokio::net::TcpListener;
use webstash_core::event::{self, Event};
use webstash_core::header::Header;
use webstash_core::{Error, Result};

/// Binds an ephemeral loopback port.
pub async fn bind() -> Result<TcpListener> {
    TcpListener::bind("127.0.0.1:0")
        .await
        .map_err(|e| Error::Server(format!("binding failed: {e}")))
}

/// Serves until a termination signal arrives or the engine requests
/// shutdown (the exit endpoint).
pub async fn run(engine: Arc<Engine>, listener: TcpListener) -> Result<()> {
    let app = Router::new()
        .fallback(handle)
        .with_state(Arc::clone(&engine));

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = engine.shutdown_requested() => {}
                _ = termination_signal() => {}
            }
        })
        .await
        .map_err(|e| Error::Server(e.to_string()))
}

async fn handle(State(engine): State<Arc<Engine>>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let body = axum::body::to_bytes(body, usize::MAX)
        .await
        .unwrap_or_default();

    let mut header = Header::new();
    for (name, value) in &parts.headers {
        if let Ok(value) = value.to_str() {
            header.append(name.as_str(), value);
        }
    }

    let proxy_request = ProxyRequest {
        method: parts.method.as_str().to_string(),
        path: parts.uri.path().to_string(),
        query: parts.uri.query().unwrap_or_default().to_string(),
        header,
        body: body.to_vec(),
    };

    let response = engine.handle_request(proxy_request).await;
    into_http_response(response)
}

fn into_http_response(response: ProxyResponse) -> Response {
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut builder = Response::builder().status(status);
    for (name, value) in response.header.iter() {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            builder = builder.header(name, value);
        }
    }
    builder
        .body(Body::from(response.body))
        .unwrap_or_else(|error| {
            event::emit(Event::Error, error);
            Response::new(Body::empty())
        })
}

async fn termination_signal() {
    let interrupt = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(_) => return std::future::pending().await,
        };
        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(signal) => signal,
            Err(_) => return std::future::pending().await,
        };
        tokio::select! {
            _ = terminate.recv() => {}
            _ = hangup.recv() => {}
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => {}
        _ = terminate => {}
    }
}
