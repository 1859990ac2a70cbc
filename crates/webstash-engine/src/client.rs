//! The reqwest-backed upstream client.
//!
//! Redirects are surfaced to the caller rather than followed (the proxy
//! relays `Location` to the browser), and compressed bodies arrive decoded,
//! with `Content-Encoding`/`Content-Length` already dropped by reqwest.

use std::time::Duration;
use webstash_core::client::{UpstreamClient, UpstreamRequest, UpstreamResponse};
use webstash_core::header::Header;
use webstash_core::{Error, Result};

#[derive(Debug, Clone)]
pub struct HttpClient {
    client: reqwest::Client,
}

impl HttpClient {
    pub fn new(proxy_server: Option<&str>) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(Duration::from_secs(10));
        if let Some(proxy) = proxy_server {
            let proxy_url = if proxy.contains("://") {
                proxy.to_string()
            } else {
                format!("http://{proxy}")
            };
            let proxy = reqwest::Proxy::all(proxy_url)
                .map_err(|e| Error::Config(format!("invalid proxy: {e}")))?;
            builder = builder.proxy(proxy);
        }
        let client = builder
            .build()
            .map_err(|e| Error::Fetch(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait::async_trait]
impl UpstreamClient for HttpClient {
    async fn fetch(&self, request: UpstreamRequest) -> Result<UpstreamResponse> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|e| Error::Fetch(format!("invalid method: {e}")))?;

        let mut builder = self
            .client
            .request(method, &request.url)
            .timeout(request.timeout);
        for (name, value) in request.header.iter() {
            if let (Ok(name), Ok(value)) = (
                reqwest::header::HeaderName::from_bytes(name.as_bytes()),
                reqwest::header::HeaderValue::from_str(value),
            ) {
                builder = builder.header(name, value);
            }
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body.clone());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| Error::Fetch(e.to_string()))?;

        let status = response.status().as_u16();
        let mut header = Header::new();
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                header.append(name.as_str(), value);
            }
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| Error::Fetch(e.to_string()))?
            .to_vec();

        Ok(UpstreamResponse {
            status,
            header,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::get, Router};
    use std::net::SocketAddr;
    use webstash_core::client::UpstreamClient as _;

    async fn serve(app: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    fn request(url: String) -> UpstreamRequest {
        UpstreamRequest {
            url,
            method: "GET".into(),
            header: Header::new(),
            body: Vec::new(),
            timeout: Duration::from_secs(2),
        }
    }

    #[tokio::test]
    async fn fetches_a_plain_body() {
        let app = Router::new().route("/", get(|| async { "hello" }));
        let addr = serve(app).await;

        let client = HttpClient::new(None).unwrap();
        let response = client.fetch(request(format!("http://{addr}/"))).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body, b"hello");
    }

    #[tokio::test]
    async fn redirects_are_surfaced_not_followed() {
        let app = Router::new()
            .route(
                "/",
                get(|| async {
                    (
                        axum::http::StatusCode::MOVED_PERMANENTLY,
                        [(axum::http::header::LOCATION, "/elsewhere")],
                        "",
                    )
                }),
            )
            .route("/elsewhere", get(|| async { "should not be fetched" }));
        let addr = serve(app).await;

        let client = HttpClient::new(None).unwrap();
        let response = client.fetch(request(format!("http://{addr}/"))).await.unwrap();
        assert_eq!(response.status, 301);
        assert_eq!(response.header.get("Location"), Some("/elsewhere"));
    }

    #[tokio::test]
    async fn timeouts_surface_as_fetch_errors() {
        let app = Router::new().route(
            "/",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                "late"
            }),
        );
        let addr = serve(app).await;

        let client = HttpClient::new(None).unwrap();
        let mut req = request(format!("http://{addr}/"));
        req.timeout = Duration::from_millis(50);
        assert!(client.fetch(req).await.is_err());
    }

    #[tokio::test]
    async fn request_bodies_and_headers_pass_through() {
        let app = Router::new().route(
            "/echo",
            axum::routing::post(
                |headers: axum::http::HeaderMap, body: String| async move {
                    let token = headers
                        .get("x-token")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("")
                        .to_string();
                    format!("{token}:{body}")
                },
            ),
        );
        let addr = serve(app).await;

        let client = HttpClient::new(None).unwrap();
        let mut req = request(format!("http://{addr}/echo"));
        req.method = "POST".into();
        req.header.append("X-Token", "abc");
        req.body = b"payload".to_vec();
        let response = client.fetch(req).await.unwrap();
        assert_eq!(response.body, b"abc:payload");
    }
}
