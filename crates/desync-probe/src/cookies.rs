use std::time::Duration;

use bytes::Bytes;
use desync_core::endpoint::Endpoint;
use desync_core::tls;
use http::header::{LOCATION, SET_COOKIE};
use http_body_util::Empty;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use thiserror::Error;
use tokio::time::timeout;
use tracing::debug;
use url::Url;

use crate::probe::USER_AGENT;

/// Hard ceiling on one cookie-acquisition attempt, redirects included.
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_REDIRECTS: usize = 10;

#[derive(Debug, Error)]
pub enum CookieError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("endpoint rejected us with status {0}")]
    Rejected(u16),
    #[error("too many redirects")]
    TooManyRedirects,
    #[error("cookie acquisition timed out")]
    Timeout,
}

/// What one acquisition produced: the jar contents and the endpoint after
/// any redirects.
#[derive(Debug)]
pub struct CookieFetch {
    pub cookies: Vec<(String, String)>,
    pub final_endpoint: Endpoint,
}

/// Fetch cookies through a stock HTTP client, forcing either HTTP/2 or
/// HTTP/1.1. Redirects are followed (up to 10) preserving the method;
/// success doubles as protocol-support detection for the host.
pub async fn acquire(
    endpoint: &Endpoint,
    method: &str,
    headers: &[(String, String)],
    force_h2: bool,
) -> Result<CookieFetch, CookieError> {
    timeout(
        ACQUIRE_TIMEOUT,
        follow_redirects(endpoint, method, headers, force_h2),
    )
    .await
    .map_err(|_| CookieError::Timeout)?
}

async fn follow_redirects(
    endpoint: &Endpoint,
    method: &str,
    headers: &[(String, String)],
    force_h2: bool,
) -> Result<CookieFetch, CookieError> {
    let tls_config = tls::insecure_client_config(&[]);
    let base = hyper_rustls::HttpsConnectorBuilder::new()
        .with_tls_config(tls_config)
        .https_or_http();
    let connector = if force_h2 {
        base.enable_http2().build()
    } else {
        base.enable_http1().build()
    };
    let client: Client<_, Empty<Bytes>> = Client::builder(TokioExecutor::new())
        .http2_only(force_h2)
        .build(connector);

    let mut current = endpoint.clone();
    let mut jar: Vec<(String, String)> = Vec::new();

    for _ in 0..=MAX_REDIRECTS {
        let uri: http::Uri = current
            .to_string()
            .parse()
            .map_err(|e: http::uri::InvalidUri| CookieError::Request(e.to_string()))?;
        let mut builder = http::Request::builder()
            .method(method)
            .uri(uri)
            .header("User-Agent", USER_AGENT)
            .header("Cache-Control", "no-store")
            .header("Pragma", "no-cache")
            .header("Accept", "*/*");
        for (name, value) in headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        let request = builder
            .body(Empty::new())
            .map_err(|e| CookieError::Request(e.to_string()))?;

        let response: hyper::Response<hyper::body::Incoming> = client
            .request(request)
            .await
            .map_err(|e| CookieError::Request(e.to_string()))?;
        collect_cookies(response.headers(), &mut jar);

        if response.status().is_redirection() {
            let Some(location) = response.headers().get(LOCATION).and_then(|v| v.to_str().ok())
            else {
                return Err(CookieError::Request("redirect without Location".into()));
            };
            current = resolve_redirect(&current, location)?;
            debug!(endpoint = %current, "following redirect");
            continue;
        }
        if !response.status().is_success() {
            return Err(CookieError::Rejected(response.status().as_u16()));
        }
        return Ok(CookieFetch {
            cookies: jar,
            final_endpoint: current,
        });
    }
    Err(CookieError::TooManyRedirects)
}

/// Merge Set-Cookie headers into the jar. Existing names win; the jar is
/// append-only.
fn collect_cookies(headers: &http::HeaderMap, jar: &mut Vec<(String, String)>) {
    for raw in headers.get_all(SET_COOKIE) {
        let Ok(text) = raw.to_str() else { continue };
        let pair = text.split(';').next().unwrap_or("").trim();
        let Some((name, value)) = pair.split_once('=') else {
            continue;
        };
        if name.is_empty() || jar.iter().any(|(n, _)| n == name) {
            continue;
        }
        jar.push((name.to_string(), value.to_string()));
    }
}

fn resolve_redirect(current: &Endpoint, location: &str) -> Result<Endpoint, CookieError> {
    let base =
        Url::parse(&current.to_string()).map_err(|e| CookieError::Request(e.to_string()))?;
    let next = base
        .join(location)
        .map_err(|e| CookieError::Request(e.to_string()))?;
    Endpoint::parse(next.as_str()).map_err(|e| CookieError::Request(e.to_string()))
}
