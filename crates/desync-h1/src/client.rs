use std::sync::Arc;
use std::time::Duration;

use desync_core::endpoint::Endpoint;
use desync_core::error::WireError;
use desync_core::tls;
use rustls_pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

const DIAL_TIMEOUT: Duration = Duration::from_secs(2);
/// Upper bound on the body sample used for outcome classification.
const SAMPLE_CAP: usize = 100;
/// How long we wait for the first body byte once the headers are in.
const SAMPLE_GRACE: Duration = Duration::from_secs(1);
const MAX_HEADER_BYTES: usize = 64 * 1024;

/// A single parsed HTTP/1 response. The body is sampled, not drained; the
/// classifier only cares whether any byte arrived.
#[derive(Debug)]
pub struct H1Response {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body_sample: Vec<u8>,
}

impl H1Response {
    pub fn sample(&self) -> &[u8] {
        &self.body_sample
    }
}

trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}

/// Write `raw` to the endpoint verbatim and read one response.
///
/// A fresh connection per call: probe payloads leave server-side parsers in
/// states no second request should ever meet. Both the write and the read are
/// bounded by `io_timeout`; the socket drops on return.
pub async fn round_trip(
    endpoint: &Endpoint,
    raw: &[u8],
    io_timeout: Duration,
) -> Result<H1Response, WireError> {
    let mut stream = connect(endpoint).await?;

    timeout(io_timeout, stream.write_all(raw))
        .await
        .map_err(|_| WireError::Timeout)?
        .map_err(|e| WireError::Io(e.to_string()))?;

    timeout(io_timeout, read_response(&mut stream))
        .await
        .map_err(|_| WireError::Timeout)?
}

async fn connect(endpoint: &Endpoint) -> Result<Box<dyn Stream>, WireError> {
    let tcp = timeout(
        DIAL_TIMEOUT,
        TcpStream::connect((endpoint.host.as_str(), endpoint.port)),
    )
    .await
    .map_err(|_| WireError::Connect("connect timeout".into()))?
    .map_err(|e| WireError::Connect(e.to_string()))?;

    if !endpoint.is_tls() {
        return Ok(Box::new(tcp));
    }

    let cfg = tls::insecure_client_config(&[b"http/1.1"]);
    let connector = tokio_rustls::TlsConnector::from(Arc::new(cfg));
    let name = ServerName::try_from(endpoint.host.clone())
        .map_err(|e| WireError::Tls(e.to_string()))?;
    let stream = timeout(DIAL_TIMEOUT, connector.connect(name, tcp))
        .await
        .map_err(|_| WireError::Tls("handshake timeout".into()))?
        .map_err(|e| WireError::Tls(e.to_string()))?;
    Ok(Box::new(stream))
}

async fn read_response(stream: &mut Box<dyn Stream>) -> Result<H1Response, WireError> {
    let mut buf: Vec<u8> = Vec::with_capacity(2048);
    loop {
        let mut chunk = [0u8; 2048];
        let n = stream
            .read(&mut chunk)
            .await
            .map_err(|e| WireError::Io(e.to_string()))?;
        if n == 0 {
            return Err(WireError::Protocol(
                "connection closed before a full response".into(),
            ));
        }
        buf.extend_from_slice(&chunk[..n]);

        let mut header_storage = [httparse::EMPTY_HEADER; 64];
        let mut resp = httparse::Response::new(&mut header_storage);
        match resp.parse(&buf) {
            Ok(httparse::Status::Complete(headers_end)) => {
                let status = resp
                    .code
                    .ok_or_else(|| WireError::Protocol("response missing status".into()))?;
                let headers = resp
                    .headers
                    .iter()
                    .map(|h| {
                        (
                            h.name.to_string(),
                            String::from_utf8_lossy(h.value).into_owned(),
                        )
                    })
                    .collect();

                let mut sample = buf[headers_end..].to_vec();
                sample.truncate(SAMPLE_CAP);
                if sample.is_empty() {
                    sample = sample_body(stream).await;
                }
                return Ok(H1Response {
                    status,
                    headers,
                    body_sample: sample,
                });
            }
            Ok(httparse::Status::Partial) => {
                if buf.len() > MAX_HEADER_BYTES {
                    return Err(WireError::Protocol("oversized response headers".into()));
                }
            }
            Err(e) => return Err(WireError::Protocol(e.to_string())),
        }
    }
}

/// Wait briefly for at least one body byte. EOF or grace expiry yields an
/// empty sample, which the classifier reads as a disconnect or a hang
/// depending on elapsed time.
async fn sample_body(stream: &mut Box<dyn Stream>) -> Vec<u8> {
    let mut sample = vec![0u8; SAMPLE_CAP];
    match timeout(SAMPLE_GRACE, stream.read(&mut sample)).await {
        Ok(Ok(n)) => {
            sample.truncate(n);
            sample
        }
        Ok(Err(e)) => {
            debug!(error = %e, "body sample read failed");
            Vec::new()
        }
        Err(_) => Vec::new(),
    }
}
