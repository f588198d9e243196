use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use desync_core::endpoint::Endpoint;
use desync_core::error::WireError;
use desync_core::escape::escape_non_printable;
use desync_core::tls;
use rustls_pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::frame;

/// Hard ceiling on a whole HTTP/2 exchange, independent of the configurable
/// HTTP/1 timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(6);
const DIAL_TIMEOUT: Duration = Duration::from_secs(2);
/// Upper bound on the body sample kept for classification.
const SAMPLE_CAP: usize = 100;
/// Received DATA chunks above this size get their window refilled eagerly.
const WINDOW_UPDATE_THRESHOLD: usize = 1024;
/// Probe streams are tiny; anything past this is not a probe response.
const MAX_BODY_BUFFER: usize = 512 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// ALPN "h2" over TLS.
    H2,
    /// Cleartext upgrade via `Upgrade: h2c`.
    H2c,
}

/// One HTTP/2 request. `authority`, `scheme` and `path` start out mirroring
/// the endpoint but are plain strings on purpose: the tunneling probe appends
/// CR/LF fragments to them and the encoder must not care.
#[derive(Debug, Clone)]
pub struct H2Request {
    pub endpoint: Endpoint,
    pub method: String,
    pub authority: String,
    pub scheme: String,
    pub path: String,
    pub query: Option<String>,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub mode: Mode,
    /// Header pair pushed through HPACK without validation. The name is
    /// ASCII-lowercased; a single leading space in the value is dropped
    /// (HPACK would not carry it, but some servers reinsert one).
    pub extra: Option<(Vec<u8>, Vec<u8>)>,
    token: u32,
}

impl H2Request {
    pub fn new(endpoint: &Endpoint, method: impl Into<String>) -> Self {
        let mode = if endpoint.is_tls() { Mode::H2 } else { Mode::H2c };
        H2Request {
            authority: endpoint.authority(),
            scheme: endpoint.scheme.as_str().to_string(),
            path: endpoint.path.clone(),
            query: endpoint.query.clone(),
            method: method.into(),
            headers: Vec::new(),
            body: Vec::new(),
            mode,
            extra: None,
            endpoint: endpoint.clone(),
            token: rand::random(),
        }
    }

    pub fn token(&self) -> u32 {
        self.token
    }

    /// Regenerate the cache-buster token for the next send.
    pub fn bust(&mut self) -> u32 {
        self.token = rand::random();
        self.token
    }

    /// `path[?query]&t=TOKEN`, token last.
    pub fn path_with_query(&self) -> String {
        let mut target = self.path.clone();
        if let Some(q) = self.query.as_deref()
            && !q.is_empty()
        {
            target.push('?');
            target.push_str(q);
        }
        if target.contains('?') {
            target.push_str(&format!("&t={}", self.token));
        } else {
            target.push_str(&format!("?t={}", self.token));
        }
        target
    }

    /// Report-time pseudo-header rendering with `\xHH` escaping.
    pub fn to_escaped_string(&self) -> String {
        let mut out = format!(
            "{} {} HTTP/2\r\n",
            escape_non_printable(self.method.as_bytes()),
            escape_non_printable(self.path_with_query().as_bytes())
        );
        out.push_str(&format!(
            ":authority: {}\r\n",
            escape_non_printable(self.authority.as_bytes())
        ));
        out.push_str(&format!(
            ":method: {}\r\n",
            escape_non_printable(self.method.as_bytes())
        ));
        out.push_str(&format!(
            ":path: {}\r\n",
            escape_non_printable(self.path_with_query().as_bytes())
        ));
        out.push_str(&format!(
            ":scheme: {}\r\n",
            escape_non_printable(self.scheme.as_bytes())
        ));
        for (name, value) in &self.headers {
            out.push_str(&format!(
                "{}: {}\r\n",
                escape_non_printable(name.as_bytes()),
                escape_non_printable(value.as_bytes())
            ));
        }
        if let Some((name, value)) = &self.extra {
            out.push_str(&format!(
                "{}: {}\r\n",
                escape_non_printable(name),
                escape_non_printable(value)
            ));
        }
        out.push_str("\r\n");
        out.push_str(&String::from_utf8_lossy(&self.body));
        out
    }
}

#[derive(Debug)]
pub struct H2Response {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body_sample: Vec<u8>,
}

impl H2Response {
    pub fn sample(&self) -> &[u8] {
        &self.body_sample
    }
}

trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}

/// Send one request on a fresh connection and read its response.
pub async fn round_trip(req: &H2Request) -> Result<H2Response, WireError> {
    timeout(REQUEST_TIMEOUT, exchange(req))
        .await
        .map_err(|_| WireError::Timeout)?
}

async fn exchange(req: &H2Request) -> Result<H2Response, WireError> {
    let endpoint = &req.endpoint;
    let tcp = timeout(
        DIAL_TIMEOUT,
        TcpStream::connect((endpoint.host.as_str(), endpoint.port)),
    )
    .await
    .map_err(|_| WireError::Connect("connect timeout".into()))?
    .map_err(|e| WireError::Connect(e.to_string()))?;

    match req.mode {
        Mode::H2 => {
            let cfg = tls::insecure_client_config(&[b"h2"]);
            let connector = tokio_rustls::TlsConnector::from(Arc::new(cfg));
            let name = ServerName::try_from(endpoint.host.clone())
                .map_err(|e| WireError::Tls(e.to_string()))?;
            let mut stream: Box<dyn Stream> = Box::new(
                timeout(DIAL_TIMEOUT, connector.connect(name, tcp))
                    .await
                    .map_err(|_| WireError::Tls("handshake timeout".into()))?
                    .map_err(|e| WireError::Tls(e.to_string()))?,
            );
            drive(&mut stream, req, false, Vec::new()).await
        }
        Mode::H2c => {
            let mut stream: Box<dyn Stream> = Box::new(tcp);
            let leftover = upgrade(&mut stream, req).await?;
            drive(&mut stream, req, true, leftover).await
        }
    }
}

/// Speak the HTTP/1.1 Upgrade handshake. Returns any bytes read past the 101
/// response headers (they belong to the HTTP/2 connection).
async fn upgrade(stream: &mut Box<dyn Stream>, req: &H2Request) -> Result<Vec<u8>, WireError> {
    let request = build_upgrade_request(req);
    stream
        .write_all(&request)
        .await
        .map_err(|e| WireError::Io(e.to_string()))?;

    let mut buf: Vec<u8> = Vec::with_capacity(1024);
    let headers_end = loop {
        let mut chunk = [0u8; 1024];
        let n = stream
            .read(&mut chunk)
            .await
            .map_err(|e| WireError::Io(e.to_string()))?;
        if n == 0 {
            return Err(WireError::Protocol(
                "connection closed during h2c upgrade".into(),
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        if buf.len() > 16 * 1024 {
            return Err(WireError::Protocol("oversized upgrade response".into()));
        }
    };

    let head = String::from_utf8_lossy(&buf[..headers_end]);
    if !head.starts_with("HTTP/1.1 101") {
        return Err(WireError::Protocol(format!(
            "h2c upgrade refused: {}",
            head.lines().next().unwrap_or("")
        )));
    }
    Ok(buf[headers_end..].to_vec())
}

fn build_upgrade_request(req: &H2Request) -> Vec<u8> {
    let mut out = Vec::with_capacity(512 + req.body.len());
    out.extend_from_slice(
        format!("{} {} HTTP/1.1\r\n", req.method, req.path_with_query()).as_bytes(),
    );
    let mut has_host = false;
    for (name, value) in &req.headers {
        if name.eq_ignore_ascii_case("host") {
            has_host = true;
        }
        out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
    }
    if !has_host {
        out.extend_from_slice(format!("Host: {}\r\n", req.authority).as_bytes());
    }
    let settings_token = STANDARD_NO_PAD.encode(frame::client_settings());
    out.extend_from_slice(
        format!(
            "Connection: Upgrade, HTTP2-Settings\r\nUpgrade: h2c\r\nHTTP2-Settings: {settings_token}\r\n"
        )
        .as_bytes(),
    );
    if let Some((name, value)) = &req.extra {
        let mut lowered = name.clone();
        lowered.make_ascii_lowercase();
        out.extend_from_slice(&lowered);
        out.push(b':');
        out.extend_from_slice(strip_leading_space(value));
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(&req.body);
    out
}

fn strip_leading_space(value: &[u8]) -> &[u8] {
    match value.first() {
        Some(b' ') => &value[1..],
        _ => value,
    }
}

/// HPACK-encode the request header block: pseudo-headers first, then user
/// headers lowercased, then the unvalidated extra pair. The encoder takes raw
/// byte slices, so nothing here rejects CR, LF or NUL.
fn encode_header_block(req: &H2Request) -> Vec<u8> {
    let mut fields: Vec<(Vec<u8>, Vec<u8>)> = Vec::with_capacity(req.headers.len() + 5);
    fields.push((b":authority".to_vec(), req.authority.clone().into_bytes()));
    fields.push((b":method".to_vec(), req.method.clone().into_bytes()));
    fields.push((b":path".to_vec(), req.path_with_query().into_bytes()));
    fields.push((b":scheme".to_vec(), req.scheme.clone().into_bytes()));
    for (name, value) in &req.headers {
        fields.push((
            name.to_ascii_lowercase().into_bytes(),
            value.clone().into_bytes(),
        ));
    }
    if let Some((name, value)) = &req.extra {
        let mut lowered = name.clone();
        lowered.make_ascii_lowercase();
        fields.push((lowered, strip_leading_space(value).to_vec()));
    }

    let mut encoder = hpack::Encoder::new();
    encoder.encode(fields.iter().map(|(n, v)| (n.as_slice(), v.as_slice())))
}

async fn drive(
    stream: &mut Box<dyn Stream>,
    req: &H2Request,
    upgraded: bool,
    leftover: Vec<u8>,
) -> Result<H2Response, WireError> {
    stream
        .write_all(frame::PREFACE)
        .await
        .map_err(|e| WireError::Io(e.to_string()))?;

    // Servers can only raise MAX_FRAME_SIZE above the 16 KiB default, so
    // splitting at the default is always within the negotiated limit even
    // when their SETTINGS have not arrived yet.
    let mut max_frame = frame::DEFAULT_MAX_FRAME_SIZE;
    if !upgraded {
        stream
            .write_all(&frame::client_settings())
            .await
            .map_err(|e| WireError::Io(e.to_string()))?;
        stream
            .write_all(&frame::window_update(0, frame::INITIAL_WINDOW))
            .await
            .map_err(|e| WireError::Io(e.to_string()))?;

        // One request per connection, stream id 1.
        let block = encode_header_block(req);
        let end_stream = req.body.is_empty();
        stream
            .write_all(&frame::header_frames(1, &block, max_frame, end_stream))
            .await
            .map_err(|e| WireError::Io(e.to_string()))?;
        if !req.body.is_empty() {
            stream
                .write_all(&frame::data_frames(1, &req.body, max_frame))
                .await
                .map_err(|e| WireError::Io(e.to_string()))?;
        }
    }
    stream
        .flush()
        .await
        .map_err(|e| WireError::Io(e.to_string()))?;

    read_response(stream, leftover, &mut max_frame).await
}

async fn read_response(
    stream: &mut Box<dyn Stream>,
    leftover: Vec<u8>,
    max_frame: &mut usize,
) -> Result<H2Response, WireError> {
    let mut buf = leftover;
    let mut decoder = hpack::Decoder::new();

    let mut status: Option<u16> = None;
    let mut headers: Vec<(String, String)> = Vec::new();
    let mut body: Vec<u8> = Vec::new();
    let mut headers_done = false;
    let mut stream_ended = false;
    // CONTINUATION accumulation.
    let mut cont_buf: Vec<u8> = Vec::new();
    let mut in_continuation = false;

    loop {
        // Pull a complete frame into the buffer.
        let header = loop {
            if let Some(h) = frame::parse_frame_header(&buf)
                && buf.len() >= frame::FRAME_HEADER_LEN + h.len
            {
                break h;
            }
            let mut chunk = [0u8; 4096];
            let n = stream
                .read(&mut chunk)
                .await
                .map_err(|e| WireError::Io(e.to_string()))?;
            if n == 0 {
                return Err(WireError::Protocol("connection closed mid-stream".into()));
            }
            buf.extend_from_slice(&chunk[..n]);
        };
        let payload: Vec<u8> =
            buf[frame::FRAME_HEADER_LEN..frame::FRAME_HEADER_LEN + header.len].to_vec();
        buf.drain(..frame::FRAME_HEADER_LEN + header.len);

        match header.kind {
            frame::TYPE_SETTINGS => {
                if header.flags & frame::FLAG_ACK == 0 {
                    for (id, value) in frame::parse_settings(&payload) {
                        if id == frame::SETTINGS_MAX_FRAME_SIZE {
                            *max_frame = value as usize;
                        }
                    }
                    stream
                        .write_all(&frame::settings_ack())
                        .await
                        .map_err(|e| WireError::Io(e.to_string()))?;
                }
            }
            frame::TYPE_HEADERS if header.stream_id == 1 => {
                let (start, end) = frame::header_block_range(&payload, header.flags);
                stream_ended |= header.flags & frame::FLAG_END_STREAM != 0;
                if header.flags & frame::FLAG_END_HEADERS != 0 {
                    decode_headers(&mut decoder, &payload[start..end], &mut status, &mut headers)?;
                    headers_done = true;
                } else {
                    cont_buf = payload[start..end].to_vec();
                    in_continuation = true;
                }
            }
            frame::TYPE_CONTINUATION if header.stream_id == 1 && in_continuation => {
                cont_buf.extend_from_slice(&payload);
                if header.flags & frame::FLAG_END_HEADERS != 0 {
                    let block = std::mem::take(&mut cont_buf);
                    decode_headers(&mut decoder, &block, &mut status, &mut headers)?;
                    headers_done = true;
                    in_continuation = false;
                }
            }
            frame::TYPE_DATA if header.stream_id == 1 => {
                let (start, end) = frame::data_range(&payload, header.flags);
                let chunk = &payload[start.min(payload.len())..end.min(payload.len())];
                if body.len() < MAX_BODY_BUFFER {
                    body.extend_from_slice(chunk);
                }
                let ended = header.flags & frame::FLAG_END_STREAM != 0;
                stream_ended |= ended;
                if !ended && chunk.len() > WINDOW_UPDATE_THRESHOLD {
                    let inc = chunk.len() as u32;
                    stream
                        .write_all(&frame::window_update(0, inc))
                        .await
                        .map_err(|e| WireError::Io(e.to_string()))?;
                    stream
                        .write_all(&frame::window_update(1, inc))
                        .await
                        .map_err(|e| WireError::Io(e.to_string()))?;
                }
            }
            frame::TYPE_RST_STREAM => {
                let code = frame::rst_error_code(&payload);
                return Err(WireError::Reset(frame::error_code_name(code).to_string()));
            }
            frame::TYPE_GOAWAY => {
                let code = frame::goaway_error_code(&payload);
                return Err(WireError::Protocol(format!(
                    "GOAWAY received: {}",
                    frame::error_code_name(code)
                )));
            }
            frame::TYPE_WINDOW_UPDATE => {}
            other => {
                debug!(kind = other, "ignoring unexpected frame");
            }
        }

        if stream_ended && headers_done {
            let status =
                status.ok_or_else(|| WireError::Protocol("response missing :status".into()))?;
            body.truncate(SAMPLE_CAP);
            return Ok(H2Response {
                status,
                headers,
                body_sample: body,
            });
        }
    }
}

fn decode_headers(
    decoder: &mut hpack::Decoder<'_>,
    block: &[u8],
    status: &mut Option<u16>,
    headers: &mut Vec<(String, String)>,
) -> Result<(), WireError> {
    let fields = decoder
        .decode(block)
        .map_err(|e| WireError::Protocol(format!("HPACK decode failed: {e:?}")))?;
    for (name, value) in fields {
        let name = String::from_utf8_lossy(&name).into_owned();
        let value = String::from_utf8_lossy(&value).into_owned();
        if name == ":status" {
            *status = value.parse().ok();
        } else if !name.starts_with(':') {
            headers.push((name, value));
        }
    }
    Ok(())
}
