use std::path::PathBuf;
use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use desync_core::endpoint::Endpoint;
use desync_core::settings::Settings;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::cookies;
use crate::probe::{HostControl, HostCtx, ProbeKind, probe_order};

/// One scan target as ingested from the input source.
#[derive(Debug, Clone)]
pub struct Target {
    pub url: String,
    pub method: Option<String>,
    pub body: Option<String>,
    pub headers: Vec<(String, String)>,
}

impl Target {
    pub fn from_url(url: impl Into<String>) -> Self {
        Target {
            url: url.into(),
            method: None,
            body: None,
            headers: Vec::new(),
        }
    }
}

/// Scan one host end to end: parse, acquire cookies over both protocols,
/// dispatch probes, log per-probe summaries. Returns false only when the URL
/// itself was unusable.
pub async fn scan(target: Target, settings: Arc<Settings>, out_root: PathBuf) -> bool {
    let endpoint = match Endpoint::parse(&target.url) {
        Ok(ep) => ep,
        Err(e) => {
            error!(url = %target.url, error = %e, "skipping target");
            return false;
        }
    };
    let method = target
        .method
        .as_deref()
        .map(|m| m.trim().to_ascii_uppercase())
        .unwrap_or_else(|| settings.method.as_str().to_string());

    let mut headers = target.headers.clone();
    if let Some(info) = &endpoint.userinfo {
        headers.push((
            "Authorization".to_string(),
            format!("Basic {}", STANDARD.encode(info)),
        ));
    }

    // Cookie acquisition doubles as protocol-support detection.
    let h2_fetch = cookies::acquire(&endpoint, &method, &headers, true).await;
    let h1_fetch = cookies::acquire(&endpoint, &method, &headers, false).await;
    let h2_supported = h2_fetch.is_ok();
    let h1_supported = h1_fetch.is_ok();
    if let Err(e) = &h2_fetch {
        debug!(endpoint = %endpoint, error = %e, "HTTP/2 cookie acquisition failed");
    }
    if let Err(e) = &h1_fetch {
        debug!(endpoint = %endpoint, error = %e, "HTTP/1.1 cookie acquisition failed");
    }
    if !h1_supported && !h2_supported {
        error!(
            endpoint = %endpoint,
            "endpoint rejected cookie acquisition on both protocols; skipping host"
        );
        return true;
    }

    let mut jar: Vec<(String, String)> = Vec::new();
    let mut final_endpoint = endpoint.clone();
    if let Ok(fetch) = h1_fetch {
        merge_cookies(&mut jar, fetch.cookies);
        final_endpoint = fetch.final_endpoint;
    }
    if let Ok(fetch) = h2_fetch {
        merge_cookies(&mut jar, fetch.cookies);
        if !h1_supported {
            final_endpoint = fetch.final_endpoint;
        }
    }
    if final_endpoint != endpoint {
        info!(endpoint = %endpoint, rewritten = %final_endpoint, "cookie acquisition followed a redirect");
    }

    let (mut ctx, control) = HostCtx::new(final_endpoint, method, Arc::clone(&settings), out_root);
    ctx.h1_supported = h1_supported;
    ctx.h2_supported = h2_supported;
    ctx.headers = headers;
    ctx.cookies = jar;
    ctx.body = target.body.map(String::into_bytes).unwrap_or_default();
    ctx.dest = settings
        .dest_url
        .as_deref()
        .and_then(|u| Endpoint::parse(u).ok());

    let order = probe_order(settings.priority);
    if settings.concurrent {
        run_concurrent(ctx, control, order).await;
    } else {
        run_sequential(&ctx, order).await;
    }
    true
}

async fn run_sequential(ctx: &HostCtx, order: [ProbeKind; 3]) {
    for kind in order {
        let found = kind.run(ctx).await;
        if found && ctx.settings.exit_early {
            break;
        }
    }
}

/// All probe families in flight at once. The first success fires the
/// cancellation token; peers observe it between generator candidates, and
/// whatever request is on the wire completes on its own deadline.
async fn run_concurrent(ctx: HostCtx, mut control: HostControl, order: [ProbeKind; 3]) {
    let ctx = Arc::new(ctx);
    let mut tasks = JoinSet::new();
    for kind in order {
        let ctx = Arc::clone(&ctx);
        tasks.spawn(async move {
            kind.run(&ctx).await;
        });
    }

    loop {
        tokio::select! {
            joined = tasks.join_next() => {
                if joined.is_none() {
                    break;
                }
            }
            Some(_) = control.findings.recv() => {
                let _ = control.cancel.send(true);
            }
        }
    }
}

/// Merge by cookie name; names already in the jar win.
fn merge_cookies(jar: &mut Vec<(String, String)>, incoming: Vec<(String, String)>) {
    for (name, value) in incoming {
        if jar.iter().any(|(n, _)| *n == name) {
            continue;
        }
        jar.push((name, value));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use desync_core::settings::Level;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// An RFC-compliant HTTP/1.1 origin: answers every request with a 200
    /// and a small body, so no probe ever sees a differential.
    async fn spawn_compliant_server() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let (mut sock, _) = listener.accept().await.unwrap();
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 16 * 1024];
                    let _ = sock.read(&mut buf).await;
                    let _ = sock
                        .write_all(b"HTTP/1.1 200 OK\r\nSet-Cookie: sid=abc\r\nContent-Length: 2\r\n\r\nok")
                        .await;
                });
            }
        });
        port
    }

    fn fast_settings(concurrent: bool) -> Arc<Settings> {
        Arc::new(Settings {
            level: Level::Basic,
            timeout: Duration::from_millis(400),
            concurrent,
            ..Settings::default()
        })
    }

    #[tokio::test]
    async fn test_scan_compliant_host_finds_nothing() {
        let port = spawn_compliant_server().await;
        let dir = tempfile::tempdir().unwrap();

        let ok = scan(
            Target::from_url(format!("http://127.0.0.1:{port}/")),
            fast_settings(false),
            dir.path().to_path_buf(),
        )
        .await;

        assert!(ok);
        // All probes finish with status=failure; no PoC tree is created.
        assert!(!dir.path().join("result").exists());
    }

    #[tokio::test]
    async fn test_scan_concurrent_mode_completes_without_findings() {
        let port = spawn_compliant_server().await;
        let dir = tempfile::tempdir().unwrap();

        let ok = scan(
            Target::from_url(format!("http://127.0.0.1:{port}/")),
            fast_settings(true),
            dir.path().to_path_buf(),
        )
        .await;

        assert!(ok);
        assert!(!dir.path().join("result").exists());
    }

    #[tokio::test]
    async fn test_scan_skips_host_when_both_protocols_reject() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let (mut sock, _) = listener.accept().await.unwrap();
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 4096];
                    let _ = sock.read(&mut buf).await;
                    let _ = sock
                        .write_all(b"HTTP/1.1 403 Forbidden\r\nContent-Length: 0\r\n\r\n")
                        .await;
                });
            }
        });
        let dir = tempfile::tempdir().unwrap();

        let ok = scan(
            Target::from_url(format!("http://127.0.0.1:{port}/")),
            fast_settings(false),
            dir.path().to_path_buf(),
        )
        .await;

        // The URL itself was fine, but no probes ran.
        assert!(ok);
        assert!(!dir.path().join("result").exists());
    }

    #[test]
    fn test_merge_cookies_existing_names_win() {
        let mut jar = vec![("sid".to_string(), "h1".to_string())];
        merge_cookies(
            &mut jar,
            vec![
                ("sid".to_string(), "h2".to_string()),
                ("extra".to_string(), "x".to_string()),
            ],
        );
        assert_eq!(
            jar,
            vec![
                ("sid".to_string(), "h1".to_string()),
                ("extra".to_string(), "x".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_scan_rejects_unparseable_url() {
        let settings = Arc::new(Settings::default());
        let ok = scan(
            Target::from_url("::not a url::"),
            settings,
            PathBuf::from("."),
        )
        .await;
        assert!(!ok);
    }
}
