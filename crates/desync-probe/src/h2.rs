use desync_core::classify::Outcome;
use desync_core::settings::Priority;
use tracing::{debug, info};

use crate::mutation::{self, PayloadKind};
use crate::probe::{HostCtx, send_h2};
use crate::{report, tunnel};

/// H2.CL, H2.TE and H2.CRLF desync tests, followed by the request-tunneling
/// check.
pub async fn run(ctx: &HostCtx) -> bool {
    if !ctx.h2_supported || ctx.cancelled() {
        return false;
    }
    let mut found = false;
    for kind in kind_order(ctx.settings.priority) {
        if ctx.cancelled() {
            return false;
        }
        if run_kind(ctx, kind).await {
            found = true;
            if ctx.settings.exit_early {
                return true;
            }
        }
    }
    tunnel::run(ctx).await;
    found
}

/// Internal order of the H2 payload kinds, derived from the global priority.
fn kind_order(priority: Priority) -> [PayloadKind; 3] {
    match priority {
        Priority::H2ClTe => [PayloadKind::Cl, PayloadKind::Te, PayloadKind::Crlf],
        Priority::H2TeCl => [PayloadKind::Te, PayloadKind::Cl, PayloadKind::Crlf],
        _ => [PayloadKind::Crlf, PayloadKind::Cl, PayloadKind::Te],
    }
}

async fn run_kind(ctx: &HostCtx, kind: PayloadKind) -> bool {
    info!(endpoint = %ctx.endpoint, "running H2.{kind} desync tests");
    let candidates = mutation::generate(kind, ctx.settings.level);

    let mut found = 0usize;
    for (name, values) in &candidates {
        for value in values {
            if ctx.cancelled() {
                return false;
            }
            let extra = build_extra(kind, name, value);
            if h2_candidate(ctx, extra).await {
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
            "finished H2.{kind} desync tests: PoC payload stored under result/{}",
            ctx.endpoint.host
        );
    } else {
        info!(
            endpoint = %ctx.endpoint,
            status = "failure",
            "finished H2.{kind} desync tests: no issues found"
        );
    }
    found > 0
}

/// Turn a generated (name, value) into the unvalidated header pair for this
/// payload kind.
pub(crate) fn build_extra(kind: PayloadKind, name: &[u8], value: &[u8]) -> (Vec<u8>, Vec<u8>) {
    match kind {
        // The CL generator enumerates name perturbations; the value is the
        // declared length that disagrees with the actual body.
        PayloadKind::Cl => (value.to_vec(), b"10".to_vec()),
        PayloadKind::Te => (name.to_vec(), value.to_vec()),
        PayloadKind::Crlf => {
            let mut v = value.to_vec();
            // CL-derived injections still need their length to become a
            // complete header line.
            if name.starts_with(b"Test1") {
                v.extend_from_slice(b": 10");
            }
            (name.to_vec(), v)
        }
    }
}

/// One smuggled header pair.
///
/// The truncated chunked body `1\r\nG` hangs only if a hop behind the
/// HTTP/2 front end interprets the pair as Transfer-Encoding and waits for
/// the rest of the stream; the terminated body must come back normal. Three
/// consecutive pairs make a finding.
pub(crate) async fn h2_candidate(ctx: &HostCtx, extra: (Vec<u8>, Vec<u8>)) -> bool {
    let mut req = ctx.base_h2_request(Some(extra));

    let mut streak = 0u8;
    loop {
        req.body = b"1\r\nG".to_vec();
        let suspect = send_h2(ctx, &mut req).await;
        if suspect != Outcome::Timeout {
            if suspect == Outcome::Disconnected {
                debug!(endpoint = %ctx.endpoint, "disconnected before timeout");
            }
            return false;
        }

        req.body = b"1\r\nG\r\n0\r\n\r\n".to_vec();
        let confirm = send_h2(ctx, &mut req).await;
        match confirm {
            Outcome::SocketError => return false,
            Outcome::Normal => {
                streak += 1;
                if streak < 3 {
                    continue;
                }
                // The PoC is the hanging variant.
                req.body = b"1\r\nG".to_vec();
                info!(
                    endpoint = %ctx.endpoint,
                    "potential H2 desync issue found - {}@{}",
                    ctx.method, ctx.endpoint
                );
                report::write(ctx, &req.to_escaped_string(), req.token());
                return true;
            }
            _ => {
                debug!(
                    endpoint = %ctx.endpoint,
                    "timeout on both partial and full chunked bodies"
                );
                return false;
            }
        }
    }
}
