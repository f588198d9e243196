use desync_h2::H2Request;
use tracing::{debug, info};

use crate::probe::HostCtx;

/// One injection site in the HTTP/2-to-HTTP/1.1 translation.
struct Site {
    name: &'static str,
    /// CRLF payload with a throwaway header tail; smoke-tests whether the
    /// front end forwards the injected bytes at all.
    test: &'static str,
    /// Same shape, but the tail overrides Host. If the translation honors
    /// it, routing changes and the origin answers with an error.
    confirm: &'static str,
    apply: fn(&mut H2Request, &str),
}

fn inject_method(req: &mut H2Request, payload: &str) {
    req.method = payload.to_string();
}

fn inject_authority(req: &mut H2Request, payload: &str) {
    req.authority.push_str(payload);
}

fn inject_scheme(req: &mut H2Request, payload: &str) {
    req.scheme.push_str(payload);
}

fn inject_path(req: &mut H2Request, payload: &str) {
    req.path.push_str(payload);
}

fn inject_header_name(req: &mut H2Request, payload: &str) {
    req.headers.push((payload.to_string(), "bar".to_string()));
}

fn inject_header_value(req: &mut H2Request, payload: &str) {
    req.headers.push(("foo".to_string(), payload.to_string()));
}

const SITES: [Site; 6] = [
    Site {
        name: "method",
        test: "GET / HTTP/1.1\r\nFoo: bar",
        confirm: "GET / HTTP/1.1\r\nHost: thisisadummyhost\r\n\r\n",
        apply: inject_method,
    },
    Site {
        name: "authority",
        test: "\r\nFoo: bar",
        confirm: "\r\nHost: thisisadummyhost\r\n\r\n",
        apply: inject_authority,
    },
    Site {
        name: "scheme",
        test: "\r\nFoo: bar",
        confirm: "\r\nHost: thisisadummyhost\r\n\r\n",
        apply: inject_scheme,
    },
    Site {
        name: "path",
        test: "?a=b HTTP/1.1\r\nFoo: bar",
        confirm: "?a=b HTTP/1.1\r\nHost: thisisadummyhost\r\n\r\n",
        apply: inject_path,
    },
    Site {
        name: "custom header key",
        test: "foo: bar\r\nx-my-hdr: x-val",
        confirm: "foo: bar\r\nhost: thisisadummyhost\r\n\r\n",
        apply: inject_header_name,
    },
    Site {
        name: "custom header value",
        test: "bar\r\nx-my-hdr: x-val",
        confirm: "bar\r\nhost: thisisadummyhost\r\n\r\n",
        apply: inject_header_value,
    },
];

/// Probe the six pseudo-header / header injection sites. Findings are
/// log-only; a tunneling suspicion has no single-request PoC.
pub async fn run(ctx: &HostCtx) {
    if !ctx.h2_supported {
        return;
    }
    info!(endpoint = %ctx.endpoint, "running H2 request-tunneling tests");

    for site in &SITES {
        if ctx.cancelled() {
            return;
        }

        let mut req = ctx.base_h2_request(None);
        (site.apply)(&mut req, site.test);
        req.bust();
        let first = match desync_h2::round_trip(&req).await {
            Ok(resp) => resp,
            Err(e) => {
                debug!(endpoint = %ctx.endpoint, error = %e, "tunnel test send failed");
                continue;
            }
        };
        if first.status >= 400 {
            debug!(
                endpoint = %ctx.endpoint,
                status = first.status,
                "{} injection rejected outright",
                site.name
            );
            continue;
        }

        let mut req = ctx.base_h2_request(None);
        (site.apply)(&mut req, site.confirm);
        req.bust();
        let second = match desync_h2::round_trip(&req).await {
            Ok(resp) => resp,
            Err(e) => {
                debug!(endpoint = %ctx.endpoint, error = %e, "tunnel confirm send failed");
                continue;
            }
        };
        if second.status >= 400 {
            // The overridden Host changed where the request was routed.
            info!(
                endpoint = %ctx.endpoint,
                status = second.status,
                payload = %req.to_escaped_string(),
                "{} injection might be interesting",
                site.name
            );
        } else {
            debug!(
                endpoint = %ctx.endpoint,
                status = second.status,
                "{} injection did not affect routing; false positive",
                site.name
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use desync_core::endpoint::Endpoint;

    fn make_request() -> H2Request {
        let endpoint = Endpoint::parse("https://example.com/app").unwrap();
        H2Request::new(&endpoint, "POST")
    }

    #[test]
    fn test_path_injection_lands_in_request_target() {
        let mut req = make_request();
        inject_path(&mut req, "?a=b HTTP/1.1\r\nFoo: bar");
        assert!(req.path_with_query().starts_with("/app?a=b HTTP/1.1\r\nFoo: bar"));
    }

    #[test]
    fn test_authority_and_scheme_injections_append() {
        let mut req = make_request();
        inject_authority(&mut req, "\r\nFoo: bar");
        inject_scheme(&mut req, "\r\nFoo: bar");
        assert_eq!(req.authority, "example.com\r\nFoo: bar");
        assert_eq!(req.scheme, "https\r\nFoo: bar");
    }

    #[test]
    fn test_header_site_injections() {
        let mut req = make_request();
        inject_header_name(&mut req, "foo: bar\r\nx-my-hdr: x-val");
        inject_header_value(&mut req, "bar\r\nx-my-hdr: x-val");
        assert!(req.headers.iter().any(|(n, v)| n == "foo: bar\r\nx-my-hdr: x-val" && v == "bar"));
        assert!(req.headers.iter().any(|(n, v)| n == "foo" && v == "bar\r\nx-my-hdr: x-val"));
    }

    #[test]
    fn test_every_confirm_payload_overrides_host() {
        for site in &SITES {
            assert!(site.confirm.to_ascii_lowercase().contains("host: thisisadummyhost"));
        }
    }
}
