use desync_core::escape::escape_non_printable;

const RN: &[u8] = b"\r\n";

/// One HTTP/1.1 probe request.
///
/// The interesting part is `hdr_payload`: a raw header line injected into the
/// serialized request exactly as given, control bytes and embedded CR/LF
/// included, just before the optional Content-Length. Everything a probe
/// mutates lives either there or in `content_length`.
#[derive(Debug, Clone)]
pub struct Payload {
    pub method: String,
    pub path: String,
    /// Caller-supplied query string, without the cache-buster token.
    pub query: Option<String>,
    pub fragment: Option<String>,
    headers: Vec<(String, String)>,
    /// Raw header line written verbatim, no name/value split, no escaping.
    pub hdr_payload: Option<Vec<u8>>,
    /// Declared Content-Length; `None` omits the header entirely.
    pub content_length: Option<usize>,
    pub body: Vec<u8>,
    token: u32,
}

impl Payload {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Payload {
            method: method.into(),
            path: path.into(),
            query: None,
            fragment: None,
            headers: Vec::new(),
            hdr_payload: None,
            content_length: None,
            body: Vec::new(),
            token: rand::random(),
        }
    }

    /// Set a header, replacing any previous value under the same name.
    /// Insertion order is preserved on the wire.
    pub fn set_header(&mut self, name: &str, value: &str) {
        if let Some(slot) = self.headers.iter_mut().find(|(n, _)| n == name) {
            slot.1 = value.to_string();
        } else {
            self.headers.push((name.to_string(), value.to_string()));
        }
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// The current cache-buster token (the `t` query parameter).
    pub fn token(&self) -> u32 {
        self.token
    }

    /// Regenerate the cache-buster so the next send bypasses any cache in the
    /// chain. Returns the fresh token.
    pub fn bust(&mut self) -> u32 {
        self.token = rand::random();
        self.token
    }

    /// `path[?query]&t=TOKEN[#fragment]`; the token always lands after the
    /// caller-supplied query.
    fn request_target(&self) -> String {
        let mut target = self.path.clone();
        match self.query.as_deref() {
            Some(q) if !q.is_empty() => {
                target.push('?');
                target.push_str(q);
                target.push_str(&format!("&t={}", self.token));
            }
            _ => {
                if target.contains('?') {
                    target.push_str(&format!("&t={}", self.token));
                } else {
                    target.push_str(&format!("?t={}", self.token));
                }
            }
        }
        if let Some(f) = &self.fragment {
            target.push('#');
            target.push_str(f);
        }
        target
    }

    /// Serialize to the exact bytes written to the socket.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(512 + self.body.len());
        out.extend_from_slice(
            format!("{} {} HTTP/1.1\r\n", self.method, self.request_target()).as_bytes(),
        );
        for (name, value) in &self.headers {
            if value.is_empty() {
                continue;
            }
            out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
        }
        if let Some(line) = &self.hdr_payload {
            out.extend_from_slice(line);
            out.extend_from_slice(RN);
        }
        if let Some(cl) = self.content_length {
            out.extend_from_slice(format!("Content-Length: {cl}\r\n").as_bytes());
        }
        out.extend_from_slice(RN);
        out.extend_from_slice(&self.body);
        out
    }

    /// Report-time rendering: same structure, but non-printable bytes in
    /// header names, values and the injected line come out as `\xHH` so the
    /// PoC file survives a text editor.
    pub fn to_escaped_string(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "{} {} HTTP/1.1\r\n",
            self.method,
            self.request_target()
        ));
        for (name, value) in &self.headers {
            if value.is_empty() {
                continue;
            }
            out.push_str(&format!(
                "{}: {}\r\n",
                escape_non_printable(name.as_bytes()),
                escape_non_printable(value.as_bytes())
            ));
        }
        if let Some(line) = &self.hdr_payload {
            out.push_str(&escape_non_printable(line));
            out.push_str("\r\n");
        }
        if let Some(cl) = self.content_length {
            out.push_str(&format!("Content-Length: {cl}\r\n"));
        }
        out.push_str("\r\n");
        out.push_str(&String::from_utf8_lossy(&self.body));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_payload() -> Payload {
        let mut p = Payload::new("POST", "/login");
        p.set_header("Host", "example.com");
        p.set_header("User-Agent", "probe");
        p
    }

    #[test]
    fn test_serialization_shape() {
        let mut p = make_payload();
        p.body = b"x=1".to_vec();
        p.content_length = Some(3);
        let bytes = p.to_bytes();
        let text = String::from_utf8_lossy(&bytes);

        assert!(text.starts_with(&format!("POST /login?t={} HTTP/1.1\r\n", p.token())));
        assert!(text.contains("Host: example.com\r\n"));
        assert!(text.contains("Content-Length: 3\r\n"));
        assert!(text.ends_with("\r\n\r\nx=1"));
    }

    #[test]
    fn test_no_body_ends_with_blank_line() {
        let p = make_payload();
        let bytes = p.to_bytes();
        assert!(bytes.ends_with(b"\r\n\r\n"));
        assert!(!String::from_utf8_lossy(&bytes).contains("Content-Length"));
    }

    #[test]
    fn test_hdr_payload_goes_out_verbatim() {
        let mut p = make_payload();
        p.hdr_payload = Some(b"Transfer-Encoding\x0b: chunked".to_vec());
        p.content_length = Some(4);
        let bytes = p.to_bytes();

        let needle = b"Transfer-Encoding\x0b: chunked\r\nContent-Length: 4\r\n";
        assert!(
            bytes.windows(needle.len()).any(|w| w == needle),
            "raw header line must precede Content-Length, unescaped"
        );
    }

    #[test]
    fn test_escaped_render_escapes_only_the_report() {
        let mut p = make_payload();
        p.hdr_payload = Some(b"X: X\x01Transfer-Encoding: chunked".to_vec());
        let wire = p.to_bytes();
        let report = p.to_escaped_string();

        assert!(wire.windows(3).any(|w| w == b"X\x01T"));
        assert!(report.contains("X: X\\x01Transfer-Encoding: chunked"));
    }

    #[test]
    fn test_token_appends_after_existing_query() {
        let mut p = make_payload();
        p.query = Some("next=%2Fhome".to_string());
        let bytes = p.to_bytes();
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.starts_with(&format!(
            "POST /login?next=%2Fhome&t={} HTTP/1.1\r\n",
            p.token()
        )));
    }

    #[test]
    fn test_bust_changes_token() {
        let mut p = make_payload();
        let before = p.token();
        // A u32 collision three times in a row is not a thing.
        let changed = (0..3).any(|_| p.bust() != before);
        assert!(changed);
    }

    #[test]
    fn test_set_header_replaces() {
        let mut p = make_payload();
        p.set_header("Host", "other.example");
        let hosts: Vec<_> = p.headers().iter().filter(|(n, _)| n == "Host").collect();
        assert_eq!(hosts.len(), 1);
        assert_eq!(hosts[0].1, "other.example");
    }
}
