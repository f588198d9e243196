use std::fmt;
use std::time::Duration;

use tracing::warn;

/// HTTP method used for probe requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Head,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Head => "HEAD",
        }
    }

    /// Case-insensitive parse; anything unknown falls back to POST.
    pub fn parse(s: &str) -> Method {
        match s.trim().to_ascii_uppercase().as_str() {
            "GET" => Method::Get,
            "POST" => Method::Post,
            "HEAD" => Method::Head,
            other => {
                warn!(method = other, "unknown method, falling back to POST");
                Method::Post
            }
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mutation intensity for the header generators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Basic,
    Double,
    Exhaustive,
}

impl Level {
    pub fn parse(s: &str) -> Level {
        match s.trim().to_ascii_lowercase().as_str() {
            "basic" => Level::Basic,
            "double" => Level::Double,
            "exhaustive" => Level::Exhaustive,
            other => {
                warn!(level = other, "unknown test level, falling back to basic");
                Level::Basic
            }
        }
    }
}

/// Order in which the probe families run against a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    ClTeH2,
    ClH2Te,
    TeClH2,
    TeH2Cl,
    H2ClTe,
    H2TeCl,
}

impl Priority {
    pub fn parse(s: &str) -> Priority {
        match s.trim().to_ascii_uppercase().as_str() {
            "CLTEH2" => Priority::ClTeH2,
            "CLH2TE" => Priority::ClH2Te,
            "TECLH2" => Priority::TeClH2,
            "TEH2CL" => Priority::TeH2Cl,
            "H2CLTE" => Priority::H2ClTe,
            "H2TECL" => Priority::H2TeCl,
            other => {
                warn!(priority = other, "unknown priority, falling back to CLTEH2");
                Priority::ClTeH2
            }
        }
    }
}

/// Process-wide scan configuration, read-only after startup. Each host gets
/// an `Arc<Settings>` handle rather than reaching for a global.
#[derive(Debug, Clone)]
pub struct Settings {
    pub method: Method,
    pub level: Level,
    pub priority: Priority,
    /// Per-request write/read deadline for HTTP/1.1 probes.
    pub timeout: Duration,
    /// Number of hosts scanned in parallel.
    pub threads: usize,
    /// Stop probing a host after its first finding.
    pub exit_early: bool,
    /// Run the probe families of one host concurrently.
    pub concurrent: bool,
    pub verbose: bool,
    /// Out-of-band host woven into generated PoC payloads.
    pub dest_url: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            method: Method::Post,
            level: Level::Basic,
            priority: Priority::ClTeH2,
            timeout: Duration::from_secs(5),
            threads: 100,
            exit_early: true,
            concurrent: false,
            verbose: false,
            dest_url: None,
        }
    }
}
