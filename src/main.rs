use std::collections::HashMap;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{ArgAction, Parser};
use desync_core::settings::{Level, Method, Priority, Settings};
use desync_probe::host::{self, Target};
use serde::Deserialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "desync", about = "Bulk HTTP request smuggling (desync) scanner", version)]
struct Cli {
    /// Target list: one URL per line, or a JSON array of
    /// {url, method, body, headers} when the path ends in .json.
    /// Reads URL lines from stdin when omitted.
    #[arg(short = 'i', long)]
    input_file: Option<PathBuf>,

    /// HTTP method for probe requests (GET, POST or HEAD)
    #[arg(short = 'X', long, default_value = "POST")]
    method: String,

    /// Mutation intensity: basic, double or exhaustive
    #[arg(long, default_value = "basic")]
    test: String,

    /// Out-of-band host woven into generated PoC payloads
    #[arg(long)]
    dest_url: Option<String>,

    /// Probe family order: CLTEH2, CLH2TE, TECLH2, TEH2CL, H2CLTE or H2TECL
    #[arg(short = 'p', long, default_value = "CLTEH2")]
    priority: String,

    /// Per-request timeout in seconds for HTTP/1.1 probes
    #[arg(short = 'T', long, default_value_t = 5)]
    timeout: u64,

    /// Number of hosts scanned in parallel
    #[arg(short = 't', long, default_value_t = 100)]
    threads: usize,

    /// Stop probing a host after its first finding
    #[arg(short = 'e', long, default_value_t = true, action = ArgAction::Set, num_args = 1)]
    exit_early: bool,

    /// Run the probe families of each host concurrently
    #[arg(short = 'c', long, default_value_t = false, action = ArgAction::Set, num_args = 1)]
    concurrent: bool,

    /// Log probe traffic at debug level
    #[arg(short = 'v', long, default_value_t = false, action = ArgAction::Set, num_args = 0..=1, default_missing_value = "true")]
    verbose: bool,
}

#[derive(Debug, Deserialize)]
struct JsonTarget {
    url: String,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    headers: Option<HashMap<String, String>>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let settings = Arc::new(Settings {
        method: Method::parse(&cli.method),
        level: Level::parse(&cli.test),
        priority: Priority::parse(&cli.priority),
        timeout: Duration::from_secs(cli.timeout.max(1)),
        threads: cli.threads.max(1),
        exit_early: cli.exit_early,
        concurrent: cli.concurrent,
        verbose: cli.verbose,
        dest_url: cli.dest_url,
    });

    let targets = load_targets(cli.input_file.as_deref())?;
    if targets.is_empty() {
        anyhow::bail!("no targets to scan");
    }
    tracing::info!(targets = targets.len(), "starting scan");
    let out_root = std::env::current_dir().context("cannot resolve working directory")?;

    let semaphore = Arc::new(Semaphore::new(settings.threads));
    let mut tasks = JoinSet::new();
    for target in targets {
        let permit = semaphore
            .clone()
            .acquire_owned()
            .await
            .context("worker pool closed")?;
        let settings = Arc::clone(&settings);
        let out_root = out_root.clone();
        tasks.spawn(async move {
            let _permit = permit;
            host::scan(target, settings, out_root).await
        });
    }

    let mut any_scannable = false;
    while let Some(joined) = tasks.join_next().await {
        if let Ok(scanned) = joined {
            any_scannable |= scanned;
        }
    }
    if !any_scannable {
        anyhow::bail!("no scannable targets: every URL failed to parse");
    }
    Ok(())
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_targets(path: Option<&Path>) -> anyhow::Result<Vec<Target>> {
    match path {
        None => {
            let stdin = std::io::stdin();
            let mut targets = Vec::new();
            for line in stdin.lock().lines() {
                let line = line.context("failed to read stdin")?;
                push_url_line(&mut targets, &line);
            }
            Ok(targets)
        }
        Some(p) if p.extension().and_then(|e| e.to_str()) == Some("json") => {
            let raw = std::fs::read_to_string(p)
                .with_context(|| format!("cannot read {}", p.display()))?;
            let entries: Vec<JsonTarget> = serde_json::from_str(&raw)
                .with_context(|| format!("invalid JSON target list in {}", p.display()))?;
            Ok(entries
                .into_iter()
                .map(|e| Target {
                    url: e.url,
                    method: e.method,
                    body: e.body,
                    headers: e
                        .headers
                        .map(|h| h.into_iter().collect())
                        .unwrap_or_default(),
                })
                .collect())
        }
        Some(p) => {
            let raw = std::fs::read_to_string(p)
                .with_context(|| format!("cannot read {}", p.display()))?;
            let mut targets = Vec::new();
            for line in raw.lines() {
                push_url_line(&mut targets, line);
            }
            Ok(targets)
        }
    }
}

fn push_url_line(targets: &mut Vec<Target>, line: &str) {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return;
    }
    targets.push(Target::from_url(line));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn test_load_targets_from_line_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "https://a.example\n\n# comment\nb.example:8443").unwrap();

        let targets = load_targets(Some(file.path())).unwrap();
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].url, "https://a.example");
        assert_eq!(targets[1].url, "b.example:8443");
    }

    #[test]
    fn test_load_targets_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("targets.json");
        std::fs::write(
            &path,
            r#"[
                {"url": "https://a.example/login", "method": "GET",
                 "headers": {"X-Api-Key": "k"}},
                {"url": "https://b.example", "body": "x=1"}
            ]"#,
        )
        .unwrap();

        let targets = load_targets(Some(&path)).unwrap();
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].method.as_deref(), Some("GET"));
        assert_eq!(
            targets[0].headers,
            vec![("X-Api-Key".to_string(), "k".to_string())]
        );
        assert_eq!(targets[1].body.as_deref(), Some("x=1"));
    }

    #[test]
    fn test_load_targets_rejects_bad_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("targets.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(load_targets(Some(&path)).is_err());
    }
}
