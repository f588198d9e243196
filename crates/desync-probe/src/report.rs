use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::probe::HostCtx;

/// Write a PoC report for the host. `content` is the escaped rendering of
/// the exact request that triggered the desync; `token` is its cache-buster
/// value, which doubles as the file name.
pub fn write(ctx: &HostCtx, content: &str, token: u32) -> Option<PathBuf> {
    match write_to(&ctx.out_root, &ctx.endpoint.host, token, content) {
        Ok(path) => Some(path),
        Err(e) => {
            warn!(endpoint = %ctx.endpoint, error = %e, "failed to write PoC report");
            None
        }
    }
}

/// `<root>/result/<host>/<token>s`, directories created as needed.
pub fn write_to(root: &Path, host: &str, token: u32, content: &str) -> io::Result<PathBuf> {
    let dir = root.join("result").join(host);
    fs::create_dir_all(&dir)?;
    let path = dir.join(format!("{token}s"));
    fs::write(&path, content)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_to_creates_tree_and_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_to(dir.path(), "example.com", 12345, "POST / HTTP/1.1\r\n").unwrap();

        assert_eq!(path, dir.path().join("result/example.com/12345s"));
        assert_eq!(fs::read_to_string(&path).unwrap(), "POST / HTTP/1.1\r\n");
    }

    #[test]
    fn test_write_to_overwrites_same_token() {
        let dir = tempfile::tempdir().unwrap();
        write_to(dir.path(), "h", 1, "first").unwrap();
        let path = write_to(dir.path(), "h", 1, "second").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "second");
    }
}
