// Filesystem helpers shared by the network engine and supervisors.

use crate::net::error::{NetworkError, NetworkResult};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

/// Create a directory (and parents) with a specific mode.
pub fn ensure_dir(path: &Path, mode: u32) -> NetworkResult<()> {
    if !path.exists() {
        std::fs::create_dir_all(path).map_err(NetworkError::Io)?;
    }
    let perms = std::fs::Permissions::from_mode(mode);
    std::fs::set_permissions(path, perms).map_err(NetworkError::Io)?;
    Ok(())
}

/// Write a file atomically: write to `<path>.tmp`, then rename into place.
/// Readers polling the file (e.g. the forkdns forwarder watching its servers
/// list) never observe a partial write.
pub fn write_atomic(path: &Path, contents: &[u8]) -> NetworkResult<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, contents).map_err(NetworkError::Io)?;
    std::fs::rename(&tmp, path).map_err(NetworkError::Io)?;
    Ok(())
}

/// Read a newline-separated list file, skipping blank lines.
pub fn read_lines(path: &Path) -> NetworkResult<Vec<String>> {
    let contents = std::fs::read_to_string(path).map_err(NetworkError::Io)?;
    Ok(contents
        .lines()
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .collect())
}

/// Remove a file if it exists; missing files collapse to success.
pub fn remove_if_exists(path: &Path) -> NetworkResult<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(NetworkError::Io(e)),
    }
}
