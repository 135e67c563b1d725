// Sysctl access via /proc/sys. Keys use the dotted-path form with slashes,
// e.g. "net/ipv4/ip_forward", matching what the engine builds from interface
// names (which may themselves contain dots, e.g. VLAN devices "eth0.100").

use crate::net::error::{NetworkError, NetworkResult};
use std::path::Path;

fn sysctl_path(key: &str) -> String {
    format!("/proc/sys/{}", key)
}

/// Read a sysctl value. A missing key surfaces as io::ErrorKind::NotFound so
/// callers can distinguish "kernel feature absent" from real failures.
pub fn sysctl_get(key: &str) -> NetworkResult<String> {
    let path = sysctl_path(key);
    let value = std::fs::read_to_string(&path).map_err(NetworkError::Io)?;
    Ok(value)
}

/// Write a sysctl value. Idempotent: re-writing the current value is a no-op
/// from the kernel's perspective.
pub fn sysctl_set(key: &str, value: &str) -> NetworkResult<()> {
    let path = sysctl_path(key);
    std::fs::write(&path, value).map_err(NetworkError::Io)?;
    Ok(())
}

/// Whether a sysctl key exists at all.
pub fn sysctl_exists(key: &str) -> bool {
    Path::new(&sysctl_path(key)).exists()
}

/// List the per-interface entries under a sysctl conf directory, e.g.
/// "net/ipv6/conf" yields ["all", "default", "lo", ...].
pub fn sysctl_entries(dir: &str) -> NetworkResult<Vec<String>> {
    let mut entries = Vec::new();
    for entry in std::fs::read_dir(sysctl_path(dir)).map_err(NetworkError::Io)? {
        let entry = entry.map_err(NetworkError::Io)?;
        if let Some(name) = entry.file_name().to_str() {
            entries.push(name.to_string());
        }
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_key_is_not_found() {
        let err = sysctl_get("net/ipv4/no_such_sysctl_key").unwrap_err();
        match err {
            NetworkError::Io(e) => assert_eq!(e.kind(), std::io::ErrorKind::NotFound),
            other => panic!("expected io error, got {}", other),
        }
    }
}
