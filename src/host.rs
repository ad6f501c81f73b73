//! Host identity resolution.
//!
//! Only the binary calls into this module; the library receives the host
//! name as a plain string.

use std::process::Command;

use tracing::warn;

/// Name used when every lookup fails. Resolves to the default policy.
pub const UNKNOWN_HOST: &str = "unknown-host";

/// Picks the host identity: CLI flag, then the configured name (which
/// already carries `BENCHGRID_HOST`), then the system hostname.
pub fn resolve(cli: Option<&str>, configured: Option<&str>) -> String {
    pick(cli, configured).unwrap_or_else(system_hostname)
}

fn pick(cli: Option<&str>, configured: Option<&str>) -> Option<String> {
    [cli, configured]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|h| !h.is_empty())
        .map(str::to_string)
}

/// Local network hostname. Never fails; falls back to [`UNKNOWN_HOST`].
pub fn system_hostname() -> String {
    let from_file = std::fs::read_to_string("/etc/hostname").ok();
    let from_env = std::env::var("HOSTNAME").ok();
    let candidates = [from_file, from_env];
    if let Some(name) = candidates
        .iter()
        .flatten()
        .map(|s| s.trim())
        .find(|s| !s.is_empty())
    {
        return name.to_string();
    }

    match Command::new("uname").arg("-n").output() {
        Ok(out) if out.status.success() => {
            let name = String::from_utf8_lossy(&out.stdout).trim().to_string();
            if !name.is_empty() {
                return name;
            }
        }
        Ok(_) | Err(_) => {}
    }

    warn!("could not determine hostname, using {UNKNOWN_HOST}");
    UNKNOWN_HOST.to_string()
}
