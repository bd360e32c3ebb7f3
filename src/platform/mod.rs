//! Platform-specific browser executable discovery
//!
//! The executable is resolved once when the application starts and then
//! stored in [`crate::RenderConfig::executable`].

use crate::{Error, Result};
use log::{debug, error};
use std::io;
use std::path::PathBuf;
use std::process::Command;

/// Binary looked up on PATH on Android (Termux)
pub const ANDROID_BROWSER: &str = "chromium-browser";

/// Edge ships with every Windows install at this location
pub const WINDOWS_BROWSER: &str = r"C:\Program Files (x86)\Microsoft\Edge\Application\msedge.exe";

/// Bare command name, resolved through PATH when the browser is spawned
pub const LINUX_BROWSER: &str = "chromium-browser";

/// Operating systems with a known discovery rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Platform {
    Android,
    Windows,
    Linux,
    Other(String),
}

impl Platform {
    /// The platform this binary was built for.
    pub fn current() -> Self {
        Self::from_os(std::env::consts::OS)
    }

    /// Map a `std::env::consts::OS` value to a platform.
    pub fn from_os(os: &str) -> Self {
        match os {
            "android" => Platform::Android,
            "windows" => Platform::Windows,
            "linux" => Platform::Linux,
            other => Platform::Other(other.to_string()),
        }
    }
}

/// Resolve the browser executable for `platform`, asking the OS via `which`
/// where a lookup is needed.
///
/// `Ok(None)` means there is no rule for this platform and the backend should
/// search for a browser itself.
pub fn resolve_executable(platform: &Platform) -> Result<Option<PathBuf>> {
    resolve_with(platform, which)
}

/// Same as [`resolve_executable`] with an injectable command lookup.
pub fn resolve_with<F>(platform: &Platform, lookup: F) -> Result<Option<PathBuf>>
where
    F: Fn(&str) -> io::Result<Option<PathBuf>>,
{
    let resolved = match platform {
        Platform::Android => match lookup(ANDROID_BROWSER) {
            Ok(Some(path)) if !path.as_os_str().is_empty() => Some(path),
            Ok(_) => {
                let msg = format!("{} not found in PATH", ANDROID_BROWSER);
                error!("Error getting {} path: {}", ANDROID_BROWSER, msg);
                return Err(Error::ConfigError(msg));
            }
            Err(e) => {
                error!("Error getting {} path: {}", ANDROID_BROWSER, e);
                return Err(Error::ConfigError(format!(
                    "failed to look up {}: {}",
                    ANDROID_BROWSER, e
                )));
            }
        },
        Platform::Windows => Some(PathBuf::from(WINDOWS_BROWSER)),
        Platform::Linux => Some(PathBuf::from(LINUX_BROWSER)),
        Platform::Other(_) => None,
    };

    match &resolved {
        Some(path) => debug!("Using executable path: {}", path.display()),
        None => debug!("No executable rule for {:?}; relying on browser auto-detection", platform),
    }

    Ok(resolved)
}

/// Ask the shell's `which` for the full path of `binary`.
fn which(binary: &str) -> io::Result<Option<PathBuf>> {
    let output = Command::new("which").arg(binary).output()?;
    if !output.status.success() {
        return Ok(None);
    }

    let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if path.is_empty() {
        Ok(None)
    } else {
        Ok(Some(PathBuf::from(path)))
    }
}
