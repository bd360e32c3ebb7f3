//! Render configuration

use crate::retry::RetryPolicy;
use crate::{SessionOptions, Viewport};
use std::path::PathBuf;
use std::time::Duration;

/// Default directory screenshots are written to (relative to the working directory)
pub const DEFAULT_OUTPUT_DIR: &str = "caching/puppeteer";

/// Default deadline for one render attempt
pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(60);

/// Default quiet period that counts as network idle
pub const DEFAULT_NETWORK_IDLE: Duration = Duration::from_millis(500);

/// Configuration injected into a [`crate::Renderer`].
///
/// Resolve the browser executable once at startup (see
/// [`crate::platform::resolve_executable`]) and store it here rather than
/// looking it up per render.
///
/// # Examples
///
/// ```
/// let cfg = htmlshot::RenderConfig::default();
/// assert_eq!(cfg.retry.max_attempts, 3);
/// assert!(cfg.output_dir.ends_with("puppeteer"));
/// ```
#[derive(Debug, Clone)]
pub struct RenderConfig {
    /// Browser executable; `None` lets the backend search for one
    pub executable: Option<PathBuf>,
    /// Directory screenshots are written to; created on demand
    pub output_dir: PathBuf,
    /// Attempt count and pause between attempts
    pub retry: RetryPolicy,
    /// Deadline for a single attempt, session launch included
    pub attempt_timeout: Duration,
    /// Quiet period after load before capturing
    pub network_idle: Duration,
    /// Extra browser command-line switches
    pub extra_args: Vec<String>,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            executable: None,
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            retry: RetryPolicy::default(),
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
            network_idle: DEFAULT_NETWORK_IDLE,
            extra_args: Vec::new(),
        }
    }
}

impl RenderConfig {
    /// Session options for one attempt at `viewport`.
    pub fn session_options(&self, viewport: Viewport) -> SessionOptions {
        SessionOptions {
            executable: self.executable.clone(),
            viewport,
            network_idle: self.network_idle,
            step_timeout: self.attempt_timeout,
            extra_args: self.extra_args.clone(),
        }
    }
}
