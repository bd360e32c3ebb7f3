//! htmlshot
//!
//! Renders HTML text to PNG screenshots with a headless Chromium-family
//! browser, retrying failed attempts, and deletes generated screenshots on
//! request.
//!
//! # Features
//!
//! - **CDP Backend** (default): launches headless Chrome/Chromium/Edge through
//!   the Chrome DevTools Protocol
//! - **Pluggable sessions**: any [`Launcher`] can stand in for the browser
//! - **Bounded retries**: fixed-delay retry with a per-attempt deadline
//!
//! # Example
//!
//! ```no_run
//! use htmlshot::{RenderConfig, Renderer, Viewport};
//!
//! # async fn example() -> htmlshot::Result<()> {
//! let renderer = Renderer::chrome(RenderConfig::default());
//! let path = renderer
//!     .render("<html><body>hi</body></html>", Viewport::default())
//!     .await?;
//! println!("saved {}", path.display());
//! htmlshot::delete_artifact(&path).await?;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub mod error;
pub use error::{Error, Result};

pub mod artifact;
pub mod config;
pub mod platform;
pub mod render;
pub mod retry;

#[cfg(feature = "cdp")]
pub mod cdp;

// Async facade over a blocking session (worker-thread backed)
pub mod async_api;

pub use artifact::delete_artifact;
pub use config::RenderConfig;
pub use render::Renderer;
pub use retry::RetryPolicy;

/// Viewport dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 800,
            height: 600,
        }
    }
}

impl Viewport {
    /// Reject zero-sized viewports before any browser is launched.
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(Error::ConfigError(format!(
                "viewport must have positive dimensions, got {}",
                self
            )));
        }
        Ok(())
    }
}

impl fmt::Display for Viewport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for Viewport {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (width, height) = s
            .split_once('x')
            .ok_or_else(|| Error::ConfigError(format!("expected WIDTHxHEIGHT, got '{}'", s)))?;

        let parse = |part: &str, name: &str| {
            part.trim()
                .parse::<u32>()
                .map_err(|_| Error::ConfigError(format!("invalid {}: '{}'", name, part.trim())))
        };

        let viewport = Viewport {
            width: parse(width, "width")?,
            height: parse(height, "height")?,
        };
        viewport.validate()?;
        Ok(viewport)
    }
}

/// Everything a [`Launcher`] needs to start one rendering session.
///
/// Built by the [`Renderer`] for each attempt from its [`RenderConfig`].
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Browser executable; `None` lets the backend find one
    pub executable: Option<PathBuf>,
    /// Window size of the headless browser, which is also the page viewport
    pub viewport: Viewport,
    /// Quiet period after load before the page counts as network-idle
    pub network_idle: Duration,
    /// Upper bound for any single browser call
    pub step_timeout: Duration,
    /// Additional command-line switches passed to the browser
    pub extra_args: Vec<String>,
}

/// A single rendering session backed by one browser process.
///
/// Methods are blocking; [`async_api::AsyncSession`] drives them from async
/// code on a dedicated thread. Sessions are never shared and `close` consumes
/// the session, so it runs at most once.
pub trait Session {
    /// Open a page and apply the viewport
    fn open_page(&mut self, viewport: Viewport) -> Result<()>;

    /// Load `html` as the document and wait until the network is idle
    fn set_content(&mut self, html: &str) -> Result<()>;

    /// Capture the visible page as PNG bytes
    fn capture_png(&mut self) -> Result<Vec<u8>>;

    /// Close the page opened by `open_page`
    fn close_page(&mut self) -> Result<()>;

    /// Shut the browser down and release the process
    fn close(self: Box<Self>) -> Result<()>;

    /// A handle that forcibly stops the browser from another thread, used
    /// when an attempt misses its deadline while a call is still blocked.
    ///
    /// Firing it must make the blocked call return promptly; `close` still
    /// runs afterwards on the worker thread.
    fn kill_switch(&self) -> Option<KillSwitch> {
        None
    }
}

/// Forcibly terminates a session's browser. See [`Session::kill_switch`].
pub type KillSwitch = Box<dyn FnOnce() + Send>;

/// Creates rendering sessions.
///
/// `launch` is called on the worker thread that will own the session, so the
/// session itself does not need to be `Send`.
pub trait Launcher: Send + Sync {
    fn launch(&self, options: &SessionOptions) -> Result<Box<dyn Session>>;
}
