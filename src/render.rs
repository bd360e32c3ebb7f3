//! HTML to PNG rendering with bounded retries

use crate::artifact::{self, ensure_output_dir, next_file_name, write_atomically};
use crate::async_api::AsyncSession;
use crate::config::RenderConfig;
use crate::{retry, Error, Launcher, Result, Viewport};
use log::{debug, error, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::timeout;

/// Renders HTML documents to PNG files.
///
/// Every attempt launches its own browser session, so a `Renderer` can be
/// shared and called concurrently; calls do not interfere with each other.
#[derive(Clone)]
pub struct Renderer {
    config: RenderConfig,
    launcher: Arc<dyn Launcher>,
}

impl Renderer {
    /// Creates a renderer that obtains sessions from `launcher`.
    pub fn new(config: RenderConfig, launcher: Arc<dyn Launcher>) -> Self {
        Self { config, launcher }
    }

    /// Creates a renderer backed by headless Chrome.
    #[cfg(feature = "cdp")]
    pub fn chrome(config: RenderConfig) -> Self {
        Self::new(config, Arc::new(crate::cdp::ChromeLauncher))
    }

    pub fn config(&self) -> &RenderConfig {
        &self.config
    }

    /// Render `html` at `viewport` and return the path of the written PNG.
    ///
    /// Attempts are retried according to the configured policy; the caller
    /// owns the returned file and removes it with [`crate::delete_artifact`].
    pub async fn render(&self, html: &str, viewport: Viewport) -> Result<PathBuf> {
        viewport.validate()?;
        let started = Instant::now();

        let path = retry::execute(&self.config.retry, || self.attempt(html, viewport)).await?;

        debug!(
            "Screenshot generated in {:.3} seconds",
            started.elapsed().as_secs_f64()
        );
        Ok(path)
    }

    /// One attempt under the attempt deadline. Errors are logged before they
    /// reach the retry loop.
    ///
    /// The browser is closed before this returns, including when the deadline
    /// passes while a browser call is still blocked.
    async fn attempt(&self, html: &str, viewport: Viewport) -> Result<PathBuf> {
        let deadline = self.config.attempt_timeout;
        let mut session =
            AsyncSession::spawn(self.launcher.clone(), self.config.session_options(viewport))?;

        let mut written = None;
        let timed = timeout(deadline, self.drive(&mut session, &mut written, html, viewport)).await;

        let outcome = match timed {
            Ok(outcome) => Self::finish(session, outcome).await,
            Err(_) => {
                session.abort().await;
                if let Some(path) = &written {
                    artifact::discard(path).await;
                }
                Err(Error::Timeout(deadline.as_millis() as u64))
            }
        };

        if let Err(e) = &outcome {
            error!("Error generating screenshot: {}", e);
        }
        outcome
    }

    async fn drive(
        &self,
        session: &mut AsyncSession,
        written: &mut Option<PathBuf>,
        html: &str,
        viewport: Viewport,
    ) -> Result<PathBuf> {
        session.ready().await?;
        self.capture(session, written, html, viewport).await
    }

    async fn finish(session: AsyncSession, outcome: Result<PathBuf>) -> Result<PathBuf> {
        match (session.close().await, outcome) {
            (Ok(()), outcome) => outcome,
            (Err(e), Ok(path)) => {
                warn!("Failed to close browser after capture: {}", e);
                Ok(path)
            }
            (Err(close_err), Err(e)) => {
                warn!("Failed to close browser after error: {}", close_err);
                Err(e)
            }
        }
    }

    async fn capture(
        &self,
        session: &AsyncSession,
        written: &mut Option<PathBuf>,
        html: &str,
        viewport: Viewport,
    ) -> Result<PathBuf> {
        session.open_page(viewport).await?;
        session.set_content(html).await?;

        ensure_output_dir(&self.config.output_dir).await?;
        let output_path = self.config.output_dir.join(next_file_name());

        let png = session.capture_png().await?;
        write_atomically(&output_path, &png).await?;
        *written = Some(output_path.clone());

        if let Err(e) = session.close_page().await {
            artifact::discard(&output_path).await;
            return Err(e);
        }

        Ok(output_path)
    }
}
