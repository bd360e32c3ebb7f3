use crate::{Error, KillSwitch, Launcher, Result, Session, SessionOptions, Viewport};
use log::{debug, warn};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use tokio::sync::oneshot;

enum Command {
    OpenPage(Viewport, oneshot::Sender<Result<()>>),
    SetContent(String, oneshot::Sender<Result<()>>),
    Capture(oneshot::Sender<Result<Vec<u8>>>),
    ClosePage(oneshot::Sender<Result<()>>),
    Close(oneshot::Sender<Result<()>>),
}

/// An async handle to one rendering session, backed by a dedicated worker thread.
///
/// The worker thread launches and owns the blocking [`Session`] and executes
/// commands sent from async tasks, so callers get an async interface without
/// the session having to be `Send`.
///
/// The session is closed exactly once: by [`AsyncSession::close`], by
/// [`AsyncSession::abort`], or by the worker when this handle is dropped.
/// `close` and `abort` return only after the worker thread has finished.
pub struct AsyncSession {
    cmd_tx: Sender<Command>,
    init_rx: Option<oneshot::Receiver<Result<()>>>,
    kill: Arc<Mutex<Option<KillSwitch>>>,
    done_rx: oneshot::Receiver<()>,
    ready: bool,
}

impl AsyncSession {
    /// Start a worker thread that launches a session in the background.
    ///
    /// Call [`AsyncSession::ready`] to wait for the launch outcome.
    pub fn spawn(launcher: Arc<dyn Launcher>, options: SessionOptions) -> Result<Self> {
        let (cmd_tx, cmd_rx) = mpsc::channel::<Command>();
        let (init_tx, init_rx) = oneshot::channel::<Result<()>>();
        let (done_tx, done_rx) = oneshot::channel::<()>();
        let kill: Arc<Mutex<Option<KillSwitch>>> = Arc::new(Mutex::new(None));
        let worker_kill = kill.clone();

        thread::Builder::new()
            .name("htmlshot-session".to_string())
            .spawn(move || {
                // Dropped when the thread exits, on every path
                let _done = done_tx;

                let mut session = match launcher.launch(&options) {
                    Ok(s) => s,
                    Err(err) => {
                        let _ = init_tx.send(Err(err));
                        return;
                    }
                };

                if let Ok(mut slot) = worker_kill.lock() {
                    *slot = session.kill_switch();
                }

                // Nobody is waiting for the session any more
                if init_tx.send(Ok(())).is_err() {
                    debug!("Session launch was abandoned; closing browser");
                    close_quietly(session);
                    return;
                }

                loop {
                    match cmd_rx.recv() {
                        Ok(Command::Close(resp)) => {
                            let _ = resp.send(session.close());
                            return;
                        }
                        Ok(cmd) => dispatch(&mut session, cmd),
                        Err(_) => {
                            debug!("Session handle dropped; closing browser");
                            close_quietly(session);
                            return;
                        }
                    }
                }
            })
            .map_err(|e| Error::InitializationError(format!("Failed to spawn session worker: {}", e)))?;

        Ok(Self {
            cmd_tx,
            init_rx: Some(init_rx),
            kill,
            done_rx,
            ready: false,
        })
    }

    /// Launch a session on a new worker thread and wait until it is usable.
    ///
    /// When the launch fails no session exists and nothing needs closing.
    pub async fn launch(launcher: Arc<dyn Launcher>, options: SessionOptions) -> Result<Self> {
        let mut session = Self::spawn(launcher, options)?;
        session.ready().await?;
        Ok(session)
    }

    /// Wait for the background launch to finish.
    pub async fn ready(&mut self) -> Result<()> {
        if self.ready {
            return Ok(());
        }
        let init_rx = self
            .init_rx
            .take()
            .ok_or_else(|| Error::Other("Session launch already failed".to_string()))?;

        init_rx
            .await
            .map_err(|e| Error::Other(format!("Session init canceled: {}", e)))??;
        self.ready = true;
        Ok(())
    }

    /// Open a page with the given viewport
    pub async fn open_page(&self, viewport: Viewport) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::OpenPage(viewport, tx))?;
        rx.await
            .map_err(|e| Error::Other(format!("OpenPage canceled: {}", e)))?
    }

    /// Load HTML into the page and wait for network idle
    pub async fn set_content(&self, html: &str) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::SetContent(html.to_string(), tx))?;
        rx.await
            .map_err(|e| Error::Other(format!("SetContent canceled: {}", e)))?
    }

    /// Capture the page as PNG bytes
    pub async fn capture_png(&self) -> Result<Vec<u8>> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Capture(tx))?;
        rx.await
            .map_err(|e| Error::Other(format!("Capture canceled: {}", e)))?
    }

    /// Close the page
    pub async fn close_page(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::ClosePage(tx))?;
        rx.await
            .map_err(|e| Error::Other(format!("ClosePage canceled: {}", e)))?
    }

    /// Close the browser and wait for the worker thread to stop.
    ///
    /// A session whose launch failed or was never awaited has nothing to
    /// close; this then only waits for the worker.
    pub async fn close(self) -> Result<()> {
        if !self.ready {
            self.shutdown(false).await;
            return Ok(());
        }

        let (tx, rx) = oneshot::channel();
        self.send(Command::Close(tx))?;
        let result = rx
            .await
            .map_err(|e| Error::Other(format!("Close canceled: {}", e)))?;
        let _ = self.done_rx.await;
        result
    }

    /// Tear the session down without waiting for in-flight work.
    ///
    /// Fires the session's kill switch so a blocked call returns, then waits
    /// until the worker has closed the session and exited.
    pub async fn abort(self) {
        self.shutdown(true).await;
    }

    async fn shutdown(self, kill: bool) {
        let AsyncSession {
            cmd_tx,
            init_rx,
            kill: slot,
            done_rx,
            ..
        } = self;
        drop(init_rx);
        drop(cmd_tx);

        if kill {
            let switch = slot.lock().ok().and_then(|mut s| s.take());
            if let Some(switch) = switch {
                debug!("Killing browser of abandoned session");
                switch();
            }
        }

        let _ = done_rx.await;
    }

    fn send(&self, cmd: Command) -> Result<()> {
        self.cmd_tx
            .send(cmd)
            .map_err(|_| Error::Other("Session worker has stopped".to_string()))
    }
}

fn dispatch(session: &mut Box<dyn Session>, cmd: Command) {
    match cmd {
        Command::OpenPage(viewport, resp) => {
            let _ = resp.send(session.open_page(viewport));
        }
        Command::SetContent(html, resp) => {
            let _ = resp.send(session.set_content(&html));
        }
        Command::Capture(resp) => {
            let _ = resp.send(session.capture_png());
        }
        Command::ClosePage(resp) => {
            let _ = resp.send(session.close_page());
        }
        // handled by the worker loop
        Command::Close(resp) => {
            let _ = resp.send(Err(Error::Other("Close dispatched twice".to_string())));
        }
    }
}

fn close_quietly(session: Box<dyn Session>) {
    if let Err(e) = session.close() {
        warn!("Failed to close abandoned session: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    #[derive(Default)]
    struct Counts {
        launched: AtomicUsize,
        closed: AtomicUsize,
        killed: AtomicUsize,
    }

    struct CountingLauncher {
        counts: Arc<Counts>,
        fail_launch: bool,
    }

    struct CountingSession {
        counts: Arc<Counts>,
        pages: usize,
        killed: Arc<AtomicBool>,
    }

    impl Launcher for CountingLauncher {
        fn launch(&self, _options: &SessionOptions) -> Result<Box<dyn Session>> {
            if self.fail_launch {
                return Err(Error::InitializationError("no browser".into()));
            }
            self.counts.launched.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(CountingSession {
                counts: self.counts.clone(),
                pages: 0,
                killed: Arc::new(AtomicBool::new(false)),
            }))
        }
    }

    impl Session for CountingSession {
        fn open_page(&mut self, _viewport: Viewport) -> Result<()> {
            self.pages += 1;
            Ok(())
        }

        fn set_content(&mut self, html: &str) -> Result<()> {
            if html.contains("fail") {
                return Err(Error::LoadError("refused".into()));
            }
            if html.contains("hang") {
                // Blocks until the kill switch fires
                let started = Instant::now();
                while !self.killed.load(Ordering::SeqCst) {
                    if started.elapsed() > Duration::from_secs(30) {
                        return Err(Error::LoadError("never killed".into()));
                    }
                    thread::sleep(Duration::from_millis(5));
                }
                return Err(Error::LoadError("browser killed".into()));
            }
            Ok(())
        }

        fn capture_png(&mut self) -> Result<Vec<u8>> {
            Ok(vec![self.pages as u8])
        }

        fn close_page(&mut self) -> Result<()> {
            Ok(())
        }

        fn close(self: Box<Self>) -> Result<()> {
            self.counts.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn kill_switch(&self) -> Option<KillSwitch> {
            let killed = self.killed.clone();
            let counts = self.counts.clone();
            Some(Box::new(move || {
                counts.killed.fetch_add(1, Ordering::SeqCst);
                killed.store(true, Ordering::SeqCst);
            }))
        }
    }

    fn launcher(counts: &Arc<Counts>, fail_launch: bool) -> Arc<CountingLauncher> {
        Arc::new(CountingLauncher {
            counts: counts.clone(),
            fail_launch,
        })
    }

    fn options() -> SessionOptions {
        SessionOptions {
            executable: None,
            viewport: Viewport::default(),
            network_idle: Duration::ZERO,
            step_timeout: Duration::from_secs(1),
            extra_args: Vec::new(),
        }
    }

    async fn wait_for_close(counts: &Counts, expected: usize) {
        for _ in 0..100 {
            if counts.closed.load(Ordering::SeqCst) == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "expected {} closes, saw {}",
            expected,
            counts.closed.load(Ordering::SeqCst)
        );
    }

    #[tokio::test]
    async fn commands_run_on_worker_and_close_once() {
        let counts = Arc::new(Counts::default());

        let session = AsyncSession::launch(launcher(&counts, false), options()).await.unwrap();
        session.open_page(Viewport::default()).await.unwrap();
        session.set_content("<p>ok</p>").await.unwrap();
        assert_eq!(session.capture_png().await.unwrap(), vec![1]);
        session.close_page().await.unwrap();
        session.close().await.unwrap();

        assert_eq!(counts.launched.load(Ordering::SeqCst), 1);
        assert_eq!(counts.closed.load(Ordering::SeqCst), 1);
        assert_eq!(counts.killed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn session_errors_are_forwarded() {
        let counts = Arc::new(Counts::default());

        let session = AsyncSession::launch(launcher(&counts, false), options()).await.unwrap();
        let err = session.set_content("fail").await.unwrap_err();
        assert!(matches!(err, Error::LoadError(_)));
        session.close().await.unwrap();
        assert_eq!(counts.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_launch_leaves_nothing_to_close() {
        let counts = Arc::new(Counts::default());

        let err = AsyncSession::launch(launcher(&counts, true), options())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::InitializationError(_)));
        assert_eq!(counts.launched.load(Ordering::SeqCst), 0);
        assert_eq!(counts.closed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn close_after_failed_ready_is_a_no_op() {
        let counts = Arc::new(Counts::default());

        let mut session = AsyncSession::spawn(launcher(&counts, true), options()).unwrap();
        assert!(session.ready().await.is_err());
        session.close().await.unwrap();
        assert_eq!(counts.closed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn dropped_handle_closes_session() {
        let counts = Arc::new(Counts::default());

        let session = AsyncSession::launch(launcher(&counts, false), options()).await.unwrap();
        session.open_page(Viewport::default()).await.unwrap();
        drop(session);

        wait_for_close(&counts, 1).await;
    }

    #[tokio::test]
    async fn abort_kills_blocked_call_and_waits_for_close() {
        let counts = Arc::new(Counts::default());
        let session = AsyncSession::launch(launcher(&counts, false), options()).await.unwrap();

        let stalled = tokio::time::timeout(Duration::from_millis(50), session.set_content("hang")).await;
        assert!(stalled.is_err());

        session.abort().await;
        assert_eq!(counts.killed.load(Ordering::SeqCst), 1);
        assert_eq!(counts.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn abort_before_ready_still_closes_launched_session() {
        let counts = Arc::new(Counts::default());
        let session = AsyncSession::spawn(launcher(&counts, false), options()).unwrap();

        session.abort().await;
        assert_eq!(
            counts.launched.load(Ordering::SeqCst),
            counts.closed.load(Ordering::SeqCst)
        );
    }
}
