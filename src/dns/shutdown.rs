/// Graceful shutdown for the relay
///
/// In-flight HTTP requests are counted with RAII guards. Once shutdown
/// starts, the listener stops accepting and the coordinator waits, up to a
/// bound, for the count to reach zero.
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use derive_more::{Display, Error, From};
use tokio::time::{sleep, timeout};

/// Shutdown errors
#[derive(Debug, Display, From, Error)]
pub enum ShutdownError {
    Io(std::io::Error),
    #[display(fmt = "shutdown already in progress")]
    AlreadyShuttingDown,
    #[display(fmt = "drain timeout reached with {} requests in flight", remaining)]
    #[from(ignore)]
    Timeout { remaining: usize },
}

/// Shutdown coordinator for graceful server termination
pub struct ShutdownCoordinator {
    /// Flag indicating shutdown has been initiated
    shutting_down: AtomicBool,
    /// Requests currently being served
    active_requests: Arc<AtomicUsize>,
    /// Maximum time to wait for requests to drain
    drain_timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(drain_timeout: Duration) -> Self {
        Self {
            shutting_down: AtomicBool::new(false),
            active_requests: Arc::new(AtomicUsize::new(0)),
            drain_timeout,
        }
    }

    /// Check if shutdown is in progress
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Relaxed)
    }

    /// Register a new request, released when the guard drops
    pub fn register_request(&self) -> RequestGuard {
        self.active_requests.fetch_add(1, Ordering::Relaxed);
        RequestGuard {
            counter: self.active_requests.clone(),
        }
    }

    pub fn request_count(&self) -> usize {
        self.active_requests.load(Ordering::Relaxed)
    }

    /// Marks the server as shutting down. The listener checks this flag
    /// before treating an accept error as fatal.
    pub fn begin_shutdown(&self) -> Result<(), ShutdownError> {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return Err(ShutdownError::AlreadyShuttingDown);
        }
        Ok(())
    }

    /// Marks the server as shutting down and waits for in-flight requests.
    pub async fn drain(&self) -> Result<(), ShutdownError> {
        self.begin_shutdown()?;
        self.wait_for_drain().await
    }

    /// Waits, up to the drain timeout, for in-flight requests to finish.
    pub async fn wait_for_drain(&self) -> Result<(), ShutdownError> {
        log::info!(
            "waiting up to {:?} for {} in-flight requests",
            self.drain_timeout,
            self.request_count()
        );

        match timeout(self.drain_timeout, self.wait_for_requests()).await {
            Ok(_) => {
                log::info!("all requests completed");
                Ok(())
            }
            Err(_) => Err(ShutdownError::Timeout {
                remaining: self.request_count(),
            }),
        }
    }

    async fn wait_for_requests(&self) {
        while self.request_count() > 0 {
            log::debug!("waiting for {} requests", self.request_count());
            sleep(Duration::from_millis(100)).await;
        }
    }
}

/// Guard for tracking active requests
pub struct RequestGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Termination signals the server reacts to
#[cfg(unix)]
pub struct Signals {
    sigint: tokio::signal::unix::Signal,
    sigterm: tokio::signal::unix::Signal,
    sighup: tokio::signal::unix::Signal,
    sigquit: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl Signals {
    /// Must be called from within a tokio runtime.
    pub fn install() -> Result<Signals, ShutdownError> {
        use tokio::signal::unix::{signal, SignalKind};

        Ok(Signals {
            sigint: signal(SignalKind::interrupt())?,
            sigterm: signal(SignalKind::terminate())?,
            sighup: signal(SignalKind::hangup())?,
            sigquit: signal(SignalKind::quit())?,
        })
    }

    /// Waits for the next signal and returns its name.
    pub async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.sigint.recv() => "SIGINT",
            _ = self.sigterm.recv() => "SIGTERM",
            _ = self.sighup.recv() => "SIGHUP",
            _ = self.sigquit.recv() => "SIGQUIT",
        }
    }
}

#[cfg(windows)]
pub struct Signals;

#[cfg(windows)]
impl Signals {
    pub fn install() -> Result<Signals, ShutdownError> {
        Ok(Signals)
    }

    pub async fn recv(&mut self) -> &'static str {
        match tokio::signal::ctrl_c().await {
            Ok(_) => "Ctrl+C",
            Err(e) => {
                log::error!("failed to listen for Ctrl+C: {}", e);
                std::future::pending::<&'static str>().await
            }
        }
    }
}
