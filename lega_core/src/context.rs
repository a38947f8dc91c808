use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

// Global singleton token that represents the worker process lifetime
static TOKEN: OnceLock<CancellationToken> = OnceLock::new();

/// Facade representing the global (singleton) application context of this
/// worker process.
///
/// The context starts out alive and can be [terminated](AppContext::terminate)
/// exactly once; repeated termination produces no additional effect. The
/// consume loop and every background task use this facade as the single
/// reference point for whether the process is shutting down.
///
/// Calling [`auto_terminate`](AppContext::auto_terminate) hands the OS
/// shutdown signals over to this context: the first signal cancels the
/// context (letting in-flight work drain), a repeated signal exits the
/// process forcibly.
pub struct AppContext;

impl AppContext {
    /// Internal chokepoint for accessing the global singleton [`TOKEN`].
    fn token() -> &'static CancellationToken {
        TOKEN.get_or_init(CancellationToken::new)
    }

    /// Blocks until the global application context is terminated.
    ///
    /// Any number of tasks may await this. Tasks that start waiting after the
    /// context has been terminated unblock immediately.
    pub async fn terminated() {
        Self::token().cancelled().await;
    }

    /// Terminates the global application context, unblocking every task
    /// [waiting](AppContext::terminated) on it.
    pub fn terminate() {
        info!("Terminating application context");

        Self::token().cancel();
    }

    /// Reports whether the global application context is still alive.
    pub fn is_alive() -> bool {
        !Self::token().is_cancelled()
    }

    /// Starts listening for OS shutdown signals (`SIGINT`/`SIGTERM` on Unix,
    /// `ctrl_c` elsewhere). The first intercepted signal
    /// [terminates](AppContext::terminate) this context; a repeated signal
    /// exits the process with a non-zero status code.
    ///
    /// Repeated calls produce no additional effect. The method must be
    /// awaited so that listening is guaranteed to have started by the time it
    /// returns.
    pub async fn auto_terminate() {
        // Guard against multiple calls to this method
        static CALLED: AtomicBool = AtomicBool::new(false);
        if CALLED.swap(true, Ordering::Relaxed) {
            return;
        }

        // Schedule listening for OS shutdown signals
        tokio::spawn(Self::listen_for_shutdown_signals());

        // Yield to the runtime so the task above has time to start working
        tokio::task::yield_now().await;
    }

    /// Intercepts OS shutdown signals for the lifetime of the process: the
    /// first one cancels the context, the next one force-exits.
    async fn listen_for_shutdown_signals() -> ! {
        Self::wait_for_shutdown_signal().await;

        info!("Shutdown signal intercepted; draining in-flight work");
        Self::token().cancel();

        Self::wait_for_shutdown_signal().await;

        warn!("Repeated shutdown signal intercepted; exiting");
        std::process::exit(1);
    }

    /// Waits for the next OS shutdown signal on a Unix platform.
    #[cfg(unix)]
    async fn wait_for_shutdown_signal() {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");

        tokio::select! {
            biased;
            _ = sigint.recv() => {}
            _ = sigterm.recv() => {}
        }
    }

    /// Waits for the next `ctrl_c` action on a non-Unix platform.
    #[cfg(not(unix))]
    async fn wait_for_shutdown_signal() {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl_c handler");
    }
}
