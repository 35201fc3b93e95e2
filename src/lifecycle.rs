//! Process lifecycle: termination signals, parent liveness and shutdown.
//!
//! Every long-running loop observes the same [`Shutdown`]. A termination
//! signal, the spawning parent going away, or a fatal transport error moves
//! it from `Running` to `ShutdownRequested`; the controller then moves it
//! on to `Terminating`, which cancels the shared token so every transport
//! loop unwinds at its next suspension point.
//!
//! Shutdown must never hang. Entering `Terminating` arms a watchdog thread
//! that force-exits the process if draining has not finished within the
//! grace period, and a second termination signal force-exits immediately.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::ServerError;

/// How often the parent process is checked.
pub const PARENT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// How long draining may take before the process is force-exited.
pub const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Exit status used when shutdown has to be forced.
pub const FORCED_EXIT_CODE: i32 = 1;

/// Process-wide shutdown phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ShutdownPhase {
    /// Serving normally.
    Running = 0,
    /// A shutdown trigger fired.
    ShutdownRequested = 1,
    /// Loops are being torn down.
    Terminating = 2,
}

impl ShutdownPhase {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Running,
            1 => Self::ShutdownRequested,
            _ => Self::Terminating,
        }
    }
}

/// Why shutdown was requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// A termination signal was delivered.
    Signal(&'static str),
    /// The parent process no longer exists.
    ParentExited(u32),
    /// The parent process is a zombie.
    ParentZombie(u32),
    /// The parent process can no longer be queried.
    ParentInaccessible(u32),
    /// The transport failed while serving.
    TransportError(String),
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Signal(name) => write!(f, "received {name}"),
            Self::ParentExited(pid) => write!(f, "parent process {pid} exited"),
            Self::ParentZombie(pid) => write!(f, "parent process {pid} is a zombie"),
            Self::ParentInaccessible(pid) => write!(f, "parent process {pid} is inaccessible"),
            Self::TransportError(e) => write!(f, "transport error: {e}"),
        }
    }
}

/// Shared shutdown signal observed by every long-running loop.
#[derive(Clone, Default)]
pub struct Shutdown {
    inner: Arc<ShutdownInner>,
}

#[derive(Default)]
struct ShutdownInner {
    phase: AtomicU8,
    reason: Mutex<Option<ShutdownReason>>,
    token: CancellationToken,
    drained: AtomicBool,
}

impl Shutdown {
    /// Creates a signal in the `Running` phase.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> ShutdownPhase {
        ShutdownPhase::from_u8(self.inner.phase.load(Ordering::Acquire))
    }

    /// The first recorded reason, if shutdown was requested.
    #[must_use]
    pub fn reason(&self) -> Option<ShutdownReason> {
        self.inner
            .reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Token cancelled on entering `Terminating`.
    #[must_use]
    pub fn token(&self) -> CancellationToken {
        self.inner.token.clone()
    }

    /// Whether shutdown has been requested.
    #[must_use]
    pub fn is_requested(&self) -> bool {
        self.phase() != ShutdownPhase::Running
    }

    /// Records a shutdown request. Returns `true` for the first request only.
    pub fn request(&self, reason: ShutdownReason) -> bool {
        let first = self
            .inner
            .phase
            .compare_exchange(
                ShutdownPhase::Running as u8,
                ShutdownPhase::ShutdownRequested as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if first {
            *self
                .inner
                .reason
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(reason);
        }
        first
    }

    /// Moves to `Terminating` and cancels the token. Returns `true` the first
    /// time only.
    pub fn begin_termination(&self) -> bool {
        let previous = self
            .inner
            .phase
            .swap(ShutdownPhase::Terminating as u8, Ordering::AcqRel);
        self.inner.token.cancel();
        ShutdownPhase::from_u8(previous) != ShutdownPhase::Terminating
    }

    /// Records that every loop has unwound.
    pub fn mark_drained(&self) {
        self.inner.drained.store(true, Ordering::Release);
    }

    /// Whether every loop has unwound.
    #[must_use]
    pub fn is_drained(&self) -> bool {
        self.inner.drained.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Shutdown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shutdown")
            .field("phase", &self.phase())
            .field("reason", &self.reason())
            .field("drained", &self.is_drained())
            .finish()
    }
}

/// Last-resort process exit.
pub trait Terminator: Send + Sync {
    /// Ends the process with `code`.
    fn force_exit(&self, code: i32);
}

/// Exits the real process.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessTerminator;

impl Terminator for ProcessTerminator {
    fn force_exit(&self, code: i32) {
        std::process::exit(code);
    }
}

/// State of the parent process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParentStatus {
    /// Still running.
    Alive,
    /// Gone.
    Exited,
    /// Exited but not reaped.
    Zombie,
    /// Exists but cannot be queried.
    AccessDenied,
    /// The check itself failed.
    Unknown,
}

/// Checks whether a process is still alive.
pub trait ParentProbe: Send + Sync {
    /// Reports the state of process `pid`.
    fn check(&self, pid: u32) -> ParentStatus;
}

/// Probe backed by the operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsParentProbe;

#[cfg(unix)]
impl ParentProbe for OsParentProbe {
    fn check(&self, pid: u32) -> ParentStatus {
        use nix::errno::Errno;
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let Ok(raw) = i32::try_from(pid) else {
            return ParentStatus::Unknown;
        };

        // Orphans are re-parented to init or a subreaper.
        if std::os::unix::process::parent_id() != pid {
            return ParentStatus::Exited;
        }

        match kill(Pid::from_raw(raw), None::<Signal>) {
            Ok(()) => {}
            Err(Errno::ESRCH) => return ParentStatus::Exited,
            Err(Errno::EPERM) => return ParentStatus::AccessDenied,
            Err(e) => {
                tracing::debug!(pid, error = %e, "Parent liveness check failed");
                return ParentStatus::Unknown;
            }
        }

        if is_zombie(pid) {
            ParentStatus::Zombie
        } else {
            ParentStatus::Alive
        }
    }
}

#[cfg(not(unix))]
impl ParentProbe for OsParentProbe {
    fn check(&self, _pid: u32) -> ParentStatus {
        ParentStatus::Alive
    }
}

/// Reads the process state letter from `/proc/<pid>/stat`.
#[cfg(target_os = "linux")]
fn is_zombie(pid: u32) -> bool {
    std::fs::read_to_string(format!("/proc/{pid}/stat"))
        .ok()
        .and_then(|stat| stat_state(&stat))
        == Some('Z')
}

#[cfg(all(unix, not(target_os = "linux")))]
const fn is_zombie(_pid: u32) -> bool {
    false
}

/// The state field follows the parenthesised command name, which may itself
/// contain spaces and parentheses.
#[cfg(any(target_os = "linux", test))]
fn stat_state(stat: &str) -> Option<char> {
    let (_, rest) = stat.rsplit_once(')')?;
    rest.trim_start().chars().next()
}

/// Pid of the process that spawned this one.
#[must_use]
pub fn parent_pid() -> Option<u32> {
    #[cfg(unix)]
    {
        Some(std::os::unix::process::parent_id())
    }
    #[cfg(not(unix))]
    {
        None
    }
}

/// Drives shutdown from signals, parent liveness and transport failures.
#[derive(Clone)]
pub struct LifecycleController {
    shutdown: Shutdown,
    terminator: Arc<dyn Terminator>,
    grace_period: Duration,
    poll_interval: Duration,
}

impl LifecycleController {
    /// Creates a controller that force-exits the real process.
    #[must_use]
    pub fn new(shutdown: Shutdown) -> Self {
        Self {
            shutdown,
            terminator: Arc::new(ProcessTerminator),
            grace_period: SHUTDOWN_GRACE_PERIOD,
            poll_interval: PARENT_POLL_INTERVAL,
        }
    }

    /// Replaces the last-resort exit.
    #[must_use]
    pub fn with_terminator(mut self, terminator: Arc<dyn Terminator>) -> Self {
        self.terminator = terminator;
        self
    }

    /// Sets how long draining may take.
    #[must_use]
    pub const fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Sets how often the parent is checked.
    #[must_use]
    pub const fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// The shared shutdown signal.
    #[must_use]
    pub const fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }

    /// Requests shutdown.
    ///
    /// The first request starts termination. A second termination signal
    /// force-exits; other repeated requests are ignored.
    pub fn request_shutdown(&self, reason: ShutdownReason) {
        if self.shutdown.request(reason.clone()) {
            tracing::info!(%reason, "Starting graceful shutdown");
            self.terminate();
            return;
        }

        if matches!(reason, ShutdownReason::Signal(_)) {
            tracing::warn!(%reason, "Second termination signal, forcing exit");
            self.terminator.force_exit(FORCED_EXIT_CODE);
        } else {
            tracing::debug!(%reason, "Shutdown already in progress");
        }
    }

    /// Called once every loop has unwound; disarms the watchdog.
    pub fn finish(&self) {
        self.shutdown.mark_drained();
        tracing::debug!("Shutdown drained");
    }

    fn terminate(&self) {
        if self.shutdown.begin_termination() {
            self.arm_watchdog();
        }
    }

    fn arm_watchdog(&self) {
        let shutdown = self.shutdown.clone();
        let terminator = Arc::clone(&self.terminator);
        let grace_period = self.grace_period;

        let spawned = std::thread::Builder::new()
            .name("shutdown-watchdog".to_string())
            .spawn(move || {
                std::thread::sleep(grace_period);
                if !shutdown.is_drained() {
                    tracing::error!(
                        grace_ms = u64::try_from(grace_period.as_millis()).unwrap_or(u64::MAX),
                        "Shutdown did not finish in time, forcing exit"
                    );
                    terminator.force_exit(FORCED_EXIT_CODE);
                }
            });

        if let Err(e) = spawned {
            tracing::error!(error = %e, "Failed to arm shutdown watchdog, forcing exit");
            self.terminator.force_exit(FORCED_EXIT_CODE);
        }
    }

    fn on_signal(&self, name: &'static str) {
        tracing::info!(signal = name, "Received termination signal");
        self.request_shutdown(ShutdownReason::Signal(name));
    }

    /// Installs SIGINT and SIGTERM handlers.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Signal`] if a handler cannot be registered.
    #[cfg(unix)]
    pub fn install_signal_handlers(&self) -> Result<JoinHandle<()>, ServerError> {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt()).map_err(ServerError::Signal)?;
        let mut sigterm = signal(SignalKind::terminate()).map_err(ServerError::Signal)?;
        let controller = self.clone();

        Ok(tokio::spawn(async move {
            loop {
                let name = tokio::select! {
                    received = sigint.recv() => received.map(|()| "SIGINT"),
                    received = sigterm.recv() => received.map(|()| "SIGTERM"),
                };
                let Some(name) = name else {
                    return;
                };
                controller.on_signal(name);
            }
        }))
    }

    /// Installs Ctrl+C and Ctrl+Break handlers.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Signal`] if a handler cannot be registered.
    #[cfg(windows)]
    pub fn install_signal_handlers(&self) -> Result<JoinHandle<()>, ServerError> {
        use tokio::signal::windows::{ctrl_break, ctrl_c};

        let mut ctrl_c = ctrl_c().map_err(ServerError::Signal)?;
        let mut ctrl_break = ctrl_break().map_err(ServerError::Signal)?;
        let controller = self.clone();

        Ok(tokio::spawn(async move {
            loop {
                let name = tokio::select! {
                    received = ctrl_c.recv() => received.map(|()| "CTRL_C"),
                    received = ctrl_break.recv() => received.map(|()| "CTRL_BREAK"),
                };
                let Some(name) = name else {
                    return;
                };
                controller.on_signal(name);
            }
        }))
    }

    /// Polls the parent process until it goes away or shutdown starts.
    pub fn watch_parent(&self, pid: u32, probe: Arc<dyn ParentProbe>) -> JoinHandle<()> {
        let controller = self.clone();
        tracing::debug!(pid, "Watching parent process");

        tokio::spawn(async move {
            let token = controller.shutdown.token();
            let mut interval = tokio::time::interval(controller.poll_interval);
            loop {
                tokio::select! {
                    () = token.cancelled() => return,
                    _ = interval.tick() => {}
                }

                let reason = match probe.check(pid) {
                    ParentStatus::Alive => continue,
                    ParentStatus::Unknown => {
                        tracing::debug!(pid, "Parent status unknown, will retry");
                        continue;
                    }
                    ParentStatus::Exited => ShutdownReason::ParentExited(pid),
                    ParentStatus::Zombie => ShutdownReason::ParentZombie(pid),
                    ParentStatus::AccessDenied => ShutdownReason::ParentInaccessible(pid),
                };
                tracing::warn!(%reason, "Parent process is gone");
                controller.request_shutdown(reason);
                return;
            }
        })
    }
}

impl fmt::Debug for LifecycleController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleController")
            .field("shutdown", &self.shutdown)
            .field("grace_period", &self.grace_period)
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}
