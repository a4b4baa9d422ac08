//! Process-based supervisor implementation
//!
//! All lifecycle transitions (start, stop, restart, configure) run inside one
//! critical section: the `tokio::sync::Mutex` around [`Slot`]. Waiting for it is
//! bounded by `lock_wait`, after which the request fails with [`Error::Busy`].
//!
//! Each launch is watched by a task that owns the `Child`. When the child exits
//! the watcher first reports the exit on a oneshot channel (so a `start` or `stop`
//! holding the lock can observe it), then takes the lock and marks the launch
//! `Crashed` only if it is still the current launch and still `Starting` or
//! `Running`. Explicit stops therefore never end up `Crashed`, and crashes never
//! silently become `Stopped`.
//!
//! Every transition publishes a complete [`AgentStatus`] on a watch channel, which
//! is what `status()` reads.

use crate::logs::{LogCapture, LogStream, spawn_pump};
use crate::{AgentControl, HealthStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::{Mutex, MutexGuard, oneshot, watch};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uros_core::config::AgentProcessConfig;
use uros_core::{
    AgentConfig, AgentState, AgentStatus, ConfigCandidate, Error, ExitInfo, Result,
    SettingsStore,
};

type ExitReport = std::result::Result<ExitStatus, String>;

/// Full command line for `config`: binary, fixed prefix, then the agent arguments
pub fn launch_command_line(process: &AgentProcessConfig, config: &AgentConfig) -> Vec<String> {
    let mut argv = vec![process.binary.display().to_string()];
    argv.extend(process.prefix_args.iter().cloned());
    argv.extend(config.launch_args());
    argv
}

fn build_command(process: &AgentProcessConfig, config: &AgentConfig) -> Command {
    let mut cmd = Command::new(&process.binary);
    cmd.args(&process.prefix_args)
        .args(config.launch_args())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    // Own process group so wrappers such as `ros2 run` are signalled with their children
    #[cfg(unix)]
    cmd.process_group(0);

    cmd
}

#[derive(Debug, Clone, Copy)]
enum StopSignal {
    Terminate,
    Kill,
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: StopSignal) -> std::io::Result<()> {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let pid = i32::try_from(pid)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "pid out of range"))?;
    let signal = match signal {
        StopSignal::Terminate => Signal::SIGTERM,
        StopSignal::Kill => Signal::SIGKILL,
    };
    killpg(Pid::from_raw(pid), signal).map_err(std::io::Error::from)
}

#[cfg(not(unix))]
fn send_signal(_pid: u32, _signal: StopSignal) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "process signals are only supported on unix",
    ))
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    i32::try_from(pid)
        .map(|pid| kill(Pid::from_raw(pid), None).is_ok())
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    true
}

fn exit_info(report: ExitReport, expected: bool) -> ExitInfo {
    match report {
        Ok(status) => ExitInfo::from_status(status, expected),
        Err(e) => {
            warn!("Could not collect micro-ROS agent exit status: {}", e);
            ExitInfo {
                code: None,
                signal: None,
                exited_at: Utc::now(),
                expected,
            }
        }
    }
}

#[derive(Debug)]
struct LaunchRecord {
    id: u64,
    pid: u32,
    started_at: DateTime<Utc>,
    config: AgentConfig,
}

/// The supervised process record
#[derive(Debug, Default)]
struct Slot {
    state: AgentState,
    launches: u64,
    launch: Option<LaunchRecord>,
    exit_rx: Option<oneshot::Receiver<ExitReport>>,
    last_exit: Option<ExitInfo>,
    last_error: Option<String>,
}

impl Slot {
    fn snapshot(&self) -> AgentStatus {
        let launch = self.launch.as_ref();
        AgentStatus {
            state: self.state,
            pid: launch.filter(|_| self.state.is_active()).map(|l| l.pid),
            launch_id: launch.map(|l| l.id),
            started_at: launch.map(|l| l.started_at),
            config: launch.map(|l| l.config.clone()),
            last_exit: self.last_exit.clone(),
            last_error: self.last_error.clone(),
        }
    }

    fn is_current(&self, launch_id: u64) -> bool {
        self.launch.as_ref().map(|l| l.id) == Some(launch_id)
    }
}

struct Shared {
    config: AgentProcessConfig,
    settings: Arc<SettingsStore>,
    logs: Arc<LogCapture>,
    slot: Mutex<Slot>,
    status: watch::Sender<AgentStatus>,
}

impl Shared {
    fn publish(&self, slot: &Slot) {
        self.status.send_replace(slot.snapshot());
    }

    async fn observe_exit(&self, launch_id: u64, report: ExitReport) {
        let mut slot = self.slot.lock().await;
        if !slot.is_current(launch_id)
            || !matches!(slot.state, AgentState::Starting | AgentState::Running)
        {
            debug!("Exit of launch {} already handled", launch_id);
            return;
        }

        let info = exit_info(report, false);
        warn!(
            "micro-ROS agent exited unexpectedly ({}); leaving it stopped",
            info
        );
        slot.state = AgentState::Crashed;
        slot.exit_rx = None;
        slot.last_exit = Some(info);
        self.publish(&slot);
    }
}

/// Supervisor for the micro-ROS agent subprocess
#[derive(Clone)]
pub struct ProcessSupervisor {
    shared: Arc<Shared>,
}

impl ProcessSupervisor {
    /// Create a new process supervisor. Nothing is launched until `start`.
    pub fn new(
        config: AgentProcessConfig,
        settings: Arc<SettingsStore>,
        logs: Arc<LogCapture>,
    ) -> Self {
        let (status, _) = watch::channel(AgentStatus::default());
        Self {
            shared: Arc::new(Shared {
                config,
                settings,
                logs,
                slot: Mutex::new(Slot::default()),
                status,
            }),
        }
    }

    /// Receiver notified on every published status change
    pub fn status_changes(&self) -> watch::Receiver<AgentStatus> {
        self.shared.status.subscribe()
    }

    /// Start the agent if auto-start is enabled in the persisted settings.
    ///
    /// Returns `Ok(None)` when auto-start is disabled.
    pub async fn resume(&self) -> Result<Option<AgentStatus>> {
        if !self.shared.settings.enabled() {
            debug!("micro-ROS agent auto-start disabled");
            return Ok(None);
        }

        info!("micro-ROS agent enabled, auto-starting");
        match self.start().await {
            Ok(status) => Ok(Some(status)),
            Err(e) => {
                error!("micro-ROS agent auto-start failed: {}", e);
                Err(e)
            }
        }
    }

    /// Stop the agent if it is running; used when the extension exits.
    pub async fn shutdown(&self) {
        let mut slot = self.shared.slot.lock().await;
        if matches!(slot.state, AgentState::Starting | AgentState::Running) {
            if let Err(e) = self.stop_locked(&mut slot).await {
                warn!("Error stopping micro-ROS agent during shutdown: {}", e);
            }
        }
    }

    // Settings writes fsync, so they run on the blocking pool
    async fn write_settings<T, F>(&self, write: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&SettingsStore) -> Result<T> + Send + 'static,
    {
        let settings = self.shared.settings.clone();
        tokio::task::spawn_blocking(move || write(&*settings))
            .await
            .map_err(|e| Error::Persistence(format!("settings writer failed: {}", e)))?
    }

    async fn acquire(&self) -> Result<MutexGuard<'_, Slot>> {
        timeout(self.shared.config.lock_wait, self.shared.slot.lock())
            .await
            .map_err(|_| {
                debug!("Lifecycle lock busy for {:?}", self.shared.config.lock_wait);
                Error::Busy
            })
    }

    async fn start_locked(&self, slot: &mut Slot) -> Result<AgentStatus> {
        if slot.state.is_active() {
            return Err(Error::AlreadyRunning);
        }

        let config = self.shared.settings.get();
        config.validate()?;
        let argv = launch_command_line(&self.shared.config, &config);

        let spawned = build_command(&self.shared.config, &config).spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                let message = format!("{}: {}", self.shared.config.binary.display(), e);
                error!("Failed to launch micro-ROS agent: {}", message);
                slot.last_error = Some(message.clone());
                self.shared.publish(slot);
                return Err(Error::LaunchFailure(message));
            }
        };

        let Some(pid) = child.id() else {
            let message = "agent exited before its pid could be read".to_string();
            slot.last_error = Some(message.clone());
            self.shared.publish(slot);
            return Err(Error::LaunchFailure(message));
        };

        slot.launches += 1;
        let launch_id = slot.launches;

        self.shared.logs.rotate(launch_id);
        if let Some(stdout) = child.stdout.take() {
            spawn_pump(self.shared.logs.clone(), launch_id, LogStream::Stdout, stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_pump(self.shared.logs.clone(), launch_id, LogStream::Stderr, stderr);
        }

        let (exit_tx, mut exit_rx) = oneshot::channel();
        let shared = self.shared.clone();
        tokio::spawn(async move {
            let report = child.wait().await.map_err(|e| e.to_string());
            // The receiver is gone once the launch has been finalized elsewhere
            let _ = exit_tx.send(report.clone());
            shared.observe_exit(launch_id, report).await;
        });

        slot.launch = Some(LaunchRecord {
            id: launch_id,
            pid,
            started_at: Utc::now(),
            config,
        });
        slot.state = AgentState::Starting;
        slot.last_error = None;
        self.shared.publish(slot);
        info!(
            "Starting micro-ROS agent (launch {}, pid {}): {}",
            launch_id,
            pid,
            argv.join(" ")
        );

        match timeout(self.shared.config.startup_grace, &mut exit_rx).await {
            Ok(report) => {
                let report = report.unwrap_or_else(|_| Err("exit watcher vanished".to_string()));
                let info = exit_info(report, false);
                warn!("micro-ROS agent exited during startup ({})", info);
                slot.state = AgentState::Crashed;
                slot.last_exit = Some(info.clone());
                self.shared.publish(slot);
                Err(Error::Crashed(info))
            }
            Err(_) => {
                slot.state = AgentState::Running;
                slot.exit_rx = Some(exit_rx);
                self.shared.publish(slot);
                info!("micro-ROS agent running (pid {})", pid);
                Ok(slot.snapshot())
            }
        }
    }

    async fn stop_locked(&self, slot: &mut Slot) -> Result<AgentStatus> {
        if !matches!(slot.state, AgentState::Starting | AgentState::Running) {
            return Err(Error::NotRunning);
        }
        let Some(pid) = slot.launch.as_ref().map(|l| l.pid) else {
            return Err(Error::NotRunning);
        };
        let mut exit_rx = slot.exit_rx.take();

        // Exited just before we got the lock; the watcher is waiting behind us
        if let Some(rx) = exit_rx.as_mut()
            && let Ok(report) = rx.try_recv()
        {
            let info = exit_info(report, false);
            warn!("micro-ROS agent had already exited ({})", info);
            slot.state = AgentState::Crashed;
            slot.last_exit = Some(info);
            self.shared.publish(slot);
            return Err(Error::NotRunning);
        }

        slot.state = AgentState::Stopping;
        self.shared.publish(slot);
        info!("Stopping micro-ROS agent (pid {})", pid);

        if let Err(e) = send_signal(pid, StopSignal::Terminate) {
            warn!("Failed to send SIGTERM to micro-ROS agent (pid {}): {}", pid, e);
        }

        let shutdown_timeout = self.shared.config.shutdown_timeout;
        let report = match exit_rx.as_mut() {
            Some(rx) => match timeout(shutdown_timeout, &mut *rx).await {
                Ok(report) => Some(report),
                Err(_) => {
                    warn!(
                        "micro-ROS agent did not exit within {:?}, killing it",
                        shutdown_timeout
                    );
                    if let Err(e) = send_signal(pid, StopSignal::Kill) {
                        warn!("Failed to send SIGKILL to micro-ROS agent (pid {}): {}", pid, e);
                    }
                    timeout(self.shared.config.kill_timeout, &mut *rx).await.ok()
                }
            },
            None => None,
        };

        match report {
            Some(report) => {
                let report = report.unwrap_or_else(|_| Err("exit watcher vanished".to_string()));
                let info = exit_info(report, true);
                info!("micro-ROS agent stopped ({})", info);
                slot.last_exit = Some(info);
            }
            None => {
                error!("micro-ROS agent (pid {}) did not exit after SIGKILL", pid);
                slot.last_error = Some(format!("process {} did not exit after SIGKILL", pid));
            }
        }

        slot.state = AgentState::Stopped;
        self.shared.publish(slot);
        Ok(slot.snapshot())
    }
}

#[async_trait]
impl AgentControl for ProcessSupervisor {
    async fn start(&self) -> Result<AgentStatus> {
        let mut slot = self.acquire().await?;
        self.start_locked(&mut slot).await
    }

    async fn stop(&self) -> Result<AgentStatus> {
        let mut slot = self.acquire().await?;
        self.stop_locked(&mut slot).await
    }

    async fn restart(&self) -> Result<AgentStatus> {
        let mut slot = self.acquire().await?;
        if matches!(slot.state, AgentState::Starting | AgentState::Running) {
            match self.stop_locked(&mut slot).await {
                Ok(_) | Err(Error::NotRunning) => {}
                Err(e) => return Err(e),
            }
        }
        self.start_locked(&mut slot).await
    }

    async fn configure(&self, candidate: ConfigCandidate) -> Result<AgentConfig> {
        let slot = self.acquire().await?;
        if slot.state.is_active() {
            return Err(Error::AgentActive);
        }
        let saved = self
            .write_settings(move |settings| settings.set_candidate(candidate))
            .await;
        drop(slot);
        saved
    }

    async fn set_enabled(&self, enabled: bool) -> Result<()> {
        self.write_settings(move |settings| settings.set_enabled(enabled))
            .await
    }

    fn status(&self) -> AgentStatus {
        self.shared.status.borrow().clone()
    }

    fn health_check(&self) -> HealthStatus {
        let status = self.status();
        match status.state {
            AgentState::Running => match status.pid {
                Some(pid) if process_alive(pid) => HealthStatus::Healthy,
                _ => HealthStatus::Unhealthy,
            },
            AgentState::Crashed => HealthStatus::Unhealthy,
            _ => HealthStatus::Unknown,
        }
    }

    fn settings(&self) -> &SettingsStore {
        &self.shared.settings
    }

    fn logs(&self) -> &LogCapture {
        &self.shared.logs
    }
}
