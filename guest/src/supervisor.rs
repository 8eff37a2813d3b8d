//! Guest agent supervision.
//!
//! The agent is restarted whenever it exits, after a fixed interval and
//! with no backoff. Its output goes to a log sink chosen once up front.

use crate::config::AgentSettings;
use crate::logsink::{LogSink, LogTarget};
use nix::errno::Errno;
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use std::collections::VecDeque;
use std::fs::File;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

const RECENT_EVENTS: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartEvent {
    /// `None` when the agent could not be spawned or waited on.
    pub exit_code: Option<i32>,
    pub uptime: Duration,
}

#[derive(Debug, Clone)]
pub struct AgentProcessState {
    pub restart_count: u64,
    pub last_exit_code: Option<i32>,
    pub log_target: LogTarget,
    /// The most recent restarts, oldest first.
    pub events: VecDeque<RestartEvent>,
}

impl AgentProcessState {
    fn record(&mut self, event: RestartEvent) {
        self.restart_count += 1;
        self.last_exit_code = event.exit_code;
        if self.events.len() == RECENT_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }
}

pub struct Supervisor {
    program: PathBuf,
    args: Vec<String>,
    restart_interval: Duration,
    monitor_interval: Duration,
    /// Opened once; every agent instance writes to a clone of it.
    log: Option<File>,
    reap_orphans: bool,
    state: AgentProcessState,
}

impl Supervisor {
    pub fn new(settings: &AgentSettings, sink: LogSink) -> Self {
        let (log, log_target) = match sink.open() {
            Ok(log) => (log, sink.target().clone()),
            Err(e) => {
                tracing::warn!(log = ?sink.target(), "agent log unavailable, using the console: {}", e);
                (None, LogTarget::Console)
            }
        };
        let state = AgentProcessState {
            restart_count: 0,
            last_exit_code: None,
            log_target,
            events: VecDeque::new(),
        };
        Self {
            program: settings.path.clone(),
            args: settings.args.clone(),
            restart_interval: Duration::from_millis(settings.restart_interval_ms),
            monitor_interval: Duration::from_millis(settings.monitor_interval_ms),
            log,
            reap_orphans: false,
            state,
        }
    }

    /// Also collect any other exited child of this process. Needed when
    /// running as PID 1, where orphans are reparented to us.
    pub fn reap_orphans(mut self, enabled: bool) -> Self {
        self.reap_orphans = enabled;
        self
    }

    pub fn state(&self) -> &AgentProcessState {
        &self.state
    }

    /// Keep the agent running forever.
    pub fn supervise(mut self) -> ! {
        let never = AtomicBool::new(false);
        loop {
            self.run_until(&never);
        }
    }

    /// Keep the agent running until `stop` is raised. A running agent is
    /// killed on stop and that exit is not counted as a restart.
    pub fn run_until(&mut self, stop: &AtomicBool) -> AgentProcessState {
        tracing::info!(
            agent = ?self.program,
            log = ?self.state.log_target,
            "supervising agent"
        );

        while !stop.load(Ordering::SeqCst) {
            let started = Instant::now();
            let exit_code = match self.spawn() {
                Ok(mut child) => {
                    tracing::info!(pid = child.id(), "agent started");
                    match self.monitor(&mut child, stop) {
                        Some(code) => code,
                        None => break,
                    }
                }
                Err(e) => {
                    tracing::error!(agent = ?self.program, "agent spawn failed: {}", e);
                    None
                }
            };

            let event = RestartEvent {
                exit_code,
                uptime: started.elapsed(),
            };
            tracing::warn!(
                exit_code = ?event.exit_code,
                uptime_ms = event.uptime.as_millis() as u64,
                restarts = self.state.restart_count + 1,
                "agent exited, restarting in {:?}",
                self.restart_interval
            );
            self.state.record(event);
            std::thread::sleep(self.restart_interval);
        }

        self.state.clone()
    }

    fn spawn(&self) -> std::io::Result<Child> {
        let (stdout, stderr) = match self.log_handles() {
            Ok(Some((out, err))) => (Stdio::from(out), Stdio::from(err)),
            Ok(None) => (Stdio::inherit(), Stdio::inherit()),
            Err(e) => {
                tracing::warn!("agent log handle unavailable, using the console: {}", e);
                (Stdio::inherit(), Stdio::inherit())
            }
        };

        Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .spawn()
    }

    fn log_handles(&self) -> std::io::Result<Option<(File, File)>> {
        match &self.log {
            Some(file) => Ok(Some((file.try_clone()?, file.try_clone()?))),
            None => Ok(None),
        }
    }

    /// Wait for the child to exit. Returns `None` when stopped, otherwise
    /// the exit code if one could be collected.
    fn monitor(&self, child: &mut Child, stop: &AtomicBool) -> Option<Option<i32>> {
        loop {
            if stop.load(Ordering::SeqCst) {
                let _ = child.kill();
                let _ = child.wait();
                return None;
            }
            match self.poll_exit(child) {
                Ok(Some(code)) => return Some(Some(code)),
                Ok(None) => std::thread::sleep(self.monitor_interval),
                Err(e) => {
                    tracing::error!("waiting on agent failed: {}", e);
                    let _ = child.kill();
                    let _ = child.wait();
                    return Some(None);
                }
            }
        }
    }

    fn poll_exit(&self, child: &mut Child) -> std::io::Result<Option<i32>> {
        if !self.reap_orphans {
            return Ok(child.try_wait()?.map(shell_exit_code));
        }

        let agent = Pid::from_raw(child.id() as i32);
        loop {
            match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => return Ok(None),
                Ok(WaitStatus::Exited(pid, code)) if pid == agent => return Ok(Some(code)),
                Ok(WaitStatus::Signaled(pid, signal, _)) if pid == agent => {
                    return Ok(Some(128 + signal as i32));
                }
                Ok(status) => tracing::debug!(?status, "reaped orphan"),
                Err(Errno::EINTR) => {}
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Shell-style exit code: the status, or 128 plus the terminating signal.
fn shell_exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|s| 128 + s))
        .unwrap_or(-1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    const FLAKY_AGENT: &str = r#"
n=$(cat "$1" 2>/dev/null || echo 0)
n=$((n + 1))
echo "$n" > "$1"
echo "attempt $n"
if [ "$n" -le 3 ]; then
    exit 7
fi
exec sleep 30
"#;

    fn settings(dir: &TempDir, args: Vec<String>) -> AgentSettings {
        AgentSettings {
            path: PathBuf::from("/bin/sh"),
            args,
            restart_interval_ms: 50,
            monitor_interval_ms: 10,
            log_primary: dir.path().join("share/agent.log"),
            log_fallback: dir.path().join("local/agent.log"),
        }
    }

    fn stop_after(delay: Duration) -> (Arc<AtomicBool>, std::thread::JoinHandle<()>) {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(delay);
            flag.store(true, Ordering::SeqCst);
        });
        (stop, handle)
    }

    #[test]
    fn test_restarts_until_agent_stays_up() {
        let dir = TempDir::new().unwrap();
        let script = dir.path().join("agent.sh");
        std::fs::write(&script, FLAKY_AGENT).unwrap();
        let counter = dir.path().join("count");
        let settings = settings(
            &dir,
            vec![
                script.to_string_lossy().into_owned(),
                counter.to_string_lossy().into_owned(),
            ],
        );
        let sink = LogSink::select(&settings.log_primary, &settings.log_fallback);
        let mut supervisor = Supervisor::new(&settings, sink);

        let (stop, handle) = stop_after(Duration::from_millis(1500));
        let state = supervisor.run_until(&stop);
        handle.join().unwrap();

        assert_eq!(state.restart_count, 3);
        assert_eq!(state.last_exit_code, Some(7));
        assert!(state.events.iter().all(|e| e.exit_code == Some(7)));
        assert_eq!(std::fs::read_to_string(&counter).unwrap().trim(), "4");
        assert_eq!(state.log_target, LogTarget::File(settings.log_primary.clone()));

        let log = std::fs::read_to_string(&settings.log_primary).unwrap();
        assert_eq!(log.lines().filter(|l| l.starts_with("attempt")).count(), 4);
    }

    #[test]
    fn test_agent_runs_after_log_directory_vanishes() {
        let dir = TempDir::new().unwrap();
        let ran = dir.path().join("ran");
        let settings = settings(
            &dir,
            vec![
                "-c".to_string(),
                format!("echo x >> '{}'; echo attempt; exit 1", ran.display()),
            ],
        );
        let sink = LogSink::select(&settings.log_primary, &settings.log_fallback);
        let mut supervisor = Supervisor::new(&settings, sink);
        std::fs::remove_dir_all(dir.path().join("share")).unwrap();

        let (stop, handle) = stop_after(Duration::from_millis(400));
        let state = supervisor.run_until(&stop);
        handle.join().unwrap();

        assert!(state.restart_count >= 1);
        assert_eq!(state.last_exit_code, Some(1));
        assert!(state.events.iter().all(|e| e.exit_code == Some(1)));
        let runs = std::fs::read_to_string(&ran).unwrap().lines().count() as u64;
        assert!(runs >= state.restart_count);
    }

    #[test]
    fn test_spawn_failure_counts_as_restart() {
        let dir = TempDir::new().unwrap();
        let mut settings = settings(&dir, Vec::new());
        settings.path = dir.path().join("no-such-agent");
        let mut supervisor = Supervisor::new(&settings, LogSink::console());

        let (stop, handle) = stop_after(Duration::from_millis(300));
        let state = supervisor.run_until(&stop);
        handle.join().unwrap();

        assert!(state.restart_count >= 1);
        assert_eq!(state.last_exit_code, None);
        assert_eq!(state.log_target, LogTarget::Console);
    }

    #[test]
    fn test_exit_code_from_signal() {
        let status = ExitStatus::from_raw(libc::SIGKILL);
        assert_eq!(shell_exit_code(status), 128 + libc::SIGKILL);
        let status = ExitStatus::from_raw(3 << 8);
        assert_eq!(shell_exit_code(status), 3);
    }

    #[test]
    fn test_event_history_is_capped() {
        let mut state = AgentProcessState {
            restart_count: 0,
            last_exit_code: None,
            log_target: LogTarget::Console,
            events: VecDeque::new(),
        };
        for code in 0..(RECENT_EVENTS as i32 + 10) {
            state.record(RestartEvent {
                exit_code: Some(code),
                uptime: Duration::ZERO,
            });
        }
        assert_eq!(state.events.len(), RECENT_EVENTS);
        assert_eq!(state.restart_count, RECENT_EVENTS as u64 + 10);
        assert_eq!(state.events.front().unwrap().exit_code, Some(10));
    }
}
