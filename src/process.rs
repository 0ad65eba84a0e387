use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use thiserror::Error;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};

use crate::session::{BridgeHandle, Session};

/// Upper bound between reap attempts when no SIGCHLD arrives.
const REAP_POLL: Duration = Duration::from_millis(250);

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("spawned process has no {0} pipe")]
    MissingPipe(&'static str),

    #[error("failed to wait for process: {0}")]
    Wait(#[from] std::io::Error),
}

/// Builds the command a bridge runs for a session.
pub trait Launcher: Send + Sync {
    fn command(&self, session: &Session) -> Command;

    /// Program name used in logs and spawn errors.
    fn program(&self) -> &str;
}

/// Runs an ssh client against the session's host.
#[derive(Debug, Clone)]
pub struct SshLauncher {
    pub program: String,
    /// Placed before the connection arguments.
    pub extra_args: Vec<String>,
}

impl Default for SshLauncher {
    fn default() -> Self {
        Self {
            program: "ssh".to_string(),
            extra_args: vec!["-tt".to_string()],
        }
    }
}

impl SshLauncher {
    /// Arguments for `session`, without the program name.
    pub fn args(&self, session: &Session) -> Vec<String> {
        let params = &session.params;
        let mut args = self.extra_args.clone();
        args.push("-p".to_string());
        args.push(params.port.to_string());
        if let Some(identity) = &params.identity_file {
            args.push("-i".to_string());
            args.push(identity.display().to_string());
        }
        args.push(format!("{}@{}", params.username, params.host));
        args
    }
}

impl Launcher for SshLauncher {
    fn command(&self, session: &Session) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.args(session));
        cmd
    }

    fn program(&self) -> &str {
        &self.program
    }
}

/// Runs a fixed command; session parameters are passed in the environment.
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
}

impl CommandLauncher {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// `sh -c <script>`.
    pub fn shell(script: impl Into<String>) -> Self {
        Self::new("/bin/sh").args(["-c".to_string(), script.into()])
    }
}

impl Launcher for CommandLauncher {
    fn command(&self, session: &Session) -> Command {
        let params = &session.params;
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .env("TERMBRIDGE_SESSION", &session.id)
            .env("TERMBRIDGE_HOST", &params.host)
            .env("TERMBRIDGE_PORT", params.port.to_string())
            .env("TERMBRIDGE_USER", &params.username);
        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }
        cmd
    }

    fn program(&self) -> &str {
        &self.program
    }
}

/// A spawned process with its three pipes taken out.
pub struct Process {
    pub child: Child,
    pub pid: Option<u32>,
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
}

impl std::fmt::Debug for Process {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Process").field("pid", &self.pid).finish_non_exhaustive()
    }
}

/// Spawn the launcher's command for `session` with piped stdio.
///
/// The child is killed if its handle is dropped.
pub fn spawn(launcher: &dyn Launcher, session: &Session) -> Result<Process, ProcessError> {
    let mut cmd = launcher.command(session);
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|source| ProcessError::Spawn {
        program: launcher.program().to_string(),
        source,
    })?;
    let pid = child.id();
    let stdin = child.stdin.take().ok_or(ProcessError::MissingPipe("stdin"))?;
    let stdout = child.stdout.take().ok_or(ProcessError::MissingPipe("stdout"))?;
    let stderr = child.stderr.take().ok_or(ProcessError::MissingPipe("stderr"))?;

    Ok(Process {
        child,
        pid,
        stdin,
        stdout,
        stderr,
    })
}

/// Wait for `child` to exit and reap it.
///
/// Every reap attempt runs under the handle's signal lock, so the handle
/// is marked exited in the same critical section that frees the pid and a
/// concurrent [`BridgeHandle::terminate`] never signals a recycled pid.
pub async fn wait_exit(child: &mut Child, handle: &BridgeHandle) -> Result<ExitStatus, ProcessError> {
    #[cfg(unix)]
    let mut sigchld = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::child()) {
        Ok(stream) => Some(stream),
        Err(err) => {
            tracing::warn!(?err, "cannot listen for SIGCHLD, polling for exit");
            None
        }
    };
    loop {
        if let Some(status) = handle.reap_with(|| child.try_wait())? {
            return Ok(status);
        }
        if handle.has_exited() {
            // Reaped elsewhere; the status is gone.
            return Err(ProcessError::Wait(std::io::Error::other("process already reaped")));
        }
        #[cfg(unix)]
        if let Some(stream) = sigchld.as_mut() {
            let _ = tokio::time::timeout(REAP_POLL, stream.recv()).await;
            continue;
        }
        tokio::time::sleep(REAP_POLL / 5).await;
    }
}

/// How a bridged process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReport {
    Code(i32),
    Signal(i32),
    Unknown,
}

impl From<ExitStatus> for ExitReport {
    fn from(status: ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return Self::Code(code);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return Self::Signal(signal);
            }
        }
        Self::Unknown
    }
}

impl std::fmt::Display for ExitReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Code(code) => write!(f, "exited with code {code}"),
            Self::Signal(signal) => write!(f, "terminated by signal {signal}"),
            Self::Unknown => write!(f, "exited with unknown status"),
        }
    }
}
