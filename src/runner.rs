//! Instrumented invocation of the utility under test.

use std::ffi::{OsStr, OsString};
use std::io::{self, Read};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::OnceLock;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::debug;
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;

use crate::config::HarnessConfig;
use crate::error::{HarnessError, Result};
use crate::valgrind::Valgrind;

pub const UTILITY_NAME: &str = "bcachefs";

static UTILITY: OnceLock<PathBuf> = OnceLock::new();

/// Resolves the utility once per process. Later calls return the first
/// successful resolution and ignore `explicit`.
pub fn utility_binary(explicit: Option<&Path>) -> Result<&'static Path> {
    if let Some(path) = UTILITY.get() {
        return Ok(path);
    }
    let name = explicit
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|| UTILITY_NAME.to_string());
    let found = match explicit {
        Some(path) => which::which(path),
        None => which::which(UTILITY_NAME),
    }
    .map_err(|e| HarnessError::BinaryNotFound {
        name,
        reason: e.to_string(),
    })?;
    Ok(UTILITY.get_or_init(|| found))
}

/// One request to run the utility. Consumed by [`Runner::run`].
#[derive(Debug, Clone, Default)]
pub struct Invocation {
    subcommand: Option<String>,
    args: Vec<OsString>,
    instrument: bool,
}

impl Invocation {
    pub fn new(subcommand: &str) -> Self {
        Self {
            subcommand: Some(subcommand.to_string()),
            ..Self::default()
        }
    }

    /// The utility with no subcommand at all.
    pub fn bare() -> Self {
        Self::default()
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn instrumented(mut self, instrument: bool) -> Self {
        self.instrument = instrument;
        self
    }

    pub fn is_instrumented(&self) -> bool {
        self.instrument
    }

    fn utility_args(&self) -> Vec<OsString> {
        self.subcommand
            .iter()
            .map(OsString::from)
            .chain(self.args.iter().cloned())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    /// Full command line as spawned, supervisor included.
    pub command: String,
    /// Exit code; a signal death is reported as `128 + signo`.
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.code == 0
    }

    pub fn stdout_lines(&self) -> Vec<&str> {
        self.stdout.lines().collect()
    }
}

#[derive(Debug)]
pub struct Runner {
    binary: PathBuf,
    valgrind: Valgrind,
    timeout: Duration,
    /// Where supervisor logs are written.
    scratch: PathBuf,
}

impl Runner {
    pub fn new(config: &HarnessConfig) -> Result<Self> {
        let binary = utility_binary(config.binary.as_deref())?.to_path_buf();
        Ok(Self::with_binary(
            binary,
            Valgrind::new(config.suppressions.clone()),
            config.timeout,
        )
        .with_scratch(&config.scratch))
    }

    /// Bypasses process-wide resolution; `binary` is used as given.
    pub fn with_binary(binary: PathBuf, valgrind: Valgrind, timeout: Duration) -> Self {
        Self {
            binary,
            valgrind,
            timeout,
            scratch: std::env::temp_dir(),
        }
    }

    pub fn with_scratch(mut self, scratch: impl Into<PathBuf>) -> Self {
        self.scratch = scratch.into();
        self
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Runs to completion and returns whatever the utility produced. Only
    /// infrastructure problems are errors; a non-zero exit is not.
    pub fn run(&self, invocation: Invocation) -> Result<CommandResult> {
        let mut argv: Vec<OsString> = Vec::new();
        let log_file = if invocation.is_instrumented() {
            let supervisor = self.valgrind.supervisor()?;
            let log = tempfile::Builder::new()
                .prefix("valgrind-")
                .suffix(".log")
                .tempfile_in(&self.scratch)
                .map_err(|e| HarnessError::InstrumentationUnavailable {
                    tool: supervisor.display().to_string(),
                    reason: format!("cannot create log file: {e}"),
                })?;
            argv.extend(self.valgrind.prefix(supervisor, log.path()));
            Some(log)
        } else {
            None
        };
        argv.push(self.binary.clone().into());
        argv.extend(invocation.utility_args());

        let command = render(&argv);
        debug!("running {command}");
        let outcome = spawn_and_wait(&argv, self.timeout).map_err(|e| HarnessError::Spawn {
            command: command.clone(),
            source: e,
        })?;
        let stdout = String::from_utf8_lossy(&outcome.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&outcome.stderr).into_owned();

        let Some(status) = outcome.status else {
            return Err(HarnessError::Timeout {
                command,
                timeout: self.timeout,
                stdout,
                stderr,
            });
        };
        let code = exit_code(status);
        debug!(
            "{command} -> exit {code}, stdout {}B, stderr {}B",
            stdout.len(),
            stderr.len()
        );

        if let Some(log) = &log_file {
            self.valgrind.check_log(&command, log.path())?;
        }

        Ok(CommandResult {
            command,
            code,
            stdout,
            stderr,
        })
    }

    /// Like [`Runner::run`], but a non-zero exit becomes `CommandFailure`.
    pub fn run_checked(&self, invocation: Invocation) -> Result<CommandResult> {
        let result = self.run(invocation)?;
        if !result.success() {
            return Err(HarnessError::CommandFailure {
                command: result.command,
                code: result.code,
                stdout: result.stdout,
                stderr: result.stderr,
            });
        }
        Ok(result)
    }
}

struct Outcome {
    /// `None` when the deadline passed and the child was killed.
    status: Option<ExitStatus>,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

fn spawn_and_wait(argv: &[OsString], timeout: Duration) -> io::Result<Outcome> {
    let (program, rest) = argv
        .split_first()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty argv"))?;
    // Own process group, so anything the utility forks can be killed with it.
    let mut child = Command::new(program)
        .args(rest)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .spawn()?;

    let stdout = drain(child.stdout.take())?;
    let stderr = drain(child.stderr.take())?;
    let status = wait_bounded(&mut child, timeout)?;
    // Stragglers holding the pipes open would keep the readers from seeing EOF.
    kill_group(&child)?;

    Ok(Outcome {
        status,
        stdout: join(stdout)?,
        stderr: join(stderr)?,
    })
}

fn wait_bounded(child: &mut Child, timeout: Duration) -> io::Result<Option<ExitStatus>> {
    let start = Instant::now();
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if start.elapsed() >= timeout {
            kill_group(child)?;
            child.wait()?;
            return Ok(None);
        }
        thread::sleep(Duration::from_millis(10));
    }
}

fn kill_group(child: &Child) -> io::Result<()> {
    let pgid = i32::try_from(child.id()).map_err(io::Error::other)?;
    match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        // The whole group is already gone.
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn drain<R>(pipe: Option<R>) -> io::Result<JoinHandle<io::Result<Vec<u8>>>>
where
    R: Read + Send + 'static,
{
    let mut pipe = pipe.ok_or_else(|| io::Error::other("output pipe unavailable"))?;
    Ok(thread::spawn(move || {
        let mut buf = Vec::new();
        pipe.read_to_end(&mut buf)?;
        Ok(buf)
    }))
}

fn join(handle: JoinHandle<io::Result<Vec<u8>>>) -> io::Result<Vec<u8>> {
    handle
        .join()
        .map_err(|_| io::Error::other("output reader panicked"))?
}

fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}

fn render(argv: &[OsString]) -> String {
    argv.iter()
        .map(|a| a.to_string_lossy())
        .collect::<Vec<_>>()
        .join(" ")
}
