use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::HarvestError;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
/// How long captured output is awaited once the program has exited. Pipes
/// inherited by descendants can stay open far longer than that.
const EXIT_DRAIN_GRACE: Duration = Duration::from_secs(2);
const KILL_DRAIN_GRACE: Duration = Duration::from_millis(200);

/// An external program invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, value: impl Into<String>) -> Self {
        self.args.push(value.into());
        self
    }

    /// Value following `flag` in the argument list.
    pub fn flag_value(&self, flag: &str) -> Option<&str> {
        self.args
            .iter()
            .position(|arg| arg == flag)
            .and_then(|idx| self.args.get(idx + 1))
            .map(String::as_str)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code; `None` when the process was killed or ended by a signal.
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.status == Some(0)
    }

    pub fn diagnostic(&self, program: &str) -> String {
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            return stderr.to_string();
        }
        match self.status {
            Some(code) => format!("{program} exited with status {code}"),
            None => format!("{program} terminated without an exit status"),
        }
    }
}

/// Runs external transfer tools. `Err` is reserved for failing to start the
/// program at all; a non-zero exit or a timeout is reported in the output.
pub trait Transport: Send + Sync {
    fn execute(
        &self,
        command: &CommandSpec,
        timeout: Duration,
    ) -> Result<CommandOutput, HarvestError>;
}

#[derive(Debug, Clone, Default)]
pub struct SystemTransport;

impl SystemTransport {
    pub fn new() -> Self {
        Self
    }

    fn resolve_program(program: &str) -> Result<PathBuf, HarvestError> {
        if Path::new(program).components().count() > 1 {
            return Ok(PathBuf::from(program));
        }
        find_in_path(program).ok_or_else(|| HarvestError::MissingTool(program.to_string()))
    }
}

impl Transport for SystemTransport {
    fn execute(
        &self,
        command: &CommandSpec,
        timeout: Duration,
    ) -> Result<CommandOutput, HarvestError> {
        let program = Self::resolve_program(&command.program)?;
        debug!(program = %program.display(), args = ?command.args, "spawning transport");
        let mut child = Command::new(&program)
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| HarvestError::TransferFailed {
                unit: command.program.clone(),
                message: format!("failed to start {}: {err}", program.display()),
            })?;

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());
        let (status, timed_out) = wait_with_deadline(&mut child, timeout)?;

        let grace = if timed_out {
            KILL_DRAIN_GRACE
        } else {
            EXIT_DRAIN_GRACE
        };
        let drained_by = Instant::now() + grace;
        Ok(CommandOutput {
            status,
            stdout: collect(&stdout, drained_by),
            stderr: collect(&stderr, drained_by),
            timed_out,
        })
    }
}

/// Reads `pipe` to the end on a detached thread.
fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut buffer = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buffer);
        }
        let _ = tx.send(String::from_utf8_lossy(&buffer).into_owned());
    });
    rx
}

fn collect(output: &mpsc::Receiver<String>, until: Instant) -> String {
    output
        .recv_timeout(until.saturating_duration_since(Instant::now()))
        .unwrap_or_default()
}

fn wait_with_deadline(
    child: &mut Child,
    timeout: Duration,
) -> Result<(Option<i32>, bool), HarvestError> {
    // an unrepresentable deadline means no deadline
    let deadline = Instant::now().checked_add(timeout);
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Ok((status.code(), false)),
            Ok(None) => {}
            Err(err) => {
                terminate(child);
                return Err(HarvestError::fs(err));
            }
        }
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            terminate(child);
            return Ok((None, true));
        }
        thread::sleep(POLL_INTERVAL);
    }
}

fn terminate(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

pub fn find_in_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for path in std::env::split_paths(&path_var) {
        let exe = path.join(format!("{name}.exe"));
        if exe.exists() {
            return Some(exe);
        }
        let plain = path.join(name);
        if plain.exists() {
            return Some(plain);
        }
    }
    None
}
