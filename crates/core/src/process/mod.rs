use std::ffi::OsString;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::{PoseTransferError, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(25);
/// How long reader threads get to see end-of-stream after a kill.
const READER_GRACE: Duration = Duration::from_millis(500);

/// Shared flag used to abort a running external tool.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Captured result of an external tool run that exited on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    pub program: String,
    /// `None` when the process was terminated by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Both output streams, stderr last, as the tool printed them.
    pub fn diagnostic(&self) -> String {
        match (self.stdout.trim().is_empty(), self.stderr.trim().is_empty()) {
            (true, true) => match self.code {
                Some(code) => format!("`{}` exited with status {code}", self.program),
                None => format!("`{}` was terminated by a signal", self.program),
            },
            (false, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout, self.stderr),
        }
    }
}

/// External program invocation with piped output, an optional deadline and
/// cooperative cancellation.
#[derive(Debug, Clone)]
pub struct ExternalCommand {
    program: PathBuf,
    args: Vec<OsString>,
    current_dir: Option<PathBuf>,
}

impl ExternalCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            current_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.current_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn program_name(&self) -> String {
        self.program.display().to_string()
    }

    /// Runs the program to completion.
    ///
    /// A non-zero exit is returned as a normal [`ToolOutput`]; only spawn
    /// failures, timeouts and cancellation are errors here.
    pub fn run(&self, timeout: Option<Duration>, cancel: &CancellationToken) -> Result<ToolOutput> {
        let program = self.program_name();
        if cancel.is_cancelled() {
            return Err(PoseTransferError::Cancelled);
        }

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &self.current_dir {
            command.current_dir(dir);
        }

        tracing::debug!(%program, args = ?self.args, "spawning external tool");
        let mut child = command
            .spawn()
            .map_err(|err| PoseTransferError::ExternalToolInvocation {
                program: program.clone(),
                diagnostic: err.to_string(),
            })?;

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());
        let started = Instant::now();

        let code = loop {
            if let Some(status) = child.try_wait()? {
                break status.code();
            }
            if cancel.is_cancelled() {
                terminate(&mut child, &program);
                reap(&program, [stdout, stderr]);
                return Err(PoseTransferError::Cancelled);
            }
            if let Some(limit) = timeout {
                if started.elapsed() >= limit {
                    terminate(&mut child, &program);
                    reap(&program, [stdout, stderr]);
                    return Err(PoseTransferError::ExternalToolTimeout {
                        program,
                        timeout: limit,
                    });
                }
            }
            thread::sleep(POLL_INTERVAL);
        };

        let output = ToolOutput {
            program,
            code,
            stdout: collect(stdout)?,
            stderr: collect(stderr)?,
        };
        tracing::debug!(
            program = %output.program,
            code = ?output.code,
            elapsed_ms = started.elapsed().as_millis() as u64,
            stdout = %output.stdout,
            stderr = %output.stderr,
            "external tool finished"
        );
        Ok(output)
    }
}

fn drain<R: Read + Send + 'static>(stream: Option<R>) -> Option<JoinHandle<Vec<u8>>> {
    stream.map(|mut stream| {
        thread::spawn(move || {
            let mut buffer = Vec::new();
            let _ = stream.read_to_end(&mut buffer);
            buffer
        })
    })
}

fn collect(handle: Option<JoinHandle<Vec<u8>>>) -> Result<String> {
    match handle {
        Some(handle) => {
            let bytes = handle
                .join()
                .map_err(|_| PoseTransferError::msg("output reader thread panicked"))?;
            Ok(String::from_utf8_lossy(&bytes).into_owned())
        }
        None => Ok(String::new()),
    }
}

/// Joins the output readers of a killed tool and logs what it printed.
/// A reader still blocked after the grace period (a grandchild holding the
/// pipe open) is left to finish on its own.
fn reap(program: &str, readers: [Option<JoinHandle<Vec<u8>>>; 2]) {
    let deadline = Instant::now() + READER_GRACE;
    for reader in readers.into_iter().flatten() {
        while !reader.is_finished() && Instant::now() < deadline {
            thread::sleep(POLL_INTERVAL);
        }
        if !reader.is_finished() {
            tracing::debug!(%program, "output reader still blocked after kill");
            continue;
        }
        match reader.join() {
            Ok(bytes) => tracing::debug!(
                %program,
                output = %String::from_utf8_lossy(&bytes),
                "output of terminated tool"
            ),
            Err(_) => tracing::warn!(%program, "output reader thread panicked"),
        }
    }
}

fn terminate(child: &mut Child, program: &str) {
    if let Err(err) = child.kill() {
        tracing::warn!(%program, %err, "failed to kill external tool");
    }
    let _ = child.wait();
}
