//! Asynchronous subprocess engine.
//!
//! A [`Command`] is an immutable template describing an executable, its
//! arguments, environment and stream wiring; every `with_*` method returns a
//! modified copy. [`Command::start`] launches the process and returns a
//! [`CommandProcess`] that pumps the child's streams in the background,
//! records all output for replay, and can be waited on any number of times.
//!
//! Note that a child writes output into fixed-size OS pipes and stalls once
//! a pipe fills up. The engine therefore always drains stdout and stderr
//! into capture buffers, regardless of the configured sinks.

mod capture;

pub use capture::CaptureReader;
pub(crate) use capture::CaptureBuffer;

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use log::{debug, warn};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch, OnceCell};
use tokio::task::JoinHandle;

/// The source from which a command reads its standard input.
#[derive(Clone, Debug)]
pub enum InputSource {
    /// No input is connected; the child sees end of stream.
    Process,
    /// The parent process's own stdin.
    Inherit,
    /// The contents of a file.
    File(PathBuf),
    /// A caller-supplied byte string.
    Bytes(Bytes),
}

/// The sink to which a command output stream is written.
///
/// Every sink is in addition to the engine's capture buffer, which always
/// records the stream in full.
#[derive(Clone)]
pub enum OutputSink {
    /// Capture only.
    Process,
    /// The parent process's own stdout or stderr.
    Inherit,
    /// Overwrite a file.
    File(PathBuf),
    /// Append to a file.
    FileAppend(PathBuf),
    /// A caller-supplied stream.
    Stream(Arc<dyn ByteSink>),
}

impl fmt::Debug for OutputSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputSink::Process => write!(f, "Process"),
            OutputSink::Inherit => write!(f, "Inherit"),
            OutputSink::File(p) => write!(f, "File({})", p.display()),
            OutputSink::FileAppend(p) => write!(f, "FileAppend({})", p.display()),
            OutputSink::Stream(_) => write!(f, "Stream(..)"),
        }
    }
}

/// Supplier of writable streams for [`OutputSink::Stream`].
pub trait ByteSink: Send + Sync {
    fn open(&self) -> std::io::Result<Box<dyn AsyncWrite + Send + Unpin>>;
}

type SuccessCondition = Arc<dyn Fn(&CommandResult) -> bool + Send + Sync>;

/// An immutable description of an executable command.
///
/// Defaults: the parent's environment, the parent's working directory, no
/// stdin, capture-only output sinks, and success exactly when the exit code
/// is zero.
#[derive(Clone)]
pub struct Command {
    executable: String,
    args: Vec<String>,
    clear_env: bool,
    env: BTreeMap<String, String>,
    working_dir: Option<PathBuf>,
    stdin: InputSource,
    stdout: OutputSink,
    stderr: OutputSink,
    success: SuccessCondition,
}

impl Command {
    pub fn new(executable: impl Into<String>) -> Self {
        Command {
            executable: executable.into(),
            args: Vec::new(),
            clear_env: false,
            env: BTreeMap::new(),
            working_dir: None,
            stdin: InputSource::Process,
            stdout: OutputSink::Process,
            stderr: OutputSink::Process,
            success: Arc::new(|result| result.exit_code() == 0),
        }
    }

    pub fn executable(&self) -> &str {
        &self.executable
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_args_appended<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Replaces the inherited environment with exactly `env`.
    pub fn with_env<I, K, V>(mut self, env: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.clear_env = true;
        self.env = env
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self
    }

    /// Runs the command with an empty environment.
    pub fn with_empty_env(self) -> Self {
        self.with_env(std::iter::empty::<(String, String)>())
    }

    /// Adds one variable on top of the current environment.
    pub fn with_env_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_stdin(mut self, source: InputSource) -> Self {
        self.stdin = source;
        self
    }

    pub fn with_stdin_utf8(self, input: impl Into<String>) -> Self {
        self.with_stdin(InputSource::Bytes(Bytes::from(input.into())))
    }

    pub fn with_stdout(mut self, sink: OutputSink) -> Self {
        self.stdout = sink;
        self
    }

    pub fn with_stdout_file(self, path: impl Into<PathBuf>) -> Self {
        self.with_stdout(OutputSink::File(path.into()))
    }

    pub fn with_stderr(mut self, sink: OutputSink) -> Self {
        self.stderr = sink;
        self
    }

    pub fn with_success_condition(
        mut self,
        condition: impl Fn(&CommandResult) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.success = Arc::new(condition);
        self
    }

    /// Success exactly when the exit code is one of `codes`.
    pub fn with_success_exit_codes(self, codes: &[i32]) -> Self {
        let codes = codes.to_vec();
        self.with_success_condition(move |result| codes.contains(&result.exit_code()))
    }

    /// Starts the command running asynchronously.
    pub fn start(self) -> Result<CommandProcess, CommandError> {
        debug!("starting command: {self}");
        CommandProcess::spawn(self)
    }

    /// Starts the command and waits for it to complete. If the returned
    /// future is dropped before completion the child is killed; a plain
    /// [`CommandProcess::wait`] never kills.
    pub async fn execute(self) -> Result<CommandResult, CommandError> {
        let process = self.start()?;
        struct KillOnDrop<'a> {
            process: &'a CommandProcess,
            armed: bool,
        }
        impl Drop for KillOnDrop<'_> {
            fn drop(&mut self) {
                if self.armed {
                    self.process.kill();
                }
            }
        }
        let mut guard = KillOnDrop {
            process: &process,
            armed: true,
        };
        let result = process.wait().await;
        guard.armed = false;
        result
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.executable)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("executable", &self.executable)
            .field("args", &self.args)
            .field("clear_env", &self.clear_env)
            .field("env", &self.env)
            .field("working_dir", &self.working_dir)
            .field("stdin", &self.stdin)
            .field("stdout", &self.stdout)
            .field("stderr", &self.stderr)
            .finish()
    }
}

/// The result of a completed command execution.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandResult {
    exit_code: i32,
    stdout: Bytes,
    stderr: Bytes,
}

impl CommandResult {
    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    pub fn stdout_bytes(&self) -> &[u8] {
        &self.stdout
    }

    pub fn stderr_bytes(&self) -> &[u8] {
        &self.stderr
    }

    pub fn stdout_utf8(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_utf8(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

impl fmt::Display for CommandResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "exit code {}, stdout: {:?}, stderr: {:?}",
            self.exit_code,
            self.stdout_utf8(),
            self.stderr_utf8()
        )
    }
}

/// A command that completed but failed its success condition.
#[derive(Clone, Debug)]
pub struct CommandFailure {
    command: String,
    result: CommandResult,
}

impl CommandFailure {
    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn result(&self) -> &CommandResult {
        &self.result
    }
}

impl fmt::Display for CommandFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "`{}` failed with {}", self.command, self.result)
    }
}

#[derive(Error, Debug)]
pub enum CommandError {
    /// The OS refused to launch the subprocess.
    #[error("failed to start `{command}`")]
    Start {
        command: String,
        #[source]
        source: std::io::Error,
    },
    /// The subprocess exited and the result failed the success condition.
    #[error("{0}")]
    Failed(CommandFailure),
    /// A deadline given to [`CommandProcess::wait_with_timeout`] elapsed.
    /// The process keeps running.
    #[error("`{command}` did not complete within {timeout:?}")]
    Timeout { command: String, timeout: Duration },
}

/// A running process started from a [`Command`].
///
/// Waiting does not kill the process when the waiting future is dropped;
/// only [`Command::execute`] ties the child's lifetime to the caller. Use
/// `kill().wait().await` to kill and reap.
pub struct CommandProcess {
    command: Command,
    kill_tx: mpsc::UnboundedSender<()>,
    exit_rx: watch::Receiver<Option<i32>>,
    stdout_capture: Arc<CaptureBuffer>,
    stderr_capture: Arc<CaptureBuffer>,
    stdin_pump: Option<AsyncCopier>,
    stdout_pump: AsyncCopier,
    stderr_pump: AsyncCopier,
    result: OnceCell<CommandResult>,
}

impl CommandProcess {
    fn spawn(command: Command) -> Result<Self, CommandError> {
        let start_error = |source| CommandError::Start {
            command: command.to_string(),
            source,
        };

        let stdin_stream = open_source(&command.stdin).map_err(start_error)?;
        let stdout_sink = open_sink(&command.stdout, StdStream::Out).map_err(start_error)?;
        let stderr_sink = open_sink(&command.stderr, StdStream::Err).map_err(start_error)?;

        let mut builder = tokio::process::Command::new(&command.executable);
        builder.args(&command.args);
        if command.clear_env {
            builder.env_clear();
        }
        builder.envs(&command.env);
        if let Some(dir) = &command.working_dir {
            builder.current_dir(dir);
        }
        builder.stdin(if stdin_stream.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        builder.stdout(Stdio::piped());
        builder.stderr(Stdio::piped());

        let mut child = builder.spawn().map_err(start_error)?;

        let stdout_capture = CaptureBuffer::new();
        let stderr_capture = CaptureBuffer::new();

        let stdin_pump = match stdin_stream {
            Some(source) => {
                let pipe = child.stdin.take().expect("child stdin requested");
                Some(spawn_input_pump(source, pipe))
            }
            None => None,
        };
        let stdout_pump = spawn_output_pump(
            child.stdout.take().expect("child stdout requested"),
            Arc::clone(&stdout_capture),
            stdout_sink,
        );
        let stderr_pump = spawn_output_pump(
            child.stderr.take().expect("child stderr requested"),
            Arc::clone(&stderr_capture),
            stderr_sink,
        );

        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = mpsc::unbounded_channel();
        tokio::spawn(reap(child, exit_tx, kill_rx));

        Ok(CommandProcess {
            command,
            kill_tx,
            exit_rx,
            stdout_capture,
            stderr_capture,
            stdin_pump,
            stdout_pump,
            stderr_pump,
            result: OnceCell::new(),
        })
    }

    /// The command that started this process.
    pub fn command(&self) -> &Command {
        &self.command
    }

    /// Whether the process has not yet terminated.
    pub fn is_alive(&self) -> bool {
        self.exit_rx.borrow().is_none()
    }

    /// Blocks until the command completes, then returns the result if it
    /// satisfies the command's success condition and fails with
    /// [`CommandError::Failed`] otherwise. Repeated waits return the same
    /// result.
    pub async fn wait(&self) -> Result<CommandResult, CommandError> {
        let exit_code = self.wait_for_exit().await;
        let result = self
            .result
            .get_or_init(|| self.finalize(exit_code))
            .await
            .clone();
        if (self.command.success)(&result) {
            Ok(result)
        } else {
            Err(CommandError::Failed(CommandFailure {
                command: self.command.to_string(),
                result,
            }))
        }
    }

    /// Like [`wait`](Self::wait) but fails with [`CommandError::Timeout`]
    /// once the deadline elapses. The process is not killed.
    pub async fn wait_with_timeout(
        &self,
        timeout: Duration,
    ) -> Result<CommandResult, CommandError> {
        match tokio::time::timeout(timeout, self.wait()).await {
            Ok(result) => result,
            Err(_) => Err(CommandError::Timeout {
                command: self.command.to_string(),
                timeout,
            }),
        }
    }

    async fn wait_for_exit(&self) -> i32 {
        let mut rx = self.exit_rx.clone();
        loop {
            if let Some(code) = *rx.borrow() {
                return code;
            }
            if rx.changed().await.is_err() {
                // The reaper is gone; its final send is already visible.
                if let Some(code) = *rx.borrow() {
                    return code;
                }
                panic!("process reaper vanished");
            }
        }
    }

    /// Computed exactly once per process; later waits reuse the outcome.
    async fn finalize(&self, exit_code: i32) -> CommandResult {
        // The process has ended, so there is no point waiting for a stdin
        // pump that may be blocked on an unbounded source; force-stop it.
        if let Some(pump) = &self.stdin_pump {
            pump.stop();
            pump.wait().await;
        }
        // The output pumps are drained in full before the result is built.
        self.stdout_pump.wait().await;
        self.stderr_pump.wait().await;
        CommandResult {
            exit_code,
            stdout: self.stdout_capture.snapshot(),
            stderr: self.stderr_capture.snapshot(),
        }
    }

    /// Sends the termination signal and returns immediately. Killing a
    /// process that already exited has no effect.
    pub fn kill(&self) -> &Self {
        let _ = self.kill_tx.send(());
        self
    }

    /// A new streaming view over the captured standard output.
    pub fn stdout_reader(&self) -> CaptureReader {
        self.stdout_capture.reader()
    }

    /// A new streaming view over the captured standard error.
    pub fn stderr_reader(&self) -> CaptureReader {
        self.stderr_capture.reader()
    }
}

impl fmt::Debug for CommandProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandProcess")
            .field("command", &self.command)
            .field("alive", &self.is_alive())
            .finish()
    }
}

enum StdStream {
    Out,
    Err,
}

fn open_source(
    source: &InputSource,
) -> std::io::Result<Option<Box<dyn AsyncRead + Send + Unpin>>> {
    Ok(match source {
        InputSource::Process => None,
        InputSource::Inherit => Some(Box::new(tokio::io::stdin())),
        InputSource::File(path) => Some(Box::new(tokio::fs::File::from_std(
            std::fs::File::open(path)?,
        ))),
        InputSource::Bytes(bytes) => Some(Box::new(std::io::Cursor::new(bytes.clone()))),
    })
}

fn open_sink(
    sink: &OutputSink,
    stream: StdStream,
) -> std::io::Result<Option<Box<dyn AsyncWrite + Send + Unpin>>> {
    Ok(match sink {
        OutputSink::Process => None,
        OutputSink::Inherit => Some(match stream {
            StdStream::Out => Box::new(tokio::io::stdout()),
            StdStream::Err => Box::new(tokio::io::stderr()),
        }),
        OutputSink::File(path) => Some(Box::new(tokio::fs::File::from_std(
            std::fs::File::create(path)?,
        ))),
        OutputSink::FileAppend(path) => Some(Box::new(tokio::fs::File::from_std(
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?,
        ))),
        OutputSink::Stream(supplier) => Some(supplier.open()?),
    })
}

/// A worker driving one stream copy to completion.
#[derive(Debug)]
struct AsyncCopier {
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl AsyncCopier {
    fn spawn(future: impl std::future::Future<Output = ()> + Send + 'static) -> Self {
        AsyncCopier {
            handle: Mutex::new(Some(tokio::spawn(future))),
        }
    }

    /// Cancels the copy; the dropped worker closes its streams.
    fn stop(&self) {
        if let Some(handle) = &*self.handle.lock().unwrap() {
            handle.abort();
        }
    }

    async fn wait(&self) {
        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

fn spawn_input_pump(
    mut source: Box<dyn AsyncRead + Send + Unpin>,
    mut pipe: tokio::process::ChildStdin,
) -> AsyncCopier {
    AsyncCopier::spawn(async move {
        if let Err(e) = tokio::io::copy(&mut source, &mut pipe).await {
            debug!("stdin pump ended: {e}");
        }
        let _ = pipe.shutdown().await;
    })
}

fn spawn_output_pump(
    mut pipe: impl AsyncRead + Send + Unpin + 'static,
    capture: Arc<CaptureBuffer>,
    mut sink: Option<Box<dyn AsyncWrite + Send + Unpin>>,
) -> AsyncCopier {
    AsyncCopier::spawn(async move {
        let mut buf = [0u8; 8192];
        loop {
            match pipe.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    capture.append(&buf[..n]);
                    if let Some(out) = sink.as_mut() {
                        if let Err(e) = out.write_all(&buf[..n]).await {
                            warn!("output sink write failed: {e}");
                            sink = None;
                        }
                    }
                }
                Err(e) => {
                    debug!("output pump read ended: {e}");
                    break;
                }
            }
        }
        if let Some(out) = sink.as_mut() {
            let _ = out.flush().await;
            let _ = out.shutdown().await;
        }
        capture.close();
    })
}

/// Owns the child for its whole lifetime: delivers kill requests and
/// publishes the exit code exactly once.
async fn reap(
    mut child: tokio::process::Child,
    exit_tx: watch::Sender<Option<i32>>,
    mut kill_rx: mpsc::UnboundedReceiver<()>,
) {
    let code = loop {
        tokio::select! {
            status = child.wait() => break status_code(status),
            request = kill_rx.recv() => match request {
                Some(()) => terminate(&mut child),
                // Every handle is gone; nothing can request a kill anymore.
                None => break status_code(child.wait().await),
            },
        }
    };
    let _ = exit_tx.send(Some(code));
}

fn status_code(status: std::io::Result<std::process::ExitStatus>) -> i32 {
    match status {
        Ok(status) => exit_code_of(status),
        Err(e) => {
            warn!("waiting on child failed: {e}");
            -1
        }
    }
}

#[cfg(unix)]
fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    // Signal terminations surface as 128 + signo, so SIGTERM reads as 143.
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}

#[cfg(not(unix))]
fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

#[cfg(unix)]
fn terminate(child: &mut tokio::process::Child) {
    // SIGTERM rather than SIGKILL, so the device tools get to shut their
    // service connections down and report the usual 143.
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut tokio::process::Child) {
    let _ = child.start_kill();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        Command::new("/bin/sh").with_args(["-c", script])
    }

    #[tokio::test]
    async fn captures_stdout_and_stderr() {
        let process = sh("echo out; echo err 1>&2").start().unwrap();
        let result = process.wait().await.unwrap();
        assert_eq!(result.exit_code(), 0);
        assert_eq!(result.stdout_utf8(), "out\n");
        assert_eq!(result.stderr_utf8(), "err\n");
    }

    #[tokio::test]
    async fn nonzero_exit_fails_the_default_success_condition() {
        let process = sh("echo boom 1>&2; exit 3").start().unwrap();
        match process.wait().await {
            Err(CommandError::Failed(failure)) => {
                assert_eq!(failure.result().exit_code(), 3);
                assert_eq!(failure.result().stderr_utf8(), "boom\n");
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn custom_success_exit_codes_are_honored() {
        let result = sh("exit 163")
            .with_success_exit_codes(&[0, 163])
            .execute()
            .await
            .unwrap();
        assert_eq!(result.exit_code(), 163);
    }

    #[tokio::test]
    async fn repeated_waits_return_equal_results() {
        let process = sh("echo once").start().unwrap();
        let first = process.wait().await.unwrap();
        let second = process.wait().await.unwrap();
        let third = process.wait().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(second, third);
    }

    #[tokio::test]
    async fn large_output_is_captured_without_loss() {
        let process = sh("head -c 1048576 /dev/zero").start().unwrap();
        let mut reader = process.stdout_reader();
        let result = process.wait().await.unwrap();
        assert_eq!(result.stdout_bytes().len(), 1048576);
        assert_eq!(reader.read_to_end().await.len(), 1048576);
    }

    #[tokio::test]
    async fn stdin_bytes_reach_the_child() {
        let result = Command::new("cat")
            .with_stdin_utf8("over the pipe")
            .execute()
            .await
            .unwrap();
        assert_eq!(result.stdout_utf8(), "over the pipe");
    }

    #[tokio::test]
    async fn empty_stdin_means_immediate_eof() {
        let result = Command::new("cat")
            .with_stdin(InputSource::Bytes(Bytes::new()))
            .execute()
            .await
            .unwrap();
        assert!(result.stdout_bytes().is_empty());
    }

    #[tokio::test]
    async fn file_sink_receives_output_and_capture_still_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.log");
        let result = sh("echo to-file")
            .with_stdout_file(&path)
            .execute()
            .await
            .unwrap();
        assert_eq!(result.stdout_utf8(), "to-file\n");
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "to-file\n");
    }

    struct SharedBufferSink {
        buffer: Arc<Mutex<Vec<u8>>>,
    }

    impl ByteSink for SharedBufferSink {
        fn open(&self) -> std::io::Result<Box<dyn AsyncWrite + Send + Unpin>> {
            Ok(Box::new(SharedBufferWriter {
                buffer: Arc::clone(&self.buffer),
            }))
        }
    }

    struct SharedBufferWriter {
        buffer: Arc<Mutex<Vec<u8>>>,
    }

    impl AsyncWrite for SharedBufferWriter {
        fn poll_write(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            buf: &[u8],
        ) -> std::task::Poll<std::io::Result<usize>> {
            self.buffer.lock().unwrap().extend_from_slice(buf);
            std::task::Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }

        fn poll_shutdown(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn stream_sink_receives_output_and_capture_still_records() {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let sink = SharedBufferSink {
            buffer: Arc::clone(&buffer),
        };
        let result = sh("echo to-stream")
            .with_stdout(OutputSink::Stream(Arc::new(sink)))
            .execute()
            .await
            .unwrap();
        assert_eq!(result.stdout_utf8(), "to-stream\n");
        assert_eq!(&*buffer.lock().unwrap(), b"to-stream\n");
    }

    #[tokio::test]
    async fn wait_with_timeout_leaves_the_process_running() {
        let process = sh("sleep 5").start().unwrap();
        match process.wait_with_timeout(Duration::from_millis(50)).await {
            Err(CommandError::Timeout { .. }) => {}
            other => panic!("expected timeout, got {other:?}"),
        }
        assert!(process.is_alive());
        let result = process.kill().wait().await;
        match result {
            Err(CommandError::Failed(failure)) => {
                assert_eq!(failure.result().exit_code(), 143);
            }
            other => panic!("expected SIGTERM exit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn reader_streams_while_process_is_alive() {
        let process = sh("echo first; sleep 0.2; echo second").start().unwrap();
        let mut reader = process.stdout_reader();
        assert_eq!(reader.next_line().await.as_deref(), Some("first"));
        assert_eq!(reader.next_line().await.as_deref(), Some("second"));
        assert_eq!(reader.next_line().await, None);
        process.wait().await.unwrap();
    }

    #[tokio::test]
    async fn start_failure_reports_the_command() {
        match Command::new("/nonexistent/binary-xyz").start() {
            Err(CommandError::Start { command, .. }) => {
                assert!(command.contains("/nonexistent/binary-xyz"));
            }
            other => panic!("expected start error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn environment_replacement_is_exact() {
        let result = sh("echo \"${IOSCONTROL_TEST_VAR}:${HOME:-unset}\"")
            .with_env([("IOSCONTROL_TEST_VAR", "42")])
            .execute()
            .await
            .unwrap();
        assert_eq!(result.stdout_utf8(), "42:unset\n");
    }
}
