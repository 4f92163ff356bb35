//! Owner of the single supervised server process.
//!
//! All lifecycle state lives in one [`Slot`] behind an async mutex; the public operations and
//! the per-process watcher task are the only code that mutates it. The watcher is the only
//! reader of the process output and the only publisher of server-channel entries.

use std::{
    fmt,
    path::{Path, PathBuf},
    process::Stdio,
    str::FromStr,
    sync::Arc,
    time::Duration,
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    process::{Child, ChildStdin, Command},
    sync::{mpsc, oneshot, watch, Mutex},
};
use tracing::{debug, error, info, warn};
use warden_core::{
    classify, route_line, Channel, InputError, LaunchSpec, LineKind, ManagedProcess, ProcessId,
    ProcessState, StartError, StopError,
};

use crate::hub::BroadcastHub;

pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(30);
const KILL_WAIT: Duration = Duration::from_secs(5);
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);
const PARTIAL_LINE_FLUSH: Duration = Duration::from_millis(250);
const INPUT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);
const TAIL_POLL: Duration = Duration::from_millis(100);
const MAX_LINE_BYTES: usize = 64 * 1024;
const LINE_QUEUE: usize = 1024;
const MASKED_REPLY: &str = "********";

#[cfg(windows)]
const LINE_ENDING: &str = "\r\n";
#[cfg(not(windows))]
const LINE_ENDING: &str = "\n";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShutdownPolicy {
    Stop,
    Detach,
}

impl Default for ShutdownPolicy {
    fn default() -> Self {
        Self::Stop
    }
}

impl fmt::Display for ShutdownPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownPolicy::Stop => f.write_str("stop"),
            ShutdownPolicy::Detach => f.write_str("detach"),
        }
    }
}

impl FromStr for ShutdownPolicy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "stop" | "terminate" => Ok(ShutdownPolicy::Stop),
            "detach" | "leave" => Ok(ShutdownPolicy::Detach),
            other => Err(format!("unknown shutdown policy '{other}'")),
        }
    }
}

#[derive(Clone, Debug)]
pub struct SupervisorConfig {
    pub stop_grace: Duration,
    pub ready_on_spawn: bool,
    /// When set, the server's stdout and stderr go to this file and are tailed from there
    /// instead of through pipes. A detached server needs this to keep running once the
    /// pipes' reader is gone.
    pub output_log: Option<PathBuf>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            stop_grace: DEFAULT_STOP_GRACE,
            ready_on_spawn: false,
            output_log: None,
        }
    }
}

struct ProcessRuntime {
    pid: Option<u32>,
    stdin: Option<ChildStdin>,
    kill_tx: Option<oneshot::Sender<()>>,
    exit_rx: watch::Receiver<Option<Option<i32>>>,
}

struct Slot {
    record: ManagedProcess,
    runtime: Option<ProcessRuntime>,
    generation: u64,
}

struct SupervisorInner {
    config: SupervisorConfig,
    hub: BroadcastHub,
    slot: Mutex<Slot>,
}

#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<SupervisorInner>,
}

impl Supervisor {
    pub fn new(hub: BroadcastHub, config: SupervisorConfig, initial: LaunchSpec) -> Self {
        Self {
            inner: Arc::new(SupervisorInner {
                config,
                hub,
                slot: Mutex::new(Slot {
                    record: ManagedProcess::new(initial),
                    runtime: None,
                    generation: 0,
                }),
            }),
        }
    }

    pub fn hub(&self) -> &BroadcastHub {
        &self.inner.hub
    }

    fn system(&self, text: impl Into<String>) {
        self.inner.hub.publish(Channel::System, text, false);
    }

    fn system_error(&self, text: impl Into<String>) {
        self.inner.hub.publish(Channel::System, text, true);
    }

    /// Record a refused start on the system channel.
    pub fn note_rejected_start(&self, err: &StartError) {
        info!(event = "start_rejected", reason = %err);
        self.system(format!("start rejected: {err}"));
    }

    pub async fn status(&self) -> ManagedProcess {
        self.inner.slot.lock().await.record.clone()
    }

    pub async fn start(&self, launch: LaunchSpec) -> Result<ProcessId, StartError> {
        let mut slot = self.inner.slot.lock().await;
        if slot.record.state.is_live() {
            let err = StartError::AlreadyRunning;
            self.note_rejected_start(&err);
            return Err(err);
        }
        if let Err(err) = launch.validate() {
            self.note_rejected_start(&err);
            return Err(err);
        }

        if slot.record.launch != launch {
            slot.record = ManagedProcess::new(launch.clone());
        }
        slot.record.transition(ProcessState::Starting);
        self.system(format!(
            "starting server '{}' ({})",
            launch.game_id,
            launch.program.display()
        ));

        let output_log = self.inner.config.output_log.clone();
        let spawned = build_command(&launch, output_log.as_deref())
            .and_then(|mut command| command.spawn());
        let mut child = match spawned {
            Ok(child) => child,
            Err(err) => {
                slot.record.transition(ProcessState::Stopped);
                error!(event = "spawn_failed", game_id = %launch.game_id, error = %err);
                self.system_error(format!("failed to start server: {err}"));
                return Err(StartError::Spawn(err.to_string()));
            }
        };

        slot.generation += 1;
        let generation = slot.generation;
        let pid = child.id();
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (kill_tx, kill_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = watch::channel(None);

        slot.record.pid = pid;
        slot.runtime = Some(ProcessRuntime {
            pid,
            stdin,
            kill_tx: Some(kill_tx),
            exit_rx,
        });
        info!(
            event = "process_started",
            game_id = %launch.game_id,
            pid = pid.unwrap_or_default(),
            process_id = %slot.record.id
        );
        self.system(format!(
            "process started (pid {})",
            pid.map(|pid| pid.to_string())
                .unwrap_or_else(|| "unknown".to_string())
        ));
        if self.inner.config.ready_on_spawn {
            slot.record.transition(ProcessState::Running);
            self.system("server is running");
        }
        let id = slot.record.id;
        drop(slot);

        let (line_tx, line_rx) = mpsc::channel::<String>(LINE_QUEUE);
        let (output_done_tx, output_done_rx) = watch::channel(false);
        if let Some(path) = output_log {
            tokio::spawn(tail_output(path, line_tx.clone(), output_done_rx));
        }
        if let Some(stdout) = stdout {
            tokio::spawn(forward_output(stdout, line_tx.clone()));
        }
        if let Some(stderr) = stderr {
            tokio::spawn(forward_output(stderr, line_tx.clone()));
        }
        drop(line_tx);

        let supervisor = self.clone();
        tokio::spawn(async move {
            supervisor
                .watch_process(generation, child, line_rx, kill_rx, exit_tx, output_done_tx)
                .await;
        });
        Ok(id)
    }

    pub async fn stop(&self) -> Result<(), StopError> {
        let (mut exit_rx, pid, graceful, joining) = {
            let mut slot = self.inner.slot.lock().await;
            let Slot {
                record, runtime, ..
            } = &mut *slot;
            let runtime = match runtime.as_mut() {
                Some(runtime) if record.state.is_live() => runtime,
                _ => {
                    info!(event = "stop_rejected", state = %record.state);
                    self.system("stop rejected: server is not running");
                    return Err(StopError::NotRunning);
                }
            };
            let mut graceful = false;
            let joining = record.state == ProcessState::Stopping;
            if !joining {
                record.transition(ProcessState::Stopping);
                self.system("stopping server");
                info!(event = "process_stopping", pid = runtime.pid.unwrap_or_default());
                if let (Some(command), Some(stdin)) =
                    (record.launch.stop_command.as_deref(), runtime.stdin.as_mut())
                {
                    graceful = write_line(stdin, command).await.is_ok();
                    if graceful {
                        self.system(format!("> {command}"));
                    }
                }
            }
            (runtime.exit_rx.clone(), runtime.pid, graceful, joining)
        };

        let grace = self.inner.config.stop_grace;
        if joining {
            // Another caller owns the escalation; just wait for it.
            wait_exit(&mut exit_rx, grace + KILL_WAIT).await;
            return Ok(());
        }
        if graceful {
            let term_after = grace.mul_f64(0.8);
            if wait_exit(&mut exit_rx, term_after).await {
                return Ok(());
            }
            signal_terminate(pid);
            if wait_exit(&mut exit_rx, grace.saturating_sub(term_after)).await {
                return Ok(());
            }
        } else {
            signal_terminate(pid);
            if wait_exit(&mut exit_rx, grace).await {
                return Ok(());
            }
        }

        warn!(event = "stop_escalated", grace_secs = grace.as_secs_f64());
        self.system_error(format!(
            "server did not exit within {}s; forcing termination",
            grace.as_secs()
        ));
        self.force_kill().await;
        if !wait_exit(&mut exit_rx, KILL_WAIT).await {
            error!(event = "kill_unconfirmed", pid = pid.unwrap_or_default());
        }
        Ok(())
    }

    async fn force_kill(&self) {
        let mut slot = self.inner.slot.lock().await;
        if let Some(runtime) = slot.runtime.as_mut() {
            signal_kill_group(runtime.pid);
            if let Some(kill_tx) = runtime.kill_tx.take() {
                let _ = kill_tx.send(());
            }
        }
    }

    pub async fn send_input(&self, text: &str) -> Result<(), InputError> {
        let mut slot = self.inner.slot.lock().await;
        let Slot {
            record, runtime, ..
        } = &mut *slot;
        let stdin = match runtime.as_mut().and_then(|runtime| runtime.stdin.as_mut()) {
            Some(stdin) if record.state.accepts_input() => stdin,
            _ => return Err(InputError::NotRunning),
        };
        let pending = record.pending_prompt;
        if text.trim().is_empty() && !pending.map(|kind| kind.accepts(text)).unwrap_or(false) {
            return Err(InputError::EmptyInput);
        }

        if let Err(err) = write_line(stdin, text).await {
            warn!(event = "input_write_failed", error = %err);
            return Err(InputError::Io(err.to_string()));
        }

        let secret = pending.map(|kind| kind.is_secret()).unwrap_or(false);
        if secret {
            self.system(format!("> {MASKED_REPLY}"));
        } else {
            self.system(format!("> {}", text.trim_end()));
        }
        if let Some(kind) = pending {
            if kind.accepts(text) {
                record.pending_prompt = None;
                info!(event = "prompt_answered", prompt = kind.as_str());
                self.system(format!("prompt answered ({})", kind.as_str()));
            }
        }
        Ok(())
    }

    /// Apply the shutdown policy, then close every subscriber stream.
    pub async fn shutdown(&self, policy: ShutdownPolicy) {
        let live = self.inner.slot.lock().await.record.state.is_live();
        if live {
            match policy {
                ShutdownPolicy::Stop => {
                    self.system("control service shutting down; stopping server");
                    if let Err(err) = self.stop().await {
                        debug!(event = "shutdown_stop", error = %err);
                    }
                }
                ShutdownPolicy::Detach => {
                    if self.inner.config.output_log.is_none() {
                        warn!(event = "detach_with_piped_output");
                    }
                    let mut slot = self.inner.slot.lock().await;
                    let pid = slot.runtime.as_ref().and_then(|runtime| runtime.pid);
                    // Dropping the runtime releases stdin and the kill switch; the child is
                    // not killed on drop.
                    slot.runtime = None;
                    info!(event = "process_detached", pid = pid.unwrap_or_default());
                    self.system("control service shutting down; leaving server running");
                }
            }
        }
        self.inner.hub.shutdown();
    }

    async fn watch_process(
        self,
        generation: u64,
        mut child: Child,
        mut line_rx: mpsc::Receiver<String>,
        mut kill_rx: oneshot::Receiver<()>,
        exit_tx: watch::Sender<Option<Option<i32>>>,
        output_done: watch::Sender<bool>,
    ) {
        let mut saw_output = false;
        let mut kill_armed = true;
        let mut lines_open = true;
        let exit_code = loop {
            tokio::select! {
                line = line_rx.recv(), if lines_open => match line {
                    Some(line) => {
                        self.handle_line(generation, &line, &mut saw_output).await;
                    }
                    None => lines_open = false,
                },
                killed = &mut kill_rx, if kill_armed => {
                    kill_armed = false;
                    if killed.is_ok() {
                        if let Err(err) = child.start_kill() {
                            warn!(event = "kill_failed", error = %err);
                        }
                    }
                }
                status = child.wait() => {
                    break match status {
                        Ok(status) => status.code(),
                        Err(err) => {
                            warn!(event = "wait_failed", error = %err);
                            None
                        }
                    };
                }
            }
        };

        // Output written just before exit may still be in flight. A helper the launch script
        // left behind can hold the pipes open indefinitely, so the drain has one deadline.
        let _ = output_done.send(true);
        let drain_deadline = tokio::time::Instant::now() + OUTPUT_DRAIN_TIMEOUT;
        while lines_open {
            match tokio::time::timeout_at(drain_deadline, line_rx.recv()).await {
                Ok(Some(line)) => self.handle_line(generation, &line, &mut saw_output).await,
                Ok(None) | Err(_) => lines_open = false,
            }
        }

        self.finish(generation, exit_code).await;
        let _ = exit_tx.send(Some(exit_code));
    }

    async fn handle_line(&self, generation: u64, line: &str, saw_output: &mut bool) {
        let hub = &self.inner.hub;
        let kind = classify(line);
        hub.publish(Channel::Server, line, kind == LineKind::Error);
        if let Some(channel) = route_line(line) {
            hub.publish(channel, line, false);
        }

        let needs_slot = !*saw_output || matches!(kind, LineKind::PromptRequest(_));
        if needs_slot {
            let mut slot = self.inner.slot.lock().await;
            if slot.generation != generation {
                return;
            }
            if !*saw_output {
                *saw_output = true;
                if slot.record.state == ProcessState::Starting {
                    slot.record.transition(ProcessState::Running);
                    info!(event = "process_running", pid = slot.record.pid.unwrap_or_default());
                    self.system("server is running");
                }
            }
            if let LineKind::PromptRequest(prompt) = kind {
                if slot.record.state.accepts_input() {
                    slot.record.pending_prompt = Some(prompt);
                    info!(event = "prompt_detected", prompt = prompt.as_str());
                    self.system(prompt.description());
                }
            }
        }

        match kind {
            LineKind::Error => {
                self.system_error(line);
            }
            LineKind::TerminalExit => {
                self.system(format!("server reported completion: {}", line.trim()));
            }
            LineKind::Plain | LineKind::PromptRequest(_) => {}
        }
    }

    async fn finish(&self, generation: u64, exit_code: Option<i32>) {
        let mut slot = self.inner.slot.lock().await;
        if slot.generation != generation {
            return;
        }
        slot.runtime = None;
        let requested = slot.record.state == ProcessState::Stopping;
        let next = if requested || exit_code == Some(0) {
            ProcessState::Stopped
        } else {
            ProcessState::Crashed
        };
        slot.record.exit_code = exit_code;
        slot.record.transition(next);

        let code = exit_code
            .map(|code| code.to_string())
            .unwrap_or_else(|| "none (terminated by signal)".to_string());
        match next {
            ProcessState::Crashed => {
                warn!(event = "process_crashed", exit_code = exit_code.unwrap_or(-1));
                self.system_error(format!("process exited unexpectedly with code {code}"));
            }
            _ => {
                info!(event = "process_stopped", exit_code = exit_code.unwrap_or(-1));
                self.system(format!("process exited with code {code}"));
            }
        }
    }
}

fn build_command(launch: &LaunchSpec, output_log: Option<&Path>) -> std::io::Result<Command> {
    let mut command = if launch.is_batch_script() {
        let mut command = Command::new("cmd");
        command.arg("/C").arg(&launch.program);
        command
    } else {
        Command::new(&launch.program)
    };
    command
        .args(&launch.args)
        .stdin(Stdio::piped())
        .kill_on_drop(false);
    // Output sent to a file keeps the server writable after this service exits.
    match output_log {
        Some(path) => {
            let file = open_output_log(path)?;
            command
                .stdout(Stdio::from(file.try_clone()?))
                .stderr(Stdio::from(file));
        }
        None => {
            command.stdout(Stdio::piped()).stderr(Stdio::piped());
        }
    }
    if let Some(dir) = &launch.working_dir {
        command.current_dir(dir);
    }
    #[cfg(unix)]
    command.process_group(0);
    Ok(command)
}

async fn write_line(stdin: &mut ChildStdin, text: &str) -> std::io::Result<()> {
    let mut payload = text.trim_end_matches(['\r', '\n']).to_string();
    payload.push_str(LINE_ENDING);
    let write = async {
        stdin.write_all(payload.as_bytes()).await?;
        stdin.flush().await
    };
    match tokio::time::timeout(INPUT_WRITE_TIMEOUT, write).await {
        Ok(result) => result,
        Err(_) => Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "server input is not being read",
        )),
    }
}

/// Wait until the watcher reports exit. False on timeout.
async fn wait_exit(exit_rx: &mut watch::Receiver<Option<Option<i32>>>, limit: Duration) -> bool {
    tokio::time::timeout(limit, exit_rx.wait_for(|exit| exit.is_some()))
        .await
        .is_ok()
}

#[cfg(unix)]
fn signal_terminate(pid: Option<u32>) {
    signal_group(pid, libc::SIGTERM);
}

#[cfg(not(unix))]
fn signal_terminate(_pid: Option<u32>) {}

#[cfg(unix)]
fn signal_kill_group(pid: Option<u32>) {
    signal_group(pid, libc::SIGKILL);
}

#[cfg(not(unix))]
fn signal_kill_group(_pid: Option<u32>) {}

/// The child leads its own process group, so the signal reaches everything a launch
/// script spawned.
#[cfg(unix)]
fn signal_group(pid: Option<u32>, signal: libc::c_int) {
    let Some(pid) = pid.and_then(|pid| i32::try_from(pid).ok()) else {
        return;
    };
    // SAFETY: kill(2) has no memory-safety preconditions.
    let rc = unsafe { libc::kill(-pid, signal) };
    if rc != 0 {
        debug!(event = "signal_failed", pid = pid, signal = signal);
    }
}

/// Byte-level line assembly shared by the pipe and file readers. Both `\n` and `\r` end a
/// line, so carriage-return progress output becomes one entry per update. A line that reaches
/// `MAX_LINE_BYTES` is cut there.
#[derive(Default)]
struct LineSplitter {
    buf: Vec<u8>,
}

impl LineSplitter {
    fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for byte in bytes {
            match byte {
                b'\n' | b'\r' => self.take_into(&mut lines),
                _ => {
                    self.buf.push(*byte);
                    if self.buf.len() >= MAX_LINE_BYTES {
                        self.take_into(&mut lines);
                    }
                }
            }
        }
        lines
    }

    fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }

    fn take_partial(&mut self) -> Option<String> {
        let mut lines = Vec::new();
        self.take_into(&mut lines);
        lines.pop()
    }

    fn take_into(&mut self, lines: &mut Vec<String>) {
        if self.buf.is_empty() {
            return;
        }
        let line = String::from_utf8_lossy(&self.buf).into_owned();
        self.buf.clear();
        if !line.trim().is_empty() {
            lines.push(line);
        }
    }
}

async fn send_lines(lines: Vec<String>, line_tx: &mpsc::Sender<String>) -> bool {
    for line in lines {
        if line_tx.send(line).await.is_err() {
            return false;
        }
    }
    true
}

async fn send_partial(splitter: &mut LineSplitter, line_tx: &mpsc::Sender<String>) -> bool {
    match splitter.take_partial() {
        Some(line) => line_tx.send(line).await.is_ok(),
        None => true,
    }
}

/// Split a pipe into lines. A trailing partial line is flushed after a short quiet period so
/// prompts printed without a newline are still seen. Read errors end the stream.
async fn forward_output<R>(mut reader: R, line_tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut buffer = [0u8; 8192];
    let mut splitter = LineSplitter::default();
    loop {
        let read = if splitter.has_partial() {
            match tokio::time::timeout(PARTIAL_LINE_FLUSH, reader.read(&mut buffer)).await {
                Ok(result) => result,
                Err(_) => {
                    if !send_partial(&mut splitter, &line_tx).await {
                        return;
                    }
                    continue;
                }
            }
        } else {
            reader.read(&mut buffer).await
        };
        let count = match read {
            Ok(0) => break,
            Ok(count) => count,
            Err(err) => {
                warn!(event = "output_read_error", error = %err);
                break;
            }
        };
        if !send_lines(splitter.feed(&buffer[..count]), &line_tx).await {
            return;
        }
    }
    let _ = send_partial(&mut splitter, &line_tx).await;
}

/// Follow the server's output log from the start. Reading continues until the first end of
/// file seen after `done` turns true.
async fn tail_output(path: PathBuf, line_tx: mpsc::Sender<String>, mut done: watch::Receiver<bool>) {
    let mut file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(err) => {
            warn!(event = "output_log_open_failed", path = %path.display(), error = %err);
            return;
        }
    };
    let mut buffer = [0u8; 8192];
    let mut splitter = LineSplitter::default();
    let mut quiet = Duration::ZERO;
    loop {
        let count = match file.read(&mut buffer).await {
            Ok(count) => count,
            Err(err) => {
                warn!(event = "output_read_error", error = %err);
                break;
            }
        };
        if count > 0 {
            quiet = Duration::ZERO;
            if !send_lines(splitter.feed(&buffer[..count]), &line_tx).await {
                return;
            }
            continue;
        }
        if *done.borrow() {
            break;
        }
        if quiet >= PARTIAL_LINE_FLUSH && !send_partial(&mut splitter, &line_tx).await {
            return;
        }
        tokio::select! {
            changed = done.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = tokio::time::sleep(TAIL_POLL) => quiet += TAIL_POLL,
        }
    }
    let _ = send_partial(&mut splitter, &line_tx).await;
}

fn open_output_log(path: &Path) -> std::io::Result<std::fs::File> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
}
