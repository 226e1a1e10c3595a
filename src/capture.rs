use crate::record::{record_id, CommandRecord, SessionRecord};
use crate::store::LogStore;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use crossterm::terminal;
use nix::sys::signal::{killpg, sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::Pid;
use portable_pty::{CommandBuilder, NativePtySystem, PtySize, PtySystem};
use std::ffi::CStr;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, Once};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

/// Set on every captured child so a nested invocation can tell it is inside one.
pub const ACTIVE_ENV: &str = "SHELLTAPE_ACTIVE";

const RELAY_CHUNK: usize = 8192;
const RESIZE_POLL: Duration = Duration::from_millis(50);
const COLLECT_POLL: Duration = Duration::from_millis(20);

static WINCH_PENDING: AtomicBool = AtomicBool::new(false);
static FOREGROUND_PGID: AtomicI32 = AtomicI32::new(0);
static INIT_CTRL_C: Once = Once::new();
static INIT_WINCH: Once = Once::new();

/// What to run. Built by the CLI layer from its arguments.
#[derive(Debug, Clone, Default)]
pub struct CaptureRequest {
    pub argv: Vec<String>,
    // Run the joined line through `<shell> -c` instead of argv-style
    pub shell_mode: bool,
    pub max_output_size: Option<usize>,
    // The caller is itself running inside a capture
    pub nested: bool,
}

/// Where and for whom the command runs. Read from the environment by the
/// shell-hook side, never by the engine.
#[derive(Debug, Clone)]
pub struct CaptureContext {
    pub session_id: String,
    pub cwd: PathBuf,
    pub shell: String,
    pub hostname: String,
    pub username: String,
}

#[derive(Debug)]
pub struct CaptureOutcome {
    pub exit_code: i32,
    // Present only when a record was persisted
    pub record: Option<CommandRecord>,
    pub relayed_bytes: u64,
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("pseudo-terminal unavailable: {0:#}")]
    PtyUnavailable(anyhow::Error),
    #[error("failed to start {program}: {error:#}")]
    Spawn {
        program: String,
        exit_code: i32,
        error: anyhow::Error,
    },
    #[error("lost track of the child process: {0:#}")]
    Wait(anyhow::Error),
}

/// Result of running one child on a pseudo-terminal.
#[derive(Debug)]
pub struct PtyRun {
    pub output: Vec<u8>,
    pub total_bytes: u64,
    pub relayed_bytes: u64,
    pub exit_code: i32,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

/// Capped copy of everything the child wrote.
#[derive(Debug, Default)]
struct CaptureBuffer {
    data: Vec<u8>,
    cap: usize,
    total: u64,
}

impl CaptureBuffer {
    fn new(cap: usize) -> Self {
        Self {
            data: Vec::with_capacity(cap.min(64 * 1024)),
            cap,
            total: 0,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        self.total += chunk.len() as u64;
        let room = self.cap.saturating_sub(self.data.len());
        if room > 0 {
            self.data.extend_from_slice(&chunk[..chunk.len().min(room)]);
        }
    }
}

pub struct CaptureEngine {
    max_output_size: usize,
    drain_timeout: Duration,
    interactive: bool,
    self_exe: Option<PathBuf>,
}

impl CaptureEngine {
    pub fn new(max_output_size: usize) -> Self {
        Self {
            max_output_size,
            drain_timeout: Duration::from_millis(200),
            interactive: false,
            self_exe: None,
        }
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Forward stdin and put the real terminal in raw mode while the child runs.
    pub fn interactive(mut self, interactive: bool) -> Self {
        self.interactive = interactive;
        self
    }

    /// Path of the running capture binary, for the recursion guard.
    pub fn with_self_exe(mut self, self_exe: Option<PathBuf>) -> Self {
        self.self_exe = self_exe.map(|p| p.canonicalize().unwrap_or(p));
        self
    }

    /// Run `request` on a pseudo-terminal, relay its output to stdout and
    /// append the finished record to `store`. Always yields the exit code the
    /// shell should see.
    pub fn capture(
        &self,
        store: &LogStore,
        request: &CaptureRequest,
        ctx: &CaptureContext,
    ) -> CaptureOutcome {
        self.capture_with_sink(store, request, ctx, io::stdout())
    }

    pub fn capture_with_sink<W>(
        &self,
        store: &LogStore,
        request: &CaptureRequest,
        ctx: &CaptureContext,
        sink: W,
    ) -> CaptureOutcome
    where
        W: Write + Send + 'static,
    {
        let Some((program, args)) = resolve_invocation(request, ctx) else {
            warn!("nothing to run");
            return CaptureOutcome {
                exit_code: 0,
                record: None,
                relayed_bytes: 0,
            };
        };
        let command_text = request.argv.join(" ");

        if request.nested || self.is_self_invocation(&request.argv[0]) {
            debug!(command = %command_text, "already capturing; running directly");
            return run_uncaptured(&program, &args, &ctx.cwd);
        }

        let cap = request.max_output_size.unwrap_or(self.max_output_size);
        let run = match self.run_on_pty(&program, &args, &ctx.cwd, cap, sink) {
            Ok(run) => run,
            Err(CaptureError::PtyUnavailable(err)) => {
                warn!("{err:#}; running without capture");
                return run_uncaptured(&program, &args, &ctx.cwd);
            }
            Err(CaptureError::Spawn {
                program,
                exit_code,
                error,
            }) => {
                eprintln!("shelltape: failed to start {program}: {error:#}");
                return CaptureOutcome {
                    exit_code,
                    record: None,
                    relayed_bytes: 0,
                };
            }
            Err(err @ CaptureError::Wait(_)) => {
                warn!("{err}");
                return CaptureOutcome {
                    exit_code: 1,
                    record: None,
                    relayed_bytes: 0,
                };
            }
        };

        let record = build_record(command_text, ctx, &run, cap);
        let persisted = match persist(store, &record, ctx) {
            Ok(()) => Some(record),
            Err(err) => {
                warn!("command ran but was not recorded: {err:#}");
                None
            }
        };

        CaptureOutcome {
            exit_code: run.exit_code,
            record: persisted,
            relayed_bytes: run.relayed_bytes,
        }
    }

    fn is_self_invocation(&self, program: &str) -> bool {
        let Some(self_exe) = &self.self_exe else {
            return false;
        };
        let candidate = Path::new(program);
        if candidate.file_name().is_some() && candidate.file_name() == self_exe.file_name() {
            return true;
        }
        candidate
            .canonicalize()
            .map(|resolved| &resolved == self_exe)
            .unwrap_or(false)
    }

    /// Spawn `program` on a fresh PTY. Relay, buffering and waiting run
    /// concurrently; pass-through never waits on the buffer.
    pub fn run_on_pty<W>(
        &self,
        program: &str,
        args: &[String],
        cwd: &Path,
        cap: usize,
        mut sink: W,
    ) -> Result<PtyRun, CaptureError>
    where
        W: Write + Send + 'static,
    {
        let pty_system = NativePtySystem::default();
        let pair = pty_system
            .openpty(current_size())
            .context("Failed to open PTY")
            .map_err(CaptureError::PtyUnavailable)?;
        let mut reader = pair
            .master
            .try_clone_reader()
            .context("Failed to clone PTY reader")
            .map_err(CaptureError::PtyUnavailable)?;
        let writer = pair
            .master
            .take_writer()
            .context("Failed to take PTY writer")
            .map_err(CaptureError::PtyUnavailable)?;

        let mut cmd = CommandBuilder::new(program);
        cmd.args(args);
        cmd.cwd(cwd);
        cmd.env(ACTIVE_ENV, "1");

        let raw_guard = RawModeGuard::enable(self.interactive);
        install_interrupt_forwarding();
        if let Err(err) = install_resize_handler() {
            debug!("resize propagation disabled: {err}");
        }

        let start_time = Utc::now();
        let mut child = match pair.slave.spawn_command(cmd) {
            Ok(child) => child,
            Err(error) => {
                drop(raw_guard);
                return Err(CaptureError::Spawn {
                    program: program.to_string(),
                    exit_code: spawn_exit_code(&error),
                    error,
                });
            }
        };
        // Only the child holds the slave now, so the relay sees EOF when it exits
        drop(pair.slave);

        if let Some(pid) = child.process_id() {
            FOREGROUND_PGID.store(pid as i32, Ordering::SeqCst);
        }

        let relayed = Arc::new(AtomicU64::new(0));
        let buffer = Arc::new(Mutex::new(CaptureBuffer::new(cap)));
        let stop = Arc::new(AtomicBool::new(false));
        // Held while a chunk is relayed and queued, so `stop` never splits one
        let in_flight = Arc::new(Mutex::new(()));
        let (tx, rx) = mpsc::channel::<Vec<u8>>();

        let relay = {
            let relayed = Arc::clone(&relayed);
            let stop = Arc::clone(&stop);
            let in_flight = Arc::clone(&in_flight);
            thread::Builder::new()
                .name("pty-relay".into())
                .spawn(move || {
                    let mut chunk = [0u8; RELAY_CHUNK];
                    let mut sink_open = true;
                    loop {
                        match reader.read(&mut chunk) {
                            Ok(0) => break,
                            Ok(n) => {
                                let _flight = in_flight.lock();
                                if stop.load(Ordering::SeqCst) {
                                    break;
                                }
                                if sink_open {
                                    let written =
                                        sink.write_all(&chunk[..n]).and_then(|_| sink.flush());
                                    match written {
                                        Ok(()) => {
                                            relayed.fetch_add(n as u64, Ordering::Relaxed);
                                        }
                                        Err(err) => {
                                            debug!("terminal pass-through closed: {err}");
                                            sink_open = false;
                                        }
                                    }
                                }
                                let _ = tx.send(chunk[..n].to_vec());
                            }
                            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                            // EIO once the slave side is closed
                            Err(_) => break,
                        }
                    }
                })
                .map_err(|err| CaptureError::Wait(err.into()))?
        };

        let collector = {
            let buffer = Arc::clone(&buffer);
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name("pty-buffer".into())
                .spawn(move || collect(&rx, &buffer, &stop))
                .map_err(|err| CaptureError::Wait(err.into()))?
        };

        // Dropping the writer sends a newline and EOF into the PTY, which the
        // line discipline echoes back as output. Without a terminal to forward
        // from, it is held until the output is drained.
        let idle_writer = if self.interactive {
            forward_input(writer);
            None
        } else {
            Some(writer)
        };

        let done = Arc::new(AtomicBool::new(false));
        let resizer = {
            let done = Arc::clone(&done);
            let master = pair.master;
            thread::Builder::new()
                .name("pty-resize".into())
                .spawn(move || {
                    while !done.load(Ordering::Relaxed) {
                        if WINCH_PENDING.swap(false, Ordering::Relaxed) {
                            if let Err(err) = master.resize(current_size()) {
                                debug!("failed to resize PTY: {err:#}");
                            }
                        }
                        thread::sleep(RESIZE_POLL);
                    }
                })
                .ok()
        };

        let status = child.wait();
        let end_time = Utc::now();
        FOREGROUND_PGID.store(0, Ordering::SeqCst);
        done.store(true, Ordering::Relaxed);
        drop(raw_guard);

        let status = status.context("Failed to wait for child").map_err(CaptureError::Wait)?;
        let exit_code = exit_code_of(&status);

        // Background jobs may keep the slave open; drain for a bounded time only
        let deadline = Instant::now() + self.drain_timeout;
        while !relay.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        if relay.is_finished() {
            let _ = relay.join();
        } else {
            debug!("PTY still open after child exit; keeping output read so far");
            let flight = in_flight.lock();
            stop.store(true, Ordering::SeqCst);
            drop(flight);
        }
        let _ = collector.join();
        drop(idle_writer);
        if let Some(resizer) = resizer {
            let _ = resizer.join();
        }

        let (output, total_bytes) = match buffer.lock() {
            Ok(mut buffer) => (std::mem::take(&mut buffer.data), buffer.total),
            Err(poisoned) => {
                let mut buffer = poisoned.into_inner();
                (std::mem::take(&mut buffer.data), buffer.total)
            }
        };

        Ok(PtyRun {
            output,
            total_bytes,
            relayed_bytes: relayed.load(Ordering::Relaxed),
            exit_code,
            start_time,
            end_time,
        })
    }
}

/// Move relayed chunks into `buffer` until the relay hangs up, or until
/// `stop` is raised and the queue is empty.
fn collect(rx: &mpsc::Receiver<Vec<u8>>, buffer: &Mutex<CaptureBuffer>, stop: &AtomicBool) {
    let push = |chunk: Vec<u8>| {
        if let Ok(mut buffer) = buffer.lock() {
            buffer.push(&chunk);
        }
    };
    loop {
        match rx.recv_timeout(COLLECT_POLL) {
            Ok(chunk) => push(chunk),
            Err(RecvTimeoutError::Timeout) if stop.load(Ordering::SeqCst) => {
                while let Ok(chunk) = rx.try_recv() {
                    push(chunk);
                }
                break;
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

/// Store a command the shell ran itself, reported after the fact by a hook.
/// Output beyond `cap` bytes is dropped and flagged.
#[allow(clippy::too_many_arguments)]
pub fn record_finished(
    store: &LogStore,
    ctx: &CaptureContext,
    command: String,
    mut output: Vec<u8>,
    exit_code: i32,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
    cap: usize,
) -> Result<CommandRecord> {
    let total_bytes = output.len() as u64;
    output.truncate(cap);
    let run = PtyRun {
        output,
        total_bytes,
        relayed_bytes: 0,
        exit_code,
        start_time,
        end_time,
    };
    let record = build_record(command, ctx, &run, cap);
    persist(store, &record, ctx)?;
    Ok(record)
}

/// Run `request` with inherited stdio and record nothing.
pub fn run_direct(request: &CaptureRequest, ctx: &CaptureContext) -> CaptureOutcome {
    match resolve_invocation(request, ctx) {
        Some((program, args)) => run_uncaptured(&program, &args, &ctx.cwd),
        None => CaptureOutcome {
            exit_code: 0,
            record: None,
            relayed_bytes: 0,
        },
    }
}

fn resolve_invocation(
    request: &CaptureRequest,
    ctx: &CaptureContext,
) -> Option<(String, Vec<String>)> {
    let first = request.argv.first()?;
    if request.shell_mode {
        let shell = if ctx.shell.is_empty() { "/bin/sh" } else { ctx.shell.as_str() };
        return Some((shell.to_string(), vec!["-c".to_string(), request.argv.join(" ")]));
    }
    Some((first.clone(), request.argv[1..].to_vec()))
}

fn build_record(command: String, ctx: &CaptureContext, run: &PtyRun, cap: usize) -> CommandRecord {
    let truncated = run.total_bytes > run.output.len() as u64;
    if truncated {
        debug!(cap, total = run.total_bytes, "output truncated");
    }
    CommandRecord {
        id: record_id(&ctx.session_id, run.start_time, &command),
        session_id: ctx.session_id.clone(),
        command,
        output: run.output.clone(),
        output_truncated: truncated,
        output_total_bytes: run.total_bytes,
        exit_code: run.exit_code,
        start_time: run.start_time,
        end_time: run.end_time.max(run.start_time),
        cwd: ctx.cwd.clone(),
        shell: ctx.shell.clone(),
        hostname: ctx.hostname.clone(),
        username: ctx.username.clone(),
    }
}

fn persist(store: &LogStore, record: &CommandRecord, ctx: &CaptureContext) -> Result<()> {
    store.append_command(record)?;
    let session = SessionRecord {
        session_id: ctx.session_id.clone(),
        shell: ctx.shell.clone(),
        hostname: ctx.hostname.clone(),
        started_at: record.start_time,
        ended_at: None,
    };
    if let Err(err) = store.ensure_session(&session) {
        warn!("failed to register session {}: {err:#}", ctx.session_id);
    }
    Ok(())
}

/// Run without a PTY and without recording; stdio is inherited.
fn run_uncaptured(program: &str, args: &[String], cwd: &Path) -> CaptureOutcome {
    let exit_code = match Command::new(program).args(args).current_dir(cwd).status() {
        Ok(status) => std_exit_code(&status),
        Err(err) => {
            eprintln!("shelltape: failed to start {program}: {err}");
            if err.kind() == io::ErrorKind::NotFound {
                127
            } else {
                126
            }
        }
    };
    CaptureOutcome {
        exit_code,
        record: None,
        relayed_bytes: 0,
    }
}

fn std_exit_code(status: &std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => 1,
    }
}

/// Exit code as the shell would report it: 128 + signal for signal deaths.
fn exit_code_of(status: &portable_pty::ExitStatus) -> i32 {
    match status.signal() {
        Some(description) => signal_number(description)
            .map(|signal| 128 + signal)
            .unwrap_or_else(|| (status.exit_code() as i32).max(1)),
        None => status.exit_code() as i32,
    }
}

/// The process layer reports signals by their `strsignal` description.
fn signal_number(description: &str) -> Option<i32> {
    if let Some(number) = description
        .strip_prefix("Signal ")
        .and_then(|n| n.trim().parse().ok())
    {
        return Some(number);
    }
    Signal::iterator()
        .find(|signal| signal_description(*signal as i32).as_deref() == Some(description))
        .map(|signal| signal as i32)
}

fn signal_description(signal: i32) -> Option<String> {
    // strsignal returns a pointer to a static or thread-local string
    let name = unsafe { libc::strsignal(signal) };
    if name.is_null() {
        return None;
    }
    Some(unsafe { CStr::from_ptr(name) }.to_string_lossy().into_owned())
}

fn spawn_exit_code(error: &anyhow::Error) -> i32 {
    let not_found = error.chain().any(|cause| {
        cause
            .downcast_ref::<io::Error>()
            .map(|io| io.kind() == io::ErrorKind::NotFound)
            .unwrap_or(false)
    });
    let message = format!("{error:#}");
    if not_found || message.contains("not found") || message.contains("doesn't exist") {
        127
    } else {
        126
    }
}

fn current_size() -> PtySize {
    let (cols, rows) = terminal::size().unwrap_or((80, 24));
    PtySize {
        rows: rows.max(1),
        cols: cols.max(1),
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// Copy stdin into the PTY. The thread stays blocked in `read` after the
/// child exits and ends with the process.
fn forward_input(mut writer: Box<dyn Write + Send>) {
    let spawned = thread::Builder::new().name("pty-input".into()).spawn(move || {
        let mut stdin = io::stdin();
        let mut chunk = [0u8; RELAY_CHUNK];
        loop {
            match stdin.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    if writer.write_all(&chunk[..n]).and_then(|_| writer.flush()).is_err() {
                        break;
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
    });
    if let Err(err) = spawned {
        warn!("input forwarding unavailable: {err}");
    }
}

/// SIGINT delivered to us goes to the child's process group instead.
fn install_interrupt_forwarding() {
    INIT_CTRL_C.call_once(|| {
        let installed = ctrlc::set_handler(|| {
            interrupt_group(FOREGROUND_PGID.load(Ordering::SeqCst));
        });
        if let Err(err) = installed {
            debug!("interrupt forwarding unavailable: {err}");
        }
    });
}

/// The child leads its own session on the PTY, so its pid is the group id.
fn interrupt_group(pgid: i32) {
    if pgid > 0 {
        let _ = killpg(Pid::from_raw(pgid), Signal::SIGINT);
    }
}

extern "C" fn on_winch(_: libc::c_int) {
    WINCH_PENDING.store(true, Ordering::Relaxed);
}

fn install_resize_handler() -> Result<()> {
    let mut result = Ok(());
    INIT_WINCH.call_once(|| {
        let action = SigAction::new(
            SigHandler::Handler(on_winch),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        // The handler only stores to an atomic
        result = unsafe { sigaction(Signal::SIGWINCH, &action) }
            .map(|_| ())
            .map_err(|errno| anyhow!("sigaction(SIGWINCH): {errno}"));
    });
    result
}

struct RawModeGuard {
    active: bool,
}

impl RawModeGuard {
    fn enable(wanted: bool) -> Self {
        let active = wanted && terminal::enable_raw_mode().is_ok();
        Self { active }
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if self.active {
            let _ = terminal::disable_raw_mode();
        }
    }
}
