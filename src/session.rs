//! Per-execution session: lifecycle state machine, output buffers, stdin
//! handle, idle/grace governors, and the one-shot done signal.
//!
//! Every mutable field lives behind a single mutex with short, await-free
//! critical sections. Timer tasks keep only a `Weak` back-reference to the
//! session, so a dropped session silently retires its timers.

use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::{EngineError, SandboxError};

/// Bound on a single stdin write so a wedged container cannot park a client
/// task forever.
const STDIN_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Write half of the container's attach stream. Shared behind its own async
/// lock so input writes never happen under the session mutex.
pub type StdinHandle = Arc<AsyncMutex<Pin<Box<dyn AsyncWrite + Send>>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Pending,
    Starting,
    Running,
    WaitingInput,
    Finished,
    Terminated,
    Closed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Finished | SessionState::Terminated | SessionState::Closed
        )
    }

    fn accepts_input(self) -> bool {
        matches!(self, SessionState::Running | SessionState::WaitingInput)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Pending => "Pending",
            SessionState::Starting => "Starting",
            SessionState::Running => "Running",
            SessionState::WaitingInput => "WaitingInput",
            SessionState::Finished => "Finished",
            SessionState::Terminated => "Terminated",
            SessionState::Closed => "Closed",
        };
        f.write_str(name)
    }
}

/// Which demuxed container stream a buffer operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

struct Inner {
    state: SessionState,
    code: Option<String>,
    container_id: Option<String>,
    stdin: Option<StdinHandle>,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    exit_code: Option<i64>,
    active_clients: usize,
    last_activity: Instant,
    grace_timer: Option<AbortHandle>,
    idle_timer: Option<AbortHandle>,
}

pub struct Session {
    id: String,
    language: String,
    started_at: Instant,
    output_cap: usize,
    idle_timeout: Duration,
    detach_grace: Duration,
    inner: Mutex<Inner>,
    /// Teardown trigger observed by the sandbox watcher.
    cancel: CancellationToken,
    /// Completion signal, fired exactly once by the first terminal
    /// transition (`CancellationToken::cancel` is idempotent).
    done: CancellationToken,
}

impl Session {
    /// New session in the Pending state, holding the code until a slot and
    /// a container materialize.
    pub fn new_pending(id: String, language: &str, code: &str, config: &EngineConfig) -> Arc<Self> {
        Arc::new(Self {
            id,
            language: language.to_string(),
            started_at: Instant::now(),
            output_cap: config.output_cap,
            idle_timeout: config.idle_timeout,
            detach_grace: config.detach_grace,
            inner: Mutex::new(Inner {
                state: SessionState::Pending,
                code: Some(code.to_string()),
                container_id: None,
                stdin: None,
                stdout: Vec::new(),
                stderr: Vec::new(),
                exit_code: None,
                active_clients: 0,
                last_activity: Instant::now(),
                grace_timer: None,
                idle_timer: None,
            }),
            cancel: CancellationToken::new(),
            done: CancellationToken::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("session mutex poisoned")
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    pub fn exit_code(&self) -> Option<i64> {
        self.lock().exit_code
    }

    pub fn active_clients(&self) -> usize {
        self.lock().active_clients
    }

    pub fn container_id(&self) -> Option<String> {
        self.lock().container_id.clone()
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Hands the retained source code to the admission task. `None` once the
    /// container has started (or on a second call).
    pub fn take_code(&self) -> Option<String> {
        self.lock().code.take()
    }

    //
    // ---------------- lifecycle ----------------
    //

    /// Pending -> Starting once a slot is held. False if the session was
    /// stopped while it waited; the caller must abandon admission.
    pub fn mark_starting(&self) -> bool {
        let mut inner = self.lock();
        if inner.state.is_terminal() {
            return false;
        }
        inner.state = SessionState::Starting;
        true
    }

    /// Binds the created container's id and stdin handle to the session.
    pub fn set_runtime(&self, container_id: String, stdin: Pin<Box<dyn AsyncWrite + Send>>) {
        let mut inner = self.lock();
        inner.container_id = Some(container_id);
        inner.stdin = Some(Arc::new(AsyncMutex::new(stdin)));
        inner.code = None;
    }

    /// Starting -> Running. Arms the idle watcher, and the grace timer when
    /// no client has attached yet.
    pub fn mark_running(self: &Arc<Self>) {
        let mut inner = self.lock();
        if inner.state.is_terminal() {
            return;
        }
        inner.state = SessionState::Running;
        inner.last_activity = Instant::now();
        self.arm_idle_locked(&mut inner);
        if inner.active_clients == 0 {
            self.arm_grace_locked(&mut inner);
        }
    }

    /// Records a clean container exit. No-op if already terminal.
    pub fn mark_finished(&self, exit_code: i64) {
        if self.terminal_transition(SessionState::Finished, Some(exit_code), false) {
            info!(session = %self.id, exit_code, "session finished");
        }
    }

    /// Records a forced shutdown. No-op if already terminal.
    pub fn mark_terminated(&self) {
        if self.terminal_transition(SessionState::Terminated, None, true) {
            info!(session = %self.id, "session terminated");
        }
    }

    /// Idempotent forced stop: terminal transition plus the teardown
    /// trigger the sandbox watcher acts on.
    pub fn stop(&self) {
        if self.terminal_transition(SessionState::Terminated, None, true) {
            info!(session = %self.id, "stopping session");
        }
    }

    /// Administrative tear-down used when the whole engine shuts down.
    pub fn close(&self) {
        if self.terminal_transition(SessionState::Closed, None, true) {
            info!(session = %self.id, "session closed");
        }
    }

    /// First terminal transition wins; all later ones are no-ops. The state
    /// is stored before `done` fires so waiters observe it.
    fn terminal_transition(
        &self,
        next: SessionState,
        exit_code: Option<i64>,
        teardown: bool,
    ) -> bool {
        let mut inner = self.lock();
        if inner.state.is_terminal() {
            return false;
        }
        inner.state = next;
        if exit_code.is_some() {
            inner.exit_code = exit_code;
        }
        if let Some(handle) = inner.grace_timer.take() {
            handle.abort();
        }
        if let Some(handle) = inner.idle_timer.take() {
            handle.abort();
        }
        drop(inner);
        if teardown {
            self.cancel.cancel();
        }
        self.done.cancel();
        true
    }

    /// Resolves once the session has entered a terminal state.
    pub async fn done(&self) {
        self.done.cancelled().await
    }

    /// Token the sandbox watcher races against `wait`.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    //
    // ---------------- output ----------------
    //

    pub fn append_stdout(&self, data: &[u8]) {
        self.append(OutputStream::Stdout, data);
    }

    pub fn append_stderr(&self, data: &[u8]) {
        self.append(OutputStream::Stderr, data);
    }

    fn append(&self, stream: OutputStream, data: &[u8]) {
        let overflow = {
            let mut inner = self.lock();
            let cap = self.output_cap;
            let buf = match stream {
                OutputStream::Stdout => &mut inner.stdout,
                OutputStream::Stderr => &mut inner.stderr,
            };
            let room = cap.saturating_sub(buf.len());
            let take = room.min(data.len());
            buf.extend_from_slice(&data[..take]);
            if stream == OutputStream::Stdout {
                inner.last_activity = Instant::now();
            }
            data.len() > room
        };
        if overflow {
            warn!(session = %self.id, ?stream, "output limit exceeded");
            self.stop();
        }
    }

    /// Suffix of the named buffer from `offset` onwards, with the cursor to
    /// pass next time. Concurrent readers keep independent cursors.
    pub fn read_since(&self, stream: OutputStream, offset: usize) -> (Vec<u8>, usize) {
        let inner = self.lock();
        let buf = match stream {
            OutputStream::Stdout => &inner.stdout,
            OutputStream::Stderr => &inner.stderr,
        };
        let start = offset.min(buf.len());
        (buf[start..].to_vec(), buf.len())
    }

    //
    // ---------------- input ----------------
    //

    /// Forwards bytes to the program's stdin. Rejected unless the session is
    /// Running or WaitingInput. The session mutex is released before the
    /// write; the write itself is bounded by a deadline.
    pub async fn write_input(&self, data: &[u8]) -> Result<(), EngineError> {
        let stdin = {
            let mut inner = self.lock();
            if !inner.state.accepts_input() {
                return Err(EngineError::InvalidState(inner.state));
            }
            inner.last_activity = Instant::now();
            match &inner.stdin {
                Some(handle) => handle.clone(),
                None => return Err(EngineError::InvalidState(inner.state)),
            }
        };
        let mut sink = stdin.lock().await;
        let write = async {
            sink.write_all(data).await?;
            sink.flush().await
        };
        tokio::time::timeout(STDIN_WRITE_TIMEOUT, write)
            .await
            .map_err(|_| SandboxError::StdinTimeout)?
            .map_err(SandboxError::Io)?;
        Ok(())
    }

    //
    // ---------------- clients ----------------
    //

    /// Registers a streaming client; disarms a pending grace timer. Allowed
    /// in any state so late clients can still drain buffered output.
    pub fn attach_client(&self) -> usize {
        let mut inner = self.lock();
        inner.active_clients += 1;
        if let Some(handle) = inner.grace_timer.take() {
            debug!(session = %self.id, "client attached, grace timer disarmed");
            handle.abort();
        }
        inner.active_clients
    }

    /// Unregisters a client. The last detach of a live session arms the
    /// grace timer.
    pub fn detach_client(self: &Arc<Self>) -> usize {
        let mut inner = self.lock();
        inner.active_clients = inner.active_clients.saturating_sub(1);
        if inner.active_clients == 0 && inner.state.accepts_input() {
            info!(session = %self.id, "last client detached, arming grace timer");
            self.arm_grace_locked(&mut inner);
        }
        inner.active_clients
    }

    //
    // ---------------- timers ----------------
    //

    fn arm_grace_locked(self: &Arc<Self>, inner: &mut Inner) {
        if let Some(handle) = inner.grace_timer.take() {
            handle.abort();
        }
        let weak = Arc::downgrade(self);
        let grace = self.detach_grace;
        let done = self.done.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = done.cancelled() => {}
                _ = tokio::time::sleep(grace) => {
                    if let Some(session) = weak.upgrade() {
                        info!(session = %session.id, "detach grace expired");
                        session.stop();
                    }
                }
            }
        });
        inner.grace_timer = Some(handle.abort_handle());
    }

    fn arm_idle_locked(self: &Arc<Self>, inner: &mut Inner) {
        if let Some(handle) = inner.idle_timer.take() {
            handle.abort();
        }
        let weak = Arc::downgrade(self);
        let idle = self.idle_timeout;
        let done = self.done.clone();
        let handle = tokio::spawn(async move {
            idle_watch(weak, idle, done).await;
        });
        inner.idle_timer = Some(handle.abort_handle());
    }
}

/// Deadline loop over `last_activity`: output appends and input writes only
/// store a timestamp, the watcher re-sleeps until the window truly elapses.
async fn idle_watch(weak: Weak<Session>, idle: Duration, done: CancellationToken) {
    loop {
        let deadline = match weak.upgrade() {
            Some(session) => session.lock().last_activity + idle,
            None => return,
        };
        tokio::select! {
            _ = done.cancelled() => return,
            _ = tokio::time::sleep_until(deadline) => {}
        }
        let Some(session) = weak.upgrade() else { return };
        let quiet = session.lock().last_activity.elapsed() >= idle;
        if quiet {
            info!(session = %session.id, "idle timeout");
            session.stop();
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::io::DuplexStream;

    fn test_config() -> EngineConfig {
        EngineConfig {
            output_cap: 64,
            idle_timeout: Duration::from_secs(5),
            detach_grace: Duration::from_secs(5),
            ..EngineConfig::default()
        }
    }

    fn pending(config: &EngineConfig) -> Arc<Session> {
        Session::new_pending("s-test".to_string(), "python", "print('hi')", config)
    }

    /// Session driven to Running with a duplex pipe as stdin; returns the
    /// peer end so tests can observe forwarded input.
    fn running(config: &EngineConfig) -> (Arc<Session>, DuplexStream) {
        let session = pending(config);
        assert!(session.mark_starting());
        let (stdin, peer) = tokio::io::duplex(256);
        session.set_runtime("ctr-test".to_string(), Box::pin(stdin));
        session.mark_running();
        (session, peer)
    }

    #[tokio::test]
    async fn first_terminal_transition_wins() {
        let (session, _peer) = running(&test_config());
        session.stop();
        session.mark_finished(0);
        session.mark_terminated();
        session.close();
        assert_eq!(session.state(), SessionState::Terminated);
        assert_eq!(session.exit_code(), None);
    }

    #[tokio::test]
    async fn finish_records_exit_code_once() {
        let (session, _peer) = running(&test_config());
        session.mark_finished(3);
        session.mark_finished(7);
        session.stop();
        assert_eq!(session.state(), SessionState::Finished);
        assert_eq!(session.exit_code(), Some(3));
    }

    #[tokio::test]
    async fn done_fires_on_stop() {
        let (session, _peer) = running(&test_config());
        session.stop();
        tokio::time::timeout(Duration::from_secs(1), session.done())
            .await
            .expect("done should fire after stop");
        // Repeated stops stay no-ops.
        session.stop();
        session.stop();
        assert_eq!(session.state(), SessionState::Terminated);
    }

    #[tokio::test]
    async fn write_input_rejected_outside_running() {
        let config = test_config();
        let session = pending(&config);
        match session.write_input(b"x").await {
            Err(EngineError::InvalidState(SessionState::Pending)) => {}
            other => panic!("expected InvalidState(Pending), got {other:?}"),
        }

        let (session, _peer) = running(&config);
        session.stop();
        assert!(matches!(
            session.write_input(b"x").await,
            Err(EngineError::InvalidState(SessionState::Terminated))
        ));
    }

    #[tokio::test]
    async fn write_input_reaches_stdin() {
        let (session, mut peer) = running(&test_config());
        session.write_input(b"ping\n").await.unwrap();
        let mut buf = [0u8; 5];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping\n");
    }

    #[tokio::test]
    async fn read_since_tracks_independent_cursors() {
        let (session, _peer) = running(&test_config());
        session.append_stdout(b"hello ");
        let (chunk, cursor) = session.read_since(OutputStream::Stdout, 0);
        assert_eq!(chunk, b"hello ");
        session.append_stdout(b"world");
        let (chunk, cursor) = session.read_since(OutputStream::Stdout, cursor);
        assert_eq!(chunk, b"world");
        let (chunk, _) = session.read_since(OutputStream::Stdout, cursor);
        assert!(chunk.is_empty());
        // A second reader starting from zero sees the whole prefix.
        let (all, _) = session.read_since(OutputStream::Stdout, 0);
        assert_eq!(all, b"hello world");
        // Stderr is untouched.
        let (err, _) = session.read_since(OutputStream::Stderr, 0);
        assert!(err.is_empty());
    }

    #[tokio::test]
    async fn output_cap_clamps_and_terminates() {
        let (session, _peer) = running(&test_config());
        session.append_stdout(&[b'x'; 60]);
        assert_eq!(session.state(), SessionState::Running);
        session.append_stdout(&[b'x'; 10]);
        let (all, _) = session.read_since(OutputStream::Stdout, 0);
        assert_eq!(all.len(), 64);
        assert_eq!(session.state(), SessionState::Terminated);
    }

    #[tokio::test]
    async fn filling_cap_exactly_is_not_a_breach() {
        let (session, _peer) = running(&test_config());
        session.append_stdout(&[b'x'; 64]);
        assert_eq!(session.state(), SessionState::Running);
    }

    #[tokio::test]
    async fn stderr_cap_also_terminates() {
        let (session, _peer) = running(&test_config());
        session.append_stderr(&[b'e'; 100]);
        let (all, _) = session.read_since(OutputStream::Stderr, 0);
        assert_eq!(all.len(), 64);
        assert_eq!(session.state(), SessionState::Terminated);
    }

    #[tokio::test]
    async fn idle_timeout_stops_quiet_session() {
        let config = EngineConfig {
            idle_timeout: Duration::from_millis(50),
            detach_grace: Duration::from_secs(5),
            ..test_config()
        };
        let (session, _peer) = running(&config);
        session.attach_client();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(session.state(), SessionState::Terminated);
    }

    #[tokio::test]
    async fn activity_defers_idle_timeout() {
        let config = EngineConfig {
            idle_timeout: Duration::from_millis(100),
            detach_grace: Duration::from_secs(5),
            ..test_config()
        };
        let (session, _peer) = running(&config);
        session.attach_client();
        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(40)).await;
            session.append_stdout(b".");
        }
        assert_eq!(session.state(), SessionState::Running);
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(session.state(), SessionState::Terminated);
    }

    #[tokio::test]
    async fn grace_timer_terminates_clientless_session() {
        let config = EngineConfig {
            detach_grace: Duration::from_millis(50),
            ..test_config()
        };
        let (session, _peer) = running(&config);
        session.attach_client();
        session.detach_client();
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(session.state(), SessionState::Terminated);
    }

    #[tokio::test]
    async fn reattach_before_grace_expiry_cancels_termination() {
        let config = EngineConfig {
            detach_grace: Duration::from_millis(80),
            ..test_config()
        };
        let (session, _peer) = running(&config);
        session.attach_client();
        session.detach_client();
        tokio::time::sleep(Duration::from_millis(20)).await;
        session.attach_client();
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(session.state(), SessionState::Running);
    }

    #[tokio::test]
    async fn never_attached_session_hits_grace() {
        let config = EngineConfig {
            detach_grace: Duration::from_millis(50),
            ..test_config()
        };
        let (session, _peer) = running(&config);
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(session.state(), SessionState::Terminated);
    }

    #[tokio::test]
    async fn late_client_can_drain_terminal_session() {
        let (session, _peer) = running(&test_config());
        session.append_stdout(b"output");
        session.stop();
        session.attach_client();
        let (chunk, _) = session.read_since(OutputStream::Stdout, 0);
        assert_eq!(chunk, b"output");
        session.detach_client();
        assert_eq!(session.active_clients(), 0);
        assert_eq!(session.state(), SessionState::Terminated);
    }

    #[tokio::test]
    async fn detach_never_goes_negative() {
        let (session, _peer) = running(&test_config());
        session.detach_client();
        session.detach_client();
        assert_eq!(session.active_clients(), 0);
    }

    #[tokio::test]
    async fn code_is_released_when_runtime_binds() {
        let config = test_config();
        let session = pending(&config);
        assert!(session.mark_starting());
        let code = session.take_code();
        assert_eq!(code.as_deref(), Some("print('hi')"));
        assert_eq!(session.take_code(), None);
    }
}
