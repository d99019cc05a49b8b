//! Engine binding that forwards every call to a worker process.
//!
//! The worker hosts a [`crate::LocalEngineBinding`] behind
//! [`crate::WorkerHost`]. The binding listens on a loopback port and the
//! worker connects back to it, so the engine library is free to write to the
//! worker's stdout. Calls are synchronous round trips; engine messages are
//! polled with `DrainMessages`.

use std::io::{self, BufReader};
use std::net::{Ipv4Addr, Shutdown, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use chrono::NaiveDateTime;
use hc_core::{ExecutionTimeline, MessageBuffer};
use tracing::{debug, error, info, warn};

use crate::api::EngineOffsets;
use crate::error::{EngineError, EngineResult};
use crate::handle::{BackendKind, DisposeOutcome, EngineHandle, EngineState, ReturnCode};
use crate::protocol::{self, PROTOCOL_VERSION, ProtocolError, Request, Response};
use crate::relay::LiveLogger;
use crate::settings::{EngineSettings, LogLevels};
use crate::values::VarValues;

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// One request/response exchange with a worker.
pub trait Transport: Send {
    fn round_trip(&mut self, request: &Request) -> Result<Response, ProtocolError>;

    /// Release the connection. Later round trips fail with `ConnectionClosed`.
    fn close(&mut self);
}

/// Framed JSON over a loopback TCP connection.
pub struct SocketTransport {
    reader: Option<BufReader<TcpStream>>,
    writer: Option<TcpStream>,
}

impl SocketTransport {
    /// `call_timeout` bounds each read and write; `None` waits indefinitely.
    pub fn new(stream: TcpStream, call_timeout: Option<Duration>) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        stream.set_read_timeout(call_timeout)?;
        stream.set_write_timeout(call_timeout)?;
        let reader = BufReader::new(stream.try_clone()?);
        Ok(Self {
            reader: Some(reader),
            writer: Some(stream),
        })
    }
}

impl Transport for SocketTransport {
    fn round_trip(&mut self, request: &Request) -> Result<Response, ProtocolError> {
        let (Some(writer), Some(reader)) = (self.writer.as_mut(), self.reader.as_mut()) else {
            return Err(ProtocolError::ConnectionClosed);
        };
        protocol::send(writer, request)?;
        protocol::receive(reader)
    }

    fn close(&mut self) {
        self.reader = None;
        if let Some(writer) = self.writer.take() {
            let _ = writer.shutdown(Shutdown::Both);
        }
    }
}

/// A spawned worker process.
pub struct WorkerProcess {
    child: Child,
    program: PathBuf,
}

impl WorkerProcess {
    pub fn new(child: Child, program: impl Into<PathBuf>) -> Self {
        Self {
            child,
            program: program.into(),
        }
    }

    pub fn id(&self) -> u32 {
        self.child.id()
    }

    /// Wait for the worker to connect to `listener`.
    ///
    /// Fails early if the worker exits, and after `timeout` otherwise.
    pub fn accept(&mut self, listener: &TcpListener, timeout: Duration) -> EngineResult<TcpStream> {
        listener.set_nonblocking(true)?;
        let deadline = Instant::now() + timeout;
        loop {
            match listener.accept() {
                Ok((stream, peer)) => {
                    stream.set_nonblocking(false)?;
                    debug!(pid = self.child.id(), %peer, "worker connected");
                    return Ok(stream);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e.into()),
            }
            if let Some(status) = self.child.try_wait()? {
                return Err(EngineError::WorkerExited {
                    program: self.program.clone(),
                    status: status.to_string(),
                });
            }
            if Instant::now() >= deadline {
                return Err(EngineError::WorkerConnectTimeout {
                    program: self.program.clone(),
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
            thread::sleep(EXIT_POLL_INTERVAL);
        }
    }

    /// Wait up to `grace` for the worker to exit, then kill it.
    pub fn wait_for_exit(&mut self, grace: Duration) -> DisposeOutcome {
        let deadline = Instant::now() + grace;
        loop {
            match self.child.try_wait() {
                Ok(Some(status)) => {
                    debug!(pid = self.child.id(), %status, "worker exited");
                    return DisposeOutcome::Clean;
                }
                Ok(None) if Instant::now() < deadline => thread::sleep(EXIT_POLL_INTERVAL),
                Ok(None) => {
                    warn!(
                        pid = self.child.id(),
                        program = %self.program.display(),
                        grace_ms = grace.as_millis() as u64,
                        "worker did not exit in time, killing"
                    );
                    if let Err(e) = self.child.kill() {
                        return DisposeOutcome::Faulted(format!("failed to kill worker: {e}"));
                    }
                    let _ = self.child.wait();
                    return DisposeOutcome::ForcedAfterTimeout;
                }
                Err(e) => {
                    let _ = self.child.kill();
                    return DisposeOutcome::Faulted(format!("failed to poll worker: {e}"));
                }
            }
        }
    }
}

/// Proxy for an engine hosted in another process.
pub struct RemoteEngineBinding {
    transport: Option<Box<dyn Transport>>,
    process: Option<WorkerProcess>,
    timeline: ExecutionTimeline,
    state: EngineState,
    /// Binding-side messages merged into the next drain.
    pending: MessageBuffer,
    grace: Duration,
}

impl RemoteEngineBinding {
    /// Start the configured worker and hand it the log levels.
    ///
    /// The worker's stdout is routed to this process's stderr; the protocol
    /// runs over a loopback connection the worker opens with `--connect`.
    pub fn spawn(settings: &EngineSettings) -> EngineResult<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
        let address = listener.local_addr()?;
        let program = settings.worker.program.clone();
        let child = Command::new(&program)
            .args(&settings.worker.args)
            .arg("--library")
            .arg(&settings.library_path)
            .arg("--connect")
            .arg(address.to_string())
            .stdin(Stdio::null())
            .stdout(io::stderr())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|source| EngineError::WorkerSpawn {
                program: program.clone(),
                source,
            })?;
        info!(pid = child.id(), program = %program.display(), %address, "started engine worker");

        let mut process = WorkerProcess::new(child, program);
        let transport = match process
            .accept(&listener, settings.connect_timeout())
            .and_then(|stream| Ok(SocketTransport::new(stream, settings.call_timeout())?))
        {
            Ok(transport) => transport,
            Err(err) => {
                let _ = process.wait_for_exit(Duration::ZERO);
                return Err(err);
            }
        };

        Self::connect(Box::new(transport), Some(process), settings)
    }

    /// Use an existing connection to a worker.
    pub fn attach(transport: Box<dyn Transport>, settings: &EngineSettings) -> EngineResult<Self> {
        Self::connect(transport, None, settings)
    }

    fn connect(
        transport: Box<dyn Transport>,
        process: Option<WorkerProcess>,
        settings: &EngineSettings,
    ) -> EngineResult<Self> {
        let mut binding = Self {
            transport: Some(transport),
            process,
            timeline: ExecutionTimeline::default(),
            state: EngineState::Unbound,
            pending: MessageBuffer::new(),
            grace: settings.shutdown_grace(),
        };
        // On failure the binding drops here and tears the worker down.
        binding.handshake(settings.log_levels)?;
        Ok(binding)
    }

    fn handshake(&mut self, levels: LogLevels) -> EngineResult<()> {
        match self.call(Request::Hello {
            version: PROTOCOL_VERSION,
        })? {
            Response::Hello { version } if version == PROTOCOL_VERSION => {}
            Response::Hello { version } => {
                return Err(EngineError::Remote {
                    message: format!(
                        "worker speaks protocol version {version}, expected {PROTOCOL_VERSION}"
                    ),
                });
            }
            other => return Err(unexpected("hello", &other)),
        }
        self.send_log_levels(levels)
    }

    fn send_log_levels(&mut self, levels: LogLevels) -> EngineResult<()> {
        match self.call(Request::SetLogLevels { levels })? {
            Response::Ok => Ok(()),
            other => Err(unexpected("ok", &other)),
        }
    }

    fn call(&mut self, request: Request) -> EngineResult<Response> {
        let Some(transport) = self.transport.as_mut() else {
            return Err(ProtocolError::ConnectionClosed.into());
        };
        match transport.round_trip(&request) {
            Ok(Response::Error { message }) => Err(EngineError::Remote { message }),
            Ok(response) => Ok(response),
            Err(err) => {
                // A failed exchange leaves the stream out of step; drop it.
                warn!(request = request.name(), error = %err, "closing worker connection");
                transport.close();
                self.transport = None;
                Err(err.into())
            }
        }
    }

    /// Forward a lifecycle request; transport faults become `TRANSPORT_FAILURE`.
    fn lifecycle(&mut self, request: Request) -> ReturnCode {
        let name = request.name();
        let result = self.call(request).and_then(|response| match response {
            Response::Code { code } => Ok(ReturnCode(code)),
            other => Err(unexpected("code", &other)),
        });
        match result {
            Ok(code) => code,
            Err(err) => self.transport_failure(name, &err),
        }
    }

    fn transport_failure(&self, call: &str, err: &EngineError) -> ReturnCode {
        error!(call, error = %err, "engine worker call failed");
        self.pending.append(format!("engine worker {call} failed: {err}"));
        ReturnCode::TRANSPORT_FAILURE
    }

    fn fetch_offsets(&mut self) -> EngineResult<EngineOffsets> {
        match self.call(Request::Offsets)? {
            Response::Offsets { offsets } => Ok(offsets),
            other => Err(unexpected("offsets", &other)),
        }
    }

    fn reject(&self, operation: &'static str) -> ReturnCode {
        let err = EngineError::InvalidState {
            operation,
            state: self.state,
        };
        warn!("{err}");
        self.pending.append(err.to_string());
        ReturnCode::INVALID_STATE
    }

    fn require_active(&self, operation: &'static str) -> EngineResult<()> {
        if self.state.is_active() {
            Ok(())
        } else {
            Err(EngineError::InvalidState {
                operation,
                state: self.state,
            })
        }
    }

    pub fn worker_id(&self) -> Option<u32> {
        self.process.as_ref().map(WorkerProcess::id)
    }
}

fn unexpected(expected: &'static str, got: &Response) -> EngineError {
    ProtocolError::Unexpected {
        expected,
        got: got.kind().to_string(),
    }
    .into()
}

impl EngineHandle for RemoteEngineBinding {
    fn kind(&self) -> BackendKind {
        BackendKind::Remote
    }

    fn state(&self) -> EngineState {
        self.state
    }

    fn set_log_levels(&mut self, levels: LogLevels) -> EngineResult<()> {
        if !self.state.can_initialize() {
            return Err(EngineError::InvalidState {
                operation: "set_log_levels",
                state: self.state,
            });
        }
        self.send_log_levels(levels)
    }

    fn set_reference_date(&mut self, date: NaiveDateTime) {
        self.timeline.set_reference_date(date);
    }

    fn timeline(&self) -> &ExecutionTimeline {
        &self.timeline
    }

    fn initialize(&mut self, config_path: &Path) -> ReturnCode {
        if !self.state.can_initialize() {
            return self.reject("initialize");
        }
        // The worker resolves paths against its own working directory.
        let config_path =
            std::path::absolute(config_path).unwrap_or_else(|_| config_path.to_path_buf());
        let code = self.lifecycle(Request::Initialize { config_path });
        if !code.is_success() {
            return code;
        }
        match self.fetch_offsets() {
            Ok(o) => {
                self.timeline.capture(o.start, o.end, o.step, o.current);
                self.state = EngineState::Initialized;
                code
            }
            Err(err) => self.transport_failure("offsets", &err),
        }
    }

    fn update(&mut self, dt: f64) -> ReturnCode {
        if !self.state.is_active() {
            return self.reject("update");
        }
        let code = self.lifecycle(Request::Update { dt });
        if !code.is_success() {
            return code;
        }
        match self.fetch_offsets() {
            Ok(o) => {
                if !self.timeline.advance(o.current) {
                    warn!(current = o.current, "ignoring non-monotonic engine offset");
                }
                self.state = EngineState::Running;
                code
            }
            Err(err) => self.transport_failure("offsets", &err),
        }
    }

    fn finish(&mut self) -> ReturnCode {
        if !self.state.is_active() {
            return self.reject("finish");
        }
        let code = self.lifecycle(Request::Finish);
        self.state = EngineState::Finished;
        code
    }

    fn get_values(&mut self, name: &str) -> EngineResult<VarValues> {
        self.require_active("get_values")?;
        match self.call(Request::GetValues {
            name: name.to_string(),
        })? {
            Response::Values { values } => Ok(values),
            other => Err(unexpected("values", &other)),
        }
    }

    fn set_values(&mut self, name: &str, values: &VarValues) -> EngineResult<()> {
        self.require_active("set_values")?;
        match self.call(Request::SetValues {
            name: name.to_string(),
            values: values.clone(),
        })? {
            Response::Ok => Ok(()),
            other => Err(unexpected("ok", &other)),
        }
    }

    fn drain_messages(&mut self) -> Vec<String> {
        let mut lines = self.pending.take();
        if self.transport.is_some() {
            match self.call(Request::DrainMessages) {
                Ok(Response::Messages { lines: remote }) => {
                    lines.extend(remote.into_iter().filter(|l| !l.is_empty()));
                }
                Ok(other) => lines.push(unexpected("messages", &other).to_string()),
                Err(err) => lines.push(format!("failed to drain worker messages: {err}")),
            }
        }
        if lines.is_empty() {
            lines.push(String::new());
        }
        lines
    }

    fn attach_live_logger(&mut self, _logger: LiveLogger) -> EngineResult<()> {
        Err(EngineError::LiveChannelUnavailable)
    }

    fn dispose(&mut self) -> DisposeOutcome {
        if self.state == EngineState::Disposed {
            return DisposeOutcome::AlreadyDisposed;
        }
        self.state = EngineState::Disposed;

        let mut fault = None;
        if let Some(mut transport) = self.transport.take() {
            match transport.round_trip(&Request::Dispose) {
                Ok(Response::Ok) => {}
                Ok(Response::Error { message }) => fault = Some(message),
                Ok(other) => fault = Some(unexpected("ok", &other).to_string()),
                Err(e) if e.is_disconnect() => debug!("engine worker already gone at dispose"),
                Err(e) => fault = Some(e.to_string()),
            }
            transport.close();
        }

        let outcome = match self.process.take() {
            Some(mut process) => process.wait_for_exit(self.grace),
            None => DisposeOutcome::Clean,
        };
        match (outcome, fault) {
            (DisposeOutcome::Clean, Some(fault)) => {
                warn!(%fault, "engine worker dispose faulted");
                DisposeOutcome::Faulted(fault)
            }
            (outcome, fault) => {
                if let Some(fault) = fault {
                    warn!(%fault, "engine worker dispose faulted");
                }
                info!(?outcome, "engine worker released");
                outcome
            }
        }
    }
}

impl Drop for RemoteEngineBinding {
    fn drop(&mut self) {
        if self.state != EngineState::Disposed {
            self.dispose();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalEngineBinding;
    use crate::settings::WorkerCommand;
    use crate::testing::{EngineScript, ScriptedEngine};
    use crate::worker::WorkerHost;

    fn scripted_worker(listener: &TcpListener) -> thread::JoinHandle<()> {
        let address = listener.local_addr().unwrap();
        thread::spawn(move || {
            let script = EngineScript {
                offsets: EngineOffsets {
                    start: 0.0,
                    end: 4.0,
                    step: 2.0,
                    current: 0.0,
                },
                ..EngineScript::default()
            };
            let (engine, _calls) = ScriptedEngine::new(script);
            let binding = LocalEngineBinding::with_api(Box::new(engine), LogLevels::default());
            WorkerHost::new(binding).serve_connection(address).unwrap();
        })
    }

    #[test]
    fn socket_transport_runs_a_session() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let worker = scripted_worker(&listener);
        let (stream, _) = listener.accept().unwrap();
        let transport = SocketTransport::new(stream, Some(Duration::from_secs(10))).unwrap();

        let mut binding =
            RemoteEngineBinding::attach(Box::new(transport), &EngineSettings::default()).unwrap();
        let temp = tempfile::tempdir().unwrap();
        assert_eq!(binding.initialize(&temp.path().join("dimr.xml")), ReturnCode::SUCCESS);
        assert_eq!(binding.update(2.0), ReturnCode::SUCCESS);
        assert_eq!(binding.timeline().current_offset(), 2.0);
        assert_eq!(binding.dispose(), DisposeOutcome::Clean);
        worker.join().unwrap();
    }

    #[test]
    fn silent_worker_times_out() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let address = listener.local_addr().unwrap();
        let peer = thread::spawn(move || {
            let stream = TcpStream::connect(address).unwrap();
            thread::sleep(Duration::from_secs(2));
            drop(stream);
        });
        let (stream, _) = listener.accept().unwrap();
        let transport = SocketTransport::new(stream, Some(Duration::from_millis(100))).unwrap();

        let started = Instant::now();
        let err = RemoteEngineBinding::attach(Box::new(transport), &EngineSettings::default())
            .err()
            .unwrap();
        assert!(matches!(err, EngineError::Protocol(ProtocolError::Io(_))), "{err}");
        assert!(started.elapsed() < Duration::from_secs(2));
        peer.join().unwrap();
    }

    #[test]
    fn closed_transport_fails_round_trips() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let address = listener.local_addr().unwrap();
        let peer = thread::spawn(move || TcpStream::connect(address).unwrap());
        let (stream, _) = listener.accept().unwrap();
        let _peer = peer.join().unwrap();

        let mut transport = SocketTransport::new(stream, None).unwrap();
        transport.close();
        let err = transport.round_trip(&Request::Offsets).unwrap_err();
        assert!(matches!(err, ProtocolError::ConnectionClosed));
    }

    #[cfg(unix)]
    #[test]
    fn worker_that_exits_immediately_is_reported() {
        let settings = EngineSettings {
            worker: WorkerCommand {
                program: PathBuf::from("sh"),
                args: vec!["-c".to_string(), "echo not a frame; exit 0".to_string()],
            },
            shutdown_grace_ms: 500,
            ..EngineSettings::default()
        };
        let err = RemoteEngineBinding::spawn(&settings).err().unwrap();
        assert!(matches!(err, EngineError::WorkerExited { .. }), "{err}");
    }

    #[cfg(unix)]
    #[test]
    fn worker_that_never_connects_is_killed() {
        let settings = EngineSettings {
            worker: WorkerCommand {
                program: PathBuf::from("sh"),
                args: vec!["-c".to_string(), "sleep 5".to_string()],
            },
            connect_timeout_ms: 200,
            ..EngineSettings::default()
        };
        let started = Instant::now();
        let err = RemoteEngineBinding::spawn(&settings).err().unwrap();
        assert!(matches!(err, EngineError::WorkerConnectTimeout { timeout_ms: 200, .. }), "{err}");
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn missing_worker_program_is_spawn_error() {
        let settings = EngineSettings {
            worker: WorkerCommand {
                program: PathBuf::from("/nonexistent/hc-worker"),
                args: Vec::new(),
            },
            ..EngineSettings::default()
        };
        let err = RemoteEngineBinding::spawn(&settings).err().unwrap();
        assert!(matches!(err, EngineError::WorkerSpawn { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn stuck_worker_is_killed_after_grace() {
        let child = Command::new("sleep").arg("5").spawn().unwrap();
        let mut process = WorkerProcess::new(child, "sleep");
        let started = Instant::now();
        assert_eq!(
            process.wait_for_exit(Duration::from_millis(50)),
            DisposeOutcome::ForcedAfterTimeout
        );
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[cfg(unix)]
    #[test]
    fn exiting_worker_is_clean() {
        let child = Command::new("true").spawn().unwrap();
        let mut process = WorkerProcess::new(child, "true");
        assert_eq!(
            process.wait_for_exit(Duration::from_secs(5)),
            DisposeOutcome::Clean
        );
    }
}
