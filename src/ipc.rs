//! IPC channel between the controller and a host process.
//!
//! The controller binds a loopback TCP listener and hands its address (the
//! "port name") to the host with the endpoint command. The host connects
//! back and introduces itself with a [`Hello`] carrying the correlation id;
//! connections with a different id are dropped.
//!
//! Every message afterwards is one line of JSON:
//!
//! ```text
//! controller ──► {"seq":7,"body":{"type":"explore","package":{...}}}
//! host       ◄── {"seq":7,"body":{"type":"explored","tests":[...]}}
//! ```
//!
//! Replies carry the sequence number of their request, so several calls can
//! be in flight on one connection. [`IpcClient`] routes each reply to the
//! caller waiting for it; losing the connection fails every pending call
//! with [`IpcError::Disconnected`].

use std::collections::HashMap;
use std::io::{self, BufRead, BufReader, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::driver::{DriverOptions, FailureKind, RunReport, TestCase, TestPackage};
use crate::liveness::deadline_after;

/// Version announced in the handshake.
pub const PROTOCOL_VERSION: u32 = 1;

const ACCEPT_POLL: Duration = Duration::from_millis(20);

/// Result type for IPC operations.
pub type IpcResult<T> = Result<T, IpcError>;

/// Errors raised by the IPC channel.
#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Malformed message: {0}")]
    Codec(#[from] serde_json::Error),

    /// The connection closed before a reply arrived.
    #[error("Connection closed")]
    Disconnected,

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// The peer answered with a reply that does not match the request.
    #[error("Unexpected reply: {0}")]
    UnexpectedReply(String),
}

/// First message sent by the host on a new connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub correlation_id: String,
    pub pid: u32,
    pub version: u32,
}

/// Requests from the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    Initialize { options: DriverOptions },
    Explore { package: TestPackage },
    Run { package: TestPackage, tests: Vec<String> },
    Unload,
    Ping,
    Shutdown,
}

impl Request {
    pub fn name(&self) -> &'static str {
        match self {
            Request::Initialize { .. } => "initialize",
            Request::Explore { .. } => "explore",
            Request::Run { .. } => "run",
            Request::Unload => "unload",
            Request::Ping => "ping",
            Request::Shutdown => "shutdown",
        }
    }
}

/// Replies from the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Reply {
    Initialized,
    Explored { tests: Vec<TestCase> },
    Ran { report: RunReport },
    Unloaded,
    Pong,
    ShuttingDown,
    Failed { kind: FailureKind, message: String },
}

/// A message tagged with its call sequence number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub seq: u64,
    pub body: T,
}

fn write_frame<T: Serialize>(writer: &mut impl Write, value: &T) -> IpcResult<()> {
    let mut line = serde_json::to_string(value)?;
    line.push('\n');
    writer.write_all(line.as_bytes())?;
    writer.flush()?;
    Ok(())
}

/// Reads one frame; `None` at end of stream.
fn read_frame<T: DeserializeOwned>(reader: &mut impl BufRead) -> IpcResult<Option<T>> {
    let mut line = String::new();
    if reader.read_line(&mut line)? == 0 {
        return Ok(None);
    }
    Ok(Some(serde_json::from_str(line.trim_end())?))
}

/// Controller-side listener waiting for the host to connect back.
pub struct IpcListener {
    listener: TcpListener,
    port_name: String,
}

impl IpcListener {
    /// Binds an ephemeral loopback port.
    pub fn bind() -> IpcResult<Self> {
        let listener = TcpListener::bind(("127.0.0.1", 0))?;
        let port_name = listener.local_addr()?.to_string();
        debug!("IPC listener bound at {}", port_name);
        Ok(Self {
            listener,
            port_name,
        })
    }

    /// Address the host should connect to.
    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    /// Waits for the host tagged `correlation_id` to connect.
    ///
    /// Gives up after `timeout`, or as soon as `keep_waiting` returns
    /// `false` (e.g. because the host process exited).
    pub fn accept(
        &self,
        correlation_id: &str,
        timeout: Duration,
        keep_waiting: impl Fn() -> bool,
    ) -> IpcResult<IpcClient> {
        let deadline = deadline_after(Instant::now(), timeout);
        self.listener.set_nonblocking(true)?;

        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    stream.set_nonblocking(false)?;
                    match handshake(&stream, correlation_id, deadline) {
                        Ok(hello) => {
                            debug!("Host pid {} connected from {}", hello.pid, addr);
                            return IpcClient::new(stream, hello);
                        }
                        Err(IpcError::Handshake(reason)) => {
                            warn!("Rejected connection from {}: {}", addr, reason);
                        }
                        Err(e) => debug!("Connection from {} dropped: {}", addr, e),
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if !keep_waiting() {
                        return Err(IpcError::Handshake(
                            "the host went away before connecting".to_string(),
                        ));
                    }
                    if Instant::now() >= deadline {
                        return Err(IpcError::Timeout(format!(
                            "no host connected to {} within {:?}",
                            self.port_name, timeout
                        )));
                    }
                    thread::sleep(ACCEPT_POLL);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

fn handshake(stream: &TcpStream, correlation_id: &str, deadline: Instant) -> IpcResult<Hello> {
    let remaining = deadline.saturating_duration_since(Instant::now());
    stream.set_read_timeout(Some(remaining.max(Duration::from_secs(1))))?;

    let mut reader = BufReader::new(stream);
    let hello: Hello = read_frame(&mut reader)?.ok_or(IpcError::Disconnected)?;
    if hello.correlation_id != correlation_id {
        return Err(IpcError::Handshake(format!(
            "correlation id {} does not match",
            hello.correlation_id
        )));
    }
    if hello.version != PROTOCOL_VERSION {
        return Err(IpcError::Handshake(format!(
            "protocol version {} is not supported",
            hello.version
        )));
    }

    stream.set_read_timeout(None)?;
    Ok(hello)
}

type PendingReply = oneshot::Sender<IpcResult<Reply>>;

#[derive(Default)]
struct Pending {
    calls: HashMap<u64, PendingReply>,
    closed: bool,
}

struct ClientInner {
    writer: Mutex<TcpStream>,
    pending: Mutex<Pending>,
    next_seq: AtomicU64,
}

impl ClientInner {
    fn pending(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn complete(&self, seq: u64, result: IpcResult<Reply>) {
        if let Some(tx) = self.pending().calls.remove(&seq) {
            let _ = tx.send(result);
        }
    }

    fn fail_all(&self) {
        let calls = {
            let mut pending = self.pending();
            pending.closed = true;
            std::mem::take(&mut pending.calls)
        };
        for (_, tx) in calls {
            let _ = tx.send(Err(IpcError::Disconnected));
        }
    }
}

/// Controller-side connection to a host.
///
/// Calls may be made concurrently from several threads.
pub struct IpcClient {
    inner: Arc<ClientInner>,
    reader: Option<JoinHandle<()>>,
    peer: Hello,
}

impl IpcClient {
    fn new(stream: TcpStream, peer: Hello) -> IpcResult<Self> {
        let read_half = stream.try_clone()?;
        let inner = Arc::new(ClientInner {
            writer: Mutex::new(stream),
            pending: Mutex::new(Pending::default()),
            next_seq: AtomicU64::new(1),
        });

        let routed = inner.clone();
        let reader = thread::Builder::new()
            .name("ipc-reader".to_string())
            .spawn(move || route_replies(routed, read_half))?;

        Ok(Self {
            inner,
            reader: Some(reader),
            peer,
        })
    }

    /// Process id the host announced.
    pub fn peer_pid(&self) -> u32 {
        self.peer.pid
    }

    fn send(&self, request: Request) -> IpcResult<(u64, oneshot::Receiver<IpcResult<Reply>>)> {
        let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.inner.pending();
            if pending.closed {
                return Err(IpcError::Disconnected);
            }
            pending.calls.insert(seq, tx);
        }

        let envelope = Envelope {
            seq,
            body: request,
        };
        let written = {
            let mut writer = self.inner.writer.lock().unwrap_or_else(PoisonError::into_inner);
            write_frame(&mut *writer, &envelope)
        };
        if let Err(e) = written {
            self.inner.pending().calls.remove(&seq);
            return Err(e);
        }

        Ok((seq, rx))
    }

    /// Sends `request` and blocks until its reply arrives.
    pub fn call(&self, request: Request) -> IpcResult<Reply> {
        let (_, rx) = self.send(request)?;
        rx.blocking_recv().unwrap_or(Err(IpcError::Disconnected))
    }

    /// Like [`call`](Self::call), failing with [`IpcError::Timeout`] if no
    /// reply arrives within `timeout`.
    pub fn call_timeout(&self, request: Request, timeout: Duration) -> IpcResult<Reply> {
        let name = request.name();
        let (seq, rx) = self.send(request)?;

        let inner = Arc::downgrade(&self.inner);
        let timer = thread::Builder::new()
            .name("ipc-call-timeout".to_string())
            .spawn(move || {
                thread::sleep(timeout);
                if let Some(inner) = inner.upgrade() {
                    inner.complete(
                        seq,
                        Err(IpcError::Timeout(format!(
                            "no reply to {} within {:?}",
                            name, timeout
                        ))),
                    );
                }
            });
        if let Err(e) = timer {
            self.inner.pending().calls.remove(&seq);
            return Err(e.into());
        }

        rx.blocking_recv().unwrap_or(Err(IpcError::Disconnected))
    }

    /// Closes the connection, failing pending calls.
    pub fn close(&self) {
        let writer = self.inner.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let _ = writer.shutdown(Shutdown::Both);
    }
}

impl Drop for IpcClient {
    fn drop(&mut self) {
        self.close();
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }
}

fn route_replies(inner: Arc<ClientInner>, stream: TcpStream) {
    let mut reader = BufReader::new(stream);
    loop {
        match read_frame::<Envelope<Reply>>(&mut reader) {
            Ok(Some(envelope)) => inner.complete(envelope.seq, Ok(envelope.body)),
            Ok(None) => {
                debug!("IPC connection closed by host");
                break;
            }
            Err(e) => {
                debug!("IPC connection lost: {}", e);
                break;
            }
        }
    }
    inner.fail_all();
}

/// Host-side connection: a stream of requests plus a reply handle.
pub struct ServerConnection {
    reader: BufReader<TcpStream>,
    replies: ReplySender,
}

impl ServerConnection {
    /// Reads the next request; `None` once the controller hung up.
    pub fn next_request(&mut self) -> IpcResult<Option<Envelope<Request>>> {
        read_frame(&mut self.reader)
    }

    /// Handle for sending replies from any thread.
    pub fn replies(&self) -> ReplySender {
        self.replies.clone()
    }
}

/// Cloneable writer for replies.
#[derive(Clone)]
pub struct ReplySender {
    writer: Arc<Mutex<TcpStream>>,
}

impl ReplySender {
    pub fn send(&self, seq: u64, reply: Reply) -> IpcResult<()> {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        write_frame(&mut *writer, &Envelope { seq, body: reply })
    }
}

/// Connects to the controller at `port_name` and introduces this process.
pub fn connect(port_name: &str, correlation_id: &str) -> IpcResult<ServerConnection> {
    let mut stream = TcpStream::connect(port_name)?;
    stream.set_nodelay(true)?;

    write_frame(
        &mut stream,
        &Hello {
            correlation_id: correlation_id.to_string(),
            pid: std::process::id(),
            version: PROTOCOL_VERSION,
        },
    )?;
    debug!("Connected to controller at {}", port_name);

    let read_half = stream.try_clone()?;
    Ok(ServerConnection {
        reader: BufReader::new(read_half),
        replies: ReplySender {
            writer: Arc::new(Mutex::new(stream)),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Host stand-in answering every request from a background thread.
    fn echo_host(port_name: String, correlation_id: &'static str) -> JoinHandle<()> {
        thread::spawn(move || {
            let mut conn = connect(&port_name, correlation_id).unwrap();
            let replies = conn.replies();
            while let Ok(Some(envelope)) = conn.next_request() {
                let reply = match envelope.body {
                    Request::Ping => Reply::Pong,
                    Request::Shutdown => {
                        replies.send(envelope.seq, Reply::ShuttingDown).unwrap();
                        break;
                    }
                    Request::Explore { package } => Reply::Explored {
                        tests: vec![TestCase::new(package.name)],
                    },
                    // Never answered, to exercise timeouts.
                    Request::Unload => continue,
                    other => Reply::Failed {
                        kind: FailureKind::InvalidOperation,
                        message: other.name().to_string(),
                    },
                };
                replies.send(envelope.seq, reply).unwrap();
            }
        })
    }

    fn connected(correlation_id: &'static str) -> (IpcClient, JoinHandle<()>) {
        let listener = IpcListener::bind().unwrap();
        let host = echo_host(listener.port_name().to_string(), correlation_id);
        let client = listener
            .accept(correlation_id, Duration::from_secs(5), || true)
            .unwrap();
        (client, host)
    }

    #[test]
    fn test_request_wire_format() {
        let json = serde_json::to_string(&Envelope {
            seq: 3,
            body: Request::Ping,
        })
        .unwrap();
        assert_eq!(json, r#"{"seq":3,"body":{"type":"ping"}}"#);
    }

    #[test]
    fn test_call_round_trip() {
        let (client, host) = connected("corr-1");
        assert_eq!(client.peer_pid(), std::process::id());

        assert_eq!(client.call(Request::Ping).unwrap(), Reply::Pong);
        let reply = client
            .call(Request::Explore {
                package: TestPackage::new("pkg"),
            })
            .unwrap();
        assert_eq!(
            reply,
            Reply::Explored {
                tests: vec![TestCase::new("pkg")]
            }
        );

        assert_eq!(client.call(Request::Shutdown).unwrap(), Reply::ShuttingDown);
        host.join().unwrap();
    }

    #[test]
    fn test_concurrent_calls_are_multiplexed() {
        let (client, _host) = connected("corr-2");
        let client = Arc::new(client);

        let workers: Vec<_> = (0..8)
            .map(|i| {
                let client = client.clone();
                thread::spawn(move || {
                    let name = format!("pkg-{}", i);
                    let reply = client
                        .call(Request::Explore {
                            package: TestPackage::new(name.clone()),
                        })
                        .unwrap();
                    assert_eq!(
                        reply,
                        Reply::Explored {
                            tests: vec![TestCase::new(name)]
                        }
                    );
                })
            })
            .collect();

        for worker in workers {
            worker.join().unwrap();
        }
    }

    #[test]
    fn test_disconnect_fails_pending_and_later_calls() {
        let (client, host) = connected("corr-3");
        assert_eq!(client.call(Request::Shutdown).unwrap(), Reply::ShuttingDown);
        host.join().unwrap();

        // The host thread dropped its end; the reader notices and closes.
        let err = client.call(Request::Ping).unwrap_err();
        assert!(matches!(err, IpcError::Disconnected | IpcError::Io(_)));
    }

    #[test]
    fn test_call_timeout() {
        let (client, _host) = connected("corr-4");
        let err = client
            .call_timeout(Request::Unload, Duration::from_millis(50))
            .unwrap_err();
        assert!(matches!(err, IpcError::Timeout(_)));

        // The connection stays usable.
        assert_eq!(client.call(Request::Ping).unwrap(), Reply::Pong);
    }

    #[test]
    fn test_mismatched_correlation_id_rejected() {
        let listener = IpcListener::bind().unwrap();
        let port = listener.port_name().to_string();
        let intruder = thread::spawn(move || {
            let _conn = connect(&port, "someone-else").unwrap();
            thread::sleep(Duration::from_millis(200));
        });

        let err = listener
            .accept("expected", Duration::from_millis(100), || true)
            .err()
            .unwrap();
        assert!(matches!(err, IpcError::Timeout(_)));
        intruder.join().unwrap();
    }

    #[test]
    fn test_accept_gives_up_when_host_gone() {
        let listener = IpcListener::bind().unwrap();
        let err = listener
            .accept("id", Duration::from_secs(30), || false)
            .err()
            .unwrap();
        assert!(matches!(err, IpcError::Handshake(_)));
    }
}
