//! Reverse TCP sessions.
//!
//! PSUs open the connection to us and then behave as a Modbus RTU slave (unit id 1)
//! inside the TCP stream. Each accepted socket is owned by one actor task; callers
//! talk to it through [`TcpSession`], which implements [`RegisterSession`].

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use rmodbus::{ModbusProto, client::ModbusRequest};
use socket2::{SockRef, TcpKeepalive};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::{mpsc, oneshot},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    bridge::SessionSink,
    error::{Error, Result},
    session::{RegisterSession, SessionId},
};

/// Modbus unit id the PSUs answer on.
pub const UNIT_ID: u8 = 1;

/// Default listen address.
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8080";

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(3);

const KEEPALIVE_IDLE: Duration = Duration::from_secs(5);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(2);
#[cfg(target_os = "linux")]
const KEEPALIVE_PROBES: u32 = 10;
#[cfg(target_os = "linux")]
const USER_TIMEOUT: Duration = Duration::from_secs(15);

/// Requests queued towards one session actor.
const REQUEST_QUEUE: usize = 8;

/// Upper bound on resynchronising, as a multiple of the quiet window.
const RESYNC_LIMIT: u32 = 4;

/// Read header: unit id, function code, byte count (or first byte of the echo).
const RTU_HEADER_LEN: usize = 3;

/// Total length of an RTU response frame, worked out from its first three bytes.
pub fn rtu_frame_len(header: &[u8; RTU_HEADER_LEN]) -> Result<usize> {
    let function = header[1];
    match function {
        f if f & 0x80 != 0 => Ok(5),
        0x03 | 0x04 => Ok(RTU_HEADER_LEN + header[2] as usize + 2),
        0x06 | 0x10 => Ok(8),
        _ => Err(Error::InvalidResponse),
    }
}

enum Operation {
    Read { count: u16 },
    Write,
}

struct SessionRequest {
    frame: Vec<u8>,
    modbus: ModbusRequest,
    operation: Operation,
    response_tx: oneshot::Sender<Result<Vec<u16>>>,
}

/// Handle to one connected PSU.
pub struct TcpSession {
    id: SessionId,
    peer: SocketAddr,
    request_tx: mpsc::Sender<SessionRequest>,
    cancel: CancellationToken,
}

impl TcpSession {
    /// Start the actor owning `stream`.
    pub fn spawn<S>(id: SessionId, peer: SocketAddr, stream: S, request_timeout: Duration) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (request_tx, request_rx) = mpsc::channel(REQUEST_QUEUE);
        let cancel = CancellationToken::new();
        tokio::spawn(run_session(id, stream, request_rx, cancel.clone(), request_timeout));
        Arc::new(Self {
            id,
            peer,
            request_tx,
            cancel,
        })
    }

    async fn submit(&self, frame: Vec<u8>, modbus: ModbusRequest, operation: Operation) -> Result<Vec<u16>> {
        if self.cancel.is_cancelled() {
            return Err(Error::SessionClosed);
        }
        let (response_tx, response_rx) = oneshot::channel();
        let request = SessionRequest {
            frame,
            modbus,
            operation,
            response_tx,
        };
        self.request_tx.send(request).await.map_err(|_| Error::SessionClosed)?;
        response_rx.await.map_err(|_| Error::SessionClosed)?
    }
}

#[async_trait]
impl RegisterSession for TcpSession {
    fn id(&self) -> SessionId {
        self.id
    }

    fn peer(&self) -> SocketAddr {
        self.peer
    }

    async fn read_registers(&self, address: u16, count: u16) -> Result<Vec<u16>> {
        let mut modbus = ModbusRequest::new(UNIT_ID, ModbusProto::Rtu);
        let mut frame = Vec::new();
        modbus.generate_get_holdings(address, count, &mut frame)?;
        self.submit(frame, modbus, Operation::Read { count }).await
    }

    async fn write_registers(&self, address: u16, values: &[u16]) -> Result<()> {
        let mut modbus = ModbusRequest::new(UNIT_ID, ModbusProto::Rtu);
        let mut frame = Vec::new();
        match values {
            [] => return Ok(()),
            [value] => modbus.generate_set_holding(address, *value, &mut frame)?,
            _ => modbus.generate_set_holdings_bulk(address, values, &mut frame)?,
        }
        self.submit(frame, modbus, Operation::Write).await.map(|_| ())
    }

    fn close(&self) {
        self.cancel.cancel();
    }

    fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    async fn closed(&self) {
        self.cancel.cancelled().await
    }
}

impl Drop for TcpSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_session<S>(
    id: SessionId,
    mut stream: S,
    mut request_rx: mpsc::Receiver<SessionRequest>,
    cancel: CancellationToken,
    request_timeout: Duration,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut scratch = [0u8; 256];
    // Set when a reply may still be in flight or was cut short.
    let mut out_of_sync = false;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            request = request_rx.recv() => {
                let Some(request) = request else { break };
                let synced = if out_of_sync {
                    resync(id, &mut stream, request_timeout).await
                } else {
                    Ok(())
                };
                let outcome = match synced {
                    Ok(()) => {
                        out_of_sync = false;
                        tokio::time::timeout(request_timeout, exchange(&mut stream, &request))
                            .await
                            .unwrap_or(Err(Error::Timeout))
                    }
                    Err(e) => Err(e),
                };
                let fatal = matches!(&outcome, Err(e) if e.is_fatal());
                if let Err(e) = &outcome {
                    debug!("Session {id} request failed: {e}");
                    out_of_sync |= matches!(e, Error::Timeout | Error::InvalidResponse);
                }
                let _ = request.response_tx.send(outcome);
                if fatal {
                    break;
                }
            }
            read = stream.read(&mut scratch) => match read {
                Ok(0) => {
                    debug!("Session {id} reached EOF");
                    break;
                }
                Ok(n) => debug!("Session {id} discarded {n} unsolicited bytes"),
                Err(e) => {
                    debug!("Session {id} read failed: {e}");
                    break;
                }
            },
        }
    }

    cancel.cancel();
    request_rx.close();
    let _ = stream.shutdown().await;
}

/// Throw away bytes until the PSU has been silent for `quiet`.
///
/// A late reply to a timed-out request, or the tail of a cut frame, would otherwise be
/// taken as the answer to the next request.
async fn resync<S>(id: SessionId, stream: &mut S, quiet: Duration) -> Result<()>
where
    S: AsyncRead + Unpin,
{
    let mut scratch = [0u8; 256];
    let mut discarded = 0;
    let drain = async {
        loop {
            match tokio::time::timeout(quiet, stream.read(&mut scratch)).await {
                Err(_) => return Ok::<(), Error>(()),
                Ok(Ok(0)) => return Err(Error::SessionClosed),
                Ok(Ok(n)) => discarded += n,
                Ok(Err(e)) => return Err(Error::from(e)),
            }
        }
    };
    let result = tokio::time::timeout(quiet * RESYNC_LIMIT, drain)
        .await
        .unwrap_or(Err(Error::InvalidResponse));
    debug!("Session {id} discarded {discarded} stale bytes");
    result
}

/// Send one request frame and read back exactly one response frame.
async fn exchange<S>(stream: &mut S, request: &SessionRequest) -> Result<Vec<u16>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(&request.frame).await?;
    stream.flush().await?;

    let mut header = [0u8; RTU_HEADER_LEN];
    stream.read_exact(&mut header).await?;
    let mut response = vec![0u8; rtu_frame_len(&header)?];
    response[..RTU_HEADER_LEN].copy_from_slice(&header);
    stream.read_exact(&mut response[RTU_HEADER_LEN..]).await?;

    match request.operation {
        Operation::Read { count } => {
            let mut registers = Vec::new();
            request.modbus.parse_u16(&response, &mut registers)?;
            if registers.len() != count as usize {
                return Err(Error::RegisterCount {
                    expected: count as usize,
                    actual: registers.len(),
                });
            }
            Ok(registers)
        }
        Operation::Write => {
            request.modbus.parse_ok(&response)?;
            Ok(Vec::new())
        }
    }
}

fn configure_keepalive(stream: &TcpStream) -> std::io::Result<()> {
    let keepalive = TcpKeepalive::new()
        .with_time(KEEPALIVE_IDLE)
        .with_interval(KEEPALIVE_INTERVAL);
    #[cfg(target_os = "linux")]
    let keepalive = keepalive.with_retries(KEEPALIVE_PROBES);

    let socket = SockRef::from(stream);
    socket.set_tcp_keepalive(&keepalive)?;
    #[cfg(target_os = "linux")]
    socket.set_tcp_user_timeout(Some(USER_TIMEOUT))?;
    Ok(())
}

/// Accept PSU connections until `cancel` fires.
///
/// Each connection is offered to the orchestrator through `sink`. When the connection
/// later goes away, for whatever reason, its id is reported back through `sink`.
pub async fn serve(
    listener: TcpListener,
    sink: SessionSink,
    request_timeout: Duration,
    cancel: CancellationToken,
) -> Result<()> {
    static NEXT_ID: AtomicU64 = AtomicU64::new(1);

    info!("Listening for PSUs on {}", listener.local_addr()?);

    loop {
        let (stream, peer) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Accept failed: {e}");
                    continue;
                }
            },
        };

        if let Err(e) = configure_keepalive(&stream) {
            warn!("Could not configure keepalive for {peer}: {e}");
        }

        let id = SessionId(NEXT_ID.fetch_add(1, Ordering::Relaxed));
        info!("PSU connected from {peer} (session {id})");

        let session = TcpSession::spawn(id, peer, stream, request_timeout);
        let watcher = session.clone();
        let closed_sink = sink.clone();
        tokio::spawn(async move {
            watcher.closed().await;
            info!("PSU session {id} from {peer} closed");
            closed_sink.session_closed(id);
        });

        if !sink.offer(session.clone()) {
            warn!("Onboarding queue full, dropping PSU connection from {peer}");
            session.close();
        }
    }

    Ok(())
}
