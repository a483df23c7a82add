//! WebSocket listener and per-connection dispatch.
//!
//! One acceptor thread, one dispatch thread per client. Admission runs
//! inside the handshake callback so rejected peers get an HTTP error
//! response and never reach the hub's index.

use std::cell::OnceCell;
use std::io::ErrorKind as IoErrorKind;
use std::net::{IpAddr, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::Result;
use parking_lot::Mutex;
use tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tungstenite::http::{StatusCode, header};
use tungstenite::protocol::{Message, WebSocketConfig};
use tungstenite::{Error as WsError, WebSocket};

use super::{AdmissionError, BroadcastHub, ClientSlot, HubMessage, Next, Outbound};
use crate::core::log_security;
use crate::{debug, log};

/// Maximum port retry attempts
const MAX_PORT_RETRIES: u16 = 10;
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
/// How long dispatch waits for outbound frames before polling the socket.
const SEND_POLL: Duration = Duration::from_millis(25);
const READ_POLL: Duration = Duration::from_millis(10);
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Running listener. Stopping is idempotent and also happens on drop.
pub struct HubServer {
    address: SocketAddr,
    stop: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl HubServer {
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn port(&self) -> u16 {
        self.address.port()
    }

    /// Stop accepting. Connected clients are closed by
    /// [`BroadcastHub::shutdown`].
    pub fn stop(&self) {
        if self.stop.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = self.thread.lock().take()
            && handle.join().is_err()
        {
            log!("hub"; "acceptor thread panicked");
        }
    }
}

impl Drop for HubServer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Bind the configured interface (trying successive ports when busy) and
/// start accepting clients for `hub`.
pub fn serve(hub: Arc<BroadcastHub>) -> Result<HubServer> {
    let options = hub.options();
    let (listener, address) = try_bind_port(options.interface, options.port, MAX_PORT_RETRIES)?;
    listener.set_nonblocking(true)?;

    if !address.ip().is_loopback() && options.auth_token.is_none() {
        log!(
            "security";
            "listening on {} without auth_token: non-local clients will be refused",
            address
        );
    }

    let stop = Arc::new(AtomicBool::new(false));
    let acceptor_stop = Arc::clone(&stop);
    let thread = thread::Builder::new()
        .name("kiln-accept".into())
        .spawn(move || accept_loop(listener, hub, acceptor_stop))?;

    log!("hub"; "listening on ws://{}", address);
    Ok(HubServer {
        address,
        stop,
        thread: Mutex::new(Some(thread)),
    })
}

fn accept_loop(listener: TcpListener, hub: Arc<BroadcastHub>, stop: Arc<AtomicBool>) {
    let mut last_sweep = Instant::now();

    while !stop.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, peer)) => {
                debug!("hub"; "connection from {}", peer);
                let hub = Arc::clone(&hub);
                let spawned = thread::Builder::new()
                    .name(format!("kiln-ws-{peer}"))
                    .spawn(move || handle_connection(stream, peer, hub));
                if let Err(e) = spawned {
                    log!("hub"; "cannot spawn dispatch thread: {}", e);
                }
            }
            Err(ref e) if e.kind() == IoErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_BACKOFF);
            }
            Err(e) => {
                log!("hub"; "accept error: {}", e);
                thread::sleep(ACCEPT_BACKOFF);
            }
        }

        if last_sweep.elapsed() >= SWEEP_INTERVAL {
            last_sweep = Instant::now();
            hub.sweep_idle();
        }
    }
    debug!("hub"; "acceptor stopped");
}

fn handle_connection(stream: TcpStream, peer: SocketAddr, hub: Arc<BroadcastHub>) {
    // Blocking with a timeout for the handshake
    let _ = stream.set_nonblocking(false);
    let _ = stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT));

    let admitted: OnceCell<Arc<ClientSlot>> = OnceCell::new();
    let callback = |request: &Request, response: Response| {
        let origin = request
            .headers()
            .get(header::ORIGIN)
            .and_then(|v| v.to_str().ok());
        let token = request_token(request);
        match hub.register(peer, origin, token.as_deref()) {
            Ok(slot) => {
                let _ = admitted.set(slot);
                Ok(response)
            }
            Err(e) => Err(rejection(peer, &e)),
        }
    };

    let config = websocket_config(hub.options().max_message_size);
    let handshake = tungstenite::accept_hdr_with_config(stream, callback, Some(config));
    let ws = match handshake {
        Ok(ws) => ws,
        Err(e) => {
            if let Some(slot) = admitted.get() {
                hub.close(slot);
            }
            debug!("hub"; "handshake with {} failed: {}", peer, e);
            return;
        }
    };
    let Some(slot) = admitted.into_inner() else {
        return;
    };

    if !hub.activate(&slot) {
        return;
    }
    dispatch(ws, &slot, &hub);
    hub.close(&slot);
    debug!("hub"; "client {} disconnected", slot.id());
}

/// Pump outbound frames and watch the socket until either side closes.
fn dispatch(mut ws: WebSocket<TcpStream>, slot: &ClientSlot, hub: &BroadcastHub) {
    let _ = ws.get_ref().set_read_timeout(Some(READ_POLL));
    let ping_interval = hub.options().ping_interval;
    let mut last_ping = Instant::now();

    loop {
        match slot.next(SEND_POLL) {
            Next::Closed => break,
            Next::Timeout => {}
            Next::Frame(frame) => {
                if send_frame(&mut ws, frame).is_err() {
                    return;
                }
                // Drain whatever else is queued before touching the socket
                let mut failed = false;
                while let Next::Frame(frame) = slot.next(Duration::ZERO) {
                    if send_frame(&mut ws, frame).is_err() {
                        failed = true;
                        break;
                    }
                }
                if failed {
                    return;
                }
            }
        }

        if last_ping.elapsed() >= ping_interval {
            last_ping = Instant::now();
            // Protocol ping gets an automatic pong, which counts as activity
            if ws.send(Message::Ping(Default::default())).is_err() {
                return;
            }
            let ping = HubMessage::ping();
            slot.enqueue(Outbound {
                text: Arc::from(ping.to_json()),
                priority: ping.priority(),
            });
        }

        match ws.read() {
            Ok(Message::Close(_)) => break,
            Ok(_) => slot.touch(),
            Err(WsError::Io(ref e))
                if matches!(e.kind(), IoErrorKind::WouldBlock | IoErrorKind::TimedOut) => {}
            Err(_) => return,
        }
    }

    let _ = ws.close(None);
    let _ = ws.flush();
}

fn send_frame(ws: &mut WebSocket<TcpStream>, frame: Outbound) -> Result<(), WsError> {
    ws.send(Message::Text(frame.text.to_string().into()))
}

fn websocket_config(max_message_size: usize) -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(max_message_size);
    config.max_frame_size = Some(max_message_size);
    config
}

/// Token from `?token=` or an `Authorization: Bearer` header.
fn request_token(request: &Request) -> Option<String> {
    let from_query = request.uri().query().and_then(|query| {
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(key, _)| key == "token")
            .map(|(_, value)| value.into_owned())
    });
    from_query.or_else(|| {
        request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(|t| t.trim().to_string())
    })
}

fn rejection(peer: SocketAddr, error: &AdmissionError) -> ErrorResponse {
    let status = match error {
        AdmissionError::Security(e) => {
            log_security(e);
            StatusCode::FORBIDDEN
        }
        AdmissionError::TooManyConnections { .. } => {
            log!("hub"; "refused {}: {}", peer, error);
            StatusCode::TOO_MANY_REQUESTS
        }
        AdmissionError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
    };
    let mut response = ErrorResponse::new(Some(error.to_string()));
    *response.status_mut() = status;
    response
}

/// Try binding to port, retry with incremented port if in use
fn try_bind_port(
    interface: IpAddr,
    base_port: u16,
    max_retries: u16,
) -> Result<(TcpListener, SocketAddr)> {
    let mut last_error = None;

    for offset in 0..max_retries {
        let port = base_port.saturating_add(offset);
        match TcpListener::bind(SocketAddr::new(interface, port)) {
            Ok(listener) => {
                let address = listener.local_addr()?;
                if offset > 0 {
                    log!("hub"; "port {} busy, using {}", base_port, address.port());
                }
                return Ok((listener, address));
            }
            Err(e) => {
                last_error = Some(e);
                // Port 0 asks the OS; retrying it changes nothing
                if base_port == 0 {
                    break;
                }
            }
        }
    }

    Err(anyhow::anyhow!(
        "failed to bind WebSocket server on {} after {} attempts: {}",
        interface,
        max_retries,
        last_error.map(|e| e.to_string()).unwrap_or_default()
    ))
}
