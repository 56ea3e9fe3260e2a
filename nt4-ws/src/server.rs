use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, Sender};
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use uuid::Uuid;

use crate::frame::CloseCode;
use crate::handshake::{self, DEFAULT_BAD_REQUEST};
use crate::session::{
    CloseState, MessageFrame, MessageKind, MessageSender, SessionConfig, SessionHandler,
    WebSocket,
};
use crate::stream::{LineReader, Transport};

/// Session ids handed to server callbacks.
pub type Guid = Uuid;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct WsServerConfig {
    pub bind_addr: IpAddr,
    /// Port to listen on; 0 lets the OS pick (the bound port is available
    /// from `local_addr`).
    pub port: u16,
    pub max_clients: usize,
    pub session: SessionConfig,
    /// Response sent when the request is not a valid WebSocket upgrade or
    /// the server is at capacity.
    pub bad_request_response: String,
    pub dispatch_queue_depth: usize,
}

impl Default for WsServerConfig {
    fn default() -> Self {
        WsServerConfig {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 0,
            max_clients: 10,
            session: SessionConfig::default(),
            bad_request_response: DEFAULT_BAD_REQUEST.to_owned(),
            dispatch_queue_depth: 64,
        }
    }
}

/// One connected client as the server tracks it.
#[derive(Clone)]
pub struct ClientEntry {
    pub guid: Guid,
    /// The path the client requested in its upgrade request.
    pub path: String,
    pub addr: Option<SocketAddr>,
    sender: Arc<MessageSender<TcpStream>>,
}

impl ClientEntry {
    /// `host:port` of the peer, empty when unknown.
    pub fn conn(&self) -> String {
        self.addr.map(|a| a.to_string()).unwrap_or_default()
    }
}

/// Server event callbacks. Held weakly so the server never keeps its owner
/// alive; sessions are owned by the server's registry and callbacks get
/// the GUID as the handle.
pub trait WsServerHandler: Send + Sync {
    /// Picks one of the protocols the client requested, or none.
    fn select_protocol(&self, _requested: &[String]) -> Option<String> {
        None
    }
    fn client_connected(&self, _entry: &ClientEntry) {}
    fn client_disconnected(&self, _guid: &Guid, _code: u16, _reason: &str) {}
    fn message_received(&self, _guid: &Guid, _frame: &MessageFrame) {}
    fn pong_received(&self, _guid: &Guid, _payload: &[u8]) {}
}

/// Operations that can be queued from contexts that must not block (timer
/// and interrupt handlers). Payload buffers move into the entry.
#[derive(Debug)]
pub enum DispatchOp {
    Disconnect(Guid),
    Ping(Guid),
    PingPayload(Guid, Vec<u8>),
    SendText(Guid, String),
    SendBinary(Guid, Vec<u8>),
}

struct Shared {
    config: WsServerConfig,
    clients: RwLock<HashMap<Guid, ClientEntry>>,
    running: AtomicBool,
    handler: RwLock<Option<Weak<dyn WsServerHandler>>>,
    local_addr: RwLock<Option<SocketAddr>>,
}

impl Shared {
    fn with_handler<R>(&self, f: impl FnOnce(&dyn WsServerHandler) -> R) -> Option<R> {
        let weak = self.handler.read().clone()?;
        let strong = weak.upgrade()?;
        Some(f(strong.as_ref()))
    }

    fn entry(&self, guid: &Guid) -> Option<ClientEntry> {
        self.clients.read().get(guid).cloned()
    }

    fn perform(&self, op: DispatchOp) -> bool {
        match op {
            DispatchOp::Disconnect(guid) => {
                self.entry(&guid)
                    .map(|e| e.sender.close(CloseCode::NormalClosure as u16, ""))
                    .is_some()
            }
            DispatchOp::Ping(guid) => self.entry(&guid).map_or(false, |e| e.sender.ping(&[])),
            DispatchOp::PingPayload(guid, payload) => self
                .entry(&guid)
                .map_or(false, |e| e.sender.ping(&payload)),
            DispatchOp::SendText(guid, data) => self
                .entry(&guid)
                .map_or(false, |e| e.sender.send(data.as_bytes(), MessageKind::Text)),
            DispatchOp::SendBinary(guid, data) => self
                .entry(&guid)
                .map_or(false, |e| e.sender.send(&data, MessageKind::Binary)),
        }
    }
}

/// A WebSocket server: accepts connections, runs the upgrade handshake,
/// and drives one session per client on its own thread.
pub struct WsServer {
    shared: Arc<Shared>,
    accept_thread: Mutex<Option<thread::JoinHandle<()>>>,
    dispatch_thread: Mutex<Option<thread::JoinHandle<()>>>,
    dispatch_tx: Mutex<Option<Sender<DispatchOp>>>,
}

impl WsServer {
    pub fn new(config: WsServerConfig) -> Self {
        WsServer {
            shared: Arc::new(Shared {
                config,
                clients: RwLock::new(HashMap::new()),
                running: AtomicBool::new(false),
                handler: RwLock::new(None),
                local_addr: RwLock::new(None),
            }),
            accept_thread: Mutex::new(None),
            dispatch_thread: Mutex::new(None),
            dispatch_tx: Mutex::new(None),
        }
    }

    /// Binds the listener and starts accepting connections.
    pub fn start(&self, handler: Weak<dyn WsServerHandler>) -> io::Result<()> {
        let listener =
            TcpListener::bind((self.shared.config.bind_addr, self.shared.config.port))?;
        let local_addr = listener.local_addr()?;
        info!("listening on {}", local_addr);

        *self.shared.local_addr.write() = Some(local_addr);
        *self.shared.handler.write() = Some(handler);
        self.shared.running.store(true, Ordering::SeqCst);

        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("ws-accept".to_owned())
            .spawn(move || accept_loop(listener, shared))?;
        *self.accept_thread.lock() = Some(handle);
        Ok(())
    }

    /// Closes the listener and disconnects every client. Outstanding
    /// session threads exit on their next read tick.
    pub fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }

        // Wake the blocked acceptor with a throwaway connection.
        if let Some(addr) = *self.shared.local_addr.read() {
            let wake = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port());
            let _ = TcpStream::connect(wake);
        }

        let entries: Vec<ClientEntry> = self.shared.clients.read().values().cloned().collect();
        for entry in entries {
            entry.sender.disconnect();
        }

        if let Some(handle) = self.accept_thread.lock().take() {
            let _ = handle.join();
        }
        *self.dispatch_tx.lock() = None;
        if let Some(handle) = self.dispatch_thread.lock().take() {
            let _ = handle.join();
        }
    }

    pub fn is_listening(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.shared.local_addr.read()
    }

    pub fn client_count(&self) -> usize {
        self.shared.clients.read().len()
    }

    pub fn is_client_connected(&self, guid: &Guid) -> bool {
        self.shared
            .entry(guid)
            .map_or(false, |e| e.sender.is_connected())
    }

    /// Starts the close handshake with a client.
    pub fn disconnect_client(&self, guid: &Guid) {
        if let Some(entry) = self.shared.entry(guid) {
            entry.sender.close(CloseCode::NormalClosure as u16, "");
        }
    }

    pub fn ping(&self, guid: &Guid, payload: &[u8]) -> bool {
        self.shared
            .entry(guid)
            .map_or(false, |e| e.sender.ping(payload))
    }

    /// Sends one message to a client. False when the client is gone, the
    /// send mutex timed out, or the transport failed; other clients are
    /// unaffected either way.
    pub fn send(&self, guid: &Guid, data: &[u8], kind: MessageKind) -> bool {
        self.shared
            .entry(guid)
            .map_or(false, |e| e.sender.send(data, kind))
    }

    /// Starts the single-reader worker that drains queued operations. Use
    /// `enqueue` from contexts that must not block on the send mutex.
    pub fn start_dispatch_queue(&self) {
        let mut tx_slot = self.dispatch_tx.lock();
        if tx_slot.is_some() {
            return;
        }
        let (tx, rx) = bounded(self.shared.config.dispatch_queue_depth);
        *tx_slot = Some(tx);

        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("ws-dispatch".to_owned())
            .spawn(move || {
                for op in rx.iter() {
                    shared.perform(op);
                }
            })
            .expect("spawn dispatch worker");
        *self.dispatch_thread.lock() = Some(handle);
    }

    pub fn is_dispatch_queue_running(&self) -> bool {
        self.dispatch_tx.lock().is_some()
    }

    /// Queues an operation without blocking. False when the queue is full
    /// or not running.
    pub fn enqueue(&self, op: DispatchOp) -> bool {
        match self.dispatch_tx.lock().as_ref() {
            Some(tx) => tx.try_send(op).is_ok(),
            None => false,
        }
    }
}

impl Drop for WsServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    while shared.running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, addr)) => {
                if !shared.running.load(Ordering::SeqCst) {
                    break;
                }
                let shared = Arc::clone(&shared);
                let spawned = thread::Builder::new()
                    .name("ws-client".to_owned())
                    .spawn(move || handle_connection(stream, addr, shared));
                if let Err(err) = spawned {
                    warn!("failed to spawn session thread: {}", err);
                }
            }
            Err(err) => {
                if shared.running.load(Ordering::SeqCst) {
                    warn!("accept failed: {}", err);
                } else {
                    break;
                }
            }
        }
    }
    debug!("acceptor stopped");
}

/// Forwards session callbacks to the server handler, keyed by GUID.
struct HandlerBridge {
    guid: Guid,
    shared: Arc<Shared>,
}

impl SessionHandler for HandlerBridge {
    fn on_message(&mut self, frame: &MessageFrame) {
        self.shared
            .with_handler(|h| h.message_received(&self.guid, frame));
    }

    fn on_pong(&mut self, payload: &[u8]) {
        self.shared
            .with_handler(|h| h.pong_received(&self.guid, payload));
    }
}

fn handle_connection(stream: TcpStream, addr: SocketAddr, shared: Arc<Shared>) {
    let _ = stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT));
    let mut reader = LineReader::new(stream);

    let request = match handshake::read_upgrade_request(&mut reader) {
        Ok(request) => request,
        Err(err) => {
            debug!("rejecting connection from {}: {}", addr, err);
            let (mut stream, _) = reader.into_parts();
            let _ = Transport::write_all(
                &mut stream,
                shared.config.bad_request_response.as_bytes(),
            );
            Transport::shutdown(&stream);
            return;
        }
    };

    if shared.clients.read().len() >= shared.config.max_clients {
        debug!("at capacity, rejecting {}", addr);
        let (mut stream, _) = reader.into_parts();
        let _ = Transport::write_all(&mut stream, shared.config.bad_request_response.as_bytes());
        Transport::shutdown(&stream);
        return;
    }

    let protocol = shared
        .with_handler(|h| h.select_protocol(&request.protocols))
        .unwrap_or(None);

    let (mut stream, leftover) = reader.into_parts();
    if handshake::write_upgrade_response(&mut stream, &request.key, protocol.as_deref()).is_err()
    {
        Transport::shutdown(&stream);
        return;
    }

    let mut ws = match WebSocket::accept(stream, leftover, shared.config.session.clone()) {
        Ok(ws) => ws,
        Err(err) => {
            debug!("session setup failed for {}: {}", addr, err);
            return;
        }
    };

    let guid = Uuid::new_v4();
    let entry = ClientEntry {
        guid,
        path: request.path.clone(),
        addr: Some(addr),
        sender: ws.sender(),
    };
    shared.clients.write().insert(guid, entry.clone());
    info!("client {} connected from {} ({})", guid, addr, request.path);
    shared.with_handler(|h| h.client_connected(&entry));

    let mut bridge = HandlerBridge {
        guid,
        shared: Arc::clone(&shared),
    };
    let state = ws.run_message_loop(&mut bridge);

    shared.clients.write().remove(&guid);
    let (code, reason) = match state {
        CloseState::Graceful { code, reason } => (code, reason),
        CloseState::Abnormal => (CloseCode::ClosedAbnormally as u16, String::new()),
    };
    info!("client {} disconnected ({}: {:?})", guid, code, reason);
    shared.with_handler(|h| h.client_disconnected(&guid, code, &reason));
}
