//! WebSocket client for the call server
//!
//! # Connection Flow
//!
//! 1. Register handlers with `on()` (and `on_close()`)
//! 2. `connect()` - establish the socket, retrying with backoff
//! 3. `send()` - queue a typed message (non-blocking)
//! 4. `disconnect()` - clean shutdown, safe to call repeatedly
//!
//! # Retry Strategy
//!
//! Initial connection retries with exponential backoff (1s, 2s, 4s, ...).
//! Mid-call disconnects do NOT reconnect; `on_close` fires instead.

use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use super::protocol::{InboundMessage, MessageKind, OutboundMessage};
use super::TransportError;

/// Connection timeout for the WebSocket handshake
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Default attempts for the initial connection
const MAX_RETRIES: u32 = 3;

/// Base delay for exponential backoff (doubles each retry)
const RETRY_BASE_DELAY: Duration = Duration::from_secs(1);

/// Messages held for types that have no handler yet.
pub const BACKLOG_LIMIT: usize = 64;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type MessageHandler = Arc<dyn Fn(&InboundMessage) + Send + Sync>;
type CloseHandler = Box<dyn FnOnce(String) + Send>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Default)]
struct Dispatch {
    handlers: HashMap<MessageKind, Vec<MessageHandler>>,
    backlog: VecDeque<InboundMessage>,
}

struct Shared {
    status: Mutex<ConnectionStatus>,
    dispatch: Mutex<Dispatch>,
    /// Held while handlers run so a backlog flush never interleaves with live frames
    delivery: Mutex<()>,
    outgoing: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    closing: AtomicBool,
    on_close: Mutex<Option<CloseHandler>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Client side of the call socket.
///
/// All methods take `&self`; the client is shared behind an `Arc` between
/// the connect task and the call loop.
pub struct TransportClient {
    shared: Arc<Shared>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    max_attempts: u32,
}

impl Default for TransportClient {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportClient {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                status: Mutex::new(ConnectionStatus::Disconnected),
                dispatch: Mutex::new(Dispatch::default()),
                delivery: Mutex::new(()),
                outgoing: Mutex::new(None),
                closing: AtomicBool::new(false),
                on_close: Mutex::new(None),
            }),
            reader_task: Mutex::new(None),
            max_attempts: MAX_RETRIES,
        }
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn status(&self) -> ConnectionStatus {
        *lock(&self.shared.status)
    }

    fn set_status(&self, status: ConnectionStatus) {
        *lock(&self.shared.status) = status;
    }

    /// Register a handler for one message type.
    ///
    /// Handlers for the same type run in registration order. Messages that
    /// arrived before the first handler for their type are replayed to it
    /// here, in arrival order. Must not be called from inside a handler.
    pub fn on<F>(&self, kind: MessageKind, handler: F)
    where
        F: Fn(&InboundMessage) + Send + Sync + 'static,
    {
        let handler: MessageHandler = Arc::new(handler);
        let _delivery = lock(&self.shared.delivery);

        let held = {
            let mut dispatch = lock(&self.shared.dispatch);
            let list = dispatch.handlers.entry(kind).or_default();
            list.push(handler.clone());
            if list.len() > 1 {
                return;
            }
            let (held, rest): (VecDeque<_>, VecDeque<_>) = dispatch
                .backlog
                .drain(..)
                .partition(|m| m.kind() == kind);
            dispatch.backlog = rest;
            held
        };

        if !held.is_empty() {
            log::debug!(
                "Replaying {} held {} message(s) to new handler",
                held.len(),
                kind.as_str()
            );
        }
        for message in &held {
            handler(message);
        }
    }

    /// Called once if the connection drops without `disconnect()`.
    pub fn on_close<F>(&self, handler: F)
    where
        F: FnOnce(String) + Send + 'static,
    {
        *lock(&self.shared.on_close) = Some(Box::new(handler));
    }

    /// Connect to the call server
    ///
    /// Resolves once the socket is open. Retries up to the configured
    /// attempt count with exponential backoff.
    pub async fn connect(&self, url: &str) -> Result<(), TransportError> {
        self.shared.closing.store(false, Ordering::SeqCst);
        self.set_status(ConnectionStatus::Connecting);

        let mut last_error = None;

        for attempt in 0..self.max_attempts {
            if attempt > 0 {
                let delay = RETRY_BASE_DELAY * 2u32.pow(attempt - 1);
                log::info!(
                    "Retrying call server connection in {:?} (attempt {}/{})",
                    delay,
                    attempt + 1,
                    self.max_attempts
                );
                tokio::time::sleep(delay).await;
            }

            if self.shared.closing.load(Ordering::SeqCst) {
                break;
            }

            match Self::try_connect(url).await {
                Ok(socket) => {
                    if self.shared.closing.load(Ordering::SeqCst) {
                        log::info!("Call closed while connecting, dropping new socket");
                        drop(socket);
                        break;
                    }
                    self.start(socket);
                    log::info!("Connected to call server at {}", url);
                    return Ok(());
                }
                Err(e) => {
                    log::warn!("Connection attempt {} failed: {}", attempt + 1, e);
                    last_error = Some(e);
                }
            }
        }

        self.set_status(ConnectionStatus::Disconnected);
        Err(last_error.unwrap_or_else(|| {
            TransportError::Connection("Connection cancelled".to_string())
        }))
    }

    /// Single connection attempt (no retries)
    async fn try_connect(url: &str) -> Result<Socket, TransportError> {
        log::info!("Connecting to call server {}...", url);

        let (socket, _response) = timeout(CONNECTION_TIMEOUT, connect_async(url))
            .await
            .map_err(|_| TransportError::Connection("Connection timeout".to_string()))?
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        Ok(socket)
    }

    fn start(&self, socket: Socket) {
        let (mut write, mut read) = socket.split();
        let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<Message>();

        *lock(&self.shared.outgoing) = Some(outgoing_tx);
        self.set_status(ConnectionStatus::Connected);

        tokio::spawn(async move {
            while let Some(message) = outgoing_rx.recv().await {
                if matches!(message, Message::Close(_)) {
                    break;
                }
                if let Err(e) = write.send(message).await {
                    log::warn!("WebSocket write failed: {}", e);
                    break;
                }
            }
            if let Err(e) = write.close().await {
                log::debug!("WebSocket close: {}", e);
            }
            log::debug!("Writer task exiting");
        });

        let shared = self.shared.clone();
        let reader = tokio::spawn(async move {
            let reason = loop {
                match read.next().await {
                    Some(Ok(Message::Text(text))) => match InboundMessage::decode(&text) {
                        Ok(message) => deliver(&shared, message),
                        Err(e) => log::warn!("Dropping inbound frame: {}", e),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        break frame
                            .map(|f| f.reason.to_string())
                            .filter(|r| !r.is_empty())
                            .unwrap_or_else(|| "closed by server".to_string());
                    }
                    Some(Ok(_)) => {} // Ignore ping/pong/binary
                    Some(Err(e)) => break e.to_string(),
                    None => break "stream ended".to_string(),
                }
            };

            lock(&shared.outgoing).take();
            *lock(&shared.status) = ConnectionStatus::Disconnected;

            if !shared.closing.swap(true, Ordering::SeqCst) {
                log::warn!("Call server connection lost: {}", reason);
                let handler = lock(&shared.on_close).take();
                if let Some(handler) = handler {
                    handler(reason);
                }
            }
            log::debug!("Reader task exiting");
        });

        if let Some(previous) = lock(&self.reader_task).replace(reader) {
            previous.abort();
        }
    }

    /// Send a typed message.
    ///
    /// When the socket is not open this is a logged no-op that returns
    /// `NotConnected`; nothing is queued for later.
    pub fn send(&self, message: &OutboundMessage) -> Result<(), TransportError> {
        let name = message.type_name();

        if self.status() != ConnectionStatus::Connected {
            log::error!("Cannot send {}: call server is not connected", name);
            return Err(TransportError::NotConnected(name));
        }

        let json = message.encode()?;
        let outgoing = lock(&self.shared.outgoing);
        let Some(tx) = outgoing.as_ref() else {
            log::error!("Cannot send {}: writer is gone", name);
            return Err(TransportError::NotConnected(name));
        };

        tx.send(Message::Text(json))
            .map_err(|_| TransportError::NotConnected(name))?;
        log::debug!("Sent {}", name);
        Ok(())
    }

    /// Close the connection. Calling this more than once is harmless.
    pub fn disconnect(&self) {
        self.shared.closing.store(true, Ordering::SeqCst);
        let was_open = self.status() != ConnectionStatus::Disconnected;

        if let Some(tx) = lock(&self.shared.outgoing).take() {
            let _ = tx.send(Message::Close(None));
        }
        self.set_status(ConnectionStatus::Disconnected);

        if let Some(reader) = lock(&self.reader_task).take() {
            reader.abort();
        }

        if was_open {
            log::info!("Disconnected from call server");
        }
    }
}

impl Drop for TransportClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn deliver(shared: &Shared, message: InboundMessage) {
    let _delivery = lock(&shared.delivery);
    let kind = message.kind();

    let handlers = {
        let mut dispatch = lock(&shared.dispatch);
        match dispatch.handlers.get(&kind) {
            Some(list) if !list.is_empty() => list.clone(),
            _ => {
                if dispatch.backlog.len() >= BACKLOG_LIMIT {
                    if let Some(dropped) = dispatch.backlog.pop_front() {
                        log::warn!(
                            "Backlog full, dropping held {} message",
                            dropped.kind().as_str()
                        );
                    }
                }
                log::debug!("No handler for {} yet, holding message", kind.as_str());
                dispatch.backlog.push_back(message);
                return;
            }
        }
    };

    for handler in &handlers {
        handler(&message);
    }
}
