use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use crate::config::ControllerConfig;
use crate::error::{Result, SlicerError};
use crate::events::EventHub;
use crate::messaging::protocol::{names, ClientState, ConnectPayload, Message, MessageCodec};
use crate::messaging::requests::{Handlers, PendingResponses};
use crate::messaging::ServerEvent;

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub listen_addr: SocketAddr,
    pub server_name: String,
    pub action_timeout: Duration,
    pub network_latency_buffer: Duration,
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
    /// How long a disconnected client may take to come back before it is offline
    pub client_disconnect_timeout: Duration,
}

impl ServerOptions {
    pub fn from_controller(config: &ControllerConfig, server_name: impl Into<String>) -> Self {
        Self {
            listen_addr: config.listen_addr,
            server_name: server_name.into(),
            action_timeout: config.action_timeout(),
            network_latency_buffer: Duration::from_millis(config.network_latency_buffer_ms),
            ping_interval: Duration::from_millis(config.ping_interval_ms),
            ping_timeout: Duration::from_millis(config.ping_timeout_ms),
            client_disconnect_timeout: config.worker_disconnect_timeout(),
        }
    }

    pub fn response_timeout(&self) -> Duration {
        self.action_timeout + self.network_latency_buffer
    }

    pub fn liveness_window(&self) -> Duration {
        self.ping_interval + self.ping_timeout
    }

    pub fn validate(&self) -> Result<()> {
        if self.client_disconnect_timeout.is_zero() {
            return Err(SlicerError::InvalidConfig(
                "Messenger server requires a valid client_disconnect_timeout".into(),
            ));
        }
        if self.action_timeout.is_zero() {
            return Err(SlicerError::InvalidConfig(
                "Messenger server requires a valid action_timeout".into(),
            ));
        }
        Ok(())
    }
}

struct ClientEntry {
    state: ClientState,
    conn_id: u64,
    tx: Option<mpsc::UnboundedSender<Message>>,
    close: Option<CancellationToken>,
    disconnect_timer: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct ClientTable {
    clients: HashMap<String, ClientEntry>,
    /// FIFO of clients ready for work
    available: VecDeque<String>,
}

impl ClientTable {
    fn remove_available(&mut self, client_id: &str) {
        self.available.retain(|id| id != client_id);
    }

    fn count(&self, matches: impl Fn(ClientState) -> bool) -> usize {
        self.clients.values().filter(|c| matches(c.state)).count()
    }
}

/// Consulted before a client-declared state change is applied.
/// Returning false leaves the client's state untouched.
pub type StateChangeHook = Arc<dyn Fn(&str, ClientState) -> bool + Send + Sync>;

struct ServerInner {
    options: ServerOptions,
    events: EventHub<ServerEvent>,
    table: Mutex<ClientTable>,
    pending: PendingResponses,
    handlers: Handlers,
    state_hook: Mutex<Option<StateChangeHook>>,
    shutting_down: AtomicBool,
    closed: CancellationToken,
    next_conn_id: AtomicU64,
    local_addr: Mutex<Option<SocketAddr>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

/// Server side of the messenger protocol.
///
/// Tracks every client that ever connected, its connection state, and the
/// FIFO of clients that reported themselves available.
#[derive(Clone)]
pub struct MessengerServer {
    inner: Arc<ServerInner>,
}

impl MessengerServer {
    pub fn new(options: ServerOptions, events: EventHub<ServerEvent>) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            inner: Arc::new(ServerInner {
                options,
                events,
                table: Mutex::new(ClientTable::default()),
                pending: PendingResponses::new(),
                handlers: Handlers::new(),
                state_hook: Mutex::new(None),
                shutting_down: AtomicBool::new(false),
                closed: CancellationToken::new(),
                next_conn_id: AtomicU64::new(1),
                local_addr: Mutex::new(None),
                accept_task: Mutex::new(None),
            }),
        })
    }

    /// Bind the listener and start accepting connections.
    pub async fn listen(&self) -> Result<SocketAddr> {
        let listener = TcpListener::bind(self.inner.options.listen_addr).await?;
        let addr = listener.local_addr()?;
        *lock(&self.inner.local_addr) = Some(addr);

        let inner = self.inner.clone();
        let task = tokio::spawn(async move { inner.accept_loop(listener).await });
        *lock(&self.inner.accept_task) = Some(task);

        tracing::info!(
            addr = %addr,
            server = %self.inner.options.server_name,
            "Messenger server listening"
        );
        Ok(addr)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *lock(&self.inner.local_addr)
    }

    pub fn events(&self) -> &EventHub<ServerEvent> {
        &self.inner.events
    }

    pub fn options(&self) -> &ServerOptions {
        &self.inner.options
    }

    /// Register a handler for requests named `message`.
    pub fn on_request<F>(&self, message: impl Into<String>, handler: F)
    where
        F: Fn(&str, &Message) -> Option<Value> + Send + Sync + 'static,
    {
        self.inner.handlers.insert(message, handler);
    }

    /// Install a hook that may veto the `available` / `unavailable`
    /// declarations clients send.
    pub fn on_client_state_change<F>(&self, hook: F)
    where
        F: Fn(&str, ClientState) -> bool + Send + Sync + 'static,
    {
        *lock(&self.inner.state_hook) = Some(Arc::new(hook));
    }

    /// Send a request to a client and wait for its response.
    pub async fn send(&self, client_id: &str, message: &str, payload: Value) -> Result<Message> {
        let request = Message::request(message, payload);
        let tx = self.inner.sender_for(client_id)?;
        let rx = self.inner.pending.register(&request.msg_id, client_id);
        let msg_id = request.msg_id.clone();

        if tx.send(request).is_err() {
            self.inner.pending.cancel(&msg_id);
            return Err(SlicerError::NotConnected(client_id.to_string()));
        }

        self.inner
            .pending
            .wait(&msg_id, rx, message, self.inner.options.response_timeout())
            .await
    }

    /// Fire-and-forget message to one client.
    pub fn send_volatile(&self, client_id: &str, message: &str, payload: Value) -> Result<()> {
        let tx = self.inner.sender_for(client_id)?;
        tx.send(Message::volatile(message, payload))
            .map_err(|_| SlicerError::NotConnected(client_id.to_string()))
    }

    /// Fire-and-forget message to every connected client. Returns how many were sent.
    pub fn send_to_all(&self, message: &str, payload: Value) -> usize {
        let senders: Vec<_> = {
            let table = self.inner.table();
            table
                .clients
                .values()
                .filter(|c| c.state.is_connected())
                .filter_map(|c| c.tx.clone())
                .collect()
        };
        senders
            .into_iter()
            .filter(|tx| tx.send(Message::volatile(message, payload.clone())).is_ok())
            .count()
    }

    /// Move a connected client between online, available and unavailable.
    pub fn update_client_state(&self, client_id: &str, state: ClientState) -> bool {
        self.inner.update_client_state(client_id, state)
    }

    /// Atomically claim an available client, marking it unavailable.
    pub fn reserve_available(&self, client_id: &str) -> bool {
        let reserved = {
            let mut guard = self.inner.table();
            let table = &mut *guard;
            match table.clients.get_mut(client_id) {
                Some(entry) if entry.state == ClientState::Available => {
                    entry.state = ClientState::Unavailable;
                    table.remove_available(client_id);
                    true
                }
                _ => false,
            }
        };
        if reserved {
            self.inner
                .events
                .emit(ServerEvent::ClientUnavailable(client_id.to_string()));
        }
        reserved
    }

    /// Return a reserved client to the available queue if it is still connected.
    pub fn restore_available(&self, client_id: &str) -> bool {
        if self.client_state(client_id) != Some(ClientState::Unavailable) {
            return false;
        }
        self.update_client_state(client_id, ClientState::Available)
    }

    /// Take the next available client. With `preferred` set, only that client
    /// is eligible.
    pub fn dequeue_available(&self, preferred: Option<&str>) -> Option<String> {
        let mut table = self.inner.table();
        match preferred {
            Some(client_id) => {
                let pos = table.available.iter().position(|id| id == client_id)?;
                table.available.remove(pos)
            }
            None => table.available.pop_front(),
        }
    }

    pub fn client_state(&self, client_id: &str) -> Option<ClientState> {
        self.inner.table().clients.get(client_id).map(|c| c.state)
    }

    pub fn available_queue_len(&self) -> usize {
        self.inner.table().available.len()
    }

    pub fn online_client_count(&self) -> usize {
        self.inner.table().count(|s| s.is_connected())
    }

    pub fn available_client_count(&self) -> usize {
        self.inner.table().count(|s| s == ClientState::Available)
    }

    pub fn unavailable_client_count(&self) -> usize {
        self.inner.table().count(|s| s == ClientState::Unavailable)
    }

    pub fn disconnected_client_count(&self) -> usize {
        self.inner.table().count(|s| s == ClientState::Disconnected)
    }

    pub fn offline_client_count(&self) -> usize {
        self.inner.table().count(|s| s == ClientState::Offline)
    }

    pub fn total_client_count(&self) -> usize {
        self.inner.table().clients.len()
    }

    /// While shutting down, disconnected clients go straight to offline.
    pub fn set_shutting_down(&self, shutting_down: bool) {
        self.inner
            .shutting_down
            .store(shutting_down, Ordering::SeqCst);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.set_shutting_down(true);
        self.inner.closed.cancel();

        let accept = lock(&self.inner.accept_task).take();
        if let Some(task) = accept {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Accept loop ended abnormally");
            }
        }

        {
            let mut table = self.inner.table();
            for entry in table.clients.values_mut() {
                if let Some(timer) = entry.disconnect_timer.take() {
                    timer.abort();
                }
                if let Some(close) = entry.close.take() {
                    close.cancel();
                }
                entry.tx = None;
            }
            table.available.clear();
        }
        self.inner.pending.clear();

        tracing::debug!(server = %self.inner.options.server_name, "Messenger server shut down");
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ServerInner {
    fn table(&self) -> MutexGuard<'_, ClientTable> {
        lock(&self.table)
    }

    fn sender_for(&self, client_id: &str) -> Result<mpsc::UnboundedSender<Message>> {
        let table = self.table();
        table
            .clients
            .get(client_id)
            .filter(|c| c.state.is_connected())
            .and_then(|c| c.tx.clone())
            .ok_or_else(|| SlicerError::NotConnected(client_id.to_string()))
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            tokio::select! {
                _ = self.closed.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let inner = self.clone();
                        tokio::spawn(async move { inner.handle_connection(stream, peer).await });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to accept connection");
                    }
                }
            }
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
        }
        let mut framed = Framed::new(stream, MessageCodec::new());

        let hello = match tokio::time::timeout(self.options.response_timeout(), framed.next()).await
        {
            Ok(Some(Ok(msg))) if msg.message == names::CONNECT => msg,
            Ok(Some(Ok(msg))) => {
                tracing::warn!(peer = %peer, message = %msg.message, "Expected client:connect as first message");
                return;
            }
            Ok(Some(Err(e))) => {
                tracing::warn!(peer = %peer, error = %e, "Invalid handshake frame");
                return;
            }
            Ok(None) => return,
            Err(_) => {
                tracing::warn!(peer = %peer, "Timed out waiting for client:connect");
                return;
            }
        };

        let client_id = match serde_json::from_value::<ConnectPayload>(hello.payload.clone()) {
            Ok(payload) if !payload.client_id.trim().is_empty() => payload.client_id,
            _ => {
                let _ = framed
                    .send(hello.respond_error("client:connect requires a client_id"))
                    .await;
                return;
            }
        };

        let ack = hello.respond(json!({
            "client_id": client_id,
            "server_name": self.options.server_name,
        }));
        if let Err(e) = framed.send(ack).await {
            tracing::debug!(client_id = %client_id, error = %e, "Failed to acknowledge client");
            return;
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let close = self.closed.child_token();
        let conn_id = self.register_connection(&client_id, tx.clone(), close.clone());

        let (mut sink, mut frames) = framed.split();
        let writer_close = close.clone();
        let writer = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    msg = rx.recv() => match msg {
                        Some(msg) => {
                            if let Err(e) = sink.send(msg).await {
                                tracing::debug!(error = %e, "Failed to write frame");
                                break;
                            }
                        }
                        None => break,
                    },
                    _ = writer_close.cancelled() => break,
                }
            }
            let _ = sink.close().await;
        });

        let liveness = self.options.liveness_window();
        loop {
            tokio::select! {
                _ = close.cancelled() => break,
                next = tokio::time::timeout(liveness, frames.next()) => match next {
                    Err(_) => {
                        tracing::warn!(client_id = %client_id, "Client missed heartbeats, closing connection");
                        break;
                    }
                    Ok(None) => break,
                    Ok(Some(Err(e))) => {
                        tracing::debug!(client_id = %client_id, error = %e, "Connection error");
                        break;
                    }
                    Ok(Some(Ok(msg))) => self.handle_message(&client_id, msg, &tx),
                }
            }
        }

        close.cancel();
        let _ = writer.await;
        self.connection_closed(&client_id, conn_id);
    }

    fn handle_message(&self, client_id: &str, msg: Message, tx: &mpsc::UnboundedSender<Message>) {
        let name = msg.message.clone();
        let reply = match name.as_str() {
            names::RESPONSE => {
                self.pending.resolve(msg);
                None
            }
            names::PING => msg.response.then(|| msg.respond(json!({ "pong": true }))),
            names::WORKER_READY | names::CLIENT_AVAILABLE => {
                self.declare_state(client_id, ClientState::Available);
                msg.response.then(|| msg.respond(json!({})))
            }
            names::CLIENT_UNAVAILABLE => {
                self.declare_state(client_id, ClientState::Unavailable);
                msg.response.then(|| msg.respond(json!({})))
            }
            _ => self.handlers.dispatch(client_id, &msg),
        };

        if let Some(reply) = reply {
            if tx.send(reply).is_err() {
                tracing::debug!(client_id = %client_id, "Connection closed before reply was sent");
            }
        }
    }

    fn declare_state(&self, client_id: &str, state: ClientState) {
        let hook = lock(&self.state_hook).clone();
        if let Some(hook) = hook {
            if !hook(client_id, state) {
                tracing::debug!(client_id = %client_id, state = ?state, "Client state change refused");
                return;
            }
        }
        self.update_client_state(client_id, state);
    }

    fn register_connection(
        &self,
        client_id: &str,
        tx: mpsc::UnboundedSender<Message>,
        close: CancellationToken,
    ) -> u64 {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::SeqCst);
        let event = {
            let mut guard = self.table();
            let table = &mut *guard;
            table.remove_available(client_id);
            match table.clients.get_mut(client_id) {
                Some(entry) => {
                    let previous = entry.state;
                    if let Some(stale) = entry.close.take() {
                        stale.cancel();
                    }
                    if let Some(timer) = entry.disconnect_timer.take() {
                        timer.abort();
                    }
                    entry.state = ClientState::Online;
                    entry.conn_id = conn_id;
                    entry.tx = Some(tx);
                    entry.close = Some(close);
                    if previous == ClientState::Offline {
                        ServerEvent::ClientOnline(client_id.to_string())
                    } else {
                        ServerEvent::ClientReconnect(client_id.to_string())
                    }
                }
                None => {
                    table.clients.insert(
                        client_id.to_string(),
                        ClientEntry {
                            state: ClientState::Online,
                            conn_id,
                            tx: Some(tx),
                            close: Some(close),
                            disconnect_timer: None,
                        },
                    );
                    ServerEvent::ClientOnline(client_id.to_string())
                }
            }
        };

        tracing::info!(client_id = %client_id, "Client connected");
        self.events.emit(event);
        conn_id
    }

    fn connection_closed(self: &Arc<Self>, client_id: &str, conn_id: u64) {
        let shutting_down = self.shutting_down.load(Ordering::SeqCst);
        {
            let mut guard = self.table();
            let table = &mut *guard;
            let Some(entry) = table.clients.get_mut(client_id) else {
                return;
            };
            if entry.conn_id != conn_id {
                // superseded by a newer connection
                return;
            }
            entry.tx = None;
            entry.close = None;
            if shutting_down {
                entry.state = ClientState::Offline;
            } else {
                entry.state = ClientState::Disconnected;
                let inner = self.clone();
                let id = client_id.to_string();
                let timeout = self.options.client_disconnect_timeout;
                entry.disconnect_timer = Some(tokio::spawn(async move {
                    tokio::time::sleep(timeout).await;
                    inner.expire_client(&id, conn_id);
                }));
            }
            table.remove_available(client_id);
        }
        self.pending.drop_owner(client_id);

        tracing::info!(client_id = %client_id, "Client disconnected");
        self.events
            .emit(ServerEvent::ClientDisconnect(client_id.to_string()));
        if shutting_down {
            self.events
                .emit(ServerEvent::ClientOffline(client_id.to_string()));
        }
    }

    fn expire_client(&self, client_id: &str, conn_id: u64) {
        let expired = {
            let mut table = self.table();
            match table.clients.get_mut(client_id) {
                Some(entry)
                    if entry.conn_id == conn_id && entry.state == ClientState::Disconnected =>
                {
                    entry.state = ClientState::Offline;
                    entry.disconnect_timer = None;
                    true
                }
                _ => false,
            }
        };
        if expired {
            tracing::warn!(client_id = %client_id, "Client did not reconnect in time, marking offline");
            self.events
                .emit(ServerEvent::ClientOffline(client_id.to_string()));
        }
    }

    fn update_client_state(&self, client_id: &str, state: ClientState) -> bool {
        if !state.is_connected() {
            return false;
        }
        let changed = {
            let mut guard = self.table();
            let table = &mut *guard;
            let Some(entry) = table.clients.get_mut(client_id) else {
                return false;
            };
            if !entry.state.is_connected() {
                return false;
            }
            let changed = entry.state != state;
            entry.state = state;
            if state == ClientState::Available {
                if !table.available.iter().any(|id| id == client_id) {
                    table.available.push_back(client_id.to_string());
                }
            } else {
                table.remove_available(client_id);
            }
            changed
        };

        if changed {
            match state {
                ClientState::Available => self
                    .events
                    .emit(ServerEvent::ClientAvailable(client_id.to_string())),
                ClientState::Unavailable => self
                    .events
                    .emit(ServerEvent::ClientUnavailable(client_id.to_string())),
                _ => {}
            }
        }
        true
    }
}
