use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use crate::config::WorkerConfig;
use crate::error::{Result, SlicerError};
use crate::messaging::heartbeat::{reconnect_delay, Heartbeat};
use crate::messaging::protocol::{names, Message, MessageCodec};
use crate::messaging::requests::{Handlers, PendingResponses};

/// Owner tag for requests sent to the server.
const SERVER: &str = "server";

#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Server address in host:port format
    pub host_addr: String,
    pub client_id: String,
    pub action_timeout: Duration,
    pub network_latency_buffer: Duration,
    pub ping_interval_ms: u64,
    pub ping_timeout_ms: u64,
    pub connect_timeout: Duration,
    pub reconnect_delay_min_ms: u64,
    pub reconnect_delay_max_ms: u64,
}

impl ClientOptions {
    pub fn from_worker(config: &WorkerConfig) -> Self {
        Self {
            host_addr: config.controller_addr.clone(),
            client_id: config.worker_id.clone(),
            action_timeout: Duration::from_millis(config.action_timeout_ms),
            network_latency_buffer: Duration::from_millis(config.network_latency_buffer_ms),
            ping_interval_ms: config.ping_interval_ms,
            ping_timeout_ms: config.ping_timeout_ms,
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            reconnect_delay_min_ms: config.reconnect_delay_min_ms,
            reconnect_delay_max_ms: config.reconnect_delay_max_ms,
        }
    }

    pub fn response_timeout(&self) -> Duration {
        self.action_timeout + self.network_latency_buffer
    }
}

struct Connection {
    tx: mpsc::UnboundedSender<Message>,
    close: CancellationToken,
}

/// A live connection whose writer and pinger are already running.
struct Attached {
    frames: SplitStream<Framed<TcpStream, MessageCodec>>,
    tx: mpsc::UnboundedSender<Message>,
    close: CancellationToken,
    writer: JoinHandle<()>,
    pinger: JoinHandle<()>,
}

struct ClientInner {
    options: ClientOptions,
    pending: PendingResponses,
    handlers: Handlers,
    conn: Mutex<Option<Connection>>,
    connected: watch::Sender<bool>,
    reconnects: watch::Sender<u64>,
    closed: CancellationToken,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

/// Client side of the messenger protocol.
///
/// Once connected, a supervisor task keeps the connection alive: it pings
/// the server, and when the connection drops it reconnects with jittered
/// backoff until [`MessengerClient::shutdown`] is called.
#[derive(Clone)]
pub struct MessengerClient {
    inner: Arc<ClientInner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MessengerClient {
    pub fn new(options: ClientOptions) -> Result<Self> {
        if options.host_addr.trim().is_empty() {
            return Err(SlicerError::InvalidConfig(
                "Messenger client requires a valid host_addr".into(),
            ));
        }
        if options.client_id.trim().is_empty() {
            return Err(SlicerError::InvalidConfig(
                "Messenger client requires a valid client_id".into(),
            ));
        }
        let (connected, _) = watch::channel(false);
        let (reconnects, _) = watch::channel(0);
        Ok(Self {
            inner: Arc::new(ClientInner {
                options,
                pending: PendingResponses::new(),
                handlers: Handlers::new(),
                conn: Mutex::new(None),
                connected,
                reconnects,
                closed: CancellationToken::new(),
                supervisor: Mutex::new(None),
            }),
        })
    }

    pub fn client_id(&self) -> &str {
        &self.inner.options.client_id
    }

    /// Register a handler for requests the server sends under `message`.
    pub fn on_request<F>(&self, message: impl Into<String>, handler: F)
    where
        F: Fn(&str, &Message) -> Option<Value> + Send + Sync + 'static,
    {
        self.inner.handlers.insert(message, handler);
    }

    /// Connect to the server, retrying until `connect_timeout` elapses.
    pub async fn connect(&self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        if self.inner.closed.is_cancelled() {
            return Err(SlicerError::Closed);
        }

        let options = &self.inner.options;
        let deadline = Instant::now() + options.connect_timeout;
        let framed = loop {
            match self.inner.open_connection().await {
                Ok(framed) => break framed,
                Err(e) => {
                    let delay =
                        reconnect_delay(options.reconnect_delay_min_ms, options.reconnect_delay_max_ms);
                    if Instant::now() + delay >= deadline {
                        return Err(SlicerError::ConnectFailed {
                            addr: options.host_addr.clone(),
                            reason: e.to_string(),
                        });
                    }
                    tracing::debug!(addr = %options.host_addr, error = %e, "Connect attempt failed, retrying");
                    tokio::time::sleep(delay).await;
                }
            }
        };

        let attached = self.inner.attach(framed);
        let inner = self.inner.clone();
        let task = tokio::spawn(async move { inner.supervise(attached).await });
        if let Some(previous) = lock(&self.inner.supervisor).replace(task) {
            previous.abort();
        }

        tracing::info!(
            client_id = %options.client_id,
            addr = %options.host_addr,
            "Connected to server"
        );
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        *self.inner.connected.borrow()
    }

    /// Counter bumped after every successful reconnect.
    pub fn reconnects(&self) -> watch::Receiver<u64> {
        self.inner.reconnects.subscribe()
    }

    /// Fire-and-forget message to the server.
    pub fn send(&self, message: &str, payload: Value) -> Result<()> {
        let tx = self
            .inner
            .current_sender()
            .ok_or_else(|| SlicerError::NotConnected(self.inner.options.client_id.clone()))?;
        tx.send(Message::volatile(message, payload))
            .map_err(|_| SlicerError::NotConnected(self.inner.options.client_id.clone()))
    }

    /// Send a request and wait for the response.
    ///
    /// Timeouts and dropped connections are retried up to `retries` more
    /// times, waiting for a reconnect in between. Errors reported by the
    /// server are returned immediately.
    pub async fn send_with_response(
        &self,
        message: &str,
        payload: Value,
        retries: u32,
    ) -> Result<Message> {
        let response_timeout = self.inner.options.response_timeout();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = match self.inner.current_sender() {
                Some(tx) => {
                    request_on(&self.inner.pending, &tx, message, payload.clone(), response_timeout)
                        .await
                }
                None => Err(SlicerError::NotConnected(
                    self.inner.options.client_id.clone(),
                )),
            };

            match result {
                Ok(response) => return Ok(response),
                Err(e @ SlicerError::Remote { .. }) => return Err(e),
                Err(e) if attempt > retries || self.inner.closed.is_cancelled() => return Err(e),
                Err(e) => {
                    tracing::debug!(message = %message, attempt, error = %e, "Request failed, retrying");
                    self.wait_for_connection(response_timeout).await;
                }
            }
        }
    }

    /// Wait up to `timeout` for a live connection.
    pub async fn wait_for_connection(&self, timeout: Duration) -> bool {
        let mut rx = self.inner.connected.subscribe();
        let connected = tokio::time::timeout(timeout, rx.wait_for(|connected| *connected))
            .await
            .map(|r| r.is_ok());
        connected.unwrap_or(false)
    }

    /// Drop the current connection and wait for the supervisor to reconnect.
    pub async fn force_reconnect(&self) -> Result<()> {
        let mut rx = self.inner.reconnects.subscribe();
        let before = *rx.borrow_and_update();

        let close = lock(&self.inner.conn).as_ref().map(|c| c.close.clone());
        match close {
            Some(close) => close.cancel(),
            None => return Err(SlicerError::NotConnected(self.inner.options.client_id.clone())),
        }

        let timeout = self.inner.options.connect_timeout;
        let reconnected = tokio::time::timeout(timeout, rx.wait_for(|n| *n > before))
            .await
            .map(|r| r.is_ok());
        match reconnected {
            Ok(true) => Ok(()),
            Ok(false) => Err(SlicerError::Closed),
            Err(_) => Err(SlicerError::Timeout {
                message: "reconnect".to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.inner.closed.cancel();
        if let Some(conn) = lock(&self.inner.conn).take() {
            conn.close.cancel();
        }
        let supervisor = lock(&self.inner.supervisor).take();
        if let Some(task) = supervisor {
            if let Err(e) = task.await {
                tracing::debug!(error = %e, "Connection supervisor ended abnormally");
            }
        }
        self.inner.pending.clear();
        self.inner.connected.send_replace(false);
        Ok(())
    }
}

/// Send `message` on `tx` and wait for the matching response.
async fn request_on(
    pending: &PendingResponses,
    tx: &mpsc::UnboundedSender<Message>,
    message: &str,
    payload: Value,
    timeout: Duration,
) -> Result<Message> {
    let request = Message::request(message, payload);
    let msg_id = request.msg_id.clone();
    let rx = pending.register(&msg_id, SERVER);
    if tx.send(request).is_err() {
        pending.cancel(&msg_id);
        return Err(SlicerError::Closed);
    }
    pending.wait(&msg_id, rx, message, timeout).await
}

impl ClientInner {
    fn current_sender(&self) -> Option<mpsc::UnboundedSender<Message>> {
        lock(&self.conn).as_ref().map(|c| c.tx.clone())
    }

    async fn open_connection(&self) -> Result<Framed<TcpStream, MessageCodec>> {
        let timeout = self.options.response_timeout();
        let stream = tokio::time::timeout(timeout, TcpStream::connect(self.options.host_addr.as_str()))
            .await
            .map_err(|_| SlicerError::Timeout {
                message: "connect".to_string(),
                timeout_ms: timeout.as_millis() as u64,
            })??;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(error = %e, "Failed to set TCP_NODELAY");
        }

        let mut framed = Framed::new(stream, MessageCodec::new());
        let hello = Message::request(
            names::CONNECT,
            json!({ "client_id": self.options.client_id }),
        );
        framed.send(hello.clone()).await?;

        let ack = tokio::time::timeout(timeout, framed.next())
            .await
            .map_err(|_| SlicerError::Timeout {
                message: names::CONNECT.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            })?;
        match ack {
            Some(Ok(msg)) if msg.is_response() && msg.msg_id == hello.msg_id => match msg.error {
                Some(error) => Err(SlicerError::Remote {
                    message: names::CONNECT.to_string(),
                    error,
                }),
                None => Ok(framed),
            },
            Some(Ok(msg)) => Err(SlicerError::Protocol(format!(
                "expected handshake response, got {}",
                msg.message
            ))),
            Some(Err(e)) => Err(e),
            None => Err(SlicerError::Closed),
        }
    }

    fn attach(self: &Arc<Self>, framed: Framed<TcpStream, MessageCodec>) -> Attached {
        let (mut sink, frames) = framed.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let close = self.closed.child_token();

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

        let heartbeat = Heartbeat::new(self.options.ping_interval_ms, self.options.ping_timeout_ms);
        let pending = self.pending.clone();
        let ping_tx = tx.clone();
        let ping_close = close.clone();
        let pinger = tokio::spawn(async move {
            let dead = heartbeat
                .run(
                    |timeout| {
                        let pending = pending.clone();
                        let tx = ping_tx.clone();
                        async move {
                            request_on(&pending, &tx, names::PING, Value::Null, timeout)
                                .await
                                .map(|_| ())
                        }
                    },
                    ping_close.clone(),
                )
                .await;
            if dead {
                tracing::warn!("Server stopped answering pings, dropping connection");
                ping_close.cancel();
            }
        });

        *lock(&self.conn) = Some(Connection {
            tx: tx.clone(),
            close: close.clone(),
        });
        self.connected.send_replace(true);

        Attached {
            frames,
            tx,
            close,
            writer,
            pinger,
        }
    }

    async fn supervise(self: Arc<Self>, attached: Attached) {
        let mut attached = attached;
        loop {
            self.read_until_closed(attached).await;
            if self.closed.is_cancelled() {
                break;
            }
            tracing::warn!(client_id = %self.options.client_id, "Connection to server lost, reconnecting");

            attached = loop {
                let delay =
                    reconnect_delay(self.options.reconnect_delay_min_ms, self.options.reconnect_delay_max_ms);
                tokio::select! {
                    _ = self.closed.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
                match self.open_connection().await {
                    Ok(framed) => break self.attach(framed),
                    Err(e) => {
                        tracing::debug!(addr = %self.options.host_addr, error = %e, "Reconnect attempt failed");
                    }
                }
            };
            self.reconnects.send_modify(|n| *n += 1);
            tracing::info!(client_id = %self.options.client_id, "Reconnected to server");
        }
    }

    async fn read_until_closed(&self, attached: Attached) {
        let Attached {
            mut frames,
            tx,
            close,
            writer,
            pinger,
        } = attached;

        loop {
            tokio::select! {
                _ = close.cancelled() => break,
                next = frames.next() => match next {
                    None => break,
                    Some(Err(e)) => {
                        tracing::debug!(error = %e, "Connection error");
                        break;
                    }
                    Some(Ok(msg)) => self.handle_message(msg, &tx),
                }
            }
        }

        close.cancel();
        pinger.abort();
        let _ = writer.await;
        *lock(&self.conn) = None;
        self.connected.send_replace(false);
        self.pending.drop_owner(SERVER);
    }

    fn handle_message(&self, msg: Message, tx: &mpsc::UnboundedSender<Message>) {
        if msg.is_response() {
            self.pending.resolve(msg);
            return;
        }
        let reply = if msg.message == names::PING {
            msg.response.then(|| msg.respond(json!({ "pong": true })))
        } else {
            self.handlers.dispatch(&self.options.host_addr, &msg)
        };
        if let Some(reply) = reply {
            if tx.send(reply).is_err() {
                tracing::debug!("Connection closed before reply was sent");
            }
        }
    }
}
