//! Reconnecting WebSocket bridge transport
//!
//! One persistent WebSocket connection carries every proxied session.
//! Outbound frames go through a bounded send queue with a non-blocking
//! offer (a full queue drops the frame and surfaces backpressure to the
//! caller); a dedicated write pump drains the queue and interleaves
//! heartbeat pings. Inbound frames are handed to the injected
//! [`Receiver`](super::Receiver) in arrival order. When a pump dies the
//! link is redialed with exponential backoff until `close()` suppresses
//! it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, sleep, timeout, Instant};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use super::codec;
use super::{Receiver, Transport};
use crate::error::BridgeError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Supplies headers (auth tokens and the like) at dial time
pub type HeaderProvider = Arc<dyn Fn() -> Vec<(String, String)> + Send + Sync>;

/// Heartbeat ping period
const PING_PERIOD: Duration = Duration::from_secs(10);

/// Read window; expires unless traffic (a pong at minimum) arrives
const PONG_WAIT: Duration = Duration::from_secs(15);

/// Per-frame write deadline
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Bounded send queue capacity, in frames
const SEND_QUEUE_SIZE: usize = 32 * 1024;

/// Backoff exponent cap for the reconnect loop
const MAX_BACKOFF_SHIFT: u32 = 16;

/// WebSocket transport configuration
#[derive(Clone)]
pub struct WsTransportConfig {
    /// `ws://` or `wss://` endpoint of the remote peer
    pub url: String,
    /// Send queue capacity in frames
    pub send_queue_size: usize,
    /// Dial timeout (TCP + TLS + WebSocket handshake)
    pub connect_timeout: Duration,
    /// Heartbeat ping period
    pub ping_period: Duration,
    /// Read window reset by inbound traffic
    pub pong_wait: Duration,
    /// Per-frame write deadline
    pub write_timeout: Duration,
}

impl WsTransportConfig {
    /// Config for the given endpoint with default timings
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            send_queue_size: SEND_QUEUE_SIZE,
            connect_timeout: Duration::from_secs(10),
            ping_period: PING_PERIOD,
            pong_wait: PONG_WAIT,
            write_timeout: WRITE_TIMEOUT,
        }
    }
}

impl std::fmt::Debug for WsTransportConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsTransportConfig")
            .field("url", &self.url)
            .field("send_queue_size", &self.send_queue_size)
            .finish()
    }
}

/// Reconnecting WebSocket transport
pub struct WsTransport {
    config: WsTransportConfig,
    send_tx: mpsc::Sender<Vec<u8>>,
    closed: AtomicBool,
    done_tx: watch::Sender<bool>,
}

impl WsTransport {
    /// Dial the endpoint and start the transport
    ///
    /// The initial dial must succeed; reconnection only governs later
    /// drops. `header_provider` is invoked on every dial so rotating
    /// credentials stay fresh.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::DialFailed`] when the first dial fails.
    pub async fn connect(
        config: WsTransportConfig,
        header_provider: Option<HeaderProvider>,
        receiver: Arc<dyn Receiver>,
    ) -> Result<Arc<Self>, BridgeError> {
        let ws = Self::dial(&config, header_provider.as_ref()).await?;

        let (send_tx, send_rx) = mpsc::channel(config.send_queue_size);
        let (done_tx, _) = watch::channel(false);
        let transport = Arc::new(Self {
            config,
            send_tx,
            closed: AtomicBool::new(false),
            done_tx,
        });

        tokio::spawn(supervisor(
            Arc::clone(&transport),
            header_provider,
            receiver,
            ws,
            send_rx,
        ));
        Ok(transport)
    }

    /// Whether the transport has been closed
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn dial(
        config: &WsTransportConfig,
        header_provider: Option<&HeaderProvider>,
    ) -> Result<WsStream, BridgeError> {
        info!(url = %config.url, "bridge dialing");

        let mut request = config
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| BridgeError::dial_failed(&config.url, e.to_string()))?;
        if let Some(provider) = header_provider {
            for (name, value) in provider() {
                let name = HeaderName::from_bytes(name.as_bytes())
                    .map_err(|e| BridgeError::dial_failed(&config.url, e.to_string()))?;
                let value = HeaderValue::from_str(&value)
                    .map_err(|e| BridgeError::dial_failed(&config.url, e.to_string()))?;
                request.headers_mut().append(name, value);
            }
        }

        let (ws, _response) = timeout(config.connect_timeout, connect_async(request))
            .await
            .map_err(|_| BridgeError::dial_failed(&config.url, "connect timeout"))?
            .map_err(|e| BridgeError::dial_failed(&config.url, e.to_string()))?;

        debug!(url = %config.url, "bridge connected");
        Ok(ws)
    }

    /// Test-only transport with a live send queue but no connection
    #[cfg(test)]
    pub(crate) fn detached(send_queue_size: usize) -> (Arc<Self>, mpsc::Receiver<Vec<u8>>) {
        let (send_tx, send_rx) = mpsc::channel(send_queue_size);
        let (done_tx, _) = watch::channel(false);
        let transport = Arc::new(Self {
            config: WsTransportConfig {
                send_queue_size,
                ..WsTransportConfig::new("ws://127.0.0.1:0/detached")
            },
            send_tx,
            closed: AtomicBool::new(false),
            done_tx,
        });
        (transport, send_rx)
    }
}

impl Transport for WsTransport {
    fn send(
        &self,
        frame_type: u8,
        flag: u8,
        client_id: &str,
        conn_id: &str,
        server_type: u8,
        payload: Option<&[u8]>,
    ) -> Result<(), BridgeError> {
        let short_id = &conn_id[..conn_id.len().min(6)];
        let data_len = payload.map_or(0, <[u8]>::len);

        if self.is_closed() {
            error!(short_id, bytes = data_len, "send refused, transport closed");
            return Err(BridgeError::Closed);
        }

        let encoded = codec::encode(frame_type, flag, client_id, conn_id, server_type, payload)?;
        let encoded_len = encoded.len();

        match self.send_tx.try_send(encoded) {
            Ok(()) => {
                debug!(short_id, bytes = data_len, encoded = encoded_len, "send queued");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                error!(
                    short_id,
                    bytes = data_len,
                    "send queue full, dropping frame"
                );
                Err(BridgeError::ChannelFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                error!(short_id, bytes = data_len, "send refused, queue gone");
                Err(BridgeError::Closed)
            }
        }
    }

    fn close(&self) {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let _ = self.done_tx.send(true);
        info!("bridge transport closed");
    }
}

/// Owns the live connection: pumps it, then reconnects until closed
async fn supervisor(
    transport: Arc<WsTransport>,
    header_provider: Option<HeaderProvider>,
    receiver: Arc<dyn Receiver>,
    mut ws: WsStream,
    mut send_rx: mpsc::Receiver<Vec<u8>>,
) {
    let mut done_rx = transport.done_tx.subscribe();

    loop {
        run_link(&transport.config, ws, &mut send_rx, &receiver, &mut done_rx).await;

        // Sessions multiplexed over the dropped link are unrecoverable.
        receiver.on_disconnected().await;

        if transport.is_closed() {
            break;
        }

        info!("bridge reconnecting");
        let mut attempt: u32 = 0;
        ws = loop {
            let backoff = Duration::from_secs(1u64 << attempt.min(MAX_BACKOFF_SHIFT));
            tokio::select! {
                _ = done_rx.wait_for(|closed| *closed) => return,
                () = tokio::time::sleep(backoff) => {}
            }
            if transport.is_closed() {
                return;
            }
            match WsTransport::dial(&transport.config, header_provider.as_ref()).await {
                Ok(ws) => break ws,
                Err(e) => {
                    attempt += 1;
                    error!(error = %e, retries = attempt, "bridge reconnect failed");
                }
            }
        };
        info!("bridge reconnected");
    }
}

/// Pump one live connection until a pump dies or the transport closes
async fn run_link(
    config: &WsTransportConfig,
    ws: WsStream,
    send_rx: &mut mpsc::Receiver<Vec<u8>>,
    receiver: &Arc<dyn Receiver>,
    done_rx: &mut watch::Receiver<bool>,
) {
    let (mut sink, mut stream) = ws.split();

    let write_pump = async {
        let mut ping = interval_at(Instant::now() + config.ping_period, config.ping_period);
        loop {
            tokio::select! {
                maybe = send_rx.recv() => {
                    let Some(frame) = maybe else { break };
                    match timeout(config.write_timeout, sink.send(Message::Binary(frame))).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            error!(error = %e, "bridge write error");
                            break;
                        }
                        Err(_) => {
                            error!("bridge write deadline expired");
                            break;
                        }
                    }
                }
                _ = ping.tick() => {
                    match timeout(config.write_timeout, sink.send(Message::Ping(Vec::new()))).await {
                        Ok(Ok(())) => debug!("ping sent"),
                        Ok(Err(e)) => {
                            error!(error = %e, "bridge ping error");
                            break;
                        }
                        Err(_) => {
                            error!("bridge ping deadline expired");
                            break;
                        }
                    }
                }
            }
        }
    };

    let read_pump = async {
        // The read deadline is armed at connect time and advanced only by
        // pongs; data traffic alone must not keep a dead heartbeat alive.
        let deadline = sleep(config.pong_wait);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                () = deadline.as_mut() => {
                    error!("bridge read deadline expired");
                    break;
                }
                message = stream.next() => match message {
                    Some(Ok(Message::Binary(data))) => {
                        debug!(bytes = data.len(), "bridge read");
                        receiver.on_received(data).await;
                    }
                    Some(Ok(Message::Text(text))) => {
                        receiver.on_received(text.into_bytes()).await;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        deadline.as_mut().reset(Instant::now() + config.pong_wait);
                        debug!("pong received");
                    }
                    // tungstenite answers pings on the next stream poll
                    Some(Ok(Message::Ping(_))) => debug!("ping received"),
                    Some(Ok(Message::Close(_))) => {
                        warn!("bridge peer sent close");
                        break;
                    }
                    Some(Ok(Message::Frame(_))) => {}
                    Some(Err(e)) => {
                        error!(error = %e, "bridge read error");
                        break;
                    }
                    None => {
                        warn!("bridge stream ended");
                        break;
                    }
                },
            }
        }
    };

    tokio::select! {
        () = write_pump => {}
        () = read_pump => {}
        _ = done_rx.wait_for(|closed| *closed) => {}
    }
}
