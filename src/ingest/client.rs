//! Persistent authenticated WebSocket ingestion client.
//!
//! A single actor task owns the connection, the subscription table, and the
//! sequence bookkeeping. Cloneable [`IngestHandle`]s send subscription
//! commands over a channel; parsed messages are routed to the bus and, for
//! orderbooks, to the state store.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt, stream::SplitSink};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async_with_config,
    tungstenite::{
        self, Message, client::IntoClientRequest, http::HeaderValue,
        protocol::WebSocketConfig,
    },
};
use tracing::{debug, error, info, warn};

use super::protocol::{
    self, SequenceTracker, ServerMessage, UpdateAction, build_subscribe, build_unsubscribe,
};
use crate::auth::AuthSigner;
use crate::bus::{StreamPublisher, topics};
use crate::config::{KalshiConfig, TuningConfig};
use crate::error::{Error, Result};
use crate::models::{
    EventLifecycleEvent, KalshiTickerV2, KalshiTrade, MarketLifecycleEvent, OrderbookDelta,
    OrderbookSnapshot,
};
use crate::state::StateStore;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// Maximum accepted frame size (10 MiB).
const MAX_FRAME_BYTES: usize = 10 * 1024 * 1024;

/// Stats cadence.
const STATS_INTERVAL: Duration = Duration::from_secs(60);

/// A tracked subscription, keyed by a locally assigned sid.
#[derive(Debug, Clone)]
struct SubscriptionInfo {
    channels: Vec<String>,
    market_tickers: Option<Vec<String>>,
}

/// Commands accepted by the ingest actor.
enum IngestCommand {
    Subscribe {
        channels: Vec<String>,
        market_tickers: Option<Vec<String>>,
        reply: oneshot::Sender<u64>,
    },
    UpdateSubscription {
        sid: u64,
        add: Vec<String>,
        remove: Vec<String>,
    },
    Unsubscribe {
        sids: Vec<u64>,
    },
}

/// Cloneable handle for driving subscriptions on a running [`WsIngest`].
#[derive(Clone)]
pub struct IngestHandle {
    tx: mpsc::Sender<IngestCommand>,
}

impl IngestHandle {
    /// Add a subscription; returns the locally assigned sid.
    pub async fn subscribe(
        &self,
        channels: Vec<String>,
        market_tickers: Option<Vec<String>>,
    ) -> Result<u64> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(IngestCommand::Subscribe {
                channels,
                market_tickers,
                reply,
            })
            .await
            .map_err(|_| Error::Parse("ingest actor stopped".to_string()))?;
        rx.await
            .map_err(|_| Error::Parse("ingest actor dropped reply".to_string()))
    }

    /// Add and/or remove markets on an existing subscription.
    pub async fn update_subscription(
        &self,
        sid: u64,
        add: Vec<String>,
        remove: Vec<String>,
    ) -> Result<()> {
        self.tx
            .send(IngestCommand::UpdateSubscription { sid, add, remove })
            .await
            .map_err(|_| Error::Parse("ingest actor stopped".to_string()))
    }

    /// Drop subscriptions entirely.
    pub async fn unsubscribe(&self, sids: Vec<u64>) -> Result<()> {
        self.tx
            .send(IngestCommand::Unsubscribe { sids })
            .await
            .map_err(|_| Error::Parse("ingest actor stopped".to_string()))
    }
}

/// The WebSocket ingestion actor.
pub struct WsIngest {
    signer: AuthSigner,
    publisher: StreamPublisher,
    state: StateStore,
    kalshi: KalshiConfig,
    tuning: TuningConfig,
    cmd_rx: mpsc::Receiver<IngestCommand>,
    subscriptions: HashMap<u64, SubscriptionInfo>,
    next_sid: u64,
    next_request_id: u64,
    sequences: SequenceTracker,
    msg_counts: HashMap<String, u64>,
    connect_time: Option<Instant>,
}

impl WsIngest {
    pub fn new(
        signer: AuthSigner,
        publisher: StreamPublisher,
        state: StateStore,
        kalshi: KalshiConfig,
        tuning: TuningConfig,
    ) -> (Self, IngestHandle) {
        let (tx, cmd_rx) = mpsc::channel(64);
        let service = Self {
            signer,
            publisher,
            state,
            kalshi,
            tuning,
            cmd_rx,
            subscriptions: HashMap::new(),
            next_sid: 1,
            next_request_id: 1,
            sequences: SequenceTracker::new(),
            msg_counts: HashMap::new(),
            connect_time: None,
        };
        (service, IngestHandle { tx })
    }

    /// Perpetual connection loop: connect, resubscribe, pump messages,
    /// reconnect with exponential backoff on any failure.
    pub async fn run(mut self) {
        let max_delay = Duration::from_secs(self.tuning.ws_reconnect_max_delay);
        let mut delay = Duration::from_secs(1);

        loop {
            match self.connect().await {
                Ok(ws) => {
                    delay = Duration::from_secs(1);
                    self.connect_time = Some(Instant::now());
                    info!(url = %self.kalshi.ws_url, "websocket_connected");

                    if let Err(e) = self.session(ws).await {
                        warn!(error = %e, "websocket_disconnected");
                    }
                }
                Err(e) => error!(error = %e, "websocket_connect_failed"),
            }

            info!(delay_seconds = delay.as_secs(), "websocket_reconnecting");
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(max_delay);
        }
    }

    /// Establish the connection with auth headers and frame limits.
    async fn connect(&self) -> Result<WsStream> {
        let mut request = self.kalshi.ws_url.as_str().into_client_request()?;

        let auth = self.signer.sign_ws();
        let headers = request.headers_mut();
        for (name, value) in auth.pairs() {
            headers.insert(
                name,
                HeaderValue::from_str(&value).map_err(|e| Error::InvalidHeaderValue(e.to_string()))?,
            );
        }

        let config = WebSocketConfig::default()
            .max_message_size(Some(MAX_FRAME_BYTES))
            .max_frame_size(Some(MAX_FRAME_BYTES));

        let (ws, response) = connect_async_with_config(request, Some(config), false).await?;
        debug!(status = %response.status(), "websocket_handshake_complete");
        Ok(ws)
    }

    /// One connected session. Returns when the connection is lost.
    async fn session(&mut self, ws: WsStream) -> Result<()> {
        let (mut sink, mut stream) = ws.split();

        self.resubscribe_all(&mut sink).await?;

        let ping_interval = Duration::from_secs(self.tuning.ws_ping_interval);
        let pong_timeout = Duration::from_secs(self.tuning.ws_pong_timeout);
        let mut ping_timer = tokio::time::interval_at(
            tokio::time::Instant::now() + ping_interval,
            ping_interval,
        );
        let mut stats_timer = tokio::time::interval_at(
            tokio::time::Instant::now() + STATS_INTERVAL,
            STATS_INTERVAL,
        );
        let mut last_pong = Instant::now();
        let mut ping_pending = false;

        loop {
            tokio::select! {
                command = self.cmd_rx.recv() => {
                    match command {
                        Some(command) => self.handle_command(&mut sink, command).await?,
                        None => return Ok(()),
                    }
                }

                message = stream.next() => {
                    match message {
                        Some(Ok(Message::Text(text))) => self.route_text(text.as_str()).await,
                        Some(Ok(Message::Ping(data))) => {
                            sink.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Pong(_))) => {
                            last_pong = Instant::now();
                            ping_pending = false;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            info!(?frame, "websocket_close_frame");
                            return Ok(());
                        }
                        Some(Ok(Message::Binary(data))) => {
                            warn!(bytes = data.len(), "unexpected_binary_message");
                        }
                        Some(Ok(Message::Frame(_))) => {}
                        Some(Err(e)) => return Err(e.into()),
                        None => return Ok(()),
                    }
                }

                _ = ping_timer.tick() => {
                    if ping_pending && last_pong.elapsed() > pong_timeout {
                        return Err(Error::WebSocket(Box::new(tungstenite::Error::Io(
                            std::io::Error::new(std::io::ErrorKind::TimedOut, "pong timeout"),
                        ))));
                    }
                    sink.send(Message::Ping(tungstenite::Bytes::from_static(b"health"))).await?;
                    ping_pending = true;
                }

                _ = stats_timer.tick() => {
                    self.log_stats();
                }
            }
        }
    }

    /// Re-send every recorded subscription from scratch (no resumption).
    async fn resubscribe_all(&mut self, sink: &mut WsSink) -> Result<()> {
        if self.subscriptions.is_empty() {
            return Ok(());
        }
        info!(count = self.subscriptions.len(), "resubscribing");
        let subs: Vec<SubscriptionInfo> = self.subscriptions.values().cloned().collect();
        for sub in subs {
            let request_id = self.next_request_id();
            let msg = build_subscribe(request_id, &sub.channels, sub.market_tickers.as_deref());
            sink.send(Message::Text(msg.into())).await?;
        }
        Ok(())
    }

    fn next_request_id(&mut self) -> u64 {
        let id = self.next_request_id;
        self.next_request_id += 1;
        id
    }

    async fn handle_command(&mut self, sink: &mut WsSink, command: IngestCommand) -> Result<()> {
        match command {
            IngestCommand::Subscribe {
                channels,
                market_tickers,
                reply,
            } => {
                let sid = self.next_sid;
                self.next_sid += 1;
                self.subscriptions.insert(
                    sid,
                    SubscriptionInfo {
                        channels: channels.clone(),
                        market_tickers: market_tickers.clone(),
                    },
                );

                let request_id = self.next_request_id();
                let msg = build_subscribe(request_id, &channels, market_tickers.as_deref());
                sink.send(Message::Text(msg.into())).await?;

                info!(
                    sid,
                    ?channels,
                    tickers = market_tickers.as_ref().map_or(0, |t| t.len()),
                    "subscription_added"
                );
                let _ = reply.send(sid);
            }

            IngestCommand::UpdateSubscription { sid, add, remove } => {
                if !self.subscriptions.contains_key(&sid) {
                    warn!(sid, "update_unknown_subscription");
                    return Ok(());
                }

                if !add.is_empty() {
                    if let Some(tickers) = self
                        .subscriptions
                        .get_mut(&sid)
                        .and_then(|s| s.market_tickers.as_mut())
                    {
                        tickers.extend(add.iter().cloned());
                    }
                    let request_id = self.next_request_id();
                    let msg = protocol::build_update_subscription(
                        request_id,
                        sid,
                        &add,
                        UpdateAction::AddMarkets,
                    );
                    sink.send(Message::Text(msg.into())).await?;
                }

                if !remove.is_empty() {
                    if let Some(tickers) = self
                        .subscriptions
                        .get_mut(&sid)
                        .and_then(|s| s.market_tickers.as_mut())
                    {
                        tickers.retain(|t| !remove.contains(t));
                    }
                    let request_id = self.next_request_id();
                    let msg = protocol::build_update_subscription(
                        request_id,
                        sid,
                        &remove,
                        UpdateAction::RemoveMarkets,
                    );
                    sink.send(Message::Text(msg.into())).await?;
                }
            }

            IngestCommand::Unsubscribe { sids } => {
                let request_id = self.next_request_id();
                let msg = build_unsubscribe(request_id, &sids);
                sink.send(Message::Text(msg.into())).await?;

                for sid in &sids {
                    self.subscriptions.remove(sid);
                    self.sequences.forget(*sid as i64);
                }
                info!(?sids, "unsubscribed");
            }
        }
        Ok(())
    }

    /// Parse one text frame and route it. Parse failures are logged and
    /// never interrupt the session.
    async fn route_text(&mut self, text: &str) {
        let parsed = match protocol::parse_incoming(text) {
            Ok(parsed) => parsed,
            Err(e) => {
                let snippet: String = text.chars().take(200).collect();
                error!(error = %e, snippet, "invalid_ws_json");
                return;
            }
        };

        match parsed {
            ServerMessage::Update {
                msg_type,
                sid,
                seq,
                msg,
            } => {
                if let (Some(sid), Some(seq)) = (sid, seq)
                    && let Some(gap) = self.sequences.observe(sid, seq)
                {
                    warn!(
                        sid = gap.sid,
                        expected = gap.expected,
                        received = gap.received,
                        "sequence_gap_detected"
                    );
                }

                *self.msg_counts.entry(msg_type.clone()).or_insert(0) += 1;
                self.route_update(&msg_type, msg).await;
            }
            ServerMessage::CommandResponse { id, msg } => {
                debug!(id, ?msg, "ws_command_response");
            }
            ServerMessage::Error { id, code, message } => {
                error!(?id, code, message, "ws_server_error");
            }
        }
    }

    async fn route_update(&mut self, msg_type: &str, msg: serde_json::Value) {
        match msg_type {
            "trade" => {
                let trade: KalshiTrade = match parse_payload(msg_type, msg) {
                    Some(v) => v,
                    None => return,
                };
                if let Err(e) = trade.validate() {
                    warn!(error = %e, "trade_validation_failed");
                    return;
                }
                if let Err(e) = self.publisher.publish(topics::TRADES, &trade).await {
                    error!(error = %e, "trade_publish_failed");
                }
            }

            "ticker" | "ticker_v2" => {
                let ticker: KalshiTickerV2 = match parse_payload(msg_type, msg) {
                    Some(v) => v,
                    None => return,
                };
                if let Err(e) = ticker.validate() {
                    warn!(error = %e, "ticker_validation_failed");
                    return;
                }
                if let Err(e) = self.publisher.publish(topics::TICKER_V2, &ticker).await {
                    error!(error = %e, "ticker_publish_failed");
                }
            }

            "orderbook_snapshot" => {
                let snapshot: OrderbookSnapshot = match parse_payload(msg_type, msg) {
                    Some(v) => v,
                    None => return,
                };
                if let Err(e) = self.state.apply_snapshot(&snapshot).await {
                    error!(error = %e, "snapshot_state_failed");
                }
                if let Err(e) = self
                    .publisher
                    .publish(topics::ORDERBOOK_SNAPSHOTS, &snapshot)
                    .await
                {
                    error!(error = %e, "snapshot_publish_failed");
                }
            }

            "orderbook_delta" => {
                let delta: OrderbookDelta = match parse_payload(msg_type, msg) {
                    Some(v) => v,
                    None => return,
                };
                if let Err(e) = self.state.apply_delta(&delta).await {
                    error!(error = %e, "delta_state_failed");
                }
                if let Err(e) = self.publisher.publish(topics::ORDERBOOK_DELTAS, &delta).await {
                    error!(error = %e, "delta_publish_failed");
                }
            }

            "market_lifecycle_v2" => {
                let event: MarketLifecycleEvent = match parse_payload(msg_type, msg) {
                    Some(v) => v,
                    None => return,
                };
                if let Err(e) = self.publisher.publish(topics::LIFECYCLE, &event).await {
                    error!(error = %e, "lifecycle_publish_failed");
                }
            }

            "event_lifecycle" => {
                let event: EventLifecycleEvent = match parse_payload(msg_type, msg) {
                    Some(v) => v,
                    None => return,
                };
                if let Err(e) = self.publisher.publish(topics::EVENT_LIFECYCLE, &event).await {
                    error!(error = %e, "event_lifecycle_publish_failed");
                }
            }

            "subscribed" | "unsubscribed" | "ok" => {
                debug!(msg_type, "ws_ack");
            }

            "error" => {
                error!(?msg, "ws_channel_error");
            }

            other => {
                debug!(msg_type = other, "unknown_message_type");
            }
        }
    }

    fn log_stats(&mut self) {
        let uptime = self
            .connect_time
            .map(|t| t.elapsed().as_secs())
            .unwrap_or(0);
        let total: u64 = self.msg_counts.values().sum();
        let published = self.publisher.take_counts();

        info!(
            uptime_seconds = uptime,
            total_messages = total,
            by_type = ?self.msg_counts,
            published = ?published,
            subscriptions = self.subscriptions.len(),
            "ws_stats"
        );
        self.msg_counts.clear();
    }
}

fn parse_payload<T: serde::de::DeserializeOwned>(
    msg_type: &str,
    msg: serde_json::Value,
) -> Option<T> {
    match serde_json::from_value(msg) {
        Ok(v) => Some(v),
        Err(e) => {
            error!(msg_type, error = %e, "message_parse_error");
            None
        }
    }
}
