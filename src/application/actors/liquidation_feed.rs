//! Liquidation Feed
//!
//! WebSocket subscription to the venue's public liquidation stream. Messages
//! are parsed into [`LiquidationEvent`]s, stamped with the qualification
//! threshold, and forwarded to the engine actor. The connection loop
//! reconnects forever with capped exponential backoff and jitter; a malformed
//! message is logged and dropped, never fatal.

use std::time::Duration;

use chrono::{TimeZone, Utc};
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, info, warn};
use url::Url;

use crate::application::actors::engine_actor::EngineMessage;
use crate::config::FeedConfig;
use crate::domain::entities::liquidation::{LiquidationEvent, PositionSide};

const PING_INTERVAL: Duration = Duration::from_secs(20);

#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    #[error("invalid feed url: {0}")]
    Url(#[from] url::ParseError),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("engine channel closed")]
    EngineGone,
}

#[derive(Debug, Deserialize)]
struct WsEnvelope {
    #[serde(default)]
    topic: String,
    #[serde(default)]
    data: Vec<WsLiquidation>,
}

#[derive(Debug, Deserialize)]
struct WsLiquidation {
    #[serde(rename = "T", default)]
    time_ms: i64,
    #[serde(rename = "s", default)]
    symbol: String,
    #[serde(rename = "S", default)]
    side: String,
    #[serde(rename = "v", default)]
    quantity: String,
    #[serde(rename = "p", default)]
    price: String,
}

pub struct LiquidationFeed {
    config: FeedConfig,
    qualify_threshold_usd: f64,
    engine_tx: mpsc::Sender<EngineMessage>,
}

impl LiquidationFeed {
    pub fn spawn(
        config: FeedConfig,
        qualify_threshold_usd: f64,
        engine_tx: mpsc::Sender<EngineMessage>,
    ) -> tokio::task::JoinHandle<()> {
        let feed = LiquidationFeed { config, qualify_threshold_usd, engine_tx };
        tokio::spawn(async move {
            feed.run().await;
        })
    }

    async fn run(self) {
        let mut backoff = Duration::from_secs(1);
        let max_backoff = Duration::from_secs(self.config.reconnect_max_secs.max(1));

        loop {
            info!(url = %self.config.ws_url, "connecting liquidation feed");
            match self.connect_and_stream().await {
                Ok(()) => {
                    warn!("liquidation feed disconnected; reconnecting");
                    backoff = Duration::from_secs(1);
                }
                Err(FeedError::EngineGone) => {
                    info!("engine channel closed; feed stopping");
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "liquidation feed error");
                }
            }

            let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..1000));
            sleep(backoff + jitter).await;
            backoff = std::cmp::min(backoff * 2, max_backoff);
        }
    }

    async fn connect_and_stream(&self) -> Result<(), FeedError> {
        let url = Url::parse(&self.config.ws_url)?;
        let (stream, _) = connect_async(url.as_str()).await?;
        let (mut write, mut read) = stream.split();

        let topics: Vec<String> = self
            .config
            .symbols
            .iter()
            .map(|symbol| format!("allLiquidation.{symbol}"))
            .collect();
        let subscribe = json!({ "op": "subscribe", "args": topics });
        write.send(Message::Text(subscribe.to_string())).await?;
        info!(symbols = self.config.symbols.len(), "liquidation topics subscribed");

        let mut ping_timer = interval(PING_INTERVAL);
        ping_timer.tick().await; // first tick fires immediately

        loop {
            tokio::select! {
                _ = ping_timer.tick() => {
                    write.send(Message::Text(json!({"op": "ping"}).to_string())).await?;
                }
                frame = read.next() => {
                    let message = match frame {
                        Some(Ok(message)) => message,
                        Some(Err(e)) => return Err(e.into()),
                        None => return Ok(()),
                    };
                    match message {
                        Message::Text(text) => self.handle_text(&text).await?,
                        Message::Ping(payload) => write.send(Message::Pong(payload)).await?,
                        Message::Close(_) => return Ok(()),
                        _ => {}
                    }
                }
            }
        }
    }

    async fn handle_text(&self, text: &str) -> Result<(), FeedError> {
        let envelope: WsEnvelope = match serde_json::from_str(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!(error = %e, "unparseable feed message dropped");
                return Ok(());
            }
        };
        if !envelope.topic.starts_with("allLiquidation.") {
            return Ok(());
        }

        for raw in &envelope.data {
            let event = match self.parse_event(raw) {
                Some(event) => event,
                None => {
                    debug!(symbol = %raw.symbol, "malformed liquidation entry dropped");
                    continue;
                }
            };
            self.engine_tx
                .send(EngineMessage::Liquidation(event))
                .await
                .map_err(|_| FeedError::EngineGone)?;
        }
        Ok(())
    }

    fn parse_event(&self, raw: &WsLiquidation) -> Option<LiquidationEvent> {
        let price = raw.price.parse::<f64>().ok().filter(|p| *p > 0.0)?;
        let quantity = raw.quantity.parse::<f64>().ok().filter(|q| *q > 0.0)?;
        // The stream reports the forced order's side: a Buy order flattens a
        // liquidated short, a Sell order a liquidated long.
        let position_side = match raw.side.as_str() {
            "Buy" => PositionSide::Short,
            "Sell" => PositionSide::Long,
            _ => return None,
        };
        let timestamp = Utc
            .timestamp_millis_opt(raw.time_ms)
            .single()
            .unwrap_or_else(Utc::now);

        Some(LiquidationEvent::new(
            raw.symbol.clone(),
            position_side,
            price,
            quantity,
            self.qualify_threshold_usd,
            timestamp,
        ))
    }
}
