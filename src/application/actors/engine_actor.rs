//! Engine Actor
//!
//! Owns the event-consumption loop over the Execution Engine. Liquidation
//! events arrive fire-and-forget from the feed; stats queries come with a
//! reply channel, so the read surface never touches engine internals
//! directly.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{error, info};

use crate::domain::entities::liquidation::LiquidationEvent;
use crate::domain::services::execution::ExecutionEngine;
use crate::domain::services::ledger::PositionLedger;
use crate::domain::services::stats::{StatsSnapshot, TradingStats};

const ENGINE_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug)]
pub enum EngineMessage {
    /// A parsed liquidation event from the feed.
    Liquidation(LiquidationEvent),
    /// Read-only aggregate statistics.
    GetStats { reply: mpsc::Sender<StatsSnapshot> },
    Shutdown,
}

pub struct EngineActor {
    engine: Arc<ExecutionEngine>,
    ledger: Arc<PositionLedger>,
    stats: Arc<TradingStats>,
}

impl EngineActor {
    pub fn spawn(
        engine: Arc<ExecutionEngine>,
        ledger: Arc<PositionLedger>,
        stats: Arc<TradingStats>,
    ) -> mpsc::Sender<EngineMessage> {
        let (tx, rx) = mpsc::channel(ENGINE_CHANNEL_CAPACITY);
        let actor = EngineActor { engine, ledger, stats };

        tokio::spawn(async move {
            actor.run(rx).await;
        });

        info!("EngineActor spawned");
        tx
    }

    async fn run(self, mut rx: mpsc::Receiver<EngineMessage>) {
        info!("EngineActor started");

        while let Some(msg) = rx.recv().await {
            match msg {
                EngineMessage::Liquidation(event) => {
                    // Outcomes are logged and counted inside the engine.
                    let _ = self.engine.on_liquidation(&event).await;
                }

                EngineMessage::GetStats { reply } => {
                    let snapshot = self.stats.snapshot(&self.ledger);
                    if let Err(e) = reply.send(snapshot).await {
                        error!("failed to send GetStats reply: {:?}", e);
                    }
                }

                EngineMessage::Shutdown => {
                    info!("EngineActor received shutdown signal");
                    break;
                }
            }
        }

        info!("EngineActor stopped");
    }
}
