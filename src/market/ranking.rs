use crate::market::events::{EventBus, EventKind, ListenerGuard};
use crate::market::now_unix_ms;
use crate::market::snapshot::{ApplyOutcome, SnapshotBook};
use crate::market::trending::{RankedMarket, TrendingEngine};
use crate::market::types::{
    MarketData, MessageType, OutcomeSelector, SubscriptionKey, UpdateSelector,
};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const BOOK_FRAME_TYPES: [MessageType; 3] = [
    MessageType::MarketData,
    MessageType::MarketUpdate,
    MessageType::TradeEvent,
];

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrendingSnapshot {
    pub generated_at_ms: i64,
    pub market_count: usize,
    pub ranked: Vec<RankedMarket>,
    pub pumping: Vec<MarketData>,
}

/// Routes market frames from the bus into `book` until the guards drop.
/// A confirmed unsubscription covering every outcome and update type evicts
/// the market.
pub fn attach_snapshot_book(
    bus: &Arc<EventBus>,
    book: Arc<Mutex<SnapshotBook>>,
) -> Vec<ListenerGuard> {
    let eviction_book = Arc::clone(&book);
    let eviction_guard = bus.scoped(
        EventKind::Frame(MessageType::UnsubscriptionConfirmed),
        move |event| {
            let Some(key) = event.as_frame().and_then(SubscriptionKey::from_confirmation) else {
                return;
            };
            if key.outcome != OutcomeSelector::All || key.update_type != UpdateSelector::All {
                return;
            }
            if eviction_book.lock().remove(&key.market_id).is_some() {
                debug!(market_id = %key.market_id, "evicted unsubscribed market");
            }
        },
    );

    BOOK_FRAME_TYPES
        .iter()
        .map(|message_type| {
            let book = Arc::clone(&book);
            bus.scoped(EventKind::Frame(*message_type), move |event| {
                let Some(frame) = event.as_frame() else {
                    return;
                };
                let outcome = book.lock().apply_frame(frame);
                match outcome {
                    Ok(ApplyOutcome::Stale) => {
                        debug!(market_id = ?frame.market_id, "skipping stale market frame");
                    }
                    Ok(_) => {}
                    Err(error) => {
                        warn!(market_id = ?frame.market_id, %error, "dropping market frame");
                    }
                }
            })
        })
        .chain(std::iter::once(eviction_guard))
        .collect()
}

pub fn build_snapshot(
    engine: &TrendingEngine,
    book: &Mutex<SnapshotBook>,
    pump_threshold: f64,
) -> TrendingSnapshot {
    let markets = book.lock().markets();
    TrendingSnapshot {
        generated_at_ms: now_unix_ms(),
        market_count: markets.len(),
        ranked: engine.rank_markets(&markets),
        pumping: engine.get_pumping_markets_ranked(&markets, pump_threshold),
    }
}

pub struct RankingJobHandle {
    pub cancellation_token: CancellationToken,
    pub join_handle: JoinHandle<()>,
    snapshots: watch::Receiver<TrendingSnapshot>,
}

impl RankingJobHandle {
    pub fn snapshots(&self) -> watch::Receiver<TrendingSnapshot> {
        self.snapshots.clone()
    }

    pub fn latest(&self) -> TrendingSnapshot {
        self.snapshots.borrow().clone()
    }

    pub async fn stop(self) {
        self.cancellation_token.cancel();
        if let Err(error) = self.join_handle.await {
            warn!(%error, "ranking job ended abnormally");
        }
    }
}

/// Attaches the book to the bus, then ranks it every `interval` until
/// cancelled. The first snapshot is published immediately.
pub fn spawn_ranking_job(
    bus: &Arc<EventBus>,
    engine: Arc<TrendingEngine>,
    book: Arc<Mutex<SnapshotBook>>,
    interval: Duration,
    pump_threshold: f64,
) -> RankingJobHandle {
    let guards = attach_snapshot_book(bus, Arc::clone(&book));
    let (publisher, snapshots) = watch::channel(TrendingSnapshot::default());
    let cancellation_token = CancellationToken::new();
    let task_token = cancellation_token.clone();

    let join_handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(interval_ms = interval.as_millis() as u64, "ranking job started");

        loop {
            tokio::select! {
                _ = task_token.cancelled() => break,
                _ = ticker.tick() => {
                    let snapshot = build_snapshot(&engine, &book, pump_threshold);
                    debug!(
                        markets = snapshot.market_count,
                        pumping = snapshot.pumping.len(),
                        "published trending snapshot"
                    );
                    publisher.send_replace(snapshot);
                }
            }
        }

        drop(guards);
        info!("ranking job stopped");
    });

    RankingJobHandle {
        cancellation_token,
        join_handle,
        snapshots,
    }
}
