//! Ingestion scheduling loop.
//!
//! Two long-running workers cooperate over a shared [`DumpStore`]: the
//! order worker redownloads the full order book every ten minutes and
//! resolves any locations it has not seen yet, the history worker
//! bootstraps itself with a full history snapshot and then appends one
//! incremental day after every upstream refresh. A one-slot channel
//! carries the single "orders are ready" signal that releases the
//! history worker from its initial wait.

use crate::client::sleep_with_token;
use crate::history::{
    download_full_history_dump, download_incremental_history_dump, HistoryDay, HistoryMarket,
    HistorySnapshot,
};
use crate::location::{download_location_dump, Location};
use crate::order::{download_order_dump, Order};
use crate::prelude::*;
use chrono::{DateTime, Days, TimeDelta, Utc};
use log::{error, info};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

const ORDER_PERIOD: TimeDelta = TimeDelta::minutes(10);
const HISTORY_PERIOD: TimeDelta = TimeDelta::hours(24);

/// The order dump published by the last order worker cycle.
#[derive(Debug, Default)]
pub struct OrderDump {
    /// Unix seconds of the publication.
    pub date: i64,
    pub data: Vec<Order>,
}

/// One published day of history data.
#[derive(Debug)]
pub struct HistoryDump {
    /// Unix seconds of the UTC midnight the data covers.
    pub date: i64,
    pub data: Vec<HistoryDay>,
}

/// Every location resolved so far.
#[derive(Debug, Default)]
pub struct LocationDump {
    /// Unix seconds of the last extension.
    pub date: i64,
    pub data: Vec<Location>,
}

/// The slots workers publish into and the HTTP front-end reads from.
///
/// Writers hold a lock only long enough to swap or extend a slot;
/// readers hold the read side for the duration of their scan or
/// encode. Readers observe either the pre-swap or post-swap value,
/// never a torn one.
#[derive(Debug, Default)]
pub struct DumpStore {
    pub orders: RwLock<OrderDump>,
    pub histories: RwLock<Vec<HistoryDump>>,
    pub locations: RwLock<LocationDump>,
}

impl DumpStore {
    pub fn new() -> Self {
        Default::default()
    }
}

/// Download orders every ten minutes and resolve fresh location ids.
///
/// Per-cycle errors are logged and the loop carries on; only
/// cancellation ends it. The first successful publication try-sends
/// `orders_ready` to release the history worker.
pub async fn order_worker(
    esi: Esi,
    reference: Arc<ReferenceData>,
    store: Arc<DumpStore>,
    ct: CancellationToken,
    orders_ready: mpsc::Sender<()>,
) {
    let mut forbidden_locations: Vec<u64> = Vec::new();
    let mut expiration = Utc::now();

    loop {
        if ct.is_cancelled() {
            return;
        }

        let now = Utc::now();
        let time_to_wait = expiration - now;
        if time_to_wait > TimeDelta::zero() {
            info!("Order Worker: up to date");
            if sleep_with_token(&ct, time_to_wait.to_std().expect("positive wait"))
                .await
                .is_err()
            {
                return;
            }
            continue;
        }

        info!("Order Worker: orders download start");
        let orders = match download_order_dump(&esi, &ct).await {
            Ok(orders) => orders,
            Err(DumpError::Cancelled) => return,
            Err(e) => {
                error!("Order Worker: order download failed: {e}");
                continue;
            }
        };
        expiration += ORDER_PERIOD;
        info!("Order Worker: orders download end, {} orders", orders.len());

        let unknown = {
            let locations = store.locations.read().await;
            unknown_locations(&orders, &locations.data, &forbidden_locations)
        };

        // Publish before signalling so the history worker's first read
        // cannot observe an empty slot.
        {
            let mut slot = store.orders.write().await;
            *slot = OrderDump {
                date: now.timestamp(),
                data: orders,
            };
        }
        let _ = orders_ready.try_send(());

        if !unknown.is_empty() {
            info!("Order Worker: location download start, {} ids", unknown.len());
            match download_location_dump(&esi, &ct, &unknown, &reference).await {
                Ok(dump) => {
                    info!("Order Worker: location download end");
                    forbidden_locations.extend(dump.forbidden);
                    let mut slot = store.locations.write().await;
                    slot.date = now.timestamp();
                    slot.data.extend(dump.locations);
                }
                Err(e) => {
                    forbidden_locations.extend(e.forbidden.iter().copied());
                    if matches!(e.source, DumpError::Cancelled) {
                        return;
                    }
                    error!("Order Worker: location download failed: {e}");
                    continue;
                }
            }
        }
    }
}

/// Collect history data: one full snapshot once orders exist, then one
/// incremental day per upstream refresh.
///
/// `window` bounds how many trailing days of the full snapshot are
/// published into the store.
pub async fn history_worker(
    esi: Esi,
    store: Arc<DumpStore>,
    ct: CancellationToken,
    mut orders_ready: mpsc::Receiver<()>,
    window: usize,
) {
    tokio::select! {
        _ = ct.cancelled() => return,
        _ = orders_ready.recv() => {}
    }

    let markets = {
        let orders = store.orders.read().await;
        active_markets(&orders.data)
    };

    info!("History Worker: full download start, {} markets", markets.len());
    let full_download_start = Utc::now();
    let snapshot = match download_full_history_dump(&esi, &ct, &markets).await {
        Ok(snapshot) => snapshot,
        Err(e) => {
            error!("History Worker: full history download failed: {e}");
            return;
        }
    };

    info!("History Worker: full download processing");
    let publish_result = publish_snapshot(&snapshot, &store, &ct, window).await;
    if let Err(e) = snapshot.close().await {
        error!("History Worker: closing snapshot: {e}");
    }
    if let Err(e) = publish_result {
        error!("History Worker: reading snapshot back: {e}");
        return;
    }
    info!("History Worker: full download end");

    // Every market is assumed up to date upstream at 11:15, see
    // https://developers.eveonline.com/api-explorer#/operations/GetMarketsRegionIdHistory
    let mut expiration = next_eleven_fifteen(full_download_start);

    loop {
        if ct.is_cancelled() {
            return;
        }

        let now = Utc::now();
        let time_to_wait = expiration - now;
        if time_to_wait > TimeDelta::zero() {
            info!("History Worker: up to date");
            if sleep_with_token(&ct, time_to_wait.to_std().expect("positive wait"))
                .await
                .is_err()
            {
                return;
            }
            continue;
        }

        info!("History Worker: incremental download start");
        let date = yesterday_midnight(now);
        let markets = {
            let orders = store.orders.read().await;
            active_markets(&orders.data)
        };
        let days = match download_incremental_history_dump(&esi, &ct, &markets, date).await {
            Ok(days) => days,
            Err(DumpError::Cancelled) => return,
            Err(e) => {
                error!("History Worker: incremental download failed: {e}");
                continue;
            }
        };
        info!("History Worker: incremental download end, {} markets", days.len());

        {
            let mut histories = store.histories.write().await;
            histories.push(HistoryDump {
                date: date as i64,
                data: days,
            });
        }

        expiration += HISTORY_PERIOD;
    }
}

/// Publish the trailing `window` dates of a snapshot into the store.
async fn publish_snapshot(
    snapshot: &HistorySnapshot,
    store: &DumpStore,
    ct: &CancellationToken,
    window: usize,
) -> DumpResult<()> {
    let start = snapshot.dates.len().saturating_sub(window);
    for &date in &snapshot.dates[start..] {
        let days = snapshot.get_history_data_for_day(ct, date).await?;
        let mut histories = store.histories.write().await;
        histories.push(HistoryDump {
            date: date as i64,
            data: days,
        });
    }
    Ok(())
}

/// Project orders onto the distinct markets they live in, first-seen
/// order preserved.
pub(crate) fn active_markets(orders: &[Order]) -> Vec<HistoryMarket> {
    let mut seen: HashSet<HistoryMarket> = HashSet::with_capacity(orders.len());
    let mut markets = Vec::new();
    for order in orders {
        let market = HistoryMarket {
            region_id: order.region_id,
            type_id: order.type_id,
        };
        if seen.insert(market) {
            markets.push(market);
        }
    }
    markets
}

/// Location ids of orders that are neither known nor forbidden,
/// deduplicated, first-seen order preserved.
pub(crate) fn unknown_locations(
    orders: &[Order],
    known: &[Location],
    forbidden: &[u64],
) -> Vec<u64> {
    let mut skip: HashSet<u64> = known.iter().map(|l| l.id).collect();
    skip.extend(forbidden.iter().copied());
    let mut unknown = Vec::new();
    for order in orders {
        if skip.insert(order.location_id) {
            unknown.push(order.location_id);
        }
    }
    unknown
}

/// The next 11:15 UTC at or after `now`'s day: today's when `now` is
/// before it, tomorrow's otherwise.
pub(crate) fn next_eleven_fifteen(now: DateTime<Utc>) -> DateTime<Utc> {
    let today = now
        .date_naive()
        .and_hms_opt(11, 15, 0)
        .expect("valid wall clock time")
        .and_utc();
    if now < today {
        today
    } else {
        today + TimeDelta::days(1)
    }
}

/// Unix seconds of yesterday's UTC midnight.
pub(crate) fn yesterday_midnight(now: DateTime<Utc>) -> u64 {
    (now.date_naive() - Days::new(1))
        .and_hms_opt(0, 0, 0)
        .expect("valid wall clock time")
        .and_utc()
        .timestamp() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn order(region_id: u64, type_id: u64, location_id: u64) -> Order {
        Order {
            is_buy_order: false,
            range: 0,
            duration: 90,
            issued: 0,
            min_volume: 1,
            volume_remain: 1,
            volume_total: 1,
            location_id,
            system_id: 30000142,
            type_id,
            region_id,
            order_id: 1,
            price: 1.0,
        }
    }

    fn location(id: u64) -> Location {
        Location {
            id,
            type_id: 1531,
            owner_id: 1000002,
            system_id: 30000142,
            security: 0.9,
            name: "somewhere".to_owned(),
        }
    }

    #[test]
    fn test_active_markets_dedupes_in_order() {
        let orders = [
            order(10, 20, 1),
            order(10, 30, 1),
            order(10, 20, 2),
            order(11, 20, 3),
        ];
        let markets = active_markets(&orders);
        assert_eq!(
            markets,
            vec![
                HistoryMarket { region_id: 10, type_id: 20 },
                HistoryMarket { region_id: 10, type_id: 30 },
                HistoryMarket { region_id: 11, type_id: 20 },
            ]
        );
    }

    #[test]
    fn test_unknown_locations_filters_known_and_forbidden() {
        let orders = [
            order(10, 20, 60000004),
            order(10, 20, 1030000000001),
            order(10, 20, 1030000000002),
            order(10, 20, 1030000000001),
            order(10, 20, 60000008),
        ];
        let known = [location(60000004)];
        let forbidden = [1030000000002];

        let unknown = unknown_locations(&orders, &known, &forbidden);
        assert_eq!(unknown, vec![1030000000001, 60000008]);
    }

    #[test]
    fn test_next_eleven_fifteen() {
        let before = Utc.with_ymd_and_hms(2024, 5, 13, 9, 0, 0).unwrap();
        assert_eq!(
            next_eleven_fifteen(before),
            Utc.with_ymd_and_hms(2024, 5, 13, 11, 15, 0).unwrap()
        );

        let after = Utc.with_ymd_and_hms(2024, 5, 13, 11, 15, 0).unwrap();
        assert_eq!(
            next_eleven_fifteen(after),
            Utc.with_ymd_and_hms(2024, 5, 14, 11, 15, 0).unwrap()
        );
    }

    #[test]
    fn test_yesterday_midnight() {
        let now = Utc.with_ymd_and_hms(2024, 5, 13, 9, 6, 31).unwrap();
        assert_eq!(
            yesterday_midnight(now),
            Utc.with_ymd_and_hms(2024, 5, 12, 0, 0, 0).unwrap().timestamp() as u64
        );
    }
}
