//! History snapshot engine against a fake ESI.

mod common;

use std::collections::HashMap;

use axum::extract::{Path, Query};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use eve_market_dump::prelude::*;
use eve_market_dump::{
    download_full_history_dump, download_incremental_history_dump, HistoryMarket,
};
use tokio_util::sync::CancellationToken;

const DAY_1: u64 = 1704067200; // 2024-01-01 UTC
const DAY_2: u64 = 1704153600; // 2024-01-02 UTC

fn esi_for(base: &str) -> Esi {
    EsiBuilder::new()
        .user_agent("eve-market-dump tests")
        .base_api_url(base)
        .build()
        .unwrap()
}

fn day_json(date: &str, average: f64) -> String {
    format!(
        r#"{{"average":{average},"date":"{date}","highest":6.0,"lowest":4.96,"order_count":2931,"volume":41268337918}}"#
    )
}

async fn history_endpoint(
    Path(region): Path<u64>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let type_id = params
        .get("type_id")
        .and_then(|t| t.parse::<u64>().ok())
        .unwrap_or(0);
    match (region, type_id) {
        (10, 20) => format!(
            "[{},{}]",
            day_json("2024-01-01", 5.0),
            day_json("2024-01-02", 5.5)
        )
        .into_response(),
        (10, 30) => format!("[{}]", day_json("2024-01-02", 7.25)).into_response(),
        _ => (StatusCode::NOT_FOUND, r#"{"error":"Type not found!"}"#).into_response(),
    }
}

fn markets() -> Vec<HistoryMarket> {
    vec![
        HistoryMarket {
            region_id: 10,
            type_id: 20,
        },
        HistoryMarket {
            region_id: 10,
            type_id: 30,
        },
        // answers 404 and must be skipped
        HistoryMarket {
            region_id: 10,
            type_id: 40,
        },
    ]
}

#[tokio::test]
async fn test_full_dump_dates_and_daily_queries() {
    let router = Router::new().route("/markets/:region/history", get(history_endpoint));
    let base = common::spawn_server(router).await;
    let esi = esi_for(&base);
    let ct = CancellationToken::new();

    let snapshot = download_full_history_dump(&esi, &ct, &markets())
        .await
        .unwrap();

    assert_eq!(snapshot.dates, vec![DAY_1, DAY_2]);

    let day_two = snapshot.get_history_data_for_day(&ct, DAY_2).await.unwrap();
    assert_eq!(day_two.len(), 2);
    assert!(day_two
        .iter()
        .any(|d| d.type_id == 20 && (d.average - 5.5).abs() < f64::EPSILON));
    assert!(day_two
        .iter()
        .any(|d| d.type_id == 30 && (d.average - 7.25).abs() < f64::EPSILON));
    assert!(day_two.iter().all(|d| d.region_id == 10));

    let day_one = snapshot.get_history_data_for_day(&ct, DAY_1).await.unwrap();
    assert_eq!(day_one.len(), 1);
    assert_eq!(day_one[0].type_id, 20);

    let no_day = snapshot
        .get_history_data_for_day(&ct, DAY_2 + 86_400)
        .await
        .unwrap();
    assert!(no_day.is_empty());

    snapshot.close().await.unwrap();
}

#[tokio::test]
async fn test_snapshot_close_removes_file_and_is_idempotent() {
    let router = Router::new().route("/markets/:region/history", get(history_endpoint));
    let base = common::spawn_server(router).await;
    let esi = esi_for(&base);
    let ct = CancellationToken::new();

    let snapshot = download_full_history_dump(&esi, &ct, &markets())
        .await
        .unwrap();

    let path = snapshot.file_path().await.unwrap();
    assert!(path.exists());
    assert!(path
        .file_name()
        .unwrap()
        .to_string_lossy()
        .starts_with("evemarketdump_history_"));

    snapshot.close().await.unwrap();
    assert!(!path.exists());
    assert!(snapshot.file_path().await.is_none());

    // second close is a no-op
    snapshot.close().await.unwrap();

    let err = snapshot
        .get_history_data_for_day(&ct, DAY_1)
        .await
        .unwrap_err();
    assert!(matches!(err, DumpError::SnapshotClosed));
}

#[tokio::test]
async fn test_full_dump_cancelled_before_start() {
    let router = Router::new().route("/markets/:region/history", get(history_endpoint));
    let base = common::spawn_server(router).await;
    let esi = esi_for(&base);
    let ct = CancellationToken::new();
    ct.cancel();

    let err = download_full_history_dump(&esi, &ct, &markets())
        .await
        .unwrap_err();
    assert!(matches!(err, DumpError::Cancelled));
}

#[tokio::test]
async fn test_incremental_dump_keeps_only_the_requested_day() {
    let router = Router::new().route("/markets/:region/history", get(history_endpoint));
    let base = common::spawn_server(router).await;
    let esi = esi_for(&base);
    let ct = CancellationToken::new();

    let days = download_incremental_history_dump(&esi, &ct, &markets(), DAY_2)
        .await
        .unwrap();

    assert_eq!(days.len(), 2);
    assert!(days.iter().all(|d| d.region_id == 10));

    let days = download_incremental_history_dump(&esi, &ct, &markets(), DAY_1)
        .await
        .unwrap();
    assert_eq!(days.len(), 1);
    assert_eq!(days[0].type_id, 20);
}
