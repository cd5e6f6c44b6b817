//! Reference web server: runs the ingestion workers and serves the
//! dumps over HTTP.
//!
//! Requires the `SSO_CLIENT_ID`, `SSO_CLIENT_SECRET` and
//! `SSO_REFRESH_TOKEN` environment variables for structure lookups.
//! Set `RUST_LOG=info` to watch the workers do their thing.

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use chrono::{TimeZone, Utc};
use eve_market_dump::prelude::*;
use eve_market_dump::scheduler::{self, DumpStore};
use log::{error, info};
use serde::Serialize;
use std::env;
use std::fmt::Write as _;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

const USER_AGENT: &str =
    "eve-market-dump reference server - contact the maintainer via the repository";
const LISTEN_ADDR: &str = "0.0.0.0:8080";

/// How many trailing days of the full snapshot are published.
const HISTORY_WINDOW: usize = 10;

#[derive(Clone)]
struct AppState {
    store: Arc<DumpStore>,
}

#[tokio::main]
async fn main() {
    pretty_env_logger::init();

    let client_id = env::var("SSO_CLIENT_ID").unwrap_or_default();
    let client_secret = env::var("SSO_CLIENT_SECRET").unwrap_or_default();
    let refresh_token = env::var("SSO_REFRESH_TOKEN").unwrap_or_default();
    if client_id.is_empty() || client_secret.is_empty() || refresh_token.is_empty() {
        eprintln!(
            "Environment variables SSO_CLIENT_ID, SSO_CLIENT_SECRET and SSO_REFRESH_TOKEN must be set"
        );
        std::process::exit(1);
    }

    let esi = match EsiBuilder::new()
        .user_agent(USER_AGENT)
        .client_id(&client_id)
        .client_secret(&client_secret)
        .refresh_token(&refresh_token)
        .build()
    {
        Ok(esi) => esi,
        Err(e) => {
            eprintln!("Can't build the ESI client: {e}");
            std::process::exit(1);
        }
    };
    let reference = match ReferenceData::embedded() {
        Ok(reference) => Arc::new(reference),
        Err(e) => {
            eprintln!("Can't parse the embedded reference data: {e}");
            std::process::exit(1);
        }
    };

    let store = Arc::new(DumpStore::new());
    let ct = CancellationToken::new();
    let (orders_ready_tx, orders_ready_rx) = mpsc::channel(1);

    // A worker going down, normally or not, takes the process with it.
    let order_handle = tokio::spawn({
        let esi = esi.clone();
        let reference = reference.clone();
        let store = store.clone();
        let ct = ct.clone();
        async move {
            scheduler::order_worker(esi, reference, store, ct.clone(), orders_ready_tx).await;
            info!("Order Worker: stopped");
            ct.cancel();
        }
    });
    let history_handle = tokio::spawn({
        let esi = esi.clone();
        let store = store.clone();
        let ct = ct.clone();
        async move {
            scheduler::history_worker(esi, store, ct.clone(), orders_ready_rx, HISTORY_WINDOW)
                .await;
            info!("History Worker: stopped");
            ct.cancel();
        }
    });

    let app = Router::new()
        .route("/", get(handle_index))
        .route("/location", get(handle_location))
        .route("/order", get(handle_order))
        .route("/history/:date", get(handle_history))
        .layer(CorsLayer::permissive())
        .with_state(AppState {
            store: store.clone(),
        });

    let listener = match tokio::net::TcpListener::bind(LISTEN_ADDR).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Http Server Worker: bind {LISTEN_ADDR}: {e}");
            ct.cancel();
            let _ = order_handle.await;
            let _ = history_handle.await;
            std::process::exit(1);
        }
    };
    info!("Http Server Worker: listening on http://{LISTEN_ADDR}");

    let shutdown = {
        let ct = ct.clone();
        async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Web server stopping...");
                    ct.cancel();
                }
                _ = ct.cancelled() => {}
            }
        }
    };
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
    {
        error!("Http Server Worker: {e}");
    }

    ct.cancel();
    let _ = order_handle.await;
    let _ = history_handle.await;
    info!("Web server stopped gracefully");
}

async fn handle_index(State(state): State<AppState>) -> Html<String> {
    let locations = state.store.locations.read().await;
    let histories = state.store.histories.read().await;
    let orders = state.store.orders.read().await;

    let mut page = String::from("<h1>Eve Market Dump</h1>\n");
    page.push_str("<h2>Locations</h2><hr>\n");
    let _ = writeln!(
        page,
        "<a href=\"/location\">{} location dump</a><br>",
        format_epoch(locations.date)
    );
    page.push_str("<h2>Orders</h2><hr>\n");
    let _ = writeln!(
        page,
        "<a href=\"/order\">{} order dump</a><br>",
        format_epoch(orders.date)
    );
    page.push_str("<h2>Histories</h2><hr>\n");
    for dump in histories.iter() {
        let _ = writeln!(
            page,
            "<a href=\"/history/{}\">{} history dump</a><br>",
            dump.date,
            format_epoch(dump.date)
        );
    }
    Html(page)
}

async fn handle_location(State(state): State<AppState>) -> Response {
    let locations = state.store.locations.read().await;
    json_array_response(&locations.data)
}

// NOTE: this endpoint sends around 350 megs of json. If you are
// serving it over the network you should at least gzip it.
async fn handle_order(State(state): State<AppState>) -> Response {
    let orders = state.store.orders.read().await;
    json_array_response(&orders.data)
}

async fn handle_history(State(state): State<AppState>, Path(date): Path<String>) -> Response {
    let Ok(date) = date.parse::<i64>() else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let histories = state.store.histories.read().await;
    match histories.iter().find(|dump| dump.date == date) {
        Some(dump) => json_array_response(&dump.data),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

fn json_array_response<T: Serialize>(data: &[T]) -> Response {
    match serde_json::to_vec(data) {
        Ok(body) => ([(header::CONTENT_TYPE, "application/json")], body).into_response(),
        Err(e) => {
            error!("Http Server Worker: encode response: {e}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

fn format_epoch(epoch: i64) -> String {
    match Utc.timestamp_opt(epoch, 0) {
        chrono::LocalResult::Single(ts) => ts.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        _ => "-".to_owned(),
    }
}
