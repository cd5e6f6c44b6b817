//! eve-market-dump
//!
//! Consolidated market dumps from [ESI], the API of [EVE Online].
//!
//! This crate periodically downloads the full order book of every
//! region, per-day price histories for every active market, and the
//! metadata of the locations those orders live in, and keeps the
//! results in shared dumps ready to serve to downstream consumers.
//! All downloads go through a single rate-limited, retry-aware ESI
//! client so the process as a whole respects upstream backoff.
//!
//! # Example
//!
//! ```rust,no_run
//! use eve_market_dump::prelude::*;
//! use eve_market_dump::download_order_dump;
//! use tokio_util::sync::CancellationToken;
//!
//! async fn run() -> DumpResult<()> {
//!     let esi = EsiBuilder::new()
//!         .user_agent("your contact info")
//!         .build()?;
//!     let ct = CancellationToken::new();
//!     let orders = download_order_dump(&esi, &ct).await?;
//!     println!("{} orders", orders.len());
//!     Ok(())
//! }
//! ```
//!
//! The `web-server` binary in this repository wires the downloaders
//! into the full ingestion loop and serves the dumps over HTTP.
//!
//! [ESI]: https://esi.evetech.net
//! [EVE Online]: https://www.eveonline.com

#![deny(clippy::all)]

mod builders;
mod client;
mod errors;
mod history;
mod location;
mod order;
mod reference;
mod regions;
pub mod scheduler;

pub mod prelude;

pub use builders::EsiBuilder;
pub use client::{ApiSecrets, Esi, EsiResponse};
pub use errors::{DumpError, DumpResult};
pub use history::{
    download_full_history_dump, download_incremental_history_dump, HistoryDay, HistoryMarket,
    HistorySnapshot,
};
pub use location::{download_location_dump, Location, LocationDownload, LocationError};
pub use order::{download_order_dump, Order};
pub use reference::ReferenceData;
pub use regions::REGIONS;
