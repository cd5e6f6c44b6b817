//! Market order downloader.

use crate::client::EsiResponse;
use crate::prelude::*;
use crate::regions::REGIONS;
use chrono::NaiveDateTime;
use log::debug;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

const ORDER_TRIALS: u32 = 5;
const ISSUED_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// One market order, normalised from the ESI representation.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Order {
    pub is_buy_order: bool,
    /// -2 = station, -1 = solar system, 0 = region, 1 = 1 jump ...
    pub range: i8,
    pub duration: u32,
    /// Unix seconds.
    pub issued: u64,
    pub min_volume: u64,
    pub volume_remain: u64,
    pub volume_total: u64,
    pub location_id: u64,
    pub system_id: u64,
    pub type_id: u64,
    pub region_id: u64,
    pub order_id: u64,
    pub price: f64,
}

#[derive(Debug, Deserialize)]
struct EsiOrder {
    duration: u32,
    is_buy_order: bool,
    issued: String,
    location_id: u64,
    min_volume: u64,
    order_id: u64,
    price: f64,
    range: String,
    system_id: u64,
    type_id: u64,
    volume_remain: u64,
    volume_total: u64,
}

/// Download every order of every region in [`REGIONS`].
///
/// Pages through each region's order book using the `X-Pages` bound of
/// the latest response. Any ESI error aborts the whole dump; a dump is
/// only useful when it is complete.
pub async fn download_order_dump(esi: &Esi, ct: &CancellationToken) -> DumpResult<Vec<Order>> {
    let mut orders: Vec<Order> = Vec::with_capacity(4000);

    for &region_id in REGIONS.iter() {
        debug!("Downloading orders of region {region_id}");
        let mut page = 1;
        loop {
            if ct.is_cancelled() {
                return Err(DumpError::Cancelled);
            }

            let uri = format!("/markets/{region_id}/orders?order_type=all&page={page}");
            let response: EsiResponse<Vec<EsiOrder>> =
                esi.fetch(ct, Method::GET, &uri, false, ORDER_TRIALS).await?;

            for esi_order in &response.data {
                orders.push(convert_order(esi_order, region_id)?);
            }

            page += 1;
            if page > response.pages {
                break;
            }
        }
    }

    Ok(orders)
}

fn convert_order(esi_order: &EsiOrder, region_id: u64) -> DumpResult<Order> {
    let issued = NaiveDateTime::parse_from_str(&esi_order.issued, ISSUED_FORMAT)
        .map_err(|e| DumpError::InvalidDate {
            value: esi_order.issued.clone(),
            source: e,
        })?
        .and_utc()
        .timestamp() as u64;

    Ok(Order {
        is_buy_order: esi_order.is_buy_order,
        range: range_code(&esi_order.range)?,
        duration: esi_order.duration,
        issued,
        min_volume: esi_order.min_volume,
        volume_remain: esi_order.volume_remain,
        volume_total: esi_order.volume_total,
        location_id: esi_order.location_id,
        system_id: esi_order.system_id,
        type_id: esi_order.type_id,
        region_id,
        order_id: esi_order.order_id,
        price: esi_order.price,
    })
}

/// Decode the `range` strings ESI uses into the compact code set kept
/// in dumps. Anything outside the documented set is refused rather than
/// silently coerced.
fn range_code(range: &str) -> DumpResult<i8> {
    match range {
        "station" => Ok(-2),
        "solarsystem" => Ok(-1),
        "region" => Ok(0),
        "1" => Ok(1),
        "2" => Ok(2),
        "3" => Ok(3),
        "4" => Ok(4),
        "5" => Ok(5),
        "10" => Ok(10),
        "20" => Ok(20),
        "30" => Ok(30),
        "40" => Ok(40),
        other => Err(DumpError::InvalidOrderRange(other.to_owned())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_code_table() {
        let table: [(&str, i8); 12] = [
            ("station", -2),
            ("solarsystem", -1),
            ("region", 0),
            ("1", 1),
            ("2", 2),
            ("3", 3),
            ("4", 4),
            ("5", 5),
            ("10", 10),
            ("20", 20),
            ("30", 30),
            ("40", 40),
        ];
        for (input, expected) in table {
            assert_eq!(range_code(input).unwrap(), expected, "range '{input}'");
        }

        for bad in ["", "6", "-1", "Station", "system", "41"] {
            assert!(
                matches!(range_code(bad), Err(DumpError::InvalidOrderRange(_))),
                "range '{bad}' should not decode"
            );
        }
    }

    #[test]
    fn test_convert_order() {
        let source = r#"{
            "duration": 90,
            "is_buy_order": false,
            "issued": "2024-05-13T09:06:31Z",
            "location_id": 60003760,
            "min_volume": 1,
            "order_id": 6711602603,
            "price": 5.27,
            "range": "region",
            "system_id": 30000142,
            "type_id": 34,
            "volume_remain": 642,
            "volume_total": 10000
          }"#;
        let esi_order: EsiOrder = serde_json::from_str(source).unwrap();
        let order = convert_order(&esi_order, 10000002).unwrap();

        assert_eq!(order.issued, 1715591191);
        assert_eq!(order.range, 0);
        assert_eq!(order.region_id, 10000002);
        assert_eq!(order.order_id, 6711602603);
        assert!(!order.is_buy_order);
    }

    #[test]
    fn test_convert_order_bad_issued() {
        let esi_order = EsiOrder {
            duration: 90,
            is_buy_order: true,
            issued: "2024-05-13 09:06:31".to_owned(),
            location_id: 1,
            min_volume: 1,
            order_id: 1,
            price: 1.0,
            range: "station".to_owned(),
            system_id: 1,
            type_id: 1,
            volume_remain: 1,
            volume_total: 1,
        };
        assert!(matches!(
            convert_order(&esi_order, 1),
            Err(DumpError::InvalidDate { .. })
        ));
    }
}
