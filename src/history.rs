//! History snapshot engine.
//!
//! The full history of every active market weighs multiple gigabytes,
//! so the full download streams fixed-width records to a temp file
//! instead of holding them in memory, and hands back a
//! [`HistorySnapshot`] to query one day at a time.

use crate::client::{sleep_with_token, EsiResponse};
use crate::prelude::*;
use chrono::NaiveDate;
use log::{debug, warn};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempPath;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

const HISTORY_TRIALS: u32 = 5;
const MARKET_TRIALS: u32 = 3;
const MARKET_BREAK: Duration = Duration::from_secs(15 * 60);
const DATE_FORMAT: &str = "%Y-%m-%d";

/// Size of one on-disk [`SnapHistoryDay`] record.
const SNAP_DAY_SIZE: usize = 64;

/// A (region, type) pair identifying one market.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HistoryMarket {
    pub region_id: u64,
    pub type_id: u64,
}

/// One day of price statistics in one market.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HistoryDay {
    pub region_id: u64,
    pub type_id: u64,
    pub average: f64,
    pub highest: f64,
    pub lowest: f64,
    pub order_count: u64,
    pub volume: u64,
}

#[derive(Debug, Deserialize)]
struct EsiHistoryDay {
    average: f64,
    date: String,
    highest: f64,
    lowest: f64,
    order_count: u64,
    volume: u64,
}

/// The on-disk record layout: eight little-endian 8-byte fields,
/// written back-to-back with no header and no index.
#[derive(Clone, Copy, Debug, PartialEq)]
struct SnapHistoryDay {
    date: u64,
    region_id: u64,
    type_id: u64,
    average: f64,
    highest: f64,
    lowest: f64,
    order_count: u64,
    volume: u64,
}

impl SnapHistoryDay {
    fn to_bytes(self) -> [u8; SNAP_DAY_SIZE] {
        let mut buf = [0u8; SNAP_DAY_SIZE];
        buf[0..8].copy_from_slice(&self.date.to_le_bytes());
        buf[8..16].copy_from_slice(&self.region_id.to_le_bytes());
        buf[16..24].copy_from_slice(&self.type_id.to_le_bytes());
        buf[24..32].copy_from_slice(&self.average.to_le_bytes());
        buf[32..40].copy_from_slice(&self.highest.to_le_bytes());
        buf[40..48].copy_from_slice(&self.lowest.to_le_bytes());
        buf[48..56].copy_from_slice(&self.order_count.to_le_bytes());
        buf[56..64].copy_from_slice(&self.volume.to_le_bytes());
        buf
    }

    fn from_bytes(buf: &[u8; SNAP_DAY_SIZE]) -> Self {
        SnapHistoryDay {
            date: le_u64(&buf[0..8]),
            region_id: le_u64(&buf[8..16]),
            type_id: le_u64(&buf[16..24]),
            average: le_f64(&buf[24..32]),
            highest: le_f64(&buf[32..40]),
            lowest: le_f64(&buf[40..48]),
            order_count: le_u64(&buf[48..56]),
            volume: le_u64(&buf[56..64]),
        }
    }
}

fn le_u64(buf: &[u8]) -> u64 {
    u64::from_le_bytes(buf.try_into().expect("8 byte field"))
}

fn le_f64(buf: &[u8]) -> f64 {
    f64::from_le_bytes(buf.try_into().expect("8 byte field"))
}

#[derive(Debug)]
struct SnapshotFile {
    file: File,
    path: TempPath,
}

/// Handle over the history data of a full download.
///
/// Owns the backing temp file. **Don't forget to call [`close`] on
/// every exit path to remove the data from disk** — dropping the
/// handle also removes the file, but `close` reports removal errors
/// instead of swallowing them.
///
/// [`close`]: HistorySnapshot::close
#[derive(Debug)]
pub struct HistorySnapshot {
    file: Mutex<Option<SnapshotFile>>,
    /// Distinct unix-second dates appearing in the file, ascending.
    pub dates: Vec<u64>,
}

impl HistorySnapshot {
    /// Reads the whole snapshot file and returns the days that match
    /// the requested unix-second date.
    pub async fn get_history_data_for_day(
        &self,
        ct: &CancellationToken,
        date: u64,
    ) -> DumpResult<Vec<HistoryDay>> {
        if !self.dates.contains(&date) {
            return Ok(Vec::new());
        }

        let mut guard = self.file.lock().await;
        let snapshot_file = guard.as_mut().ok_or(DumpError::SnapshotClosed)?;
        snapshot_file.file.seek(SeekFrom::Start(0)).await?;

        let mut days = Vec::with_capacity(1024);
        let mut reader = BufReader::new(&mut snapshot_file.file);
        let mut buf = [0u8; SNAP_DAY_SIZE];
        loop {
            if ct.is_cancelled() {
                return Err(DumpError::Cancelled);
            }
            match reader.read_exact(&mut buf).await {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            let snap_day = SnapHistoryDay::from_bytes(&buf);
            if snap_day.date == date {
                days.push(HistoryDay {
                    region_id: snap_day.region_id,
                    type_id: snap_day.type_id,
                    average: snap_day.average,
                    highest: snap_day.highest,
                    lowest: snap_day.lowest,
                    order_count: snap_day.order_count,
                    volume: snap_day.volume,
                });
            }
        }

        Ok(days)
    }

    /// Path of the backing temp file, `None` once closed.
    pub async fn file_path(&self) -> Option<PathBuf> {
        self.file.lock().await.as_ref().map(|f| f.path.to_path_buf())
    }

    /// Close and remove the snapshot file. Can be called multiple
    /// times; calls after the first are no-ops.
    pub async fn close(&self) -> DumpResult<()> {
        let mut guard = self.file.lock().await;
        if let Some(SnapshotFile { file, path }) = guard.take() {
            drop(file);
            let name = path.to_path_buf();
            path.close()?;
            debug!("Removed snapshot file {}", name.display());
        }
        Ok(())
    }
}

/// Download the full market history available for a slice of markets.
///
/// The data is streamed to a temp file; the returned snapshot serves
/// per-day queries through [`HistorySnapshot::get_history_data_for_day`].
/// On any error the partial file is removed and no handle escapes.
///
/// Markets that answer 400 or 404 are skipped, an empty history is
/// normal. Other failures get up to two 15 minute breaks before the
/// whole dump is abandoned.
pub async fn download_full_history_dump(
    esi: &Esi,
    ct: &CancellationToken,
    markets: &[HistoryMarket],
) -> DumpResult<HistorySnapshot> {
    let temp = tempfile::Builder::new()
        .prefix("evemarketdump_history_")
        .tempfile()?;
    let (file, path) = temp.into_parts();
    let mut writer = BufWriter::new(File::from_std(file));
    let mut dates: BTreeSet<u64> = BTreeSet::new();

    // PERF: this loop could be spread over a few worker tasks, the
    // bottleneck today is the sequential round trips
    for market in markets {
        if ct.is_cancelled() {
            return Err(DumpError::Cancelled);
        }

        let Some(esi_history) = fetch_market_history(esi, ct, market).await? else {
            continue;
        };

        for esi_day in &esi_history {
            let snap_day = convert_history_day(esi_day, market)?;
            dates.insert(snap_day.date);
            writer.write_all(&snap_day.to_bytes()).await?;
        }
    }

    writer.flush().await?;
    Ok(HistorySnapshot {
        file: Mutex::new(Some(SnapshotFile {
            file: writer.into_inner(),
            path,
        })),
        dates: dates.into_iter().collect(),
    })
}

/// Download the history of one day for a slice of markets.
///
/// Same fetch policy as the full download but nothing touches disk:
/// only the days matching `request_date` (unix seconds of a UTC
/// midnight) survive. This can take hours for hundreds of thousands
/// of markets.
pub async fn download_incremental_history_dump(
    esi: &Esi,
    ct: &CancellationToken,
    markets: &[HistoryMarket],
    request_date: u64,
) -> DumpResult<Vec<HistoryDay>> {
    let mut days = Vec::with_capacity(1024);

    for market in markets {
        if ct.is_cancelled() {
            return Err(DumpError::Cancelled);
        }

        let Some(esi_history) = fetch_market_history(esi, ct, market).await? else {
            continue;
        };

        for esi_day in &esi_history {
            if parse_history_date(&esi_day.date)? == request_date {
                days.push(HistoryDay {
                    region_id: market.region_id,
                    type_id: market.type_id,
                    average: esi_day.average,
                    highest: esi_day.highest,
                    lowest: esi_day.lowest,
                    order_count: esi_day.order_count,
                    volume: esi_day.volume,
                });
                break;
            }
        }
    }

    Ok(days)
}

/// Fetch one market's history. `None` means the market has no history
/// and should be skipped.
async fn fetch_market_history(
    esi: &Esi,
    ct: &CancellationToken,
    market: &HistoryMarket,
) -> DumpResult<Option<Vec<EsiHistoryDay>>> {
    let uri = format!(
        "/markets/{}/history?type_id={}",
        market.region_id, market.type_id
    );
    let mut market_trials = MARKET_TRIALS;
    loop {
        let result: DumpResult<EsiResponse<Vec<EsiHistoryDay>>> =
            esi.fetch(ct, Method::GET, &uri, false, HISTORY_TRIALS).await;
        match result {
            Ok(response) => return Ok(Some(response.data)),
            Err(DumpError::Esi {
                code: 400 | 404, ..
            }) => return Ok(None),
            Err(err @ DumpError::Esi { .. }) => return Err(err),
            Err(err) => {
                if market_trials <= 1 {
                    return Err(err);
                }
                warn!(
                    "Error while downloading history of region {} type {}, taking a 15 minute break: {err}",
                    market.region_id, market.type_id
                );
                sleep_with_token(ct, MARKET_BREAK).await?;
                market_trials -= 1;
            }
        }
    }
}

fn convert_history_day(esi_day: &EsiHistoryDay, market: &HistoryMarket) -> DumpResult<SnapHistoryDay> {
    Ok(SnapHistoryDay {
        date: parse_history_date(&esi_day.date)?,
        region_id: market.region_id,
        type_id: market.type_id,
        average: esi_day.average,
        highest: esi_day.highest,
        lowest: esi_day.lowest,
        order_count: esi_day.order_count,
        volume: esi_day.volume,
    })
}

/// Parse an ESI `YYYY-MM-DD` date into the unix seconds of its UTC
/// midnight.
pub(crate) fn parse_history_date(date: &str) -> DumpResult<u64> {
    let parsed = NaiveDate::parse_from_str(date, DATE_FORMAT).map_err(|e| DumpError::InvalidDate {
        value: date.to_owned(),
        source: e,
    })?;
    let midnight = parsed.and_hms_opt(0, 0, 0).expect("midnight is always valid");
    Ok(midnight.and_utc().timestamp() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snap_day_bytes_round_trip() {
        let day = SnapHistoryDay {
            date: 1704067200,
            region_id: 10000002,
            type_id: 34,
            average: 5.27,
            highest: 6.0,
            lowest: 4.96,
            order_count: 2931,
            volume: 41268337918,
        };
        let buf = day.to_bytes();
        assert_eq!(SnapHistoryDay::from_bytes(&buf), day);
    }

    #[test]
    fn test_snap_day_layout_is_little_endian() {
        let day = SnapHistoryDay {
            date: 0x0102030405060708,
            region_id: 0,
            type_id: 0,
            average: 0.0,
            highest: 0.0,
            lowest: 0.0,
            order_count: 0,
            volume: 0,
        };
        let buf = day.to_bytes();
        assert_eq!(&buf[0..8], &[8, 7, 6, 5, 4, 3, 2, 1]);
    }

    #[test]
    fn test_parse_history_date() {
        assert_eq!(parse_history_date("2024-01-01").unwrap(), 1704067200);
        assert_eq!(parse_history_date("1970-01-01").unwrap(), 0);
        assert!(matches!(
            parse_history_date("2024-13-01"),
            Err(DumpError::InvalidDate { .. })
        ));
        assert!(matches!(
            parse_history_date("01/02/2024"),
            Err(DumpError::InvalidDate { .. })
        ));
    }

    #[test]
    fn test_esi_history_day_deserialize() {
        let source = r#"{
            "average": 5.27,
            "date": "2024-01-01",
            "highest": 6.0,
            "lowest": 4.96,
            "order_count": 2931,
            "volume": 41268337918
          }"#;
        let day: EsiHistoryDay = serde_json::from_str(source).unwrap();
        assert_eq!(day.date, "2024-01-01");
        assert_eq!(day.order_count, 2931);
    }
}
