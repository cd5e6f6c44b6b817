//! Embedded reference tables for NPC stations and solar systems.
//!
//! Both tables come from the static data export and ship inside the
//! binary. They are parsed once at startup into flat vectors; at ~9k
//! systems and ~6k stations a linear scan per lookup is plenty.

use crate::prelude::*;
use serde::de::DeserializeOwned;
use serde::Deserialize;

static CSV_STATIONS: &[u8] = include_bytes!("../data/stations.csv");
static CSV_SYSTEMS: &[u8] = include_bytes!("../data/systems.csv");

const STATIONS_HEADER: [&str; 6] = [
    "stationID",
    "security",
    "stationTypeID",
    "corporationID",
    "solarSystemID",
    "stationName",
];
const SYSTEMS_HEADER: [&str; 2] = ["solarSystemID", "security"];

#[derive(Debug, Deserialize)]
pub(crate) struct Station {
    #[serde(rename = "stationID")]
    pub(crate) id: u64,
    pub(crate) security: f32,
    #[serde(rename = "stationTypeID")]
    pub(crate) type_id: u64,
    #[serde(rename = "corporationID")]
    pub(crate) owner_id: u64,
    #[serde(rename = "solarSystemID")]
    pub(crate) system_id: u64,
    #[serde(rename = "stationName")]
    pub(crate) name: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct System {
    #[serde(rename = "solarSystemID")]
    pub(crate) id: u64,
    pub(crate) security: f32,
}

/// The parsed station and system tables.
#[derive(Debug)]
pub struct ReferenceData {
    stations: Vec<Station>,
    systems: Vec<System>,
}

impl ReferenceData {
    /// Parse the CSVs embedded in the binary.
    ///
    /// A header mismatch in either file is fatal: it means the data
    /// files were regenerated against a different export schema.
    pub fn embedded() -> DumpResult<Self> {
        Self::from_csv(CSV_STATIONS, CSV_SYSTEMS)
    }

    /// Parse station and system tables from caller-provided CSV bytes.
    pub fn from_csv(stations: &[u8], systems: &[u8]) -> DumpResult<Self> {
        Ok(ReferenceData {
            stations: read_table(stations, &STATIONS_HEADER)?,
            systems: read_table(systems, &SYSTEMS_HEADER)?,
        })
    }

    pub(crate) fn station_by_id(&self, id: u64) -> Option<&Station> {
        self.stations.iter().find(|s| s.id == id)
    }

    pub(crate) fn system_by_id(&self, id: u64) -> Option<&System> {
        self.systems.iter().find(|s| s.id == id)
    }
}

fn read_table<T: DeserializeOwned>(data: &[u8], header: &[&str]) -> DumpResult<Vec<T>> {
    let mut reader = csv::Reader::from_reader(data);
    let found = reader.headers()?;
    if found.len() != header.len() || found.iter().zip(header.iter()).any(|(a, b)| a != *b) {
        return Err(DumpError::InvalidCsvHeader(format!("{found:?}")));
    }
    reader
        .deserialize()
        .collect::<Result<Vec<T>, csv::Error>>()
        .map_err(DumpError::from)
}
