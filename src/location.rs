//! Location resolver.
//!
//! A location id names either an NPC station, answered from the
//! embedded reference tables, or a player structure, which takes an
//! authenticated ESI call and may well be off limits to the
//! authenticated character.

use crate::client::EsiResponse;
use crate::prelude::*;
use log::debug;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

const NPC_STATION_MIN: u64 = 60_000_000;
const NPC_STATION_MAX: u64 = 64_000_000;

/// Metadata of a trading location, NPC station or player structure.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Location {
    pub id: u64,
    /// Station type id.
    pub type_id: u64,
    /// Owning corporation id.
    pub owner_id: u64,
    pub system_id: u64,
    pub security: f32,
    pub name: String,
}

#[derive(Debug, Deserialize)]
struct EsiStructure {
    name: String,
    #[serde(rename = "solar_system_id")]
    system_id: u64,
    type_id: u64,
    owner_id: u64,
}

/// Result of one resolver pass.
#[derive(Debug, Default)]
pub struct LocationDownload {
    pub locations: Vec<Location>,
    /// Ids that answered with an ESI error. Avoid requesting these
    /// again in subsequent cycles or you will suffer error rate
    /// timeouts from ESI.
    pub forbidden: Vec<u64>,
}

/// Resolver failure. Carries the forbidden ids accumulated before the
/// failure so the caller can persist them anyway.
#[derive(Debug, Error)]
#[error("location dump failed")]
pub struct LocationError {
    pub forbidden: Vec<u64>,
    #[source]
    pub source: DumpError,
}

/// Resolve a set of location ids into [`Location`] metadata.
///
/// NPC station ids (the closed range 60,000,000..=64,000,000) resolve
/// against the embedded tables; a missing row means the reference CSVs
/// are stale and fails the pass. Anything else is fetched as a player
/// structure with a single trial — an ESI error marks the id forbidden
/// and the pass continues, a transport error aborts it.
pub async fn download_location_dump(
    esi: &Esi,
    ct: &CancellationToken,
    unknown_locations: &[u64],
    reference: &ReferenceData,
) -> Result<LocationDownload, LocationError> {
    let mut locations = Vec::with_capacity(unknown_locations.len());
    let mut forbidden: Vec<u64> = Vec::new();

    for &loc_id in unknown_locations {
        let is_npc_station = (NPC_STATION_MIN..=NPC_STATION_MAX).contains(&loc_id);
        if is_npc_station {
            let Some(station) = reference.station_by_id(loc_id) else {
                return Err(LocationError {
                    forbidden,
                    source: DumpError::UnknownNpcStation(loc_id),
                });
            };
            locations.push(Location {
                id: station.id,
                type_id: station.type_id,
                owner_id: station.owner_id,
                system_id: station.system_id,
                security: station.security,
                name: station.name.clone(),
            });
        } else {
            let uri = format!("/universe/structures/{loc_id}");
            let response: EsiResponse<EsiStructure> =
                match esi.fetch(ct, Method::GET, &uri, true, 1).await {
                    Ok(response) => response,
                    Err(DumpError::Esi { code, .. }) => {
                        debug!("Structure {loc_id} is off limits ({code})");
                        forbidden.push(loc_id);
                        continue;
                    }
                    Err(e) => {
                        return Err(LocationError {
                            forbidden,
                            source: e,
                        })
                    }
                };
            let structure = response.data;
            let Some(system) = reference.system_by_id(structure.system_id) else {
                return Err(LocationError {
                    forbidden,
                    source: DumpError::UnknownSystem(structure.system_id),
                });
            };
            locations.push(Location {
                id: loc_id,
                type_id: structure.type_id,
                owner_id: structure.owner_id,
                system_id: structure.system_id,
                security: system.security,
                name: structure.name,
            });
        }
    }

    Ok(LocationDownload {
        locations,
        forbidden,
    })
}
