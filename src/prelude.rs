//! Module for easy imports.

pub use crate::builders::EsiBuilder;
pub use crate::client::{ApiSecrets, Esi};
pub use crate::errors::{DumpError, DumpResult};
pub use crate::reference::ReferenceData;
pub(crate) use serde::{Deserialize, Serialize};
