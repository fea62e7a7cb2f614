//! Universe stage result types.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A symbol dropped during universe construction together with the
/// machine-readable reason code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UniverseReject {
    pub symbol: String,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct UniverseStats {
    pub total: usize,
    pub kept: usize,
    pub rejected: usize,
}

/// Where a candidate symbol was seen and what the catalog said about it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceFlags {
    pub in_catalog: bool,
    pub in_default_list: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exchange_status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quote_asset: Option<String>,
}

/// The tradable candidate set plus everything that was filtered away.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UniverseResult {
    /// Kept symbols, ascending, unique.
    pub symbols: Vec<String>,
    pub rejects: Vec<UniverseReject>,
    pub stats: UniverseStats,
    pub source_flags: BTreeMap<String, SourceFlags>,
}
