//! Artifact validation for stage pre/postconditions.

pub mod artifacts;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// How hard artifact validators look at stage inputs/outputs.
///
/// `Strict` parses files and checks schemas; `Lenient` only checks
/// existence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ValidationMode {
    Strict,
    Lenient,
}

impl ValidationMode {
    pub fn is_strict(self) -> bool {
        matches!(self, Self::Strict)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Strict => "strict",
            Self::Lenient => "lenient",
        }
    }
}
