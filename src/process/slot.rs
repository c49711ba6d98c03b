//! Process slots - the fixed roles a supervised process can occupy

use crate::error::LauncherError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessSlot {
    Skin,
    Helper,
}

impl ProcessSlot {
    pub fn all() -> [ProcessSlot; 2] {
        [ProcessSlot::Skin, ProcessSlot::Helper]
    }

    pub fn name(&self) -> &'static str {
        match self {
            ProcessSlot::Skin => "skin",
            ProcessSlot::Helper => "helper",
        }
    }

    /// Event emitted for each output line in push mode
    pub fn event_name(&self) -> &'static str {
        match self {
            ProcessSlot::Skin => "skin_output",
            ProcessSlot::Helper => "helper_output",
        }
    }
}

impl fmt::Display for ProcessSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ProcessSlot {
    type Err = LauncherError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "skin" => Ok(ProcessSlot::Skin),
            "helper" => Ok(ProcessSlot::Helper),
            other => Err(LauncherError::UnknownSlot(other.to_string())),
        }
    }
}
