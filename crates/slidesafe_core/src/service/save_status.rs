//! Save indicator projection.

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// What the save indicator should show for one document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SaveStatus {
    Saved,
    Saving,
    /// Edits are buffered locally and waiting for the debounce window.
    Pending,
    /// The last remote write failed and edits are still unconfirmed.
    Error,
    Offline,
}

impl SaveStatus {
    /// Precedence: offline, saving, error, pending, saved.
    pub fn derive(online: bool, saving: bool, dirty: bool, last_failed: bool) -> Self {
        if !online {
            Self::Offline
        } else if saving {
            Self::Saving
        } else if dirty && last_failed {
            Self::Error
        } else if dirty {
            Self::Pending
        } else {
            Self::Saved
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Saved => "saved",
            Self::Saving => "saving",
            Self::Pending => "pending",
            Self::Error => "error",
            Self::Offline => "offline",
        }
    }
}

impl Display for SaveStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
