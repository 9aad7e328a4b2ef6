use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;

/// Stable identifier for one synchronizable stream (an account, a payroll feed).
///
/// Export ids key the cursor file and name the ledger file, so they must not
/// change between runs.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExportId(pub String);

impl ExportId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Default ledger file name: `{export_id}.csv`
    pub fn default_file_name(&self) -> String {
        format!("{}.csv", self.0)
    }
}

impl fmt::Display for ExportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ExportId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ExportId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl Borrow<str> for ExportId {
    fn borrow(&self) -> &str {
        &self.0
    }
}
