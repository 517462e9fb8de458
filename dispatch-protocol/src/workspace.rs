use serde::Deserialize;
use serde::Serialize;

use crate::Millis;

/// A named, path-addressed directory owning a set of runs (`spec.md` §3.1,
/// §4.3). Owned by C3; Session Core only reads/touches it.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Workspace {
    pub path: String,
    pub name: String,
    pub theme_override: Option<String>,
    pub last_active: Option<Millis>,
    pub created_at: Millis,
    pub updated_at: Millis,
}

impl Workspace {
    /// Name defaults to the last path segment (`spec.md` §4.3, P6).
    pub fn derive_name(path: &str) -> String {
        path.rsplit('/')
            .find(|segment| !segment.is_empty())
            .unwrap_or(path)
            .to_string()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct WorkspacePatch {
    pub name: Option<String>,
    pub theme_override: Option<String>,
}
