use crate::error::CageError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// One declarative API hook: a method on a class, disambiguated by its
/// ordered parameter-type signature, with the parameters to capture.
///
/// `hooked_params` maps a capture label to a parameter index; a `BTreeMap`
/// keeps generated scripts byte-stable across runs. `category` is an opaque
/// tag forwarded verbatim into every event the hook emits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookDefinition {
    pub class: String,
    pub method: String,
    #[serde(default)]
    pub params: Vec<String>,
    #[serde(default)]
    pub hooked_params: BTreeMap<String, usize>,
    pub category: String,
}

impl HookDefinition {
    /// The identity used for duplicate rejection: two definitions may not
    /// share (class, method, signature).
    pub fn signature_key(&self) -> String {
        format!("{}#{}({})", self.class, self.method, self.params.join(","))
    }
}

/// Load the hook-definitions file: a JSON array of definitions, read once
/// per run and treated as read-only afterwards.
pub fn load_definitions(path: &Path) -> Result<Vec<HookDefinition>, CageError> {
    let raw = fs::read_to_string(path).map_err(|err| {
        CageError::dependency(
            path.display().to_string(),
            format!("hook definitions not readable: {err}"),
        )
    })?;
    serde_json::from_str(&raw)
        .map_err(|err| CageError::Script(format!("{} is not a valid hook set: {err}", path.display())))
}
