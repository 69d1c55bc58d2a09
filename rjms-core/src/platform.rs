//! Minimal platform description (§1, §10.3): a substitute for the original's full
//! SimGrid XML topology, carrying only what C2/C4 need — machine names and a
//! pstate catalog with power draw and transition durations. Full topology/routing
//! parsing is out of scope per §1 and is not reimplemented; this is a deliberate,
//! documented simplification (SPEC_FULL.md §1), not a partial attempt at the
//! original format.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::SimError;
use crate::machine::{PstateCatalog, PstateKind};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PstateDescription {
    pub kind: PlatformPstateKind,
    /// Watts while resident in this pstate (`0.0` for transition pstates, which
    /// instead have a duration).
    #[serde(default)]
    pub watts: f64,
    /// Seconds to complete a transition into this pstate, if it is a transition
    /// pstate.
    #[serde(default)]
    pub transition_seconds: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlatformPstateKind {
    Compute,
    Sleep,
}

impl From<PlatformPstateKind> for PstateKind {
    fn from(value: PlatformPstateKind) -> Self {
        match value {
            PlatformPstateKind::Compute => PstateKind::Compute,
            PlatformPstateKind::Sleep => PstateKind::Sleep,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformDescription {
    pub hosts: Vec<String>,
    pub pstates: HashMap<u32, PstateDescription>,
}

impl PlatformDescription {
    pub fn load(path: &Path) -> Result<Self, SimError> {
        let text = fs::read_to_string(path)
            .map_err(|e| SimError::configuration(format!("cannot read platform file '{}': {e}", path.display())))?;
        let platform: PlatformDescription = serde_json::from_str(&text)
            .map_err(|e| SimError::configuration(format!("cannot parse platform file '{}': {e}", path.display())))?;
        if platform.hosts.is_empty() {
            return Err(SimError::configuration("platform declares no hosts".into()));
        }
        Ok(platform)
    }

    pub fn pstate_kinds(&self) -> HashMap<u32, PstateKind> {
        self.pstates.iter().map(|(p, d)| (*p, d.kind.into())).collect()
    }

    /// Kind + power-draw catalog for `MachineRegistry::create` (§4.2, §8 `-E`
    /// energy accounting).
    pub fn pstate_catalog(&self) -> PstateCatalog {
        let kinds = self.pstate_kinds();
        let watts = self.pstates.iter().map(|(p, d)| (*p, d.watts)).collect();
        PstateCatalog::new(kinds, watts)
    }

    pub fn transition_seconds(&self, pstate: u32) -> f64 {
        self.pstates.get(&pstate).map(|d| d.transition_seconds).unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_parses_minimal_platform_json() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("rjms-platform-test-{}.json", std::process::id()));
        std::fs::write(
            &path,
            r#"{"hosts": ["master_host", "m0", "m1"], "pstates": {"0": {"kind": "compute", "watts": 100.0}, "1": {"kind": "sleep", "transition_seconds": 5.0}}}"#,
        )
        .unwrap();

        let platform = PlatformDescription::load(&path).unwrap();
        assert_eq!(platform.hosts.len(), 3);
        assert_eq!(platform.transition_seconds(1), 5.0);

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn load_rejects_empty_host_list() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("rjms-platform-empty-{}.json", std::process::id()));
        std::fs::write(&path, r#"{"hosts": [], "pstates": {}}"#).unwrap();
        assert!(PlatformDescription::load(&path).is_err());
        std::fs::remove_file(&path).ok();
    }
}
