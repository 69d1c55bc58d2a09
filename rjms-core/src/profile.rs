//! Job profiles: the recipe a job follows while it runs (SPEC_FULL.md §3, §4.3).
//!
//! Modeled as a tagged union with one execution function per variant rather than a
//! virtual hierarchy (§9 "Dynamic dispatch on profile type"). `parallel` and
//! `parallel-homogeneous` duration is the declared compute amount directly — the
//! core does not convert flops/bytes into wall time, that physics is the simulation
//! kernel's job and is out of scope (§1, §10.1).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Defends against pathological sequence-of-sequence workloads recursing without
/// bound (§9 "bound the recursion depth defensively").
pub const MAX_SEQUENCE_DEPTH: u32 = 64;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Profile {
    Parallel {
        /// One compute amount per resource, in declared "seconds of work" units.
        compute: Vec<f64>,
        /// Resource x resource communication matrix, flattened row-major.
        communication: Vec<f64>,
    },
    ParallelHomogeneous {
        compute: f64,
        communication: f64,
    },
    Delay {
        seconds: f64,
    },
    Sequence {
        profiles: Vec<String>,
        repeat: u32,
    },
    Smpi {
        /// One trace file path per rank.
        traces: Vec<String>,
    },
}

impl Profile {
    pub fn kind(&self) -> &'static str {
        match self {
            Profile::Parallel { .. } => "parallel",
            Profile::ParallelHomogeneous { .. } => "parallel_homogeneous",
            Profile::Delay { .. } => "delay",
            Profile::Sequence { .. } => "sequence",
            Profile::Smpi { .. } => "smpi",
        }
    }
}

/// Validates the invariants from §3: sequence profiles are acyclic and reference
/// only existing profiles; SMPI trace count matches `required_resources`.
pub fn validate_profiles(
    profiles: &HashMap<String, Profile>,
    required_resources: &HashMap<String, u32>,
) -> Result<(), String> {
    for (name, profile) in profiles {
        match profile {
            Profile::Sequence { profiles: inner, .. } => {
                let mut visited = vec![name.clone()];
                check_sequence_acyclic(name, inner, profiles, &mut visited)?;
            }
            Profile::Smpi { traces } => {
                if let Some(&required) = required_resources.get(name) {
                    if traces.len() as u32 != required {
                        return Err(format!(
                            "profile '{name}': smpi trace count {} does not match required resources {required}",
                            traces.len()
                        ));
                    }
                }
            }
            _ => {}
        }
    }
    Ok(())
}

fn check_sequence_acyclic(
    origin: &str,
    inner: &[String],
    profiles: &HashMap<String, Profile>,
    visited: &mut Vec<String>,
) -> Result<(), String> {
    for name in inner {
        if !profiles.contains_key(name) {
            return Err(format!("sequence '{origin}' references unknown profile '{name}'"));
        }
        if visited.contains(name) {
            return Err(format!("sequence '{origin}' is cyclic via '{name}'"));
        }
        if let Profile::Sequence { profiles: nested, .. } = &profiles[name] {
            visited.push(name.clone());
            check_sequence_acyclic(name, nested, profiles, visited)?;
            visited.pop();
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profiles(pairs: &[(&str, Profile)]) -> HashMap<String, Profile> {
        pairs.iter().map(|(n, p)| (n.to_string(), p.clone())).collect()
    }

    #[test]
    fn accepts_acyclic_sequence() {
        let profiles = profiles(&[
            ("a", Profile::Sequence { profiles: vec!["b".into()], repeat: 1 }),
            ("b", Profile::Delay { seconds: 1.0 }),
        ]);
        assert!(validate_profiles(&profiles, &HashMap::new()).is_ok());
    }

    #[test]
    fn rejects_cyclic_sequence() {
        let profiles = profiles(&[
            ("a", Profile::Sequence { profiles: vec!["b".into()], repeat: 1 }),
            ("b", Profile::Sequence { profiles: vec!["a".into()], repeat: 1 }),
        ]);
        assert!(validate_profiles(&profiles, &HashMap::new()).is_err());
    }

    #[test]
    fn rejects_sequence_to_unknown_profile() {
        let profiles = profiles(&[(
            "a",
            Profile::Sequence { profiles: vec!["missing".into()], repeat: 1 },
        )]);
        assert!(validate_profiles(&profiles, &HashMap::new()).is_err());
    }

    #[test]
    fn smpi_trace_count_must_match_required_resources() {
        let profiles = profiles(&[(
            "a",
            Profile::Smpi { traces: vec!["r0.trace".into()] },
        )]);
        let mut required = HashMap::new();
        required.insert("a".to_string(), 2);
        assert!(validate_profiles(&profiles, &required).is_err());
        required.insert("a".to_string(), 1);
        assert!(validate_profiles(&profiles, &required).is_ok());
    }
}
