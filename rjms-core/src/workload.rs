//! Workload file parsing (§6): `{jobs: [...], profiles: {...}}` JSON, as named in
//! SPEC_FULL.md's workload-file section. Each loaded file is assigned a unique
//! short workload name so its jobs' `JobId`s don't collide across `-w` repeats.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::SimError;
use crate::job::{Job, JobId};
use crate::profile::{validate_profiles, Profile};
use crate::submitter::ScheduledJob;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadJob {
    pub id: u64,
    pub subtime: f64,
    /// Seconds, or a negative value meaning unbounded (§3).
    pub walltime: f64,
    pub res: u32,
    pub profile: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadFile {
    pub jobs: Vec<WorkloadJob>,
    pub profiles: HashMap<String, Profile>,
}

#[derive(Debug, Clone)]
pub struct LoadedWorkload {
    pub name: String,
    pub jobs: Vec<WorkloadJob>,
    pub profiles: HashMap<String, Profile>,
}

impl WorkloadFile {
    pub fn load(path: &Path, name: impl Into<String>) -> Result<LoadedWorkload, SimError> {
        let text = fs::read_to_string(path)
            .map_err(|e| SimError::configuration(format!("cannot read workload file '{}': {e}", path.display())))?;
        let parsed: WorkloadFile = serde_json::from_str(&text)
            .map_err(|e| SimError::configuration(format!("cannot parse workload file '{}': {e}", path.display())))?;

        let required: HashMap<String, u32> =
            parsed.jobs.iter().map(|j| (j.profile.clone(), j.res)).collect();
        validate_profiles(&parsed.profiles, &required)
            .map_err(|e| SimError::configuration(format!("workload file '{}': {e}", path.display())))?;

        for job in &parsed.jobs {
            if !parsed.profiles.contains_key(&job.profile) {
                return Err(SimError::configuration(format!(
                    "workload file '{}': job {} references unknown profile '{}'",
                    path.display(),
                    job.id,
                    job.profile
                )));
            }
        }

        Ok(LoadedWorkload { name: name.into(), jobs: parsed.jobs, profiles: parsed.profiles })
    }
}

/// Merges several loaded workloads into one global profile table and job list,
/// plus the per-workload submission lists a submitter (`submitter::run_submitter`)
/// needs. Profile names are qualified with their workload name
/// (`"<workload>::<profile>"`) so two `-w` files declaring a same-named but
/// different profile never collide (§6 "each gets a unique short name" extended
/// to the profile namespace, since the wire job-id syntax already disambiguates
/// jobs but the workload JSON shape gives profiles no such qualifier itself).
pub fn assemble(
    loaded: &[LoadedWorkload],
) -> (HashMap<String, Profile>, Vec<Job>, Vec<(String, Vec<ScheduledJob>)>) {
    let mut profiles = HashMap::new();
    let mut jobs = Vec::new();
    let mut per_submitter = Vec::with_capacity(loaded.len());

    for workload in loaded {
        for (profile_name, profile) in &workload.profiles {
            profiles.insert(
                qualify(&workload.name, profile_name),
                qualify_profile(&workload.name, profile.clone()),
            );
        }

        let mut scheduled = Vec::with_capacity(workload.jobs.len());
        for job in &workload.jobs {
            let id = JobId::new(workload.name.clone(), job.id);
            let walltime = if job.walltime < 0.0 { None } else { Some(job.walltime) };
            jobs.push(Job::new(
                id.clone(),
                job.res,
                walltime,
                qualify(&workload.name, &job.profile),
                job.subtime,
            ));
            scheduled.push(ScheduledJob { id, subtime: job.subtime });
        }
        per_submitter.push((workload.name.clone(), scheduled));
    }

    (profiles, jobs, per_submitter)
}

fn qualify(workload: &str, name: &str) -> String {
    format!("{workload}::{name}")
}

/// Sequence profiles reference other profiles by bare name (§3); those
/// references must be qualified the same way or they'd dangle once the profile
/// table is merged and keyed by qualified name.
fn qualify_profile(workload: &str, profile: Profile) -> Profile {
    match profile {
        Profile::Sequence { profiles: inner, repeat } => {
            Profile::Sequence { profiles: inner.iter().map(|p| qualify(workload, p)).collect(), repeat }
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_valid_workload_and_assigns_name() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("rjms-workload-test-{}.json", std::process::id()));
        std::fs::write(
            &path,
            r#"{
                "jobs": [{"id": 0, "subtime": 0.0, "walltime": 10.0, "res": 1, "profile": "p0"}],
                "profiles": {"p0": {"type": "delay", "seconds": 5.0}}
            }"#,
        )
        .unwrap();

        let workload = WorkloadFile::load(&path, "w0").unwrap();
        assert_eq!(workload.name, "w0");
        assert_eq!(workload.jobs.len(), 1);

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn rejects_job_referencing_unknown_profile() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("rjms-workload-bad-{}.json", std::process::id()));
        std::fs::write(
            &path,
            r#"{
                "jobs": [{"id": 0, "subtime": 0.0, "walltime": 10.0, "res": 1, "profile": "missing"}],
                "profiles": {}
            }"#,
        )
        .unwrap();

        assert!(WorkloadFile::load(&path, "w0").is_err());
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn assemble_qualifies_profile_names_per_workload_to_avoid_collisions() {
        let mut profiles_a = HashMap::new();
        profiles_a.insert("p0".to_string(), Profile::Delay { seconds: 1.0 });
        let a = LoadedWorkload {
            name: "a".to_string(),
            jobs: vec![WorkloadJob { id: 0, subtime: 0.0, walltime: 5.0, res: 1, profile: "p0".to_string() }],
            profiles: profiles_a,
        };

        let mut profiles_b = HashMap::new();
        profiles_b.insert("p0".to_string(), Profile::Delay { seconds: 99.0 });
        let b = LoadedWorkload {
            name: "b".to_string(),
            jobs: vec![WorkloadJob { id: 0, subtime: 0.0, walltime: 5.0, res: 1, profile: "p0".to_string() }],
            profiles: profiles_b,
        };

        let (profiles, jobs, per_submitter) = assemble(&[a, b]);
        assert_eq!(profiles.len(), 2);
        assert!(profiles.contains_key("a::p0"));
        assert!(profiles.contains_key("b::p0"));
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].profile, "a::p0");
        assert_eq!(jobs[1].profile, "b::p0");
        assert_eq!(per_submitter.len(), 2);
    }

    #[test]
    fn assemble_qualifies_sequence_inner_references() {
        let mut profiles = HashMap::new();
        profiles.insert("seq".to_string(), Profile::Sequence { profiles: vec!["d".to_string()], repeat: 1 });
        profiles.insert("d".to_string(), Profile::Delay { seconds: 1.0 });
        let w = LoadedWorkload {
            name: "w0".to_string(),
            jobs: vec![WorkloadJob { id: 0, subtime: 0.0, walltime: 5.0, res: 1, profile: "seq".to_string() }],
            profiles,
        };

        let (profiles, _, _) = assemble(&[w]);
        match &profiles["w0::seq"] {
            Profile::Sequence { profiles: inner, .. } => assert_eq!(inner[0], "w0::d"),
            other => panic!("unexpected profile: {other:?}"),
        }
    }
}
