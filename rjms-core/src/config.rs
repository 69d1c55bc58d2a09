//! `SimConfig`: the validated, in-memory form of the CLI surface (§6, §10.3).
//!
//! This struct is deliberately `clap`-free — deriving the CLI arguments is the
//! binary crate's job (`rjms-server`), mirroring the teacher's own split of a
//! thin argument-parsing layer in the server binary from plain data in the core.

use std::path::PathBuf;

use crate::error::SimError;
use crate::protocol::WireFormat;

#[derive(Debug, Clone)]
pub struct SimConfig {
    pub platform_file: PathBuf,
    pub workload_files: Vec<PathBuf>,
    pub workflow_files: Vec<(PathBuf, Option<f64>)>,
    pub socket_path: PathBuf,
    pub master_host: String,
    pub output_prefix: String,
    pub energy_enabled: bool,
    pub space_sharing: bool,
    pub machine_limit: Option<usize>,
    pub limit_by_workload: bool,
    pub schedule_tracing: bool,
    pub machine_state_tracing: bool,
    pub batexec: bool,
    pub wire_format: WireFormat,
}

impl SimConfig {
    /// Startup validation (§7 item 1): file existence and basic shape. Deeper
    /// checks (profile references, master host presence) happen once the
    /// platform/workload files are actually parsed.
    pub fn validate(&self) -> Result<(), SimError> {
        if !self.platform_file.exists() {
            return Err(SimError::configuration(format!(
                "platform file '{}' does not exist",
                self.platform_file.display()
            )));
        }
        for w in &self.workload_files {
            if !w.exists() {
                return Err(SimError::configuration(format!("workload file '{}' does not exist", w.display())));
            }
        }
        for (w, _) in &self.workflow_files {
            if !w.exists() {
                return Err(SimError::configuration(format!("workflow file '{}' does not exist", w.display())));
            }
        }
        if self.batexec && self.space_sharing {
            return Err(SimError::configuration("batexec mode never enables space sharing".into()));
        }
        Ok(())
    }
}
