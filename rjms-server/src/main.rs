//! Process entry point: CLI parsing (§6, §10.3), logging setup (§10.4) and
//! bootstrap — loading the platform/workload files, building the machine
//! registry and job table, then handing off to either `batexec` (§11.1) or the
//! socket-driven `Server` loop (C1).
//!
//! Grounded on `bpmn-lite-server/src/main.rs`'s shape (`tracing_subscriber::fmt()`
//! init, then a single bootstrap function that picks a backend and runs it) —
//! generalized here from "pick a process store" to "pick batexec vs. socket
//! transport."

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use clap::{ArgAction, Parser};
use tokio::net::UnixListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use rjms_core::batexec;
use rjms_core::config::SimConfig;
use rjms_core::machine::MachineRegistry;
use rjms_core::platform::PlatformDescription;
use rjms_core::protocol::WireFormat;
use rjms_core::submitter;
use rjms_core::tracer::{CsvTracer, NullTracer, ScheduleTracer};
use rjms_core::workload::{self, WorkloadFile};
use rjms_core::{SchedulerTransport, Server, SimError};

#[derive(Parser, Debug)]
#[command(name = "rjms", about = "HPC batch-scheduling simulator core", disable_help_flag = true)]
struct Cli {
    /// Platform description file.
    #[arg(short = 'p', long = "platform")]
    platform: PathBuf,

    /// Workload file; may be repeated.
    #[arg(short = 'w', long = "workload")]
    workload: Vec<PathBuf>,

    /// Workflow file with optional `:start_time` suffix; may be repeated.
    #[arg(short = 'W', long = "workflow")]
    workflow: Vec<String>,

    /// Scheduler socket path.
    #[arg(short = 's', long = "socket", default_value = "/tmp/bat_socket")]
    socket: PathBuf,

    /// Master host name.
    #[arg(short = 'm', long = "master-host", default_value = "master_host")]
    master_host: String,

    /// Output file prefix.
    #[arg(short = 'e', long = "output-prefix", default_value = "out")]
    output_prefix: String,

    /// Enable energy accounting.
    #[arg(short = 'E', long = "energy")]
    energy: bool,

    /// Allow space sharing.
    #[arg(short = 'h', long = "space-sharing")]
    space_sharing: bool,

    /// Limit compute machines to N (-1 = all).
    #[arg(short = 'l', long = "limit", default_value_t = -1)]
    limit: i64,

    /// Also limit by workload-declared resource count; take the min.
    #[arg(short = 'L', long = "limit-by-workload")]
    limit_by_workload: bool,

    /// Suppress all but error-level logging.
    #[arg(short = 'q', long = "quiet")]
    quiet: bool,

    /// Verbosity level 0 (error) through 4 (trace); default is 2 (info).
    #[arg(short = 'v', long = "verbosity")]
    verbosity: Option<u8>,

    /// Disable schedule tracing.
    #[arg(short = 'T', long = "no-schedule-trace")]
    no_schedule_trace: bool,

    /// Disable machine-state tracing.
    #[arg(short = 'U', long = "no-machine-state-trace")]
    no_machine_state_trace: bool,

    /// Run every job sequentially, in-process, with no external scheduler.
    #[arg(short = 'c', long = "batexec")]
    batexec: bool,

    /// Use the legacy colon/pipe wire form instead of the default JSON envelope.
    #[arg(long = "legacy-protocol")]
    legacy_protocol: bool,

    #[arg(long = "help", action = ArgAction::Help)]
    help: Option<bool>,
}

fn main() {
    let cli = Cli::parse();
    init_tracing(&cli);

    let runtime = tokio::runtime::Runtime::new().expect("failed to start tokio runtime");
    if let Err(e) = runtime.block_on(run(cli)) {
        error!("rjms: {e}");
        std::process::exit(1);
    }
}

fn init_tracing(cli: &Cli) {
    let directive = if cli.quiet {
        "error"
    } else {
        match cli.verbosity {
            Some(0) => "error",
            Some(1) => "warn",
            Some(2) => "info",
            Some(3) => "debug",
            Some(_) => "trace",
            None => "info",
        }
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run(cli: Cli) -> Result<(), SimError> {
    if !cli.workflow.is_empty() {
        return Err(SimError::configuration(
            "workflow (-W) DAG execution is out of scope of this core; use -w for flat workload files",
        ));
    }

    let wire_format = if cli.legacy_protocol { WireFormat::Legacy } else { WireFormat::Json };

    let config = SimConfig {
        platform_file: cli.platform.clone(),
        workload_files: cli.workload.clone(),
        workflow_files: Vec::new(),
        socket_path: cli.socket.clone(),
        master_host: cli.master_host.clone(),
        output_prefix: cli.output_prefix.clone(),
        energy_enabled: cli.energy,
        space_sharing: cli.space_sharing,
        machine_limit: if cli.limit < 0 { None } else { Some(cli.limit as usize) },
        limit_by_workload: cli.limit_by_workload,
        schedule_tracing: !cli.no_schedule_trace,
        machine_state_tracing: !cli.no_machine_state_trace,
        batexec: cli.batexec,
        wire_format,
    };
    config.validate()?;

    let platform = PlatformDescription::load(&config.platform_file)?;
    let pstate_catalog = platform.pstate_catalog();
    let transition_seconds: HashMap<u32, f64> =
        platform.pstates.iter().map(|(pstate, desc)| (*pstate, desc.transition_seconds)).collect();

    let mut loaded = Vec::with_capacity(config.workload_files.len());
    for (index, path) in config.workload_files.iter().enumerate() {
        loaded.push(WorkloadFile::load(path, workload_name(path, index))?);
    }

    let (profiles, jobs, per_submitter) = workload::assemble(&loaded);

    let declared_by_workload = loaded.iter().flat_map(|w| w.jobs.iter()).map(|j| j.res as usize).max();
    let final_limit = match (config.machine_limit, config.limit_by_workload, declared_by_workload) {
        (Some(cli_limit), true, Some(declared)) => Some(cli_limit.min(declared)),
        (Some(cli_limit), false, _) => Some(cli_limit),
        (None, true, declared) => declared,
        (None, false, _) => None,
    };

    let registry =
        MachineRegistry::create(&platform.hosts, &config.master_host, pstate_catalog, final_limit)?;

    let out_dir = std::env::current_dir()
        .map_err(|e| SimError::configuration(format!("cannot resolve output directory: {e}")))?;
    let tracer: Box<dyn ScheduleTracer> = if config.schedule_tracing || config.machine_state_tracing {
        Box::new(
            CsvTracer::create(&out_dir, &config.output_prefix)
                .map_err(|e| SimError::configuration(format!("cannot create output files: {e}")))?,
        )
    } else {
        Box::new(NullTracer)
    };

    if config.batexec {
        let mut tracer = tracer;
        let finished = batexec::run_batexec(registry, profiles, jobs, tracer.as_mut()).await?;
        info!(jobs = finished.len(), "batexec run complete");
        return Ok(());
    }

    if config.socket_path.exists() {
        fs::remove_file(&config.socket_path).map_err(|e| {
            SimError::configuration(format!(
                "cannot remove stale socket '{}': {e}",
                config.socket_path.display()
            ))
        })?;
    }
    let listener = UnixListener::bind(&config.socket_path).map_err(|e| {
        SimError::configuration(format!("cannot bind socket '{}': {e}", config.socket_path.display()))
    })?;
    info!(socket = %config.socket_path.display(), "waiting for scheduler connection");
    let (stream, _) = listener
        .accept()
        .await
        .map_err(|e| SimError::kernel_error(format!("failed to accept scheduler connection: {e}")))?;
    info!("scheduler connected");

    let transport = SchedulerTransport::new(stream, wire_format);
    let mut server = Server::new(
        registry,
        profiles,
        config.space_sharing,
        config.energy_enabled,
        tracer,
        transition_seconds,
        transport,
    );

    for job in jobs {
        server.register_job(job);
    }

    let mailbox = server.mailbox();
    let clock = server.clock().clone();
    for (name, scheduled) in per_submitter {
        tokio::spawn(submitter::run_submitter(clock.clone(), mailbox.clone(), name, scheduled, false));
    }

    server.run().await
}

/// Derives a short, unique workload name from a file path (§6 "each gets a
/// unique short name"), falling back to a positional name when the file stem is
/// missing.
fn workload_name(path: &Path, index: usize) -> String {
    path.file_stem().and_then(|s| s.to_str()).map(str::to_string).unwrap_or_else(|| format!("w{index}"))
}
