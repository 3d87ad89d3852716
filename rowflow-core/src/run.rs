//! Workflow entry points shared by the CLI and alternate front-ends.

use crate::comm::Communicator;
use crate::config::load_config;
use crate::core::{FlowManager, ModuleContext};
use crate::data::DataManager;
use crate::error::{FlowError, Result};
use crate::registry::{bind_workflow, check_config, ModuleRegistry};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Everything needed to execute one workflow.
pub struct RunOptions {
    /// Path to the configuration document.
    pub config: PathBuf,
    /// Path of the output container.
    pub output: PathBuf,
    /// Optional input container copied onto the output before the loop.
    pub input: Option<PathBuf>,
    /// Optional loop start index.
    pub start: Option<u64>,
    /// Optional loop end index.
    pub end: Option<u64>,
    /// The substrate communicator for this rank.
    pub comm: Arc<dyn Communicator>,
    /// Factory registry used for module discovery.
    pub registry: ModuleRegistry,
}

/// Execute a workflow: bind the configuration, open the output, run the
/// loop, finish.
///
/// When an input file is given, rank 0 copies it onto the output path
/// before the container is opened and all ranks synchronize on the copy.
pub fn run(opts: RunOptions) -> Result<()> {
    let config = load_config(&opts.config)?;
    // Resolve structure and class names before the output file exists.
    check_config(&config, &opts.registry)?;

    if opts.comm.rank() == 0 {
        info!(output = %opts.output.display(), "workflow starting");
        if let Some(input) = &opts.input {
            info!(input = %input.display(), "input file");
        }
        info!(start = ?opts.start, end = ?opts.end, ranks = opts.comm.size(), "loop bounds");
    }

    if let Some(input) = &opts.input {
        if input != &opts.output {
            if opts.comm.rank() == 0 {
                std::fs::copy(input, &opts.output).map_err(|e| FlowError::io(input, &e))?;
            }
            opts.comm.barrier()?;
        }
    }

    let data_manager = Arc::new(DataManager::open(&opts.output, Arc::clone(&opts.comm))?);
    let ctx = ModuleContext {
        data_manager: Arc::clone(&data_manager),
        comm: Arc::clone(&opts.comm),
        input_filename: opts.input.clone(),
        start_position: opts.start,
        end_position: opts.end,
    };
    let workflow = bind_workflow(&config, &opts.registry, &ctx)?;
    let mut manager = FlowManager::new(workflow, data_manager);
    manager.execute()
}

/// Parse and structurally check a configuration without running it.
pub fn validate(config_path: &Path, registry: &ModuleRegistry) -> Result<()> {
    let config = load_config(config_path)?;
    check_config(&config, registry)
}
