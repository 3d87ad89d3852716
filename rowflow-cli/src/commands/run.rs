//! `rowflow run` - execute a workflow.

use rowflow_core::comm::{Communicator, LocalComm};
use rowflow_core::registry::builtin_registry;
use rowflow_core::run::{run, RunOptions};
use rowflow_core::Result;
use std::path::PathBuf;
use std::sync::Arc;

pub fn execute(
    config: PathBuf,
    output: PathBuf,
    input: Option<PathBuf>,
    start: Option<u64>,
    end: Option<u64>,
) -> Result<()> {
    // Without a parallel substrate this process is rank 0 of size 1; a
    // substrate-backed front end would build its communicator here instead.
    let comm: Arc<dyn Communicator> = Arc::new(LocalComm::new());
    let span = tracing::info_span!("flow", rank = comm.rank());
    let _guard = span.enter();

    run(RunOptions {
        config,
        output,
        input,
        start,
        end,
        comm,
        registry: builtin_registry(),
    })
}
