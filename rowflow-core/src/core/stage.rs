//! Stage contract.

use super::{Cache, ModuleContext, ResourceRegistry};
use crate::config::Requirement;
use crate::error::Result;
use std::ops::Range;

/// A processing stage, instantiated once per rank in configuration order.
///
/// Stages read their declared requirements from the per-iteration cache and
/// write new rows and references through the data manager injected at
/// construction. Stage code never detects the substrate: a slice may be
/// empty on a drained rank, and any data-manager collectives it issues then
/// participate with zero-sized writes.
///
/// Recoverable conditions are handled inside the stage; an error returned
/// here aborts the workflow.
pub trait Stage: Send {
    /// Create datasets and record metadata; called once before the loop.
    fn init(&mut self, source_name: &str, resources: &ResourceRegistry) -> Result<()> {
        let _ = (source_name, resources);
        Ok(())
    }

    /// Process one source slice.
    fn run(&mut self, source_name: &str, source_slice: Range<u64>, cache: &mut Cache)
        -> Result<()>;

    /// Clean up; called once after the loop terminates globally.
    fn finish(&mut self, source_name: &str) -> Result<()> {
        let _ = source_name;
        Ok(())
    }
}

/// Creates stage instances from configuration.
pub trait StageFactory: Send + Sync {
    /// The class name this factory answers to.
    fn classname(&self) -> &str;

    /// Instantiate the stage named `name` from its `params` map.
    ///
    /// `requires` is the parsed requirement list the manager will preload
    /// for this stage. Unknown parameter keys must be ignored; required
    /// keys are validated here, before any file write.
    fn create(
        &self,
        ctx: &ModuleContext,
        name: &str,
        requires: &[Requirement],
        params: &serde_yaml::Value,
    ) -> Result<Box<dyn Stage>>;
}
