//! Generator contract.

use super::ModuleContext;
use crate::error::Result;
use std::ops::Range;

/// Produces successive row slices of the source dataset for this rank.
///
/// `next_slice` returns `None` once this rank's partition is drained; it
/// must keep returning `None` afterwards. A drained rank stays in the loop
/// with empty slices until every rank is drained, so collectives inside
/// stages remain aligned.
///
/// A generator may create the source dataset itself in `init` and emit
/// slices as data is produced (e.g. while converting an external format).
/// Source rows must then be reserved through the data manager's collective
/// [`reserve_rows`](crate::data::DataManager::reserve_rows) so offsets stay
/// globally consistent; the data manager never reserves on a generator's
/// behalf.
pub trait Generator: Send {
    /// The source dataset this generator drives.
    fn dset_name(&self) -> &str;

    /// Prepare the source dataset; called once before stage `init`.
    fn init(&mut self) -> Result<()> {
        Ok(())
    }

    /// The next row slice for this rank, or `None` when drained.
    fn next_slice(&mut self) -> Result<Option<Range<u64>>>;

    /// Clean up; called once after the run loop terminates globally.
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Creates generator instances from configuration.
pub trait GeneratorFactory: Send + Sync {
    /// The class name this factory answers to.
    fn classname(&self) -> &str;

    /// Instantiate a generator for `dset_name` from its `params` map.
    ///
    /// Unknown parameter keys must be ignored; required keys are validated
    /// here, before any file write.
    fn create(
        &self,
        ctx: &ModuleContext,
        dset_name: &str,
        params: &serde_yaml::Value,
    ) -> Result<Box<dyn Generator>>;
}
