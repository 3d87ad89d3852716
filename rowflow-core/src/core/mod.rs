//! Workflow components: generator, stages, resources, cache, and the
//! top-level manager that drives them.

mod cache;
mod generator;
mod manager;
mod resource;
mod stage;

pub use cache::{Cache, CacheValue, Producer};
pub use generator::{Generator, GeneratorFactory};
pub use manager::{BoundStage, FlowManager, RunState};
pub use resource::{Resource, ResourceFactory, ResourceRegistry};
pub use stage::{Stage, StageFactory};

use crate::comm::Communicator;
use crate::data::DataManager;
use std::path::PathBuf;
use std::sync::Arc;

/// Construction-time context handed to every module factory.
///
/// Mirrors what user classes receive at instantiation: the data manager,
/// the substrate communicator, and the loop bounds from the command line.
#[derive(Clone)]
pub struct ModuleContext {
    /// Shared data manager for the output container.
    pub data_manager: Arc<DataManager>,
    /// The substrate communicator.
    pub comm: Arc<dyn Communicator>,
    /// Optional input file handed to the generator.
    pub input_filename: Option<PathBuf>,
    /// Optional loop start index.
    pub start_position: Option<u64>,
    /// Optional loop end index.
    pub end_position: Option<u64>,
}
