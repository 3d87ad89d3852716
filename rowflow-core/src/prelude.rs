//! Convenience re-exports for workflow module authors.

pub use crate::comm::{Communicator, LocalComm, SharedComm};
pub use crate::config::Requirement;
pub use crate::core::{
    Cache, CacheValue, FlowManager, Generator, GeneratorFactory, ModuleContext, Resource,
    ResourceFactory, ResourceRegistry, Stage, StageFactory,
};
pub use crate::data::{
    DataManager, DerefOptions, IndexRect, MaskedRect, Rect, RefDirection, Selection,
};
pub use crate::error::{FlowError, Result};
pub use crate::registry::{builtin_registry, bind_workflow, ModuleRegistry, Tier};
pub use crate::run::RunOptions;
pub use crate::store::{Dtype, Field, Scalar};
