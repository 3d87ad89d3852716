//! Modules shipped with rowflow, registered under the builtin tier.

mod loop_generator;

pub use loop_generator::{DatasetLoopGenerator, DatasetLoopGeneratorFactory};
