//! Module discovery and workflow binding.
//!
//! User classes are found through an explicit registry instead of directory
//! scanning: plugin code registers factories under a stable class name at
//! load time. The three-tier resolution order is preserved as registration
//! tiers (working directory, sibling modules directory, built-ins) and
//! lookup takes the first factory found scanning the tiers in that order,
//! so a local class shadows a shipped one of the same name.

use crate::config::{RequireSpec, WorkflowConfig};
use crate::core::{
    BoundStage, Generator, GeneratorFactory, ModuleContext, ResourceFactory, ResourceRegistry,
    StageFactory,
};
use crate::error::{FlowError, Result};
use std::sync::Arc;
use tracing::info;

/// Class name bound when `flow.source` is a plain dataset path.
pub const DEFAULT_GENERATOR: &str = "DatasetLoopGenerator";

/// Registration tier, scanned in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    /// Classes registered by the invoking application itself.
    WorkingDir,
    /// Classes from a sibling plugin collection.
    ModulesDir,
    /// Classes shipped with rowflow.
    Builtin,
}

const TIER_ORDER: [Tier; 3] = [Tier::WorkingDir, Tier::ModulesDir, Tier::Builtin];

/// Factory registry for generators, stages, and resources.
#[derive(Default)]
pub struct ModuleRegistry {
    generators: Vec<(Tier, Arc<dyn GeneratorFactory>)>,
    stages: Vec<(Tier, Arc<dyn StageFactory>)>,
    resources: Vec<(Tier, Arc<dyn ResourceFactory>)>,
}

impl ModuleRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a generator factory under a tier.
    pub fn register_generator(&mut self, tier: Tier, factory: Arc<dyn GeneratorFactory>) {
        self.generators.push((tier, factory));
    }

    /// Register a stage factory under a tier.
    pub fn register_stage(&mut self, tier: Tier, factory: Arc<dyn StageFactory>) {
        self.stages.push((tier, factory));
    }

    /// Register a resource factory under a tier.
    pub fn register_resource(&mut self, tier: Tier, factory: Arc<dyn ResourceFactory>) {
        self.resources.push((tier, factory));
    }

    /// Resolve a generator class name; first tier hit wins.
    pub fn find_generator(&self, classname: &str) -> Option<Arc<dyn GeneratorFactory>> {
        TIER_ORDER.iter().find_map(|tier| {
            self.generators
                .iter()
                .find(|(t, f)| t == tier && f.classname() == classname)
                .map(|(_, f)| Arc::clone(f))
        })
    }

    /// Resolve a stage class name; first tier hit wins.
    pub fn find_stage(&self, classname: &str) -> Option<Arc<dyn StageFactory>> {
        TIER_ORDER.iter().find_map(|tier| {
            self.stages
                .iter()
                .find(|(t, f)| t == tier && f.classname() == classname)
                .map(|(_, f)| Arc::clone(f))
        })
    }

    /// Resolve a resource class name; first tier hit wins.
    pub fn find_resource(&self, classname: &str) -> Option<Arc<dyn ResourceFactory>> {
        TIER_ORDER.iter().find_map(|tier| {
            self.resources
                .iter()
                .find(|(t, f)| t == tier && f.classname() == classname)
                .map(|(_, f)| Arc::clone(f))
        })
    }
}

/// Registry pre-populated with the shipped modules.
pub fn builtin_registry() -> ModuleRegistry {
    let mut registry = ModuleRegistry::new();
    registry.register_generator(
        Tier::Builtin,
        Arc::new(crate::modules::DatasetLoopGeneratorFactory),
    );
    registry
}

/// A fully bound workflow, ready to hand to the flow manager.
pub struct BoundWorkflow {
    /// The source dataset driven by the generator.
    pub source_name: String,
    /// The generator instance.
    pub generator: Box<dyn Generator>,
    /// Stage instances in configuration order.
    pub stages: Vec<BoundStage>,
    /// Resource singletons in configuration order.
    pub resources: ResourceRegistry,
    /// Dataset paths deleted at teardown.
    pub drop_list: Vec<String>,
}

/// Instantiate the generator, stages, and resources of a configuration.
///
/// All configuration and discovery errors surface here, before any file
/// write. When `flow.source` has no matching block, it is taken as a
/// dataset path and the default loop generator is bound.
pub fn bind_workflow(
    config: &WorkflowConfig,
    registry: &ModuleRegistry,
    ctx: &ModuleContext,
) -> Result<BoundWorkflow> {
    config.validate()?;

    let (classname, dset_name, gen_params) = match config.blocks.get(&config.flow.source) {
        Some(block) => {
            let dset = block.dset_name.clone().ok_or_else(|| FlowError::ConfigValue {
                field: format!("{}.dset_name", config.flow.source),
                cause: "generator block needs a source dataset".to_string(),
            })?;
            (block.classname.clone(), dset, block.params.clone())
        }
        None => {
            if ctx.comm.rank() == 0 {
                info!(
                    source = %config.flow.source,
                    "no generator block found, using default loop behavior"
                );
            }
            (
                DEFAULT_GENERATOR.to_string(),
                config.flow.source.clone(),
                serde_yaml::Value::Null,
            )
        }
    };
    let factory = registry
        .find_generator(&classname)
        .ok_or(FlowError::UnknownClass {
            classname: classname.clone(),
        })?;
    let generator = factory.create(ctx, &dset_name, &gen_params)?;

    let mut stages = Vec::with_capacity(config.flow.stages.len());
    for name in &config.flow.stages {
        let block = config.blocks.get(name).expect("validated above");
        let factory = registry
            .find_stage(&block.classname)
            .ok_or(FlowError::UnknownClass {
                classname: block.classname.clone(),
            })?;
        let requires: Vec<_> = block.requires.iter().map(RequireSpec::to_requirement).collect();
        let stage = factory.create(ctx, name, &requires, &block.params)?;
        stages.push(BoundStage {
            name: name.clone(),
            requires,
            stage,
        });
    }

    let mut resources = ResourceRegistry::new();
    for block in &config.resources {
        let factory =
            registry
                .find_resource(&block.classname)
                .ok_or(FlowError::UnknownClass {
                    classname: block.classname.clone(),
                })?;
        let resource = factory.create(ctx, &block.params)?;
        resources.insert(block.classname.clone(), resource)?;
    }

    Ok(BoundWorkflow {
        source_name: dset_name,
        generator,
        stages,
        resources,
        drop_list: config.flow.drop.clone(),
    })
}

/// Resolve every class a configuration names, without instantiating.
///
/// Used by `rowflow validate` to report discovery problems up front.
pub fn check_config(config: &WorkflowConfig, registry: &ModuleRegistry) -> Result<()> {
    config.validate()?;
    if let Some(block) = config.blocks.get(&config.flow.source) {
        if block.dset_name.is_none() {
            return Err(FlowError::ConfigValue {
                field: format!("{}.dset_name", config.flow.source),
                cause: "generator block needs a source dataset".to_string(),
            });
        }
        registry
            .find_generator(&block.classname)
            .ok_or(FlowError::UnknownClass {
                classname: block.classname.clone(),
            })?;
    }
    for name in &config.flow.stages {
        let block = config.blocks.get(name).expect("validated above");
        registry
            .find_stage(&block.classname)
            .ok_or(FlowError::UnknownClass {
                classname: block.classname.clone(),
            })?;
    }
    for block in &config.resources {
        registry
            .find_resource(&block.classname)
            .ok_or(FlowError::UnknownClass {
                classname: block.classname.clone(),
            })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Stage;

    struct NamedStageFactory {
        classname: &'static str,
    }

    impl StageFactory for NamedStageFactory {
        fn classname(&self) -> &str {
            self.classname
        }

        fn create(
            &self,
            _ctx: &ModuleContext,
            _name: &str,
            _requires: &[crate::config::Requirement],
            _params: &serde_yaml::Value,
        ) -> Result<Box<dyn Stage>> {
            unimplemented!("not needed for lookup tests")
        }
    }

    #[test]
    fn lookup_scans_tiers_in_order() {
        let builtin: Arc<dyn StageFactory> = Arc::new(NamedStageFactory { classname: "Calib" });
        let local: Arc<dyn StageFactory> = Arc::new(NamedStageFactory { classname: "Calib" });
        let mut registry = ModuleRegistry::new();
        registry.register_stage(Tier::Builtin, Arc::clone(&builtin));
        registry.register_stage(Tier::ModulesDir, Arc::clone(&local));
        let found = registry.find_stage("Calib").unwrap();
        // the modules-directory registration shadows the builtin
        assert!(Arc::ptr_eq(&found, &local));
        assert!(!Arc::ptr_eq(&found, &builtin));
    }

    #[test]
    fn unknown_class_is_none() {
        let registry = ModuleRegistry::new();
        assert!(registry.find_stage("Nope").is_none());
        assert!(registry.find_generator("Nope").is_none());
        assert!(registry.find_resource("Nope").is_none());
    }

    #[test]
    fn builtin_registry_has_loop_generator() {
        let registry = builtin_registry();
        assert!(registry.find_generator(DEFAULT_GENERATOR).is_some());
    }
}
