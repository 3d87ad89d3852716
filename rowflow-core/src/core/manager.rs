//! Top-level workflow orchestrator.
//!
//! Drives init → run loop → finish across the generator, stages, and
//! resources of a bound workflow. Termination is collective: the loop ends
//! on the first iteration in which every rank's generator reports empty.
//! Until then a drained rank keeps running stages with an empty slice so
//! that collectives issued inside stage code stay aligned across ranks.

use super::cache::{Cache, CacheValue, Producer};
use super::resource::ResourceRegistry;
use super::stage::Stage;
use super::Generator;
use crate::comm::Communicator;
use crate::config::Requirement;
use crate::data::{DataManager, IndexRect, MaskedRect, RowSource};
use crate::error::{FlowError, Result};
use crate::registry::BoundWorkflow;
use std::ops::Range;
use std::sync::Arc;
use tracing::{debug, info};

/// Per-rank lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Constructed, nothing initialized.
    Created,
    /// All components initialized.
    Initialized,
    /// Inside the run loop.
    Running,
    /// This rank's generator is drained; waiting for global termination.
    Drained,
    /// Finish sequence in progress.
    Finishing,
    /// File closed; terminal.
    Closed,
    /// Error path; a best-effort teardown is underway.
    Aborting,
}

/// A stage with its configured name and preload requirements.
pub struct BoundStage {
    /// Stage name from the `flow.stages` list.
    pub name: String,
    /// Parsed `requires` declarations.
    pub requires: Vec<Requirement>,
    /// The stage instance.
    pub stage: Box<dyn Stage>,
}

/// Runs a bound workflow on this rank.
pub struct FlowManager {
    data: Arc<DataManager>,
    comm: Arc<dyn Communicator>,
    generator: Box<dyn Generator>,
    stages: Vec<BoundStage>,
    resources: ResourceRegistry,
    drop_list: Vec<String>,
    state: RunState,
}

impl FlowManager {
    /// Assemble a manager from a bound workflow and the shared data manager.
    pub fn new(workflow: BoundWorkflow, data: Arc<DataManager>) -> Self {
        let comm = Arc::clone(data.comm());
        Self {
            data,
            comm,
            generator: workflow.generator,
            stages: workflow.stages,
            resources: workflow.resources,
            drop_list: workflow.drop_list,
            state: RunState::Created,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> RunState {
        self.state
    }

    /// The resource container.
    pub fn resources(&self) -> &ResourceRegistry {
        &self.resources
    }

    /// Initialize resources, then the generator, then stages in order.
    pub fn init(&mut self) -> Result<()> {
        let source = self.generator.dset_name().to_string();
        for (classname, resource) in self.resources.iter() {
            debug!(classname, "resource init");
            resource.init(&source)?;
        }
        self.generator.init()?;
        for bound in &mut self.stages {
            debug!(stage = %bound.name, "stage init");
            bound.stage.init(&source, &self.resources)?;
        }
        self.comm.barrier()?;
        self.state = RunState::Initialized;
        Ok(())
    }

    /// Execute the run loop until every rank is drained.
    pub fn run(&mut self) -> Result<()> {
        self.state = RunState::Running;
        let source = self.generator.dset_name().to_string();
        if self.comm.rank() == 0 {
            let chain: Vec<&str> = self.stages.iter().map(|s| s.name.as_str()).collect();
            info!(source = %source, stages = %chain.join(" -> "), "run loop");
        }

        // Stage i sees the requirements of every stage up to and including
        // itself, so later stages can read what earlier ones preloaded.
        let cumulative: Vec<Vec<Requirement>> = (0..self.stages.len())
            .map(|i| {
                self.stages[..=i]
                    .iter()
                    .flat_map(|s| s.requires.iter().cloned())
                    .collect()
            })
            .collect();

        let mut drained = false;
        let mut iteration = 0u64;
        loop {
            let slice = self.generator.next_slice()?;
            if drained && slice.is_some() {
                return Err(FlowError::Termination {
                    rank: self.comm.rank(),
                    cause: "generator yielded rows after reporting empty".to_string(),
                });
            }
            if slice.is_none() {
                drained = true;
                self.state = RunState::Drained;
            }
            let all_empty = self.comm.allreduce_min(drained as u64)? == 1;
            if all_empty {
                break;
            }

            let slice = slice.unwrap_or(0..0);
            let mut cache = Cache::new();
            for (i, bound) in self.stages.iter_mut().enumerate() {
                update_cache(&self.data, &mut cache, &source, &slice, &cumulative[i]);
                bound.stage.run(&source, slice.clone(), &mut cache)?;
            }
            iteration += 1;
            debug!(rank = self.comm.rank(), iteration, "iteration complete");
        }
        Ok(())
    }

    /// Finish components in forward order, then close the file.
    pub fn finish(&mut self) -> Result<()> {
        self.state = RunState::Finishing;
        let source = self.generator.dset_name().to_string();
        self.generator.finish()?;
        self.comm.barrier()?;
        for bound in &mut self.stages {
            bound.stage.finish(&source)?;
        }
        for (_, resource) in self.resources.iter() {
            resource.finish(&source)?;
        }
        self.data.finish(&self.drop_list)?;
        self.state = RunState::Closed;
        Ok(())
    }

    /// Run the full lifecycle, tearing down on error.
    ///
    /// The error path notifies the substrate so peers blocked in a
    /// collective fail instead of wedging, then closes the file in whatever
    /// state the last successful collective produced.
    pub fn execute(&mut self) -> Result<()> {
        let result = self
            .init()
            .and_then(|_| self.run())
            .and_then(|_| self.finish());
        if let Err(err) = result {
            self.state = RunState::Aborting;
            self.comm.abort();
            let _ = self.data.abort_close();
            self.state = RunState::Closed;
            return Err(err);
        }
        Ok(())
    }
}

/// Refresh the cache for one stage: evict entries no longer required and
/// register producers for the source slice and each missing requirement.
fn update_cache(
    data: &Arc<DataManager>,
    cache: &mut Cache,
    source: &str,
    slice: &Range<u64>,
    requirements: &[Requirement],
) {
    let mut keep: Vec<&str> = requirements.iter().map(|r| r.name.as_str()).collect();
    keep.push(source);
    cache.retain_names(&keep);

    if !cache.contains(source) {
        let dm = Arc::clone(data);
        let name = source.to_string();
        let sl = slice.clone();
        cache.insert(
            source,
            Box::new(move || Ok(CacheValue::Table(dm.load_slice(&name, sl.clone())?))),
        );
    }
    for req in requirements {
        if !cache.contains(&req.name) {
            cache.insert(req.name.clone(), requirement_producer(data, source, slice, req));
        }
    }
}

fn requirement_producer(
    data: &Arc<DataManager>,
    source: &str,
    slice: &Range<u64>,
    req: &Requirement,
) -> Producer {
    let dm = Arc::clone(data);
    let source = source.to_string();
    let slice = slice.clone();
    let req = req.clone();
    Box::new(move || load_requirement(&dm, &source, slice.clone(), &req))
}

/// Materialize one requirement from current on-disk state.
///
/// The join chain starts at the source when a direct `source -> path[0]`
/// reference exists; otherwise the path list itself is the chain. A single
/// path with no references falls back to a 1:1 row-aligned load, or, when
/// the target is still shorter than the slice (no references written yet),
/// to an empty join.
fn load_requirement(
    dm: &DataManager,
    source: &str,
    slice: Range<u64>,
    req: &Requirement,
) -> Result<CacheValue> {
    if req.path.is_empty() {
        return Err(FlowError::ConfigValue {
            field: format!("requires.{}", req.name),
            cause: "empty path".to_string(),
        });
    }
    debug!(
        name = %req.name,
        chain = %req.path.join(" -> "),
        index_only = req.index_only,
        "loading requirement"
    );

    let edges = |nodes: &[String]| -> Vec<(String, String)> {
        nodes
            .windows(2)
            .map(|w| (w[0].clone(), w[1].clone()))
            .collect()
    };
    let chain = if dm.ref_exists(source, &req.path[0]) {
        let mut nodes = vec![source.to_string()];
        nodes.extend(req.path.iter().cloned());
        Some(edges(&nodes))
    } else if req.path.len() > 1 {
        Some(edges(&req.path))
    } else {
        None
    };

    match chain {
        Some(chain) => {
            if req.index_only {
                Ok(CacheValue::Indices(
                    dm.deref_chain_range_indices(slice, &chain)?,
                ))
            } else {
                Ok(CacheValue::Rows(dm.deref_chain_range(slice, &chain)?))
            }
        }
        None => {
            let dset = dm.get_dset(&req.path[0])?;
            if req.index_only {
                return Ok(CacheValue::Indices(IndexRect::from_range(slice)));
            }
            if dset.rows() >= slice.end {
                Ok(CacheValue::Table(dset.read(slice)?))
            } else {
                let n = (slice.end - slice.start) as usize;
                Ok(CacheValue::Rows(MaskedRect::empty(dset.dtype(), n)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::LocalComm;
    use crate::store::{Dtype, Scalar};
    use tempfile::tempdir;

    struct CountingGenerator {
        dset: String,
        slices: Vec<Range<u64>>,
        cursor: usize,
    }

    impl Generator for CountingGenerator {
        fn dset_name(&self) -> &str {
            &self.dset
        }

        fn next_slice(&mut self) -> Result<Option<Range<u64>>> {
            let slice = self.slices.get(self.cursor).cloned();
            self.cursor += 1;
            Ok(slice)
        }
    }

    struct SumStage {
        seen: Arc<parking_lot::Mutex<Vec<i64>>>,
    }

    impl Stage for SumStage {
        fn run(
            &mut self,
            source_name: &str,
            _source_slice: Range<u64>,
            cache: &mut Cache,
        ) -> Result<()> {
            let rows = cache.get(source_name)?.as_table().unwrap();
            let mut seen = self.seen.lock();
            for i in 0..rows.len() {
                seen.push(rows.get_i64(i, "value").unwrap());
            }
            Ok(())
        }
    }

    #[test]
    fn loop_feeds_stages_until_drained() {
        let dir = tempdir().unwrap();
        let comm: Arc<dyn Communicator> = Arc::new(LocalComm::new());
        let dm = Arc::new(DataManager::open(dir.path().join("out.rfl"), comm).unwrap());
        let dtype = Dtype::scalar(Scalar::I64);
        dm.create_dset("events", &dtype, Some(4)).unwrap();
        let sl = dm.reserve_rows("events", 6).unwrap();
        dm.write_data("events", sl.start, &dtype.pack_i64(&[1, 2, 3, 4, 5, 6]))
            .unwrap();

        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let workflow = BoundWorkflow {
            source_name: "events".to_string(),
            generator: Box::new(CountingGenerator {
                dset: "events".to_string(),
                slices: vec![0..3, 3..6],
                cursor: 0,
            }),
            stages: vec![BoundStage {
                name: "sum".to_string(),
                requires: Vec::new(),
                stage: Box::new(SumStage {
                    seen: Arc::clone(&seen),
                }),
            }],
            resources: ResourceRegistry::new(),
            drop_list: Vec::new(),
        };
        let mut manager = FlowManager::new(workflow, dm);
        manager.execute().unwrap();
        assert_eq!(manager.state(), RunState::Closed);
        assert_eq!(*seen.lock(), vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn empty_generator_terminates_immediately() {
        let dir = tempdir().unwrap();
        let comm: Arc<dyn Communicator> = Arc::new(LocalComm::new());
        let dm = Arc::new(DataManager::open(dir.path().join("out.rfl"), comm).unwrap());
        let mut manager = FlowManager::new(
            BoundWorkflow {
                source_name: "events".to_string(),
                generator: Box::new(CountingGenerator {
                    dset: "events".to_string(),
                    slices: Vec::new(),
                    cursor: 0,
                }),
                stages: Vec::new(),
                resources: ResourceRegistry::new(),
                drop_list: Vec::new(),
            },
            dm,
        );
        manager.init().unwrap();
        manager.run().unwrap();
        assert_eq!(manager.state(), RunState::Drained);
    }
}
