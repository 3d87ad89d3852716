//! Default dataset loop generator.

use crate::core::{Generator, GeneratorFactory, ModuleContext};
use crate::data::DataManager;
use crate::error::{FlowError, Result};
use serde::Deserialize;
use std::ops::Range;
use std::sync::Arc;
use tracing::debug;

/// Sweeps an existing source dataset in contiguous chunks.
///
/// `[start, end)` is split into `chunk_size` chunks round-robined across
/// ranks: rank `r` takes chunks `r, r + size, r + 2·size, ...` in order.
/// The chunk size defaults to the source dataset's storage chunk.
///
/// Bound automatically when `flow.source` names a dataset path; a manual
/// block pins the chunk size:
///
/// ```yaml
/// flow:
///   source: input
///   stages: [...]
///
/// input:
///   classname: DatasetLoopGenerator
///   dset_name: raw/packets
///   params:
///     chunk_size: 2048
/// ```
pub struct DatasetLoopGenerator {
    data_manager: Arc<DataManager>,
    dset_name: String,
    chunk_size: Option<u64>,
    start_position: Option<u64>,
    end_position: Option<u64>,
    slices: Vec<Range<u64>>,
    cursor: usize,
}

impl Generator for DatasetLoopGenerator {
    fn dset_name(&self) -> &str {
        &self.dset_name
    }

    fn init(&mut self) -> Result<()> {
        let dset = self.data_manager.get_dset(&self.dset_name)?;
        let rows = dset.rows();
        let chunk = self.chunk_size.unwrap_or_else(|| dset.chunk_rows());
        if chunk == 0 {
            return Err(FlowError::ConfigValue {
                field: "chunk_size".to_string(),
                cause: "must be positive".to_string(),
            });
        }
        let start = self.start_position.unwrap_or(0).min(rows);
        let end = self.end_position.unwrap_or(rows).min(rows);

        let rank = self.data_manager.rank() as u64;
        let size = self.data_manager.size() as u64;
        let mut slices = Vec::new();
        let mut index = 0u64;
        let mut pos = start;
        while pos < end {
            let stop = (pos + chunk).min(end);
            if index % size == rank {
                slices.push(pos..stop);
            }
            index += 1;
            pos = stop;
        }
        debug!(
            rank = self.data_manager.rank(),
            chunks = slices.len(),
            chunk,
            "loop partition ready"
        );
        self.slices = slices;

        self.data_manager.set_attrs(
            &self.dset_name,
            [
                (
                    "classname".to_string(),
                    serde_json::json!("DatasetLoopGenerator"),
                ),
                ("chunk_size".to_string(), serde_json::json!(chunk)),
            ],
        )
    }

    fn next_slice(&mut self) -> Result<Option<Range<u64>>> {
        let slice = self.slices.get(self.cursor).cloned();
        self.cursor += 1;
        Ok(slice)
    }
}

#[derive(Deserialize, Default)]
struct LoopParams {
    #[serde(default)]
    chunk_size: Option<ChunkSpec>,
}

/// Chunk size: a row count, or `auto` for the dataset's storage chunk.
#[derive(Deserialize)]
#[serde(untagged)]
enum ChunkSpec {
    Rows(u64),
    Named(String),
}

/// Factory for [`DatasetLoopGenerator`].
pub struct DatasetLoopGeneratorFactory;

impl GeneratorFactory for DatasetLoopGeneratorFactory {
    fn classname(&self) -> &str {
        "DatasetLoopGenerator"
    }

    fn create(
        &self,
        ctx: &ModuleContext,
        dset_name: &str,
        params: &serde_yaml::Value,
    ) -> Result<Box<dyn Generator>> {
        let params: LoopParams = if params.is_null() {
            LoopParams::default()
        } else {
            serde_yaml::from_value(params.clone()).map_err(|e| FlowError::ConfigValue {
                field: "params".to_string(),
                cause: e.to_string(),
            })?
        };
        let chunk_size = match params.chunk_size {
            None => None,
            Some(ChunkSpec::Rows(n)) => Some(n),
            Some(ChunkSpec::Named(name)) if name == "auto" => None,
            Some(ChunkSpec::Named(name)) => {
                return Err(FlowError::ConfigValue {
                    field: "chunk_size".to_string(),
                    cause: format!("expected a row count or 'auto', got '{}'", name),
                });
            }
        };
        Ok(Box::new(DatasetLoopGenerator {
            data_manager: Arc::clone(&ctx.data_manager),
            dset_name: dset_name.to_string(),
            chunk_size,
            start_position: ctx.start_position,
            end_position: ctx.end_position,
            slices: Vec::new(),
            cursor: 0,
        }))
    }
}
