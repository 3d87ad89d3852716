//! Workflow configuration document.
//!
//! The document is a YAML mapping with two well-known sections (`flow`,
//! `resources`) plus one block per named generator or stage. Unknown keys
//! are ignored everywhere so configurations stay forward compatible. An
//! `!include <path>` tag splices another document in place, resolved
//! relative to the current working directory, with inclusion loops
//! detected.
//!
//! ```yaml
//! flow:
//!   source: raw/packets
//!   stages: [calib, cluster]
//!   drop: [tmp/work]
//!
//! resources:
//!   - classname: Geometry
//!     params: !include geometry.yaml
//!
//! calib:
//!   classname: CalibStage
//!   requires: [raw/packets]
//!   params:
//!     gain: 0.25
//!
//! cluster:
//!   classname: ClusterStage
//!   requires:
//!     - name: calib_hits
//!       path: [calib/hits]
//!     - name: packet_idx
//!       path: raw/packets
//!       index_only: true
//! ```

use crate::error::{FlowError, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// The `flow` section: source, stage order, and drop list.
#[derive(Debug, Clone, Deserialize)]
pub struct FlowSection {
    /// Dataset path, or the name of a generator block.
    pub source: String,
    /// Ordered list of stage block names to run per iteration.
    #[serde(default)]
    pub stages: Vec<String>,
    /// Dataset paths deleted at workflow teardown.
    #[serde(default)]
    pub drop: Vec<String>,
}

/// One entry of the `resources` list.
#[derive(Debug, Clone, Deserialize)]
pub struct ResourceBlock {
    /// User class resolved through module discovery.
    pub classname: String,
    /// Free-form constructor parameters.
    #[serde(default)]
    pub params: serde_yaml::Value,
}

/// A named generator or stage block.
#[derive(Debug, Clone, Deserialize)]
pub struct ModuleBlock {
    /// User class resolved through module discovery.
    pub classname: String,
    /// Source dataset driven by a generator block.
    #[serde(default)]
    pub dset_name: Option<String>,
    /// Free-form constructor parameters.
    #[serde(default)]
    pub params: serde_yaml::Value,
    /// Joins to preload into the cache before the stage runs.
    #[serde(default)]
    pub requires: Vec<RequireSpec>,
}

/// A requirement declaration as written in configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RequireSpec {
    /// Bare path: a one-hop join cached under the path itself.
    Path(String),
    /// Object form with explicit name, path or chain, and index flag.
    Detailed {
        /// Cache entry name.
        name: String,
        /// Path or multi-hop chain; defaults to `[name]`.
        #[serde(default)]
        path: Option<PathSpec>,
        /// Cache indices instead of rows.
        #[serde(default)]
        index_only: bool,
    },
}

/// A single path or a multi-hop chain.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PathSpec {
    /// One dataset path.
    Single(String),
    /// A chain of dataset paths traversed in order.
    Chain(Vec<String>),
}

/// A normalized requirement: cache name, chain, and index flag.
#[derive(Debug, Clone)]
pub struct Requirement {
    /// Cache entry name.
    pub name: String,
    /// Dataset paths traversed from the source.
    pub path: Vec<String>,
    /// Cache indices instead of rows.
    pub index_only: bool,
}

impl RequireSpec {
    /// Normalize into a [`Requirement`].
    pub fn to_requirement(&self) -> Requirement {
        match self {
            Self::Path(path) => Requirement {
                name: path.clone(),
                path: vec![path.clone()],
                index_only: false,
            },
            Self::Detailed {
                name,
                path,
                index_only,
            } => {
                let path = match path {
                    None => vec![name.clone()],
                    Some(PathSpec::Single(p)) => vec![p.clone()],
                    Some(PathSpec::Chain(c)) => c.clone(),
                };
                Requirement {
                    name: name.clone(),
                    path,
                    index_only: *index_only,
                }
            }
        }
    }
}

/// The parsed top-level configuration.
#[derive(Debug, Clone)]
pub struct WorkflowConfig {
    /// The `flow` section.
    pub flow: FlowSection,
    /// The `resources` list.
    pub resources: Vec<ResourceBlock>,
    /// Named generator/stage blocks keyed by block name.
    pub blocks: BTreeMap<String, ModuleBlock>,
}

impl WorkflowConfig {
    /// Check structural consistency: every configured stage has a block.
    pub fn validate(&self) -> Result<()> {
        if self.flow.source.is_empty() {
            return Err(FlowError::ConfigValue {
                field: "flow.source".to_string(),
                cause: "must not be empty".to_string(),
            });
        }
        for stage in &self.flow.stages {
            if !self.blocks.contains_key(stage) {
                return Err(FlowError::ConfigValue {
                    field: format!("flow.stages.{}", stage),
                    cause: "no matching top-level block".to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Load and parse a configuration file.
///
/// `!include` paths are resolved relative to the current working directory.
pub fn load_config(path: &Path) -> Result<WorkflowConfig> {
    let base = std::env::current_dir().map_err(|e| FlowError::io(path, &e))?;
    load_config_with_base(path, &base)
}

/// Load with an explicit base directory for `!include` resolution.
pub fn load_config_with_base(path: &Path, base: &Path) -> Result<WorkflowConfig> {
    let text = std::fs::read_to_string(path).map_err(|e| FlowError::ConfigParse {
        path: path.to_path_buf(),
        cause: e.to_string(),
    })?;
    let value: serde_yaml::Value =
        serde_yaml::from_str(&text).map_err(|e| FlowError::ConfigParse {
            path: path.to_path_buf(),
            cause: e.to_string(),
        })?;
    let mut visited = vec![normalize(path)];
    let value = resolve_includes(value, base, &mut visited)?;
    parse_document(value, path)
}

/// Parse a configuration document from a string. Includes are resolved
/// against `base`.
pub fn parse_config_str(text: &str, base: &Path) -> Result<WorkflowConfig> {
    let anon = PathBuf::from("<inline>");
    let value: serde_yaml::Value = serde_yaml::from_str(text).map_err(|e| FlowError::ConfigParse {
        path: anon.clone(),
        cause: e.to_string(),
    })?;
    let mut visited = Vec::new();
    let value = resolve_includes(value, base, &mut visited)?;
    parse_document(value, &anon)
}

fn normalize(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

fn resolve_includes(
    value: serde_yaml::Value,
    base: &Path,
    visited: &mut Vec<PathBuf>,
) -> Result<serde_yaml::Value> {
    use serde_yaml::Value;
    match value {
        Value::Tagged(tagged) if tagged.tag.to_string() == "!include" => {
            let rel = tagged.value.as_str().ok_or_else(|| FlowError::ConfigValue {
                field: "!include".to_string(),
                cause: "include target must be a string path".to_string(),
            })?;
            let target = base.join(rel);
            let key = normalize(&target);
            if visited.contains(&key) {
                return Err(FlowError::IncludeLoop { path: target });
            }
            visited.push(key);
            let text = std::fs::read_to_string(&target).map_err(|e| FlowError::ConfigParse {
                path: target.clone(),
                cause: e.to_string(),
            })?;
            let included: Value =
                serde_yaml::from_str(&text).map_err(|e| FlowError::ConfigParse {
                    path: target.clone(),
                    cause: e.to_string(),
                })?;
            let resolved = resolve_includes(included, base, visited)?;
            visited.pop();
            Ok(resolved)
        }
        Value::Tagged(tagged) => Ok(Value::Tagged(tagged)),
        Value::Mapping(map) => {
            let mut out = serde_yaml::Mapping::with_capacity(map.len());
            for (key, val) in map {
                out.insert(key, resolve_includes(val, base, visited)?);
            }
            Ok(Value::Mapping(out))
        }
        Value::Sequence(seq) => Ok(Value::Sequence(
            seq.into_iter()
                .map(|v| resolve_includes(v, base, visited))
                .collect::<Result<_>>()?,
        )),
        other => Ok(other),
    }
}

fn parse_document(value: serde_yaml::Value, path: &Path) -> Result<WorkflowConfig> {
    let serde_yaml::Value::Mapping(map) = value else {
        return Err(FlowError::ConfigParse {
            path: path.to_path_buf(),
            cause: "top level must be a mapping".to_string(),
        });
    };

    let mut flow = None;
    let mut resources = Vec::new();
    let mut blocks = BTreeMap::new();

    for (key, value) in map {
        let Some(key) = key.as_str().map(str::to_string) else {
            continue;
        };
        match key.as_str() {
            "flow" => {
                flow = Some(serde_yaml::from_value::<FlowSection>(value).map_err(|e| {
                    FlowError::ConfigValue {
                        field: "flow".to_string(),
                        cause: e.to_string(),
                    }
                })?);
            }
            "resources" => {
                resources =
                    serde_yaml::from_value::<Vec<ResourceBlock>>(value).map_err(|e| {
                        FlowError::ConfigValue {
                            field: "resources".to_string(),
                            cause: e.to_string(),
                        }
                    })?;
            }
            _ => {
                // A mapping with a classname is a module block; anything
                // else is an unknown key and ignored for forward
                // compatibility.
                let is_block = value
                    .as_mapping()
                    .map(|m| m.get("classname").is_some())
                    .unwrap_or(false);
                if is_block {
                    let block =
                        serde_yaml::from_value::<ModuleBlock>(value).map_err(|e| {
                            FlowError::ConfigValue {
                                field: key.clone(),
                                cause: e.to_string(),
                            }
                        })?;
                    blocks.insert(key, block);
                }
            }
        }
    }

    let flow = flow.ok_or_else(|| FlowError::ConfigValue {
        field: "flow".to_string(),
        cause: "missing required section".to_string(),
    })?;

    let config = WorkflowConfig {
        flow,
        resources,
        blocks,
    };
    config.validate()?;
    Ok(config)
}
