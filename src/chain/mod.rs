// Conduit — Chain Module
//
// Sequential multi-ability pipelines. Each step's output is projected into
// the next step's params; a fully successful chain of two or more steps is
// saved as a workflow ability that can be replayed later.

pub mod dot_path;
mod error;
mod orchestrator;

pub use error::ChainError;
pub use orchestrator::{
    ChainOptions, ChainOrchestrator, ChainReport, OutputTransform, StepRecord, StepRunner,
    MAX_CHAIN_STEPS,
};

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One invocation within a chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainStep {
    pub ability_id: String,
    #[serde(default)]
    pub params: Map<String, Value>,
    /// `sourcePath -> targetField` projection of this step's output into the
    /// next step's params.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_mapping: Option<BTreeMap<String, String>>,
}
