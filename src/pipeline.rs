//! Declarative pipeline description: the YAML surface a user edits.

use crate::error::{OrchestratorError, Result};
use crate::gate::GateCondition;
use crate::matrix::{expand, Dimension, ExcludeRow, IncludeRow, JobConfiguration};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A complete pipeline description parsed from YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    /// Pipeline name
    pub name: String,
    /// Build matrix
    #[serde(default)]
    pub matrix: MatrixSpec,
    /// Environment variables shared by all steps
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Ordered step sequence run by every expanded job
    #[serde(default)]
    pub steps: Vec<StepSpec>,
    /// Gated publish steps run after all jobs complete
    #[serde(default)]
    pub publish: Vec<PublishSpec>,
}

/// Declarative matrix: dimensions plus explicit include/exclude rows.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MatrixSpec {
    /// Ordered axes; declaration order drives expansion order
    #[serde(default)]
    pub dimensions: Vec<Dimension>,
    /// Rows merged into (or appended to) the product
    #[serde(default)]
    pub include: Vec<IncludeRow>,
    /// Rows removed from the product
    #[serde(default)]
    pub exclude: Vec<ExcludeRow>,
}

/// One step in a job's ordered sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSpec {
    /// Optional display name
    #[serde(default)]
    pub name: Option<String>,
    /// Shell command to run
    pub run: String,
    /// Working directory, relative to the job's workspace
    #[serde(default, rename = "working-directory")]
    pub working_directory: Option<String>,
    /// Environment variables for this step
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Wall-clock budget for this step, in seconds
    #[serde(default, rename = "timeout-secs")]
    pub timeout_secs: Option<u64>,
    /// Condition for running this step
    #[serde(default, rename = "if")]
    pub condition: Option<GateCondition>,
    /// Continue the job even if this step fails
    #[serde(default, rename = "continue-on-error")]
    pub continue_on_error: bool,
}

impl StepSpec {
    /// Display name for this step.
    pub fn display_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| truncate_command(&self.run))
    }
}

/// Truncate a command for display purposes. Cuts on a char boundary so
/// multi-byte text in the command cannot panic the slice.
fn truncate_command(cmd: &str) -> String {
    let first_line = cmd.lines().next().unwrap_or(cmd);
    if first_line.len() <= 50 {
        return first_line.to_string();
    }
    let mut cut = 47;
    while !first_line.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...", &first_line[..cut])
}

/// A downstream publish step and the gate controlling it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishSpec {
    /// Publish step name (also the payload key)
    pub name: String,
    /// Gate deciding whether this publish runs
    #[serde(rename = "if")]
    pub condition: GateCondition,
}

impl Pipeline {
    /// Parse a pipeline description from YAML content and validate it.
    pub fn parse(yaml: &str) -> Result<Self> {
        let pipeline: Pipeline =
            serde_yaml::from_str(yaml).map_err(|e| OrchestratorError::YamlParse(e.to_string()))?;
        pipeline.validate()?;
        Ok(pipeline)
    }

    /// Validate the pipeline description. Configuration errors are fatal
    /// before any job starts.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(OrchestratorError::Configuration(
                "pipeline name is required".into(),
            ));
        }
        if self.steps.is_empty() {
            return Err(OrchestratorError::Configuration(
                "pipeline must have at least one step".into(),
            ));
        }
        for (idx, step) in self.steps.iter().enumerate() {
            if step.run.trim().is_empty() {
                return Err(OrchestratorError::Configuration(format!(
                    "step {} has an empty run command",
                    idx + 1
                )));
            }
        }
        if self.matrix.dimensions.is_empty() && self.matrix.include.is_empty() {
            return Err(OrchestratorError::Configuration(
                "matrix must declare at least one dimension or include row".into(),
            ));
        }
        // Surfaces exclude rows naming unknown dimensions
        self.expand()?;
        Ok(())
    }

    /// Expand this pipeline's matrix into concrete job configurations.
    pub fn expand(&self) -> Result<Vec<JobConfiguration>> {
        expand(
            &self.matrix.dimensions,
            &self.matrix.include,
            &self.matrix.exclude,
        )
    }

    /// Display names of the step sequence, in order.
    pub fn step_names(&self) -> Vec<String> {
        self.steps.iter().map(|s| s.display_name()).collect()
    }
}
