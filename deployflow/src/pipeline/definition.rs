//! Pipeline definitions and the validating builder.

use super::action::Action;
use crate::errors::PipelineValidationError;
use std::collections::HashSet;
use std::sync::Arc;

/// A named group of actions. Stages run strictly in order.
#[derive(Debug, Clone)]
pub struct StageDefinition {
    /// The stage name, unique within the pipeline.
    pub name: String,
    /// Actions run in declared order.
    pub actions: Vec<Arc<dyn Action>>,
}

impl StageDefinition {
    /// Creates a stage.
    #[must_use]
    pub fn new(name: impl Into<String>, actions: Vec<Arc<dyn Action>>) -> Self {
        Self {
            name: name.into(),
            actions,
        }
    }
}

/// A validated, ordered list of stages.
#[derive(Debug, Clone)]
pub struct PipelineDefinition {
    name: String,
    stages: Vec<StageDefinition>,
}

impl PipelineDefinition {
    /// Returns the pipeline name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the stages in execution order.
    #[must_use]
    pub fn stages(&self) -> &[StageDefinition] {
        &self.stages
    }

    /// Returns the stage names in execution order.
    #[must_use]
    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name.as_str()).collect()
    }
}

/// Builder for creating validated pipelines.
#[derive(Debug, Clone)]
pub struct PipelineBuilder {
    name: String,
    stages: Vec<StageDefinition>,
}

impl PipelineBuilder {
    /// Creates a new pipeline builder.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stages: Vec::new(),
        }
    }

    /// Appends a stage.
    ///
    /// # Errors
    ///
    /// Returns an error if the stage name is empty or taken, or the stage has no actions.
    pub fn stage(
        mut self,
        name: impl Into<String>,
        actions: Vec<Arc<dyn Action>>,
    ) -> Result<Self, PipelineValidationError> {
        let stage = StageDefinition::new(name, actions);

        if stage.name.trim().is_empty() {
            return Err(PipelineValidationError::new("Stage name cannot be empty"));
        }
        if self.stages.iter().any(|s| s.name == stage.name) {
            return Err(PipelineValidationError::new(format!(
                "Duplicate stage name '{}'",
                stage.name
            ))
            .with_stages(vec![stage.name.clone()])
            .with_fix_hint("Give every stage a unique name."));
        }
        if stage.actions.is_empty() {
            return Err(PipelineValidationError::new(format!(
                "Stage '{}' has no actions",
                stage.name
            ))
            .with_stages(vec![stage.name.clone()]));
        }

        self.stages.push(stage);
        Ok(self)
    }

    /// Builds the pipeline, checking artifact handoff.
    ///
    /// Every input must be produced by an earlier action, and every output
    /// name must be unique.
    ///
    /// # Errors
    ///
    /// Returns the first validation failure.
    pub fn build(self) -> Result<PipelineDefinition, PipelineValidationError> {
        if self.name.trim().is_empty() {
            return Err(PipelineValidationError::new(
                "Pipeline name cannot be empty or whitespace-only",
            ));
        }
        if self.stages.is_empty() {
            return Err(PipelineValidationError::new("Pipeline has no stages")
                .with_fix_hint("Add at least one stage to the pipeline before building."));
        }

        let mut action_names = HashSet::new();
        let mut produced: HashSet<String> = HashSet::new();
        for stage in &self.stages {
            for action in &stage.actions {
                if !action_names.insert(action.name().to_string()) {
                    return Err(PipelineValidationError::new(format!(
                        "Duplicate action name '{}'",
                        action.name()
                    ))
                    .with_stages(vec![stage.name.clone()]));
                }
                for input in action.input_artifacts() {
                    if !produced.contains(&input) {
                        return Err(PipelineValidationError::new(format!(
                            "Action '{}' consumes '{input}', which no earlier action produces",
                            action.name()
                        ))
                        .with_stages(vec![stage.name.clone()])
                        .with_fix_hint("Produce the artifact in an earlier stage."));
                    }
                }
                for output in action.output_artifacts() {
                    if !produced.insert(output.clone()) {
                        return Err(PipelineValidationError::new(format!(
                            "Artifact '{output}' is produced more than once"
                        ))
                        .with_stages(vec![stage.name.clone()]));
                    }
                }
            }
        }

        Ok(PipelineDefinition {
            name: self.name,
            stages: self.stages,
        })
    }
}
