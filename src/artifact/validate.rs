//! Validators that decide whether an artifact is ready to be submitted.
//!
//! Each validator returns a list of human-readable failure reasons; an empty
//! list means the artifact passed. Reasons are fed back to the agent
//! verbatim, so they name the offending field or task index.

use async_trait::async_trait;
use jsonschema::validator_for;
use serde_json::Value;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;

use super::{ArtifactState, Task, Variant};

#[async_trait]
pub trait Validator: Send + Sync {
    fn name(&self) -> &str;

    async fn validate(&self, dir: &Path, state: &ArtifactState) -> Vec<String>;
}

/// Structural invariants of the artifact for its variant.
pub fn structural_errors(state: &ArtifactState) -> Vec<String> {
    let mut errors = Vec::new();

    if state.spec.as_deref().is_none_or(|s| s.trim().is_empty()) {
        errors.push("spec is missing".to_string());
    }
    if state.name.is_none() {
        errors.push("name is missing".to_string());
    }
    let Some(variant) = state.variant() else {
        errors.push("function_type is missing".to_string());
        return errors;
    };

    let function = &state.function;
    if function
        .description
        .as_deref()
        .is_none_or(|d| d.trim().is_empty())
    {
        errors.push("function.description is missing".to_string());
    }
    match &function.input_schema {
        None => errors.push("function.input_schema is missing".to_string()),
        Some(schema) => {
            if let Err(err) = validator_for(schema) {
                errors.push(format!("function.input_schema is not a valid JSON schema: {}", err));
            }
        }
    }

    let (min, max) = state.parameters.width_bounds();
    let count = function.tasks.len() as u32;
    if count < min || count > max {
        errors.push(format!(
            "{} function must have between {} and {} tasks, found {}",
            variant.label(),
            min,
            max,
            count
        ));
    }

    for (index, task) in function.tasks.iter().enumerate() {
        let allowed = match (variant, task) {
            (Variant::ScalarLeaf | Variant::VectorLeaf, Task::Inline { .. }) => true,
            (Variant::ScalarLeaf | Variant::VectorLeaf, _) => false,
            (Variant::ScalarBranch | Variant::VectorBranch, _) => true,
        };
        if !allowed {
            errors.push(format!(
                "task {}: {} tasks are not allowed in a {} function",
                index,
                task.kind(),
                variant.label()
            ));
        }
        if let Task::Placeholder { input_schema, .. } = task
            && let Err(err) = validator_for(input_schema)
        {
            errors.push(format!("task {}: input_schema is not a valid JSON schema: {}", index, err));
        }
    }

    match variant {
        Variant::ScalarBranch | Variant::ScalarLeaf => {
            for (field, value) in [
                ("output_length", &function.output_length),
                ("input_split", &function.input_split),
                ("input_merge", &function.input_merge),
            ] {
                if value.is_some() {
                    errors.push(format!("scalar functions must not set function.{}", field));
                }
            }
        }
        Variant::VectorBranch | Variant::VectorLeaf => {
            if function.output_length.is_none() {
                errors.push("vector functions must set function.output_length".to_string());
            }
        }
    }

    errors.extend(state.placeholder_alignment_errors());
    if let Some(name) = &state.name {
        for (index, spec) in state.placeholders() {
            if &spec.name == name {
                errors.push(format!("task {}: placeholder reuses the function's own name '{}'", index, name));
            }
        }
    }
    errors
}

/// Checks the variant's structural invariants.
pub struct StructuralValidator;

#[async_trait]
impl Validator for StructuralValidator {
    fn name(&self) -> &str {
        "structure"
    }

    async fn validate(&self, _dir: &Path, state: &ArtifactState) -> Vec<String> {
        structural_errors(state)
    }
}

/// Checks every example input against `function.input_schema`.
pub struct ExampleInputValidator;

impl ExampleInputValidator {
    pub fn check(schema: &Value, examples: &[Value]) -> Vec<String> {
        let compiled = match validator_for(schema) {
            Ok(compiled) => compiled,
            // Reported by the structural validator.
            Err(_) => return Vec::new(),
        };
        let mut errors = Vec::new();
        for (index, example) in examples.iter().enumerate() {
            let messages: Vec<String> = compiled
                .iter_errors(example)
                .map(|err| err.to_string())
                .collect();
            if !messages.is_empty() {
                errors.push(format!(
                    "example input {} does not match input_schema: {}",
                    index,
                    messages.join("; ")
                ));
            }
        }
        errors
    }
}

#[async_trait]
impl Validator for ExampleInputValidator {
    fn name(&self) -> &str {
        "example-inputs"
    }

    async fn validate(&self, _dir: &Path, state: &ArtifactState) -> Vec<String> {
        if state.example_inputs.is_empty() {
            return vec!["at least one example input is required".to_string()];
        }
        match &state.function.input_schema {
            Some(schema) => Self::check(schema, &state.example_inputs),
            None => Vec::new(),
        }
    }
}

/// Runs an external test command in the node directory.
///
/// Exit code 0 passes; anything else, including a timeout, fails with the
/// command's output as the reason.
pub struct CommandValidator {
    command: String,
    timeout: Duration,
}

impl CommandValidator {
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            timeout,
        }
    }
}

#[async_trait]
impl Validator for CommandValidator {
    fn name(&self) -> &str {
        "test-command"
    }

    async fn validate(&self, dir: &Path, _state: &ArtifactState) -> Vec<String> {
        let child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .current_dir(dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("FNFORGE_ARTIFACT", super::store::artifact_path(dir))
            .kill_on_drop(true)
            .spawn();
        let child = match child {
            Ok(child) => child,
            Err(err) => {
                return vec![format!("failed to run test command '{}': {}", self.command, err)];
            }
        };

        let output = match timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => return vec![format!("test command '{}' failed: {}", self.command, err)],
            Err(_) => {
                return vec![format!(
                    "test command '{}' timed out after {} seconds",
                    self.command,
                    self.timeout.as_secs()
                )];
            }
        };

        if output.status.success() {
            return Vec::new();
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        let detail = if !stderr.trim().is_empty() {
            stderr.trim().to_string()
        } else {
            stdout.trim().to_string()
        };
        vec![format!(
            "test command '{}' exited with code {}: {}",
            self.command,
            output.status.code().unwrap_or(-1),
            detail
        )]
    }
}

/// An ordered set of validators; every validator runs and all reasons are
/// collected.
pub struct ValidatorChain {
    validators: Vec<Box<dyn Validator>>,
}

impl ValidatorChain {
    pub fn new() -> Self {
        Self {
            validators: Vec::new(),
        }
    }

    /// Structure and example inputs, plus the external test command if one is
    /// configured.
    pub fn standard(test_cmd: Option<(String, Duration)>) -> Self {
        let mut chain = Self::new()
            .with(StructuralValidator)
            .with(ExampleInputValidator);
        if let Some((command, limit)) = test_cmd {
            chain = chain.with(CommandValidator::new(command, limit));
        }
        chain
    }

    pub fn with(mut self, validator: impl Validator + 'static) -> Self {
        self.validators.push(Box::new(validator));
        self
    }

    pub async fn run(&self, dir: &Path, state: &ArtifactState) -> Vec<String> {
        let mut reasons = Vec::new();
        for validator in &self.validators {
            let found = validator.validate(dir, state).await;
            if !found.is_empty() {
                tracing::debug!(validator = validator.name(), count = found.len(), "validation failed");
            }
            reasons.extend(found);
        }
        reasons
    }
}

impl Default for ValidatorChain {
    fn default() -> Self {
        Self::standard(None)
    }
}
