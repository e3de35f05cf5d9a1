//! Typed tools the agent uses to read and edit the artifact.
//!
//! Write tools validate their arguments before touching state: a rejected
//! call leaves the artifact unchanged and the rejection is both returned to
//! the agent and remembered for the next corrective instruction.

use jsonschema::validator_for;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::artifact::store::write_readme;
use crate::artifact::{
    ArtifactState, FieldEdit, FunctionType, PlaceholderSpec, Task, TaskCommon, TaskEdit,
    validate_name,
};
use crate::event::EventSink;
use crate::remote::RemoteHost;

/// One tool invocation requested by the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

impl ToolCall {
    pub fn new(name: &str, arguments: Value) -> Self {
        Self {
            name: name.to_string(),
            arguments,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolKind {
    ReadSpec,
    ReadName,
    ReadType,
    ReadInputSchema,
    ReadEssay,
    ReadEssayTasks,
    ReadParameters,
    ReadFunction,
    WriteSpec,
    WriteName,
    WriteType,
    WriteInputSchema,
    WriteEssay,
    WriteEssayTasks,
    WriteDescription,
    WriteInputMaps,
    WriteVectorFields,
    AppendInlineTask,
    AppendPlaceholderTask,
    EditTask,
    DeleteTask,
    WriteExampleInputs,
    WriteReadme,
}

impl ToolKind {
    pub const ALL: [ToolKind; 23] = [
        ToolKind::ReadSpec,
        ToolKind::ReadName,
        ToolKind::ReadType,
        ToolKind::ReadInputSchema,
        ToolKind::ReadEssay,
        ToolKind::ReadEssayTasks,
        ToolKind::ReadParameters,
        ToolKind::ReadFunction,
        ToolKind::WriteSpec,
        ToolKind::WriteName,
        ToolKind::WriteType,
        ToolKind::WriteInputSchema,
        ToolKind::WriteEssay,
        ToolKind::WriteEssayTasks,
        ToolKind::WriteDescription,
        ToolKind::WriteInputMaps,
        ToolKind::WriteVectorFields,
        ToolKind::AppendInlineTask,
        ToolKind::AppendPlaceholderTask,
        ToolKind::EditTask,
        ToolKind::DeleteTask,
        ToolKind::WriteExampleInputs,
        ToolKind::WriteReadme,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ToolKind::ReadSpec => "read_spec",
            ToolKind::ReadName => "read_name",
            ToolKind::ReadType => "read_type",
            ToolKind::ReadInputSchema => "read_input_schema",
            ToolKind::ReadEssay => "read_essay",
            ToolKind::ReadEssayTasks => "read_essay_tasks",
            ToolKind::ReadParameters => "read_parameters",
            ToolKind::ReadFunction => "read_function",
            ToolKind::WriteSpec => "write_spec",
            ToolKind::WriteName => "write_name",
            ToolKind::WriteType => "write_type",
            ToolKind::WriteInputSchema => "write_input_schema",
            ToolKind::WriteEssay => "write_essay",
            ToolKind::WriteEssayTasks => "write_essay_tasks",
            ToolKind::WriteDescription => "write_description",
            ToolKind::WriteInputMaps => "write_input_maps",
            ToolKind::WriteVectorFields => "write_vector_fields",
            ToolKind::AppendInlineTask => "append_inline_task",
            ToolKind::AppendPlaceholderTask => "append_placeholder_task",
            ToolKind::EditTask => "edit_task",
            ToolKind::DeleteTask => "delete_task",
            ToolKind::WriteExampleInputs => "write_example_inputs",
            ToolKind::WriteReadme => "write_readme",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }

    /// One-line usage shown to the agent.
    pub fn usage(self) -> &'static str {
        match self {
            ToolKind::ReadSpec => "read_spec {} - the function's specification",
            ToolKind::ReadName => "read_name {} - the function's name",
            ToolKind::ReadType => "read_type {} - scalar or vector",
            ToolKind::ReadInputSchema => "read_input_schema {} - the input JSON schema",
            ToolKind::ReadEssay => "read_essay {} - the design essay",
            ToolKind::ReadEssayTasks => "read_essay_tasks {} - the task breakdown essay",
            ToolKind::ReadParameters => "read_parameters {} - depth and width bounds",
            ToolKind::ReadFunction => "read_function {} - the function body, child specs and examples",
            ToolKind::WriteSpec => "write_spec {\"spec\": string}",
            ToolKind::WriteName => {
                "write_name {\"name\": string} - lowercase words joined by dashes, at most 100 bytes, unused"
            }
            ToolKind::WriteType => "write_type {\"function_type\": \"scalar\" | \"vector\"}",
            ToolKind::WriteInputSchema => "write_input_schema {\"input_schema\": JSON schema object}",
            ToolKind::WriteEssay => "write_essay {\"essay\": string}",
            ToolKind::WriteEssayTasks => "write_essay_tasks {\"essay_tasks\": string}",
            ToolKind::WriteDescription => "write_description {\"description\": string}",
            ToolKind::WriteInputMaps => "write_input_maps {\"input_maps\": any | null}",
            ToolKind::WriteVectorFields => {
                "write_vector_fields {\"output_length\"?, \"input_split\"?, \"input_merge\"?} - null deletes a field"
            }
            ToolKind::AppendInlineTask => {
                "append_inline_task {\"body\": object, \"skip\"?, \"map\"?, \"input\"?, \"output\"?}"
            }
            ToolKind::AppendPlaceholderTask => {
                "append_placeholder_task {\"name\": string, \"spec\": string, \"function_type\": \"scalar\" | \"vector\", \"input_schema\": object, \"skip\"?, \"map\"?, \"input\"?, \"output\"?}"
            }
            ToolKind::EditTask => {
                "edit_task {\"index\": number, \"skip\"?, \"map\"?, \"input\"?, \"output\"?, \"input_schema\"?, \"spec\"?, \"body\"?} - null deletes an optional field"
            }
            ToolKind::DeleteTask => "delete_task {\"index\": number}",
            ToolKind::WriteExampleInputs => "write_example_inputs {\"example_inputs\": array}",
            ToolKind::WriteReadme => "write_readme {\"content\": string} - README.md summary",
        }
    }
}

/// Everything outside the artifact that tools consult.
#[derive(Clone)]
pub struct ToolContext {
    /// Directory sibling nodes live in; used for the name collision check.
    pub workspace: PathBuf,
    /// Remote host; used for the name collision check.
    pub remote: Option<Arc<dyn RemoteHost>>,
    pub events: EventSink,
}

impl ToolContext {
    pub fn new(workspace: &Path) -> Self {
        Self {
            workspace: workspace.to_path_buf(),
            remote: None,
            events: EventSink::detached(),
        }
    }

    pub fn with_remote(mut self, remote: Arc<dyn RemoteHost>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }
}

/// The tools available for one agent turn, bound to the node's state.
pub struct ToolBox<'a> {
    state: &'a mut ArtifactState,
    dir: &'a Path,
    allowed: Vec<ToolKind>,
    context: ToolContext,
    rejections: Vec<String>,
    accepted_writes: usize,
}

impl<'a> ToolBox<'a> {
    pub fn new(
        state: &'a mut ArtifactState,
        dir: &'a Path,
        allowed: Vec<ToolKind>,
        context: ToolContext,
    ) -> Self {
        Self {
            state,
            dir,
            allowed,
            context,
            rejections: Vec::new(),
            accepted_writes: 0,
        }
    }

    pub fn allowed(&self) -> &[ToolKind] {
        &self.allowed
    }

    pub fn is_allowed(&self, kind: ToolKind) -> bool {
        self.allowed.contains(&kind)
    }

    pub fn state(&self) -> &ArtifactState {
        self.state
    }

    pub fn rejections(&self) -> &[String] {
        &self.rejections
    }

    pub fn take_rejections(&mut self) -> Vec<String> {
        std::mem::take(&mut self.rejections)
    }

    pub fn accepted_writes(&self) -> usize {
        self.accepted_writes
    }

    /// Markdown list of the available tools for an instruction.
    pub fn describe(&self) -> String {
        self.allowed
            .iter()
            .map(|kind| format!("- {}", kind.usage()))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Execute one tool call. Errors are rejections to report back to the
    /// agent; they never abort the turn.
    pub async fn call(&mut self, call: &ToolCall) -> Result<Value, String> {
        let result = match ToolKind::from_name(&call.name) {
            None => Err(format!("unknown tool '{}'", call.name)),
            Some(kind) if !self.is_allowed(kind) => Err(format!(
                "tool '{}' is not available in this step",
                call.name
            )),
            Some(kind) => self.dispatch(kind, &call.arguments).await,
        };
        match &result {
            Ok(_) => {
                if call.name.starts_with("write_")
                    || call.name.starts_with("append_")
                    || call.name.starts_with("edit_")
                    || call.name.starts_with("delete_")
                {
                    self.accepted_writes += 1;
                }
            }
            Err(reason) => {
                tracing::debug!(tool = %call.name, %reason, "tool call rejected");
                self.rejections.push(format!("{}: {}", call.name, reason));
            }
        }
        result
    }

    async fn dispatch(&mut self, kind: ToolKind, args: &Value) -> Result<Value, String> {
        let state = &mut *self.state;
        match kind {
            ToolKind::ReadSpec => Ok(json!(state.spec)),
            ToolKind::ReadName => Ok(json!(state.name)),
            ToolKind::ReadType => Ok(json!(state.function_type)),
            ToolKind::ReadInputSchema => Ok(json!(state.function.input_schema)),
            ToolKind::ReadEssay => Ok(json!(state.essay)),
            ToolKind::ReadEssayTasks => Ok(json!(state.essay_tasks)),
            ToolKind::ReadParameters => Ok(json!(state.parameters)),
            ToolKind::ReadFunction => Ok(json!({
                "function": state.function,
                "placeholder_task_specs": state.placeholder_task_specs,
                "example_inputs": state.example_inputs,
            })),
            ToolKind::WriteSpec => {
                state.spec = Some(required_text(args, "spec")?);
                Ok(json!("ok"))
            }
            ToolKind::WriteName => self.write_name(args).await,
            ToolKind::WriteType => {
                let raw = required_text(args, "function_type")?;
                let function_type: FunctionType = raw.parse().map_err(|e: anyhow::Error| e.to_string())?;
                state.function_type = Some(function_type);
                Ok(json!("ok"))
            }
            ToolKind::WriteInputSchema => {
                let schema = required_schema(args, "input_schema")?;
                state.function.input_schema = Some(schema);
                Ok(json!("ok"))
            }
            ToolKind::WriteEssay => {
                state.essay = Some(required_text(args, "essay")?);
                Ok(json!("ok"))
            }
            ToolKind::WriteEssayTasks => {
                state.essay_tasks = Some(required_text(args, "essay_tasks")?);
                Ok(json!("ok"))
            }
            ToolKind::WriteDescription => {
                state.function.description = Some(required_text(args, "description")?);
                Ok(json!("ok"))
            }
            ToolKind::WriteInputMaps => {
                if args.get("input_maps").is_none() {
                    return Err("missing field 'input_maps'".to_string());
                }
                FieldEdit::from_json(args, "input_maps").apply(&mut state.function.input_maps);
                Ok(json!("ok"))
            }
            ToolKind::WriteVectorFields => {
                let edits = [
                    FieldEdit::from_json(args, "output_length"),
                    FieldEdit::from_json(args, "input_split"),
                    FieldEdit::from_json(args, "input_merge"),
                ];
                if edits.iter().all(FieldEdit::is_keep) {
                    return Err("provide at least one of output_length, input_split, input_merge".to_string());
                }
                let [output_length, input_split, input_merge] = edits;
                output_length.apply(&mut state.function.output_length);
                input_split.apply(&mut state.function.input_split);
                input_merge.apply(&mut state.function.input_merge);
                Ok(json!("ok"))
            }
            ToolKind::AppendInlineTask => {
                let body = args
                    .get("body")
                    .filter(|b| b.is_object())
                    .cloned()
                    .ok_or_else(|| "field 'body' must be an object".to_string())?;
                let task = Task::Inline {
                    body,
                    common: common_from(args),
                };
                let index = state.append_task(task, None)?;
                Ok(json!({ "index": index }))
            }
            ToolKind::AppendPlaceholderTask => {
                let name = required_text(args, "name")?;
                let spec = required_text(args, "spec")?;
                let function_type: FunctionType = required_text(args, "function_type")?
                    .parse()
                    .map_err(|e: anyhow::Error| e.to_string())?;
                let input_schema = required_schema(args, "input_schema")?;
                let task = Task::Placeholder {
                    function_type,
                    input_schema,
                    common: common_from(args),
                };
                validate_name(&name)?;
                check_unclaimed(&self.context, &name, None).await?;
                let index = state.append_task(task, Some(PlaceholderSpec { name, spec }))?;
                Ok(json!({ "index": index }))
            }
            ToolKind::EditTask => {
                let index = required_index(args)?;
                let input_schema = match args.get("input_schema") {
                    None => None,
                    Some(_) => Some(required_schema(args, "input_schema")?),
                };
                let spec = match args.get("spec") {
                    None => None,
                    Some(_) => Some(required_text(args, "spec")?),
                };
                let edit = TaskEdit {
                    skip: FieldEdit::from_json(args, "skip"),
                    map: FieldEdit::from_json(args, "map"),
                    input: FieldEdit::from_json(args, "input"),
                    output: FieldEdit::from_json(args, "output"),
                    input_schema,
                    spec,
                    body: args.get("body").filter(|b| !b.is_null()).cloned(),
                };
                state.edit_task(index, edit)?;
                Ok(json!("ok"))
            }
            ToolKind::DeleteTask => {
                let index = required_index(args)?;
                let removed = state.delete_task(index)?;
                Ok(json!({ "deleted": removed.kind() }))
            }
            ToolKind::WriteExampleInputs => {
                let examples = args
                    .get("example_inputs")
                    .and_then(Value::as_array)
                    .filter(|a| !a.is_empty())
                    .cloned()
                    .ok_or_else(|| "field 'example_inputs' must be a non-empty array".to_string())?;
                state.example_inputs = examples;
                Ok(json!("ok"))
            }
            ToolKind::WriteReadme => {
                let content = required_text(args, "content")?;
                write_readme(self.dir, &content).map_err(|e| e.to_string())?;
                Ok(json!("ok"))
            }
        }
    }

    async fn write_name(&mut self, args: &Value) -> Result<Value, String> {
        if let Some(existing) = &self.state.name {
            return Err(format!("name already claimed as '{}'", existing));
        }
        let name = required_text(args, "name")?;
        validate_name(&name)?;

        check_unclaimed(&self.context, &name, Some(self.dir)).await?;

        self.state.name = Some(name.clone());
        self.context.events.name(&name);
        Ok(json!("ok"))
    }
}

/// Reject `name` if another node already uses it, in the workspace or on the
/// remote. `own_dir` is the directory of the node claiming the name, which
/// may already sit at the name's workspace path.
async fn check_unclaimed(context: &ToolContext, name: &str, own_dir: Option<&Path>) -> Result<(), String> {
    let local = context.workspace.join(name);
    if local.exists() && !own_dir.is_some_and(|dir| same_dir(&local, dir)) {
        return Err(format!("name '{}' is already used in the workspace", name));
    }
    if let Some(remote) = &context.remote {
        match remote.repository_exists(name).await {
            Ok(false) => {}
            Ok(true) => return Err(format!("name '{}' is already taken on the remote", name)),
            Err(err) => return Err(format!("could not check name '{}': {}", name, err)),
        }
    }
    Ok(())
}

fn same_dir(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

fn required_text(args: &Value, key: &str) -> Result<String, String> {
    match args.get(key) {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.clone()),
        Some(Value::String(_)) => Err(format!("field '{}' must not be empty", key)),
        Some(_) => Err(format!("field '{}' must be a string", key)),
        None => Err(format!("missing field '{}'", key)),
    }
}

fn required_schema(args: &Value, key: &str) -> Result<Value, String> {
    let schema = args
        .get(key)
        .filter(|s| s.is_object())
        .cloned()
        .ok_or_else(|| format!("field '{}' must be a JSON schema object", key))?;
    validator_for(&schema).map_err(|e| format!("field '{}' is not a valid JSON schema: {}", key, e))?;
    Ok(schema)
}

fn required_index(args: &Value) -> Result<usize, String> {
    args.get("index")
        .and_then(Value::as_u64)
        .map(|i| i as usize)
        .ok_or_else(|| "field 'index' must be a non-negative integer".to_string())
}

fn common_from(args: &Value) -> TaskCommon {
    let field = |key: &str| args.get(key).filter(|v| !v.is_null()).cloned();
    TaskCommon {
        skip: field("skip"),
        map: field("map"),
        input: field("input"),
        output: field("output"),
    }
}
