//! Working record for one node of a function tree.
//!
//! An [`ArtifactState`] is created empty, filled in by the phase pipeline,
//! edited by the build loop and finally rewritten by the closer once the
//! node's children converge. It is persisted as `artifact.json` in the
//! node's directory.

pub mod store;
pub mod validate;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::OnceLock;

use crate::params::GenerationParameters;

/// Maximum length of a function name in bytes.
pub const MAX_NAME_BYTES: usize = 100;

/// What kind of quality function a node produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FunctionType {
    /// Scores a single item.
    Scalar,
    /// Ranks a collection of items.
    Vector,
}

impl std::fmt::Display for FunctionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FunctionType::Scalar => write!(f, "scalar"),
            FunctionType::Vector => write!(f, "vector"),
        }
    }
}

impl std::str::FromStr for FunctionType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "scalar" => Ok(FunctionType::Scalar),
            "vector" => Ok(FunctionType::Vector),
            _ => anyhow::bail!("Invalid function type '{}'. Valid values: scalar, vector", s),
        }
    }
}

/// The four shapes a node can take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    ScalarBranch,
    ScalarLeaf,
    VectorBranch,
    VectorLeaf,
}

impl Variant {
    pub fn of(function_type: FunctionType, parameters: &GenerationParameters) -> Self {
        match (function_type, parameters.is_leaf()) {
            (FunctionType::Scalar, false) => Variant::ScalarBranch,
            (FunctionType::Scalar, true) => Variant::ScalarLeaf,
            (FunctionType::Vector, false) => Variant::VectorBranch,
            (FunctionType::Vector, true) => Variant::VectorLeaf,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Variant::ScalarBranch => "scalar branch",
            Variant::ScalarLeaf => "scalar leaf",
            Variant::VectorBranch => "vector branch",
            Variant::VectorLeaf => "vector leaf",
        }
    }
}

/// Location of a finalized function on the remote host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerRepositoryCommit {
    pub owner: String,
    pub repository: String,
    pub commit: String,
}

impl std::fmt::Display for OwnerRepositoryCommit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}@{}", self.owner, self.repository, self.commit)
    }
}

/// Expressions every task may carry; preserved verbatim when a placeholder
/// is resolved into a reference.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskCommon {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub map: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Task {
    /// A slot awaiting a sub-function built by a child process.
    Placeholder {
        function_type: FunctionType,
        input_schema: Value,
        #[serde(default)]
        common: TaskCommon,
    },
    /// A resolved sub-function.
    Reference {
        owner: String,
        repository: String,
        commit: String,
        #[serde(default)]
        common: TaskCommon,
    },
    /// A self-contained task body (leaf functions).
    Inline {
        body: Value,
        #[serde(default)]
        common: TaskCommon,
    },
}

impl Task {
    pub fn is_placeholder(&self) -> bool {
        matches!(self, Task::Placeholder { .. })
    }

    pub fn common(&self) -> &TaskCommon {
        match self {
            Task::Placeholder { common, .. }
            | Task::Reference { common, .. }
            | Task::Inline { common, .. } => common,
        }
    }

    pub fn common_mut(&mut self) -> &mut TaskCommon {
        match self {
            Task::Placeholder { common, .. }
            | Task::Reference { common, .. }
            | Task::Inline { common, .. } => common,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Task::Placeholder { .. } => "placeholder",
            Task::Reference { .. } => "reference",
            Task::Inline { .. } => "inline",
        }
    }
}

/// Child declaration attached to a placeholder task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaceholderSpec {
    /// Name the child will be created under.
    pub name: String,
    /// Natural-language specification handed to the child.
    pub spec: String,
}

/// The function definition itself.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FunctionBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_maps: Option<Value>,
    #[serde(default)]
    pub tasks: Vec<Task>,
    /// Vector functions only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_length: Option<Value>,
    /// Vector functions only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_split: Option<Value>,
    /// Vector functions only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_merge: Option<Value>,
}

/// A three-way edit of an optional field: leave it, replace it, or remove it.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum FieldEdit<T> {
    #[default]
    Keep,
    Set(T),
    Delete,
}

impl<T> FieldEdit<T> {
    pub fn apply(self, target: &mut Option<T>) {
        match self {
            FieldEdit::Keep => {}
            FieldEdit::Set(value) => *target = Some(value),
            FieldEdit::Delete => *target = None,
        }
    }

    pub fn is_keep(&self) -> bool {
        matches!(self, FieldEdit::Keep)
    }
}

impl FieldEdit<Value> {
    /// Read an edit from a JSON object: a missing key keeps the field,
    /// `null` deletes it, anything else replaces it.
    pub fn from_json(args: &Value, key: &str) -> Self {
        match args.get(key) {
            None => FieldEdit::Keep,
            Some(Value::Null) => FieldEdit::Delete,
            Some(value) => FieldEdit::Set(value.clone()),
        }
    }
}

/// A partial update to one task.
#[derive(Debug, Clone, Default)]
pub struct TaskEdit {
    pub skip: FieldEdit<Value>,
    pub map: FieldEdit<Value>,
    pub input: FieldEdit<Value>,
    pub output: FieldEdit<Value>,
    /// Placeholder tasks: new input schema.
    pub input_schema: Option<Value>,
    /// Placeholder tasks: new child spec text.
    pub spec: Option<String>,
    /// Inline tasks: new body.
    pub body: Option<Value>,
}

/// The mutable working record for one tree node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArtifactState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_type: Option<FunctionType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub essay: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub essay_tasks: Option<String>,
    #[serde(default)]
    pub parameters: GenerationParameters,
    #[serde(default)]
    pub function: FunctionBody,
    #[serde(default)]
    pub placeholder_task_specs: Vec<Option<PlaceholderSpec>>,
    #[serde(default)]
    pub example_inputs: Vec<Value>,
}

impl ArtifactState {
    pub fn new(parameters: GenerationParameters) -> Self {
        Self {
            parameters,
            ..Self::default()
        }
    }

    pub fn variant(&self) -> Option<Variant> {
        self.function_type
            .map(|function_type| Variant::of(function_type, &self.parameters))
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("<unnamed>")
    }

    pub fn has_placeholders(&self) -> bool {
        self.function.tasks.iter().any(Task::is_placeholder)
    }

    /// Placeholder tasks that carry a child declaration, with their index.
    pub fn placeholders(&self) -> impl Iterator<Item = (usize, &PlaceholderSpec)> {
        self.function
            .tasks
            .iter()
            .zip(self.placeholder_task_specs.iter())
            .enumerate()
            .filter_map(|(index, (task, spec))| match (task, spec) {
                (Task::Placeholder { .. }, Some(spec)) => Some((index, spec)),
                _ => None,
            })
    }

    /// Append a task. Placeholders must come with a child declaration and
    /// every other kind must come without one.
    pub fn append_task(&mut self, task: Task, spec: Option<PlaceholderSpec>) -> Result<usize, String> {
        check_task_spec_pair(&task, spec.as_ref())?;
        if let Some(spec) = &spec
            && self.placeholders().any(|(_, existing)| existing.name == spec.name)
        {
            return Err(format!("a placeholder named '{}' already exists", spec.name));
        }
        if let Some(spec) = &spec
            && self.name.as_deref() == Some(spec.name.as_str())
        {
            return Err(format!("placeholder reuses the function's own name '{}'", spec.name));
        }
        self.sync_placeholder_specs();
        self.function.tasks.push(task);
        self.placeholder_task_specs.push(spec);
        Ok(self.function.tasks.len() - 1)
    }

    pub fn delete_task(&mut self, index: usize) -> Result<Task, String> {
        if index >= self.function.tasks.len() {
            return Err(format!(
                "task index {} out of range (have {} tasks)",
                index,
                self.function.tasks.len()
            ));
        }
        self.sync_placeholder_specs();
        self.placeholder_task_specs.remove(index);
        Ok(self.function.tasks.remove(index))
    }

    pub fn edit_task(&mut self, index: usize, edit: TaskEdit) -> Result<(), String> {
        self.sync_placeholder_specs();
        let count = self.function.tasks.len();
        let task = self
            .function
            .tasks
            .get_mut(index)
            .ok_or_else(|| format!("task index {} out of range (have {} tasks)", index, count))?;

        match task {
            Task::Placeholder { input_schema, .. } => {
                if edit.body.is_some() {
                    return Err("placeholder tasks have no body".to_string());
                }
                if let Some(schema) = edit.input_schema {
                    *input_schema = schema;
                }
                if let Some(text) = edit.spec {
                    if text.trim().is_empty() {
                        return Err("placeholder spec must not be empty".to_string());
                    }
                    if let Some(Some(spec)) = self.placeholder_task_specs.get_mut(index) {
                        spec.spec = text;
                    }
                }
            }
            Task::Reference { .. } => {
                if edit.body.is_some() || edit.input_schema.is_some() || edit.spec.is_some() {
                    return Err("reference tasks only accept skip/map/input/output edits".to_string());
                }
            }
            Task::Inline { body, .. } => {
                if edit.input_schema.is_some() || edit.spec.is_some() {
                    return Err("inline tasks have no input schema or spec".to_string());
                }
                if let Some(new_body) = edit.body {
                    *body = new_body;
                }
            }
        }

        let common = task.common_mut();
        edit.skip.apply(&mut common.skip);
        edit.map.apply(&mut common.map);
        edit.input.apply(&mut common.input);
        edit.output.apply(&mut common.output);
        Ok(())
    }

    /// Rewrite the placeholder at `index` into a reference to a finalized
    /// child. Returns `false` if the task is not a placeholder.
    pub fn resolve_placeholder(&mut self, index: usize, location: &OwnerRepositoryCommit) -> bool {
        self.sync_placeholder_specs();
        let Some(task) = self.function.tasks.get_mut(index) else {
            return false;
        };
        let Task::Placeholder { common, .. } = task else {
            return false;
        };
        let common = std::mem::take(common);
        *task = Task::Reference {
            owner: location.owner.clone(),
            repository: location.repository.clone(),
            commit: location.commit.clone(),
            common,
        };
        self.placeholder_task_specs[index] = None;
        true
    }

    /// Check the tasks/spec alignment invariant.
    pub fn placeholder_alignment_errors(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.placeholder_task_specs.len() != self.function.tasks.len() {
            errors.push(format!(
                "placeholder_task_specs has {} entries but there are {} tasks",
                self.placeholder_task_specs.len(),
                self.function.tasks.len()
            ));
        }
        for (index, task) in self.function.tasks.iter().enumerate() {
            let spec = self.placeholder_task_specs.get(index).and_then(Option::as_ref);
            if let Err(message) = check_task_spec_pair(task, spec) {
                errors.push(format!("task {}: {}", index, message));
            }
        }
        errors
    }

    // Older artifacts may omit the spec array entirely; pad it so index
    // arithmetic stays aligned.
    fn sync_placeholder_specs(&mut self) {
        let tasks = self.function.tasks.len();
        if self.placeholder_task_specs.len() < tasks {
            self.placeholder_task_specs.resize(tasks, None);
        }
    }
}

fn check_task_spec_pair(task: &Task, spec: Option<&PlaceholderSpec>) -> Result<(), String> {
    match (task.is_placeholder(), spec) {
        (true, None) => Err("placeholder task is missing its spec".to_string()),
        (false, Some(_)) => Err(format!("{} task must not carry a placeholder spec", task.kind())),
        (true, Some(spec)) if spec.spec.trim().is_empty() => {
            Err("placeholder spec must not be empty".to_string())
        }
        (true, Some(spec)) => validate_name(&spec.name),
        (false, None) => Ok(()),
    }
}

/// Validate the shape of a function name: lowercase alphanumeric words
/// joined by single dashes, at most [`MAX_NAME_BYTES`] bytes.
pub fn validate_name(name: &str) -> Result<(), String> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| {
        Regex::new(r"^[a-z0-9]+(-[a-z0-9]+)*$").unwrap_or_else(|_| unreachable!())
    });

    if name.is_empty() {
        return Err("name must not be empty".to_string());
    }
    if name.len() > MAX_NAME_BYTES {
        return Err(format!(
            "name '{}' is {} bytes; the limit is {}",
            name,
            name.len(),
            MAX_NAME_BYTES
        ));
    }
    if !pattern.is_match(name) {
        return Err(format!(
            "name '{}' must be lowercase letters and digits separated by single dashes",
            name
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn placeholder() -> Task {
        Task::Placeholder {
            function_type: FunctionType::Scalar,
            input_schema: json!({"type": "string"}),
            common: TaskCommon {
                map: Some(json!("$.items")),
                ..TaskCommon::default()
            },
        }
    }

    fn spec(name: &str) -> Option<PlaceholderSpec> {
        Some(PlaceholderSpec {
            name: name.to_string(),
            spec: format!("score {}", name),
        })
    }

    fn inline() -> Task {
        Task::Inline {
            body: json!({"prompt": "rate it"}),
            common: TaskCommon::default(),
        }
    }

    #[test]
    fn test_variant_covers_all_combinations() {
        let branch = GenerationParameters::new(1, 1, 2, 1, 2);
        let leaf = GenerationParameters::new(0, 1, 2, 1, 2);
        assert_eq!(Variant::of(FunctionType::Scalar, &branch), Variant::ScalarBranch);
        assert_eq!(Variant::of(FunctionType::Scalar, &leaf), Variant::ScalarLeaf);
        assert_eq!(Variant::of(FunctionType::Vector, &branch), Variant::VectorBranch);
        assert_eq!(Variant::of(FunctionType::Vector, &leaf), Variant::VectorLeaf);
    }

    #[test]
    fn test_function_type_parse() {
        assert_eq!("Scalar".parse::<FunctionType>().unwrap(), FunctionType::Scalar);
        assert_eq!(" vector ".parse::<FunctionType>().unwrap(), FunctionType::Vector);
        assert!("matrix".parse::<FunctionType>().is_err());
    }

    #[test]
    fn test_append_keeps_specs_in_lockstep() {
        let mut state = ArtifactState::default();
        state.append_task(placeholder(), spec("child-a")).unwrap();
        state.append_task(inline(), None).unwrap();
        assert_eq!(state.function.tasks.len(), 2);
        assert_eq!(state.placeholder_task_specs.len(), 2);
        assert!(state.placeholder_task_specs[1].is_none());
        assert!(state.placeholder_alignment_errors().is_empty());
    }

    #[test]
    fn test_append_rejects_mismatched_pairs() {
        let mut state = ArtifactState::default();
        assert!(state.append_task(placeholder(), None).is_err());
        assert!(state.append_task(inline(), spec("x")).is_err());
        assert!(state.function.tasks.is_empty());
        assert!(state.placeholder_task_specs.is_empty());
    }

    #[test]
    fn test_append_rejects_duplicate_child_names() {
        let mut state = ArtifactState::default();
        state.append_task(placeholder(), spec("same")).unwrap();
        let err = state.append_task(placeholder(), spec("same")).unwrap_err();
        assert!(err.contains("same"));
    }

    #[test]
    fn test_delete_removes_both_entries() {
        let mut state = ArtifactState::default();
        state.append_task(inline(), None).unwrap();
        state.append_task(placeholder(), spec("child-b")).unwrap();
        let removed = state.delete_task(0).unwrap();
        assert_eq!(removed.kind(), "inline");
        assert_eq!(state.placeholder_task_specs.len(), 1);
        assert_eq!(state.placeholders().next().unwrap().0, 0);
        assert!(state.delete_task(5).is_err());
    }

    #[test]
    fn test_edit_distinguishes_delete_from_keep() {
        let mut state = ArtifactState::default();
        state.append_task(placeholder(), spec("child-c")).unwrap();
        let edit = TaskEdit {
            map: FieldEdit::Delete,
            skip: FieldEdit::Set(json!(false)),
            spec: Some("rank things carefully".to_string()),
            ..TaskEdit::default()
        };
        state.edit_task(0, edit).unwrap();
        let common = state.function.tasks[0].common();
        assert!(common.map.is_none());
        assert_eq!(common.skip, Some(json!(false)));
        assert!(common.output.is_none());
        assert_eq!(
            state.placeholder_task_specs[0].as_ref().unwrap().spec,
            "rank things carefully"
        );
    }

    #[test]
    fn test_edit_rejects_fields_foreign_to_kind() {
        let mut state = ArtifactState::default();
        state.append_task(inline(), None).unwrap();
        let edit = TaskEdit {
            spec: Some("nope".to_string()),
            ..TaskEdit::default()
        };
        assert!(state.edit_task(0, edit).is_err());
    }

    #[test]
    fn test_field_edit_from_json() {
        let args = json!({"skip": null, "map": 3});
        assert_eq!(FieldEdit::from_json(&args, "skip"), FieldEdit::Delete);
        assert_eq!(FieldEdit::from_json(&args, "map"), FieldEdit::Set(json!(3)));
        assert!(FieldEdit::from_json(&args, "output").is_keep());
    }

    #[test]
    fn test_resolve_placeholder_preserves_common_fields() {
        let mut state = ArtifactState::default();
        state.append_task(placeholder(), spec("child-d")).unwrap();
        let location = OwnerRepositoryCommit {
            owner: "acme".into(),
            repository: "child-d".into(),
            commit: "abc123".into(),
        };
        assert!(state.resolve_placeholder(0, &location));
        match &state.function.tasks[0] {
            Task::Reference {
                owner,
                repository,
                commit,
                common,
            } => {
                assert_eq!(owner, "acme");
                assert_eq!(repository, "child-d");
                assert_eq!(commit, "abc123");
                assert_eq!(common.map, Some(json!("$.items")));
            }
            other => panic!("expected reference, got {:?}", other),
        }
        assert!(state.placeholder_task_specs[0].is_none());
        assert!(!state.resolve_placeholder(0, &location));
        assert!(state.placeholder_alignment_errors().is_empty());
    }

    #[test]
    fn test_alignment_errors_detect_drift() {
        let mut state = ArtifactState::default();
        state.function.tasks.push(placeholder());
        let errors = state.placeholder_alignment_errors();
        assert!(errors.iter().any(|e| e.contains("missing its spec")));
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("rank-news-articles").is_ok());
        assert!(validate_name("a1").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("Upper").is_err());
        assert!(validate_name("double--dash").is_err());
        assert!(validate_name("-leading").is_err());
        assert!(validate_name("trailing-").is_err());
        assert!(validate_name("under_score").is_err());
        assert!(validate_name(&"a".repeat(MAX_NAME_BYTES)).is_ok());
        assert!(validate_name(&"a".repeat(MAX_NAME_BYTES + 1)).is_err());
    }

    #[test]
    fn test_state_serde_roundtrip_with_missing_specs_array() {
        let raw = json!({
            "name": "legacy",
            "function_type": "vector",
            "function": {"tasks": [{"kind": "inline", "body": {}}]}
        });
        let mut state: ArtifactState = serde_json::from_value(raw).unwrap();
        assert!(state.placeholder_task_specs.is_empty());
        state.append_task(inline(), None).unwrap();
        assert_eq!(state.placeholder_task_specs.len(), 2);
    }
}
