//! Task decomposition: planner prompts and lenient plan parsing.
//!
//! The planner is asked for a `{"subtasks": [...]}` JSON document. Output is
//! accepted leniently (markdown fences, string ids, missing fields) and
//! handed to [`TaskGraph::build`](crate::core::graph::TaskGraph::build),
//! which performs the structural repairs and validation.

use crate::config::Config;
use crate::core::task::{Subtask, SubtaskId};
use crate::error::Result;
use crate::orchestration::backend::{AgentBackend, PlanRequest};
use crate::orchestration::usage::UsageTracker;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, LazyLock};
use tracing::{debug, info, warn};

/// Matches an opening markdown fence at the start of a line.
static OPEN_FENCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^```(?:json)?\s*").unwrap());

/// Matches a closing markdown fence at the end of a line.
static CLOSE_FENCE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)\s*```$").unwrap());

/// System prompt for the planner.
pub fn planner_system_prompt(max_subtasks: usize) -> String {
    format!(
        r#"You are an expert task orchestrator. Your job is to decompose a complex task into smaller, parallelizable subtasks.

Output ONLY valid JSON (no markdown fences, no explanation) in this exact format:
{{
  "subtasks": [
    {{
      "id": 1,
      "title": "Short title",
      "description": "Detailed description of what to do",
      "dependencies": []
    }},
    {{
      "id": 2,
      "title": "Another subtask",
      "description": "...",
      "dependencies": [1]
    }}
  ]
}}

Rules:
- Maximum {max_subtasks} subtasks
- dependencies is a list of subtask ids that must complete BEFORE this one starts
- Maximize parallelism: tasks with no shared dependencies can run simultaneously
- Each subtask should be self-contained and actionable
- Be specific: include filenames, function names, etc. when known"#
    )
}

/// User prompt for the planner: the task plus truncated working context.
pub fn planner_prompt(task: &str, context: &str, context_chars: usize) -> String {
    let context: String = context.chars().take(context_chars).collect();
    format!("Task: {}\n\nWorking directory context:\n{}", task, context)
}

/// Remove markdown code fences around a JSON document.
pub fn strip_fences(raw: &str) -> String {
    let trimmed = raw.trim();
    let opened = OPEN_FENCE_RE.replace_all(trimmed, "");
    CLOSE_FENCE_RE.replace_all(&opened, "").trim().to_string()
}

#[derive(Debug, Deserialize)]
struct RawPlan {
    #[serde(default)]
    subtasks: Vec<RawSubtask>,
}

#[derive(Debug, Deserialize)]
struct RawSubtask {
    #[serde(default)]
    id: Value,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    dependencies: Vec<Value>,
}

/// Interpret a JSON value as a subtask id. Non-positive or non-numeric
/// values map to the invalid id 0.
fn lenient_id(value: &Value) -> SubtaskId {
    let parsed = match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    };
    match parsed {
        Some(n) if n > 0 => SubtaskId(n as u64),
        _ => SubtaskId(0),
    }
}

/// Parse planner output into candidate subtasks.
///
/// # Errors
///
/// Returns [`Error::Json`] when the text is not a JSON plan document.
/// An empty `subtasks` list is not an error.
pub fn parse_plan(raw: &str) -> Result<Vec<Subtask>> {
    let cleaned = strip_fences(raw);
    let plan: RawPlan = serde_json::from_str(&cleaned)?;

    let subtasks = plan
        .subtasks
        .into_iter()
        .map(|raw| {
            let id = lenient_id(&raw.id);
            let title = raw
                .title
                .filter(|t| !t.trim().is_empty())
                .unwrap_or_else(|| format!("Subtask {}", id));
            let description = raw
                .description
                .filter(|d| !d.trim().is_empty())
                .unwrap_or_else(|| title.clone());
            let deps: Vec<SubtaskId> = raw
                .dependencies
                .iter()
                .map(lenient_id)
                .filter(|dep| {
                    if !dep.is_valid() {
                        warn!(subtask_id = %id, "dropping non-numeric or non-positive dependency");
                    }
                    dep.is_valid()
                })
                .collect();
            Subtask::new(id, &title, &description).with_dependencies(deps)
        })
        .collect();

    Ok(subtasks)
}

/// Ask the planner for a decomposition, trying each configured model in turn.
///
/// Returns the first non-empty parsed plan. When every model fails, returns
/// an empty list, which the graph builder turns into a single subtask.
/// Every attempt runs in `workdir` and records on `usage`.
pub async fn request_plan(
    backend: &dyn AgentBackend,
    config: &Config,
    task: &str,
    base_system: &str,
    workdir: &Path,
    usage: &Arc<UsageTracker>,
) -> Vec<Subtask> {
    let system = planner_system_prompt(config.max_subtasks);
    let prompt = planner_prompt(task, base_system, config.planner_context_chars);

    for alias in &config.planner_models {
        let model = config.resolve_model(alias).to_string();
        info!(model = %model, "requesting plan");
        let request = PlanRequest {
            task: task.to_string(),
            system: system.clone(),
            prompt: prompt.clone(),
            model: model.clone(),
            workdir: workdir.to_path_buf(),
            usage: Arc::clone(usage),
        };

        let attempt = match backend.plan(&request).await {
            Ok(raw) => parse_plan(&raw),
            Err(e) => Err(e),
        };
        match attempt {
            Ok(subtasks) if !subtasks.is_empty() => {
                debug!(model = %model, subtasks = subtasks.len(), "plan parsed");
                return subtasks;
            }
            Ok(_) => warn!(model = %model, "plan attempt returned no subtasks"),
            Err(e) => warn!(model = %model, error = %e, "plan attempt failed"),
        }
    }

    warn!("could not generate a plan, running as a single task");
    Vec::new()
}
