//! Project context gathered from the working directory.
//!
//! Planner and workers share one base system prompt that names the working
//! directory and, when recognisable, the project type and the leading part of
//! its key manifest and readme files.

use std::fs;
use std::path::Path;
use tracing::debug;

/// Indicator files and the project type they imply, in detection order.
pub const PROJECT_INDICATORS: &[(&str, &str)] = &[
    ("package.json", "Node.js"),
    ("requirements.txt", "Python"),
    ("pyproject.toml", "Python"),
    ("Cargo.toml", "Rust"),
    ("go.mod", "Go"),
    ("pom.xml", "Java (Maven)"),
    ("composer.json", "PHP"),
    ("build.gradle", "Java (Gradle)"),
];

/// Files whose leading content is included verbatim.
pub const CONTEXT_FILES: &[&str] = &[
    "README.md",
    "README.txt",
    "package.json",
    "pyproject.toml",
    "Cargo.toml",
];

/// Characters kept from each context file.
pub const CONTEXT_FILE_CHARS: usize = 2000;

/// Project types detected in `workdir`, duplicates collapsed.
pub fn detect_project_types(workdir: &Path) -> Vec<&'static str> {
    let mut types: Vec<&'static str> = Vec::new();
    for (file, kind) in PROJECT_INDICATORS {
        if workdir.join(file).exists() && !types.contains(kind) {
            types.push(kind);
        }
    }
    types
}

/// Collect the project context for `workdir`, or `None` when nothing is found.
pub fn load_project_context(workdir: &Path) -> Option<String> {
    let mut parts = Vec::new();

    let types = detect_project_types(workdir);
    if !types.is_empty() {
        parts.push(format!("### Detected Project Type\n{}", types.join(", ")));
    }

    for file in CONTEXT_FILES {
        let path = workdir.join(file);
        let Ok(bytes) = fs::read(&path) else {
            continue;
        };
        let content: String = String::from_utf8_lossy(&bytes)
            .chars()
            .take(CONTEXT_FILE_CHARS)
            .collect();
        debug!(file, chars = content.chars().count(), "loaded project context file");
        parts.push(format!("### {}\n{}", file, content));
    }

    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n\n"))
    }
}

/// Base system prompt shared by every agent call of a run.
pub fn system_prompt(workdir: &Path, project_context: Option<&str>) -> String {
    let shown = fs::canonicalize(workdir).unwrap_or_else(|_| workdir.to_path_buf());
    let mut base = format!(
        "You are an expert coding assistant. Working directory: {}\n\n\
         Workflow:\n\
         1. Explore first (list and read the key files)\n\
         2. Make precise, targeted edits\n\
         3. Run tests/builds to verify\n\
         4. Report clearly what changed and why\n\n\
         Be concise. Show diffs when editing. Verify your changes work.",
        shown.display()
    );
    if let Some(ctx) = project_context {
        base.push_str("\n\n## Project Context\n");
        base.push_str(ctx);
    }
    base
}
