//! Runtime registration of new subtasks.
//!
//! Workers that discover extra work call [`SpawnHandle::spawn_worker`]. The
//! registry allocates an id, snapshots the currently completed subtasks as
//! the new subtask's dependencies and queues it; the scheduler drains the
//! queue into the graph at the start of each iteration.

use crate::core::graph::TaskGraph;
use crate::core::task::{Subtask, SubtaskId, SubtaskOrigin};
use crate::error::{Error, Result};
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{info, warn};

/// Default cap on subtasks registered during one run.
pub const DEFAULT_MAX_DYNAMIC_TASKS: usize = 10;

#[derive(Debug)]
struct RegistryState {
    next_id: SubtaskId,
    done: BTreeSet<SubtaskId>,
    pending: Vec<Subtask>,
    registered: usize,
}

/// Shared, mutex-guarded queue of runtime-registered subtasks.
#[derive(Debug)]
pub struct DynamicTaskRegistry {
    state: Mutex<RegistryState>,
    max_dynamic_tasks: usize,
}

impl DynamicTaskRegistry {
    /// Create a registry whose first allocated id is `first_id`.
    pub fn new(first_id: SubtaskId, max_dynamic_tasks: usize) -> Self {
        Self {
            state: Mutex::new(RegistryState {
                next_id: first_id,
                done: BTreeSet::new(),
                pending: Vec::new(),
                registered: 0,
            }),
            max_dynamic_tasks,
        }
    }

    /// Create a registry allocating ids after the graph's largest id.
    pub fn for_graph(graph: &TaskGraph, max_dynamic_tasks: usize) -> Arc<Self> {
        Arc::new(Self::new(graph.max_id().next(), max_dynamic_tasks))
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new subtask that depends on everything completed so far.
    ///
    /// # Errors
    ///
    /// [`Error::SpawnLimit`] once `max_dynamic_tasks` subtasks were registered,
    /// [`Error::Validation`] for an empty title.
    pub fn register(
        &self,
        title: &str,
        description: &str,
        context: Option<&str>,
    ) -> Result<SubtaskId> {
        self.register_from(None, title, description, context)
    }

    fn register_from(
        &self,
        requested_by: Option<SubtaskId>,
        title: &str,
        description: &str,
        context: Option<&str>,
    ) -> Result<SubtaskId> {
        if title.trim().is_empty() {
            return Err(Error::Validation("spawned subtask needs a title".to_string()));
        }
        let description = match context.filter(|c| !c.is_empty()) {
            Some(context) => format!("{}\n\nContext:\n{}", description, context),
            None => description.to_string(),
        };

        let mut state = self.lock();
        if state.registered >= self.max_dynamic_tasks {
            warn!(
                max = self.max_dynamic_tasks,
                title, "dynamic subtask refused, limit reached"
            );
            return Err(Error::SpawnLimit {
                max: self.max_dynamic_tasks,
            });
        }
        let id = state.next_id;
        state.next_id = id.next();
        state.registered += 1;
        let subtask = Subtask::new(id, title, &description)
            .with_dependencies(state.done.iter().copied())
            .with_origin(SubtaskOrigin::Spawned { by: requested_by });
        state.pending.push(subtask);
        drop(state);

        info!(subtask_id = %id, title, "registered dynamic subtask");
        Ok(id)
    }

    /// Mirror a `Done` transition into the dependency snapshot.
    pub fn record_done(&self, id: SubtaskId) {
        self.lock().done.insert(id);
    }

    /// Take every queued subtask, in registration order.
    pub fn drain(&self) -> Vec<Subtask> {
        std::mem::take(&mut self.lock().pending)
    }

    pub fn has_pending(&self) -> bool {
        !self.lock().pending.is_empty()
    }

    /// Number of subtasks registered so far.
    pub fn registered(&self) -> usize {
        self.lock().registered
    }
}

/// Handle given to workers for registering follow-up subtasks.
#[derive(Debug, Clone)]
pub struct SpawnHandle {
    registry: Arc<DynamicTaskRegistry>,
    requested_by: Option<SubtaskId>,
}

impl SpawnHandle {
    pub fn new(registry: Arc<DynamicTaskRegistry>) -> Self {
        Self {
            registry,
            requested_by: None,
        }
    }

    /// The same handle, attributing registrations to `id`.
    pub fn for_subtask(&self, id: SubtaskId) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
            requested_by: Some(id),
        }
    }

    /// Register a subtask and return the acknowledgement shown to the agent.
    ///
    /// Refusals are reported in the acknowledgement text, never as errors,
    /// so a worker keeps running when the limit is hit.
    pub fn spawn_worker(&self, title: &str, description: &str, context: Option<&str>) -> String {
        match self
            .registry
            .register_from(self.requested_by, title, description, context)
        {
            Ok(id) => format!("Spawned worker [{}]: {}", id, title),
            Err(e) => format!("Failed to spawn worker: {}", e),
        }
    }

    /// JSON schema of the `spawn_worker` tool for backends that advertise tools.
    pub fn tool_definition() -> serde_json::Value {
        json!({
            "type": "function",
            "function": {
                "name": "spawn_worker",
                "description": "Dynamically spawn an additional worker agent to handle a new subtask that wasn't in the original plan. Use this when you discover additional work that needs to be done.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "title": {"type": "string", "description": "Short title for the subtask"},
                        "description": {"type": "string", "description": "Detailed description of what the worker should do"},
                        "context": {"type": "string", "description": "Any additional context or results from previous workers that this worker needs"}
                    },
                    "required": ["title", "description"]
                }
            }
        })
    }
}
