//! Runtime registration of subtasks by running workers.

use std::sync::Arc;

use maestro::core::{SubtaskId, SubtaskOrigin, TaskStatus};
use maestro::orchestration::{Orchestrator, RunTermination};

use crate::fixtures::{
    fast_config, fast_scheduler_config, graph, plan_json, scheduler, MockBackend, WorkerScript,
};

fn spawning(spawns: &[(&str, &str)]) -> WorkerScript {
    WorkerScript {
        spawns: spawns
            .iter()
            .map(|(title, description)| (title.to_string(), description.to_string(), None))
            .collect(),
        ..WorkerScript::default()
    }
}

#[tokio::test(start_paused = true)]
async fn test_spawned_subtask_depends_on_completed_work() {
    let backend = Arc::new(
        MockBackend::new().with_script(3, spawning(&[("Write docs", "document the API")])),
    );
    let (s, registry) = scheduler(
        graph(&[(1, &[]), (2, &[]), (3, &[1, 2])]),
        Arc::clone(&backend),
        fast_scheduler_config(4),
    );
    let report = s.run().await.unwrap();

    assert_eq!(registry.registered(), 1);
    assert_eq!(
        backend.acknowledgements.lock().unwrap().as_slice(),
        ["Spawned worker [4]: Write docs"]
    );

    let spawned = report.graph.get(&SubtaskId(4)).unwrap();
    assert_eq!(spawned.dependencies, vec![SubtaskId(1), SubtaskId(2)]);
    assert_eq!(
        spawned.origin,
        SubtaskOrigin::Spawned {
            by: Some(SubtaskId(3))
        }
    );
    assert_eq!(report.statuses[&SubtaskId(4)], TaskStatus::Done);
    assert_eq!(report.termination, RunTermination::Completed);
}

#[tokio::test(start_paused = true)]
async fn test_spawned_subtask_context_is_appended() {
    let backend = Arc::new(MockBackend::new().with_script(
        1,
        WorkerScript {
            spawns: vec![(
                "Fix lint".to_string(),
                "fix the warnings".to_string(),
                Some("clippy found 3 warnings".to_string()),
            )],
            ..WorkerScript::default()
        },
    ));
    let (s, _) = scheduler(graph(&[(1, &[])]), Arc::clone(&backend), fast_scheduler_config(2));
    s.run().await.unwrap();

    let request = backend.request_for(2).unwrap();
    assert!(request
        .prompt
        .contains("fix the warnings\n\nContext:\nclippy found 3 warnings"));
    // Subtask 1 was still running when 2 was registered.
    assert!(!request.system.contains("prerequisite"));
}

#[tokio::test(start_paused = true)]
async fn test_spawn_limit_is_enforced() {
    let spawns: Vec<(String, String)> = (0..12)
        .map(|i| (format!("Extra {}", i), format!("extra work {}", i)))
        .collect();
    let borrowed: Vec<(&str, &str)> = spawns
        .iter()
        .map(|(t, d)| (t.as_str(), d.as_str()))
        .collect();
    let backend = Arc::new(MockBackend::new().with_script(1, spawning(&borrowed)));
    let (s, registry) = scheduler(graph(&[(1, &[])]), Arc::clone(&backend), fast_scheduler_config(4));
    let report = s.run().await.unwrap();

    assert_eq!(registry.registered(), 10);
    let acks = backend.acknowledgements.lock().unwrap().clone();
    assert_eq!(acks.len(), 12);
    assert!(acks[..10].iter().all(|a| a.starts_with("Spawned worker [")));
    assert!(acks[10..]
        .iter()
        .all(|a| a == "Failed to spawn worker: Dynamic task limit reached (max: 10)"));

    assert_eq!(report.graph.len(), 11);
    assert_eq!(report.outcomes.completed_count(), 11);
    assert!(backend.peak_concurrency() <= 4);
}

#[tokio::test(start_paused = true)]
async fn test_spawned_subtasks_appear_in_report() {
    let backend = Arc::new(
        MockBackend::new()
            .with_plan(&plan_json(&[(1, "Scaffold", &[]), (2, "Implement", &[1])]))
            .with_script(2, spawning(&[("Add tests", "cover the new code")])),
    );
    let report = Orchestrator::new(backend.clone(), fast_config())
        .run("build X")
        .await
        .unwrap();

    assert_eq!(report.subtasks.len(), 3);
    let extra = report
        .outcomes
        .iter()
        .find(|o| o.id == SubtaskId(3))
        .unwrap();
    assert_eq!(extra.title, "Add tests");
    assert!(extra.is_done());
    assert_eq!(report.completed(), 3);

    let aggregate = backend.aggregate_requests.lock().unwrap();
    assert!(aggregate[0].prompt.contains("## ✅ Subtask 3: Add tests\nresult of 3"));
}
