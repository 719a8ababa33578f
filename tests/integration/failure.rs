//! Failure containment tests.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;

use maestro::core::{FailureCause, SubtaskId, TaskStatus};
use maestro::orchestration::{
    AgentBackend, AggregateRequest, Orchestrator, PlanRequest, RunTermination, SpawnHandle,
    WorkerRequest,
};
use maestro::{Error, Result};

use crate::fixtures::{
    fast_config, fast_scheduler_config, graph, plan_json, scheduler, MockBackend, WorkerScript,
};

#[tokio::test(start_paused = true)]
async fn test_failure_cascades_to_transitive_dependents() {
    let backend = Arc::new(MockBackend::new().failing(1, "compile error"));
    let (s, _) = scheduler(
        graph(&[(1, &[]), (2, &[1]), (3, &[2])]),
        Arc::clone(&backend),
        fast_scheduler_config(4),
    );
    let report = s.run().await.unwrap();

    assert_eq!(report.termination, RunTermination::Stalled);
    assert!(report.iterations <= 5, "took {} iterations", report.iterations);
    assert_eq!(backend.started_ids(), vec![1]);

    let first = report.outcomes.get(&SubtaskId(1)).unwrap();
    assert_eq!(first.cause, Some(FailureCause::Worker));
    assert_eq!(first.result, "Backend error: compile error");
    for id in [2, 3] {
        assert_eq!(report.statuses[&SubtaskId(id)], TaskStatus::Failed);
        assert!(matches!(
            report.outcomes.get(&SubtaskId(id)).unwrap().cause,
            Some(FailureCause::Cascade { .. })
        ));
    }
}

#[tokio::test(start_paused = true)]
async fn test_failure_does_not_stop_independent_work() {
    let backend = Arc::new(MockBackend::new().failing(1, "boom").with_delay(3, 100));
    let (s, _) = scheduler(
        graph(&[(1, &[]), (2, &[1]), (3, &[]), (4, &[3])]),
        Arc::clone(&backend),
        fast_scheduler_config(4),
    );
    let report = s.run().await.unwrap();

    assert_eq!(report.statuses[&SubtaskId(3)], TaskStatus::Done);
    assert_eq!(report.statuses[&SubtaskId(4)], TaskStatus::Done);
    assert_eq!(report.outcomes.completed_count(), 2);
    assert_eq!(report.outcomes.failed_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_worker_panic_is_contained() {
    let backend = Arc::new(MockBackend::new().with_script(
        2,
        WorkerScript {
            panic: true,
            ..WorkerScript::default()
        },
    ));
    let (s, _) = scheduler(
        graph(&[(1, &[]), (2, &[]), (3, &[2])]),
        Arc::clone(&backend),
        fast_scheduler_config(4),
    );
    let report = s.run().await.unwrap();

    let crashed = report.outcomes.get(&SubtaskId(2)).unwrap();
    assert!(crashed.result.starts_with("Worker crashed: mock worker 2 panicked"));
    assert_eq!(report.statuses[&SubtaskId(1)], TaskStatus::Done);
    assert_eq!(
        report.outcomes.get(&SubtaskId(3)).unwrap().cause,
        Some(FailureCause::Cascade {
            dependency: SubtaskId(2)
        })
    );
}

/// Backend whose `execute` panics before it returns a future for one subtask.
struct EagerPanicBackend {
    panic_on: SubtaskId,
}

#[async_trait]
impl AgentBackend for EagerPanicBackend {
    async fn plan(&self, _request: &PlanRequest) -> Result<String> {
        Ok(String::new())
    }

    fn execute<'life0, 'async_trait>(
        &'life0 self,
        request: WorkerRequest,
        _spawn: SpawnHandle,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'async_trait>>
    where
        'life0: 'async_trait,
    {
        if request.subtask_id == self.panic_on {
            panic!("eager panic in worker {}", request.subtask_id);
        }
        Box::pin(async move { Ok(format!("result of {}", request.subtask_id)) })
    }

    async fn aggregate(&self, _request: &AggregateRequest) -> Result<String> {
        Ok(String::new())
    }
}

#[tokio::test(start_paused = true)]
async fn test_panic_before_future_fails_only_its_subtask() {
    let backend = Arc::new(EagerPanicBackend {
        panic_on: SubtaskId(2),
    });
    let (s, _) = scheduler(
        graph(&[(1, &[]), (2, &[]), (3, &[]), (4, &[2])]),
        backend,
        fast_scheduler_config(4),
    );
    let report = s.run().await.unwrap();

    assert_eq!(report.termination, RunTermination::Stalled);
    assert_eq!(report.statuses[&SubtaskId(1)], TaskStatus::Done);
    assert_eq!(report.statuses[&SubtaskId(3)], TaskStatus::Done);

    let crashed = report.outcomes.get(&SubtaskId(2)).unwrap();
    assert_eq!(crashed.status, TaskStatus::Failed);
    assert_eq!(crashed.cause, Some(FailureCause::Worker));
    assert_eq!(crashed.result, "Worker crashed: eager panic in worker 2");
    assert_eq!(
        report.outcomes.get(&SubtaskId(4)).unwrap().cause,
        Some(FailureCause::Cascade {
            dependency: SubtaskId(2)
        })
    );
}

#[tokio::test(start_paused = true)]
async fn test_cyclic_plan_is_rejected() {
    let backend = Arc::new(
        MockBackend::new().with_plan(&plan_json(&[(1, "A", &[2]), (2, "B", &[1])])),
    );
    let orchestrator = Orchestrator::new(backend.clone(), fast_config());

    let err = orchestrator.run("build X").await.unwrap_err();
    match err {
        Error::CyclicDependency { cycle } => {
            assert!(cycle.contains(&SubtaskId(1)) && cycle.contains(&SubtaskId(2)));
        }
        other => panic!("expected cycle error, got {other:?}"),
    }
    assert!(backend.started_ids().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_all_failed_still_aggregated() {
    let backend = Arc::new(
        MockBackend::new()
            .with_plan(&plan_json(&[(1, "A", &[]), (2, "B", &[])]))
            .failing(1, "first broke")
            .failing(2, "second broke"),
    );
    let report = Orchestrator::new(backend.clone(), fast_config())
        .run("build X")
        .await
        .unwrap();

    assert_eq!(report.completed(), 0);
    assert_eq!(report.failed(), 2);
    let requests = backend.aggregate_requests.lock().unwrap();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].prompt.contains("## ❌ Subtask 1: A\nBackend error: first broke"));
    assert!(requests[0].prompt.contains("## ❌ Subtask 2: B\nBackend error: second broke"));
}

#[tokio::test(start_paused = true)]
async fn test_aggregation_failure_falls_back_to_raw_results() {
    let backend = Arc::new(
        MockBackend::new()
            .with_plan(&plan_json(&[(1, "A", &[])]))
            .with_aggregate_error("overloaded"),
    );
    let report = Orchestrator::new(backend, fast_config())
        .run("build X")
        .await
        .unwrap();

    assert!(report.aggregation_failed);
    assert!(report
        .summary
        .starts_with("Aggregation failed: Backend error: overloaded\n\nIndividual results:\n"));
    assert!(report.summary.contains("## ✅ Subtask 1: A\nresult of 1"));
    assert!(report.termination.is_success());
}

#[tokio::test(start_paused = true)]
async fn test_hung_worker_exhausts_run_budget() {
    let backend = Arc::new(MockBackend::new().with_script(
        1,
        WorkerScript {
            hang: true,
            ..WorkerScript::default()
        },
    ));
    let mut config = fast_scheduler_config(2);
    config.run_timeout = Some(std::time::Duration::from_secs(30));
    let (s, _) = scheduler(graph(&[(1, &[]), (2, &[]), (3, &[1])]), backend, config);
    let report = s.run().await.unwrap();

    assert!(matches!(
        report.termination,
        RunTermination::BudgetExhausted { .. }
    ));
    assert_eq!(report.statuses[&SubtaskId(2)], TaskStatus::Done);
    for id in [1, 3] {
        assert_eq!(
            report.outcomes.get(&SubtaskId(id)).unwrap().cause,
            Some(FailureCause::BudgetExhausted)
        );
    }
}
