//! Batch grouping and concurrency correctness.

use crate::fixtures::*;
use async_trait::async_trait;
use relay::core::WorkflowDefinition;
use relay::error::Result;
use relay::orchestration::{OperationContext, OperationRunner, WorkflowEvent};
use relay::workflow::WorkflowStatus;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Tracks the peak number of simultaneously running operations.
struct ConcurrencyProbe {
    current: AtomicUsize,
    peak: AtomicUsize,
    hold: Duration,
}

impl ConcurrencyProbe {
    fn new(hold: Duration) -> Arc<Self> {
        Arc::new(Self {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            hold,
        })
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OperationRunner for ConcurrencyProbe {
    async fn run(&self, _ctx: OperationContext) -> Result<Value> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.hold).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(json!(now))
    }
}

async fn batch_events(harness: &TestHarness) -> Vec<Vec<String>> {
    tokio::time::sleep(Duration::from_millis(50)).await;
    harness
        .recorded_events()
        .iter()
        .filter_map(|e| match e {
            WorkflowEvent::BatchStarted { phases, .. } => {
                Some(phases.iter().map(|p| p.to_string()).collect())
            }
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_fan_in_groups_independent_phases() {
    let harness = TestHarness::new(RecordingRunner::new());
    harness
        .orchestrator
        .execute(&fan_in_definition())
        .await
        .unwrap();

    let batches = batch_events(&harness).await;
    assert_eq!(batches.len(), 2);
    assert_eq!(batches[0], vec!["a".to_string(), "b".to_string()]);
    assert_eq!(batches[1], vec!["c".to_string()]);
}

#[tokio::test]
async fn test_diamond_runs_middles_together() {
    let harness = TestHarness::new(RecordingRunner::new());
    harness
        .orchestrator
        .execute(&diamond_definition())
        .await
        .unwrap();

    let batches = batch_events(&harness).await;
    assert_eq!(batches.len(), 3);
    assert_eq!(batches[1], vec!["left".to_string(), "right".to_string()]);
}

#[tokio::test]
async fn test_batch_order_follows_declaration_order() {
    let harness = TestHarness::new(RecordingRunner::new());
    let definition = WorkflowDefinition::new("declaration")
        .with_phase(phase("zeta", &[]))
        .with_phase(phase("alpha", &[]));
    harness.orchestrator.execute(&definition).await.unwrap();

    let batches = batch_events(&harness).await;
    assert_eq!(batches[0], vec!["zeta".to_string(), "alpha".to_string()]);
}

#[tokio::test]
async fn test_independent_phases_actually_overlap() {
    let probe = ConcurrencyProbe::new(Duration::from_millis(100));
    let harness = TestHarness::new(probe.clone());

    let definition = WorkflowDefinition::new("wide")
        .with_phase(phase("a", &[]))
        .with_phase(phase("b", &[]))
        .with_phase(phase("c", &[]));

    let start = Instant::now();
    let result = harness.orchestrator.execute(&definition).await.unwrap();

    assert_eq!(result.status, WorkflowStatus::Completed);
    assert!(probe.peak() >= 2, "phases should overlap, peak was {}", probe.peak());
    // Three 100ms phases in parallel should take well under 300ms
    assert!(start.elapsed() < Duration::from_millis(280));
}

#[tokio::test]
async fn test_concurrency_limit_bounds_parallelism() {
    let probe = ConcurrencyProbe::new(Duration::from_millis(30));
    let harness = TestHarness::with_setup(probe.clone(), 2, lenient_breakers());

    let mut definition = WorkflowDefinition::new("bounded");
    for i in 0..8 {
        definition = definition.with_phase(phase(&format!("p{}", i), &[]));
    }
    harness.orchestrator.execute(&definition).await.unwrap();

    assert!(probe.peak() <= 2, "limit 2 exceeded, peak was {}", probe.peak());
}

#[tokio::test]
async fn test_dependent_phase_waits_for_whole_batch() {
    let runner = RecordingRunner::new();
    let harness = TestHarness::new(runner.clone());
    harness
        .orchestrator
        .execute(&fan_in_definition())
        .await
        .unwrap();

    let order = runner.phases_run();
    let pos = |id: &str| order.iter().position(|p| p == id).unwrap();
    assert!(pos("c") > pos("a"));
    assert!(pos("c") > pos("b"));
}

#[tokio::test]
async fn test_one_slow_phase_does_not_block_unrelated_chain() {
    // Two disjoint chains; slowness in one must not change results in
    // the other.
    struct MixedRunner;

    #[async_trait]
    impl OperationRunner for MixedRunner {
        async fn run(&self, ctx: OperationContext) -> Result<Value> {
            if ctx.phase_id.as_str().starts_with("slow") {
                tokio::time::sleep(Duration::from_millis(80)).await;
            }
            Ok(json!("ok"))
        }
    }

    let harness = TestHarness::new(Arc::new(MixedRunner));
    let definition = WorkflowDefinition::new("two-chains")
        .with_phase(phase("slow-a", &[]))
        .with_phase(phase("fast-a", &[]))
        .with_phase(phase("slow-b", &["slow-a"]))
        .with_phase(phase("fast-b", &["fast-a"]));

    let result = harness.orchestrator.execute(&definition).await.unwrap();
    assert_eq!(result.status, WorkflowStatus::Completed);
    assert_eq!(result.completed_phases.len(), 4);
}
