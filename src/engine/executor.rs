use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::broker::{Broker, Delivery};
use crate::engine::registry::{HandlerContext, HandlerRegistry, HandlerResult};
use crate::engine::template::resolve_parameters;
use crate::error::EngineResult;
use crate::models::{ContinuationEvent, ExecutionStatus, ExecutionTask, Node, TaskStatus};
use crate::store::Store;

/// Pause inserted before resuming the consume loop after an unexpected
/// engine-level error, so a poisoned message cannot hot-loop.
const CRASH_PAUSE: Duration = Duration::from_secs(2);

const READ_BATCH: usize = 10;

/// Consumes continuation events and advances each execution by exactly
/// one node per event. Multiple engine instances may run concurrently in
/// one consumer group; the unique task insert is the only coordination.
pub struct ExecutionEngine {
    store: Store,
    broker: Broker,
    registry: Arc<HandlerRegistry>,
}

/// Outcome of node selection for one event.
#[derive(Debug, PartialEq)]
enum Selection<'a> {
    Run(&'a Node),
    /// Test-mode target already has a task row for this execution.
    AlreadyRan,
    /// Test-mode target is not a node of this workflow.
    UnknownTarget,
    /// Every declared node has run; the execution is complete.
    Finished,
}

impl ExecutionEngine {
    pub fn new(store: Store, broker: Broker, registry: Arc<HandlerRegistry>) -> Self {
        Self {
            store,
            broker,
            registry,
        }
    }

    /// The consumer loop. Never returns under normal operation.
    pub async fn run(&self) {
        info!("execution engine started; draining pending backlog");

        // Messages delivered before a restart but never acked come back
        // first: this is how a withheld ack turns into redelivery.
        loop {
            match self.broker.read_backlog(READ_BATCH).await {
                Ok(backlog) if backlog.is_empty() => break,
                Ok(backlog) => {
                    for delivery in backlog {
                        self.process(delivery).await;
                    }
                }
                Err(e) => {
                    error!("failed to read pending backlog: {e}");
                    tokio::time::sleep(CRASH_PAUSE).await;
                }
            }
        }

        loop {
            match self.broker.read_new(READ_BATCH).await {
                Ok(deliveries) => {
                    for delivery in deliveries {
                        self.process(delivery).await;
                    }
                }
                Err(e) => {
                    error!("broker read failed: {e}");
                    tokio::time::sleep(CRASH_PAUSE).await;
                }
            }
        }
    }

    /// Handle one delivery and commit its offset. Only an unexpected
    /// engine-level error withholds the ack (forcing redelivery); every
    /// drop case in the error taxonomy still commits.
    async fn process(&self, delivery: Delivery) {
        match self.handle_event(&delivery.payload).await {
            Ok(()) => {
                if let Err(e) = self.broker.ack(&delivery.id).await {
                    error!("failed to ack {}: {e}", delivery.id);
                }
            }
            Err(e) => {
                error!("engine error on {} (will be redelivered): {e}", delivery.id);
                tokio::time::sleep(CRASH_PAUSE).await;
            }
        }
    }

    /// Advance the workflow by one node. Ok(()) means "handled, commit";
    /// Err means infrastructure failed mid-event and the offset must not
    /// be committed.
    async fn handle_event(&self, raw: &str) -> EngineResult<()> {
        let Some(event) = ContinuationEvent::parse(raw) else {
            warn!("dropping malformed event: {raw}");
            return Ok(());
        };

        let Some(workflow) = self.store.load_workflow(event.workflow_id).await? else {
            warn!("dropping event for missing workflow {}", event.workflow_id);
            return Ok(());
        };
        if workflow.nodes.is_empty() {
            warn!("dropping event for empty workflow {}", workflow.id);
            return Ok(());
        }

        let prior = self.store.tasks_for_execution(event.execution_id).await?;
        let completed: HashSet<&str> = prior.iter().map(|t| t.node_id.as_str()).collect();

        let target = if event.is_test {
            event.target_node_id.as_deref()
        } else {
            None
        };

        let node = match select_node(&workflow.nodes, &completed, target) {
            Selection::Run(node) => node,
            Selection::AlreadyRan | Selection::UnknownTarget => return Ok(()),
            Selection::Finished => {
                self.store
                    .mark_execution(event.execution_id, ExecutionStatus::Success)
                    .await?;
                info!("execution {} finished", event.execution_id);
                return Ok(());
            }
        };

        let parent_output = workflow
            .parent_of(&node.id)
            .and_then(|parent| latest_output(&prior, parent))
            .cloned();

        // Linearization point. A duplicate delivery loses the insert race
        // and is dropped here with no side effects.
        let Some(task_id) = self
            .store
            .claim_task(event.execution_id, &node.id, parent_output.as_ref())
            .await?
        else {
            info!(
                "duplicate delivery for ({}, {}); dropping",
                event.execution_id, node.id
            );
            return Ok(());
        };

        let parameters = resolve_parameters(&node.parameters, parent_output.as_ref());
        let ctx = HandlerContext {
            workflow_id: workflow.id,
            execution_id: event.execution_id,
            node_id: node.id.clone(),
            user_id: workflow.user_id,
            action: node.action.clone(),
            is_test: event.is_test,
        };

        let result = dispatch(&self.registry, node, &parameters, &ctx).await;

        if result.success {
            let status = result.task_status();
            self.store
                .complete_task(task_id, status, result.data.as_ref())
                .await?;

            if status == TaskStatus::Success {
                self.broker
                    .publish(&ContinuationEvent::new(workflow.id, event.execution_id))
                    .await?;
            } else {
                // PENDING: suspended until the wait/resume matcher injects
                // the next continuation.
                info!(
                    "execution {} suspended at node {}",
                    event.execution_id, node.id
                );
            }
        } else {
            let message = result.error.unwrap_or_else(|| "node failed".to_string());
            warn!(
                "node {} failed in execution {}: {message}",
                node.id, event.execution_id
            );
            self.store.fail_task(task_id, &message).await?;
        }

        Ok(())
    }
}

/// Look up and run the handler. Everything that can go wrong inside a
/// handler (unknown type, validation, execution error) collapses to a
/// failure result; it never aborts the event.
async fn dispatch(
    registry: &HandlerRegistry,
    node: &Node,
    parameters: &Value,
    ctx: &HandlerContext,
) -> HandlerResult {
    let Some(handler) = registry.get(&node.node_type) else {
        return HandlerResult::failure(format!("unknown node type '{}'", node.node_type));
    };

    if let Err(message) = handler.validate(parameters) {
        return HandlerResult::failure(message);
    }

    match handler.execute(parameters, ctx).await {
        Ok(result) => result,
        Err(e) => HandlerResult::failure(e.to_string()),
    }
}

/// Node selection for one event. Test runs target one exact node; full
/// runs take the first node in declared order that has no task row yet.
fn select_node<'a>(
    nodes: &'a [Node],
    completed: &HashSet<&str>,
    target: Option<&str>,
) -> Selection<'a> {
    if let Some(target_id) = target {
        return match nodes.iter().find(|n| n.id == target_id) {
            Some(_) if completed.contains(target_id) => Selection::AlreadyRan,
            Some(node) => Selection::Run(node),
            None => Selection::UnknownTarget,
        };
    }

    match nodes.iter().find(|n| !completed.contains(n.id.as_str())) {
        Some(node) => Selection::Run(node),
        None => Selection::Finished,
    }
}

/// Most recently finished output for a node, from the execution's task
/// snapshot (which includes tasks written by prior processes and events).
fn latest_output<'a>(tasks: &'a [ExecutionTask], node_id: &str) -> Option<&'a Value> {
    tasks
        .iter()
        .rev()
        .find(|t| t.node_id == node_id && t.output.is_some())
        .and_then(|t| t.output.as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    fn node(id: &str) -> Node {
        Node {
            id: id.to_string(),
            node_type: "http".to_string(),
            action: String::new(),
            parameters: json!({}),
            credentials: vec![],
        }
    }

    fn task(node_id: &str, output: Option<Value>) -> ExecutionTask {
        ExecutionTask {
            id: Uuid::new_v4(),
            execution_id: Uuid::new_v4(),
            node_id: node_id.to_string(),
            status: TaskStatus::Success,
            attempts: 1,
            input: None,
            output,
            error: None,
            started_at: Utc::now(),
            finished_at: Some(Utc::now()),
        }
    }

    #[test]
    fn full_run_picks_first_unrun_in_declared_order() {
        let nodes = vec![node("a"), node("b"), node("c")];
        let completed: HashSet<&str> = ["a"].into_iter().collect();
        match select_node(&nodes, &completed, None) {
            Selection::Run(n) => assert_eq!(n.id, "b"),
            other => panic!("expected Run(b), got {other:?}"),
        }
    }

    #[test]
    fn all_nodes_run_means_finished() {
        let nodes = vec![node("a"), node("b")];
        let completed: HashSet<&str> = ["a", "b"].into_iter().collect();
        assert_eq!(select_node(&nodes, &completed, None), Selection::Finished);
    }

    #[test]
    fn test_mode_targets_exact_node() {
        let nodes = vec![node("a"), node("b")];
        let completed = HashSet::new();
        match select_node(&nodes, &completed, Some("b")) {
            Selection::Run(n) => assert_eq!(n.id, "b"),
            other => panic!("expected Run(b), got {other:?}"),
        }
    }

    #[test]
    fn test_mode_skips_already_run_target() {
        let nodes = vec![node("a")];
        let completed: HashSet<&str> = ["a"].into_iter().collect();
        assert_eq!(select_node(&nodes, &completed, Some("a")), Selection::AlreadyRan);
    }

    #[test]
    fn test_mode_rejects_unknown_target() {
        let nodes = vec![node("a")];
        let completed = HashSet::new();
        assert_eq!(
            select_node(&nodes, &completed, Some("missing")),
            Selection::UnknownTarget
        );
    }

    #[tokio::test]
    async fn unregistered_node_type_yields_a_failed_result() {
        let registry = HandlerRegistry::new();
        let mut unknown = node("n1");
        unknown.node_type = "carrier-pigeon".to_string();
        let ctx = HandlerContext {
            workflow_id: Uuid::new_v4(),
            execution_id: Uuid::new_v4(),
            node_id: unknown.id.clone(),
            user_id: Uuid::new_v4(),
            action: String::new(),
            is_test: false,
        };

        let result = dispatch(&registry, &unknown, &json!({}), &ctx).await;
        assert!(!result.success);
        assert_eq!(result.task_status(), TaskStatus::Failed);
        assert!(result.error.expect("error").contains("carrier-pigeon"));
    }

    #[test]
    fn latest_output_takes_most_recent_finished_row() {
        let tasks = vec![
            task("a", Some(json!({"v": 1}))),
            task("b", None),
            task("a", Some(json!({"v": 2}))),
        ];
        assert_eq!(latest_output(&tasks, "a"), Some(&json!({"v": 2})));
        assert_eq!(latest_output(&tasks, "b"), None);
        assert_eq!(latest_output(&tasks, "c"), None);
    }
}
