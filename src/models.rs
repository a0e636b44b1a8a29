use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "execution_status", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum ExecutionStatus {
    Running,
    Success,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "task_status", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskStatus {
    Running,
    Pending,
    Success,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "outbox_status", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum OutboxStatus {
    Unsent,
    Testing,
    Sent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "wait_status", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum WaitStatus {
    Waiting,
    Replied,
}

/// One step in a workflow graph. The declared position in the workflow's
/// node array is the execution order; the engine does not topologically
/// sort.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub parameters: Value,
    #[serde(default)]
    pub credentials: Vec<String>,
}

/// Directed edge: output of `from` feeds `to`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConnection {
    pub from: String,
    pub to: String,
}

/// Immutable-per-run workflow definition; read-only to the core.
#[derive(Debug, Clone)]
pub struct Workflow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub nodes: Vec<Node>,
    pub connections: Vec<NodeConnection>,
}

impl Workflow {
    pub fn node(&self, node_id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == node_id)
    }

    /// Parent node id of `node_id`, if any. None means a root/trigger node.
    pub fn parent_of(&self, node_id: &str) -> Option<&str> {
        self.connections
            .iter()
            .find(|c| c.to == node_id)
            .map(|c| c.from.as_str())
    }

    /// Node fed by `node_id`'s output, if any.
    pub fn child_of(&self, node_id: &str) -> Option<&str> {
        self.connections
            .iter()
            .find(|c| c.from == node_id)
            .map(|c| c.to.as_str())
    }
}

#[derive(Debug, Clone, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Execution {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub status: ExecutionStatus,
    pub input: Option<Value>,
    pub created_at: DateTime<Utc>,
}

/// The record of one node's attempt within one execution. The pair
/// (execution_id, node_id) is unique; inserting it is the linearization
/// point for duplicate/concurrent deliveries.
#[derive(Debug, Clone, FromRow)]
pub struct ExecutionTask {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub node_id: String,
    pub status: TaskStatus,
    pub attempts: i32,
    pub input: Option<Value>,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxEntry {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub execution_id: Uuid,
    pub payload: String,
    pub status: OutboxStatus,
    #[serde(skip)]
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct EmailWait {
    pub id: Uuid,
    pub message_id: String,
    pub workflow_id: Uuid,
    pub execution_id: Uuid,
    pub node_id: String,
    pub user_id: Uuid,
    pub is_test: bool,
    pub status: WaitStatus,
}

/// "Advance this execution by one more node." The broker message value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContinuationEvent {
    pub workflow_id: Uuid,
    pub execution_id: Uuid,
    #[serde(default, alias = "targetId", skip_serializing_if = "Option::is_none")]
    pub target_node_id: Option<String>,
    #[serde(default)]
    pub is_test: bool,
}

impl ContinuationEvent {
    pub fn new(workflow_id: Uuid, execution_id: Uuid) -> Self {
        Self {
            workflow_id,
            execution_id,
            target_node_id: None,
            is_test: false,
        }
    }

    /// Lenient parse of a broker message. Relayed outbox rows carry the
    /// same required top-level fields; test-run target/flags may sit
    /// inside the stringified `payload`. Returns None when the required
    /// ids are missing or malformed.
    pub fn parse(raw: &str) -> Option<Self> {
        let value: Value = serde_json::from_str(raw).ok()?;
        let mut event: ContinuationEvent = serde_json::from_value(value.clone()).ok()?;

        if event.target_node_id.is_none() {
            let inner = value
                .get("payload")
                .or_else(|| value.get("ExecutionPayload"))
                .and_then(Value::as_str)
                .and_then(|s| serde_json::from_str::<Value>(s).ok());

            if let Some(inner) = inner {
                event.target_node_id = inner
                    .get("targetNodeId")
                    .or_else(|| inner.get("targetId"))
                    .and_then(Value::as_str)
                    .map(str::to_string);
                if !event.is_test {
                    event.is_test = inner
                        .get("isTest")
                        .and_then(Value::as_bool)
                        .unwrap_or(false);
                }
            }
        }

        Some(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_continuation() {
        let wf = Uuid::new_v4();
        let ex = Uuid::new_v4();
        let raw = format!(r#"{{"workflowId":"{wf}","executionId":"{ex}"}}"#);
        let event = ContinuationEvent::parse(&raw).expect("event");
        assert_eq!(event.workflow_id, wf);
        assert_eq!(event.execution_id, ex);
        assert!(event.target_node_id.is_none());
        assert!(!event.is_test);
    }

    #[test]
    fn accepts_legacy_target_alias() {
        let raw = format!(
            r#"{{"workflowId":"{}","executionId":"{}","targetId":"node-2","isTest":true}}"#,
            Uuid::new_v4(),
            Uuid::new_v4()
        );
        let event = ContinuationEvent::parse(&raw).expect("event");
        assert_eq!(event.target_node_id.as_deref(), Some("node-2"));
        assert!(event.is_test);
    }

    #[test]
    fn extracts_target_from_relayed_outbox_row() {
        let raw = format!(
            r#"{{"id":"{}","workflowId":"{}","executionId":"{}","payload":"{{\"targetNodeId\":\"node-3\",\"isTest\":true}}","status":"TESTING"}}"#,
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4()
        );
        let event = ContinuationEvent::parse(&raw).expect("event");
        assert_eq!(event.target_node_id.as_deref(), Some("node-3"));
        assert!(event.is_test);
    }

    #[test]
    fn rejects_malformed_events() {
        assert!(ContinuationEvent::parse("not json").is_none());
        assert!(ContinuationEvent::parse(r#"{"workflowId":"abc"}"#).is_none());
        assert!(
            ContinuationEvent::parse(&format!(r#"{{"workflowId":"{}"}}"#, Uuid::new_v4()))
                .is_none()
        );
    }

    #[test]
    fn parent_lookup_follows_connections() {
        let workflow = Workflow {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            name: "wf".into(),
            nodes: vec![],
            connections: vec![NodeConnection {
                from: "trigger".into(),
                to: "send".into(),
            }],
        };
        assert_eq!(workflow.parent_of("send"), Some("trigger"));
        assert_eq!(workflow.parent_of("trigger"), None);
        assert_eq!(workflow.child_of("trigger"), Some("send"));
        assert_eq!(workflow.child_of("send"), None);
    }
}
