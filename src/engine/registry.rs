use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::EngineResult;
use crate::models::TaskStatus;

/// Per-dispatch context handed to a node handler alongside its resolved
/// parameters.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    pub workflow_id: Uuid,
    pub execution_id: Uuid,
    pub node_id: String,
    pub user_id: Uuid,
    /// The node's action label (e.g. "send" vs "send_and_wait").
    pub action: String,
    pub is_test: bool,
}

/// What a handler reports back. PENDING suspends the workflow until an
/// external event resumes it; the engine publishes no continuation for it.
#[derive(Debug, Clone)]
pub struct HandlerResult {
    pub success: bool,
    pub status: Option<TaskStatus>,
    pub data: Option<Value>,
    pub error: Option<String>,
}

impl HandlerResult {
    pub fn success(data: Option<Value>) -> Self {
        Self {
            success: true,
            status: Some(TaskStatus::Success),
            data,
            error: None,
        }
    }

    pub fn pending(data: Option<Value>) -> Self {
        Self {
            success: true,
            status: Some(TaskStatus::Pending),
            data,
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            status: Some(TaskStatus::Failed),
            data: None,
            error: Some(error.into()),
        }
    }

    /// Status to record on the task; an unspecified status on a successful
    /// result defaults to SUCCESS.
    pub fn task_status(&self) -> TaskStatus {
        match self.status {
            Some(status) => status,
            None if self.success => TaskStatus::Success,
            None => TaskStatus::Failed,
        }
    }
}

/// One node type's executable capability. Implementations live in
/// `crate::nodes`; the engine only sees this trait.
#[async_trait]
pub trait NodeHandler: Send + Sync {
    /// Cheap structural check of the resolved parameters, run before
    /// execute. An Err becomes a failure result, not an engine error.
    fn validate(&self, parameters: &Value) -> Result<(), String>;

    async fn execute(
        &self,
        parameters: &Value,
        ctx: &HandlerContext,
    ) -> EngineResult<HandlerResult>;
}

/// Node-type → handler mapping. New node types plug in here without
/// touching the engine loop.
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn NodeHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn register(&mut self, node_type: &str, handler: Arc<dyn NodeHandler>) {
        self.handlers.insert(node_type.to_string(), handler);
    }

    pub fn get(&self, node_type: &str) -> Option<Arc<dyn NodeHandler>> {
        self.handlers.get(node_type).cloned()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoHandler;

    #[async_trait]
    impl NodeHandler for EchoHandler {
        fn validate(&self, parameters: &Value) -> Result<(), String> {
            parameters
                .get("message")
                .map(|_| ())
                .ok_or_else(|| "missing message".to_string())
        }

        async fn execute(
            &self,
            parameters: &Value,
            _ctx: &HandlerContext,
        ) -> EngineResult<HandlerResult> {
            Ok(HandlerResult::success(Some(parameters.clone())))
        }
    }

    #[test]
    fn lookup_is_by_exact_type() {
        let mut registry = HandlerRegistry::new();
        registry.register("echo", Arc::new(EchoHandler));
        assert!(registry.get("echo").is_some());
        assert!(registry.get("unknown-type").is_none());
    }

    #[test]
    fn unspecified_status_defaults_to_success() {
        let result = HandlerResult {
            success: true,
            status: None,
            data: None,
            error: None,
        };
        assert_eq!(result.task_status(), TaskStatus::Success);

        assert_eq!(
            HandlerResult::pending(None).task_status(),
            TaskStatus::Pending
        );
        assert_eq!(
            HandlerResult::failure("boom").task_status(),
            TaskStatus::Failed
        );
    }
}
