use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::EngineResult;
use crate::models::{
    EmailWait, Execution, ExecutionStatus, ExecutionTask, Node, NodeConnection, OutboxEntry,
    OutboxStatus, TaskStatus, Workflow,
};

/// All relational access for the execution subsystem. One instance per
/// worker, cheap to clone (wraps the pool).
#[derive(Debug, Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    // ===== Workflows =====

    pub async fn load_workflow(&self, workflow_id: Uuid) -> EngineResult<Option<Workflow>> {
        let row: Option<(Uuid, Uuid, String, Value, Value)> = sqlx::query_as(
            r#"
            SELECT id, user_id, name, nodes, connections
            FROM workflows
            WHERE id = $1 AND is_active = true
            "#,
        )
        .bind(workflow_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some((id, user_id, name, nodes, connections)) = row else {
            return Ok(None);
        };

        let nodes: Vec<Node> = serde_json::from_value(nodes)?;
        let connections: Vec<NodeConnection> = serde_json::from_value(connections)?;

        Ok(Some(Workflow {
            id,
            user_id,
            name,
            nodes,
            connections,
        }))
    }

    // ===== Executions & tasks =====

    pub async fn mark_execution(
        &self,
        execution_id: Uuid,
        status: ExecutionStatus,
    ) -> EngineResult<()> {
        sqlx::query("UPDATE executions SET status = $2 WHERE id = $1")
            .bind(execution_id)
            .bind(status)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn execution(&self, execution_id: Uuid) -> EngineResult<Option<Execution>> {
        let execution = sqlx::query_as::<_, Execution>(
            "SELECT id, workflow_id, status, input, created_at FROM executions WHERE id = $1",
        )
        .bind(execution_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(execution)
    }

    /// All task rows for one execution, oldest first. Re-read on every
    /// event; node selection and parent-output resolution both come from
    /// this snapshot, so history from prior processes is covered.
    pub async fn tasks_for_execution(
        &self,
        execution_id: Uuid,
    ) -> EngineResult<Vec<ExecutionTask>> {
        let tasks = sqlx::query_as::<_, ExecutionTask>(
            r#"
            SELECT id, execution_id, node_id, status, attempts, input, output,
                   error, started_at, finished_at
            FROM execution_tasks
            WHERE execution_id = $1
            ORDER BY started_at ASC
            "#,
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(tasks)
    }

    /// The linearization point: atomically create the RUNNING task row for
    /// (execution, node). Returns None when the row already exists; the
    /// event is a duplicate delivery and must be dropped without side
    /// effects.
    pub async fn claim_task(
        &self,
        execution_id: Uuid,
        node_id: &str,
        input: Option<&Value>,
    ) -> EngineResult<Option<Uuid>> {
        let task_id: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO execution_tasks (id, execution_id, node_id, status, attempts, input, started_at)
            VALUES ($1, $2, $3, $4, 1, $5, NOW())
            ON CONFLICT (execution_id, node_id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(execution_id)
        .bind(node_id)
        .bind(TaskStatus::Running)
        .bind(input)
        .fetch_optional(&self.pool)
        .await?;

        Ok(task_id.map(|(id,)| id))
    }

    pub async fn complete_task(
        &self,
        task_id: Uuid,
        status: TaskStatus,
        output: Option<&Value>,
    ) -> EngineResult<()> {
        sqlx::query(
            "UPDATE execution_tasks SET status = $2, output = $3, finished_at = NOW() WHERE id = $1",
        )
        .bind(task_id)
        .bind(status)
        .bind(output)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn fail_task(&self, task_id: Uuid, error: &str) -> EngineResult<()> {
        sqlx::query(
            r#"
            UPDATE execution_tasks
            SET status = $2, attempts = attempts + 1, error = $3, finished_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(task_id)
        .bind(TaskStatus::Failed)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ===== Outbox =====

    /// Oldest unrelayed entries, bounded. TESTING rows are single-node
    /// test runs and relay the same way.
    pub async fn unsent_outbox(&self, limit: i64) -> EngineResult<Vec<OutboxEntry>> {
        let entries = sqlx::query_as::<_, OutboxEntry>(
            r#"
            SELECT id, workflow_id, execution_id, payload, status, created_at
            FROM outbox_entries
            WHERE status IN ('UNSENT', 'TESTING')
            ORDER BY created_at ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(entries)
    }

    pub async fn mark_outbox_sent(&self, ids: &[Uuid]) -> EngineResult<()> {
        sqlx::query("UPDATE outbox_entries SET status = $2 WHERE id = ANY($1)")
            .bind(ids)
            .bind(OutboxStatus::Sent)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ===== Ingestion boundary =====

    /// Record a triggering event: execution + its trigger-node task + the
    /// outbox intent, in one transaction. The outbox pattern's durable
    /// half; the sweeper relays it to the broker.
    pub async fn ingest(
        &self,
        workflow: &Workflow,
        payload: Value,
        is_test: bool,
        target_node_id: Option<&str>,
    ) -> EngineResult<Uuid> {
        let trigger = workflow
            .nodes
            .first()
            .map(|n| n.id.clone())
            .unwrap_or_default();
        let execution_id = Uuid::new_v4();

        let mut execution_payload = serde_json::json!({ "input": payload });
        if is_test {
            execution_payload["isTest"] = Value::Bool(true);
            if let Some(target) = target_node_id {
                execution_payload["targetNodeId"] = Value::String(target.to_string());
            }
        }

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO executions (id, workflow_id, status, input) VALUES ($1, $2, $3, $4)",
        )
        .bind(execution_id)
        .bind(workflow.id)
        .bind(ExecutionStatus::Running)
        .bind(&payload)
        .execute(&mut *tx)
        .await?;

        if !trigger.is_empty() {
            sqlx::query(
                r#"
                INSERT INTO execution_tasks
                    (id, execution_id, node_id, status, attempts, output, started_at, finished_at)
                VALUES ($1, $2, $3, $4, 1, $5, NOW(), NOW())
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(execution_id)
            .bind(&trigger)
            .bind(TaskStatus::Success)
            .bind(&payload)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            r#"
            INSERT INTO outbox_entries (id, workflow_id, execution_id, payload, status)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(workflow.id)
        .bind(execution_id)
        .bind(execution_payload.to_string())
        .bind(if is_test {
            OutboxStatus::Testing
        } else {
            OutboxStatus::Unsent
        })
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(execution_id)
    }

    // ===== Email waits =====

    pub async fn create_email_wait(
        &self,
        message_id: &str,
        workflow_id: Uuid,
        execution_id: Uuid,
        node_id: &str,
        user_id: Uuid,
        is_test: bool,
    ) -> EngineResult<Uuid> {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO email_waits (id, message_id, workflow_id, execution_id, node_id, user_id, is_test)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(id)
        .bind(message_id)
        .bind(workflow_id)
        .bind(execution_id)
        .bind(node_id)
        .bind(user_id)
        .bind(is_test)
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    /// Users with at least one outstanding wait; drives which mailboxes
    /// the matcher keeps connected.
    pub async fn waiting_users(&self) -> EngineResult<Vec<Uuid>> {
        let users: Vec<(Uuid,)> = sqlx::query_as(
            "SELECT DISTINCT user_id FROM email_waits WHERE status = 'WAITING'",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(users.into_iter().map(|(id,)| id).collect())
    }

    pub async fn waiting_for_user(&self, user_id: Uuid) -> EngineResult<Vec<EmailWait>> {
        let waits = sqlx::query_as::<_, EmailWait>(
            r#"
            SELECT id, message_id, workflow_id, execution_id, node_id, user_id, is_test, status
            FROM email_waits
            WHERE user_id = $1 AND status = 'WAITING'
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(waits)
    }

    /// Flip a wait to REPLIED and its task to SUCCESS in one transaction.
    /// The guarded wait update makes the transition exactly-once: a second
    /// matcher seeing the same reply gets false and does nothing.
    pub async fn resolve_wait(&self, wait: &EmailWait, reply: &Value) -> EngineResult<bool> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE email_waits SET status = 'REPLIED' WHERE id = $1 AND status = 'WAITING'",
        )
        .bind(wait.id)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            r#"
            UPDATE execution_tasks
            SET status = $3, output = $4, finished_at = NOW()
            WHERE id = (
                SELECT id FROM execution_tasks
                WHERE execution_id = $1 AND node_id = $2
                ORDER BY started_at DESC
                LIMIT 1
            )
            "#,
        )
        .bind(wait.execution_id)
        .bind(&wait.node_id)
        .bind(TaskStatus::Success)
        .bind(reply)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    // ===== Credentials =====

    pub async fn credential_secret(
        &self,
        user_id: Uuid,
        platform: &str,
    ) -> EngineResult<Option<String>> {
        let secret: Option<(String,)> = sqlx::query_as(
            "SELECT secret FROM credentials WHERE user_id = $1 AND platform = $2",
        )
        .bind(user_id)
        .bind(platform)
        .fetch_optional(&self.pool)
        .await?;
        Ok(secret.map(|(s,)| s))
    }
}
