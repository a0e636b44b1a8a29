use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::transport::smtp::{authentication::Credentials, PoolConfig};
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

use crate::config::SmtpConfig;
use crate::credentials::CredentialResolver;
use crate::engine::registry::{HandlerContext, HandlerResult, NodeHandler};
use crate::error::{EngineError, EngineResult};
use crate::store::Store;

/// Outbound mail. Action `send` completes immediately; action
/// `send_and_wait` registers an email wait keyed by the outbound
/// Message-ID and suspends the workflow (PENDING) until the reply
/// matcher sees an answer.
pub struct EmailSendHandler {
    store: Store,
    resolver: Arc<CredentialResolver>,
    fallback: SmtpConfig,
    /// Per-user SMTP transports; lettre pools connections internally, so
    /// one transport per user is enough.
    transports: Mutex<HashMap<Uuid, AsyncSmtpTransport<Tokio1Executor>>>,
}

impl EmailSendHandler {
    pub fn new(store: Store, resolver: Arc<CredentialResolver>, fallback: SmtpConfig) -> Self {
        Self {
            store,
            resolver,
            fallback,
            transports: Mutex::new(HashMap::new()),
        }
    }

    /// The user's own SMTP credential when present, otherwise the global
    /// deployment transport.
    async fn transport_for(
        &self,
        user_id: Uuid,
    ) -> EngineResult<(AsyncSmtpTransport<Tokio1Executor>, Mailbox)> {
        let mut transports = self.transports.lock().await;

        let (host, port, username, password, from_email, from_name) =
            if self.resolver.fetch("smtp", user_id).await? {
                let cred = self.resolver.require("smtp", user_id).await?;
                (
                    cred.str_field("host").unwrap_or(&self.fallback.host).to_string(),
                    cred.u16_field("port").unwrap_or(self.fallback.port),
                    cred.str_field("username").unwrap_or_default().to_string(),
                    cred.str_field("password").unwrap_or_default().to_string(),
                    cred.str_field("from_email")
                        .unwrap_or(&self.fallback.from_email)
                        .to_string(),
                    cred.str_field("from_name")
                        .unwrap_or(&self.fallback.from_name)
                        .to_string(),
                )
            } else {
                if !self.fallback.is_configured() {
                    return Err(EngineError::Config(format!(
                        "no smtp credential for user {user_id} and no global transport configured"
                    )));
                }
                (
                    self.fallback.host.clone(),
                    self.fallback.port,
                    self.fallback.username.clone(),
                    self.fallback.password.clone(),
                    self.fallback.from_email.clone(),
                    self.fallback.from_name.clone(),
                )
            };

        let from: Mailbox = format!("{from_name} <{from_email}>").parse()?;

        if let Some(transport) = transports.get(&user_id) {
            return Ok((transport.clone(), from));
        }

        let transport = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&host)
            .port(port)
            .credentials(Credentials::new(username, password))
            .pool_config(PoolConfig::new().max_size(4))
            .timeout(Some(Duration::from_secs(10)))
            .build();

        transports.insert(user_id, transport.clone());
        Ok((transport, from))
    }
}

fn message_domain(from: &Mailbox) -> String {
    from.email
        .to_string()
        .split('@')
        .nth(1)
        .unwrap_or("flowd.local")
        .to_string()
}

#[async_trait]
impl NodeHandler for EmailSendHandler {
    fn validate(&self, parameters: &Value) -> Result<(), String> {
        match parameters.get("to").and_then(Value::as_str) {
            Some(to) if !to.is_empty() => Ok(()),
            _ => Err("missing 'to' parameter".to_string()),
        }
    }

    async fn execute(
        &self,
        parameters: &Value,
        ctx: &HandlerContext,
    ) -> EngineResult<HandlerResult> {
        let to = parameters["to"].as_str().unwrap_or_default();
        let subject = parameters
            .get("subject")
            .and_then(Value::as_str)
            .unwrap_or("(no subject)");
        let body = parameters
            .get("body")
            .and_then(Value::as_str)
            .unwrap_or_default();

        let (transport, from) = self.transport_for(ctx.user_id).await?;
        let message_id = format!("<{}@{}>", Uuid::new_v4(), message_domain(&from));

        let message = Message::builder()
            .from(from)
            .to(to.parse::<Mailbox>()?)
            .subject(subject)
            .message_id(Some(message_id.clone()))
            .body(body.to_string())?;

        transport.send(message).await?;
        info!("mail {message_id} sent to {to}");

        let wait_for_reply = matches!(ctx.action.as_str(), "send_and_wait" | "send-and-wait");
        if !wait_for_reply {
            return Ok(HandlerResult::success(Some(json!({
                "messageId": message_id
            }))));
        }

        self.store
            .create_email_wait(
                &message_id,
                ctx.workflow_id,
                ctx.execution_id,
                &ctx.node_id,
                ctx.user_id,
                ctx.is_test,
            )
            .await?;

        // PENDING: the engine publishes no continuation; the matcher will
        // when (and if) a reply arrives.
        Ok(HandlerResult::pending(Some(json!({
            "messageId": message_id,
            "waiting": true,
        }))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_comes_from_sender_address() {
        let from: Mailbox = "flowd <noreply@example.com>".parse().expect("mailbox");
        assert_eq!(message_domain(&from), "example.com");
    }
}
