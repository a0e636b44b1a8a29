use std::collections::HashMap;
use std::sync::Arc;

use mail_parser::MessageParser;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::Broker;
use crate::config::MatcherConfig;
use crate::credentials::CredentialResolver;
use crate::error::{EngineError, EngineResult};
use crate::mail::cache::{ImapSession, SessionCache};
use crate::models::{ContinuationEvent, EmailWait};
use crate::store::Store;

/// Resumes suspended send-and-wait nodes. Each cycle scans the inbox of
/// every user with an open wait for unseen mail whose In-Reply-To header
/// matches a tracked Message-ID, flips the wait and its task, and
/// publishes the continuation the engine withheld at suspension time.
pub struct ReplyMatcher {
    store: Store,
    broker: Arc<Broker>,
    resolver: Arc<CredentialResolver>,
    config: MatcherConfig,
    cache: SessionCache<ImapSession>,
}

struct ReplyMatch {
    seq: u32,
    wait: EmailWait,
    reply: Value,
}

impl ReplyMatcher {
    pub fn new(
        store: Store,
        broker: Arc<Broker>,
        resolver: Arc<CredentialResolver>,
        config: MatcherConfig,
    ) -> Self {
        let cache = SessionCache::new(config.cache_capacity, config.cache_ttl);
        Self {
            store,
            broker,
            resolver,
            config,
            cache,
        }
    }

    /// Never returns. One failing user never blocks the others; only a
    /// failure to list waiting users backs the whole loop off.
    pub async fn run(mut self) {
        info!(
            interval = ?self.config.poll_interval,
            "email reply matcher started"
        );
        loop {
            match self.scan_cycle().await {
                Ok(()) => tokio::time::sleep(self.config.poll_interval).await,
                Err(err) => {
                    error!("reply matcher cycle failed: {err}");
                    tokio::time::sleep(self.config.error_backoff).await;
                }
            }
        }
    }

    async fn scan_cycle(&mut self) -> EngineResult<()> {
        let waiting = self.store.waiting_users().await?;

        // Users whose every wait has resolved keep no connection open.
        let active: std::collections::HashSet<Uuid> = waiting.iter().copied().collect();
        for user in self.cache.users() {
            if !active.contains(&user) {
                if let Some(session) = self.cache.remove(&user) {
                    logout_quietly(session);
                }
            }
        }

        for user in waiting {
            if let Err(err) = self.scan_user(user).await {
                warn!("mailbox scan for user {user} failed: {err}");
                // A broken session poisons every later command; rebuild
                // it on the next cycle.
                if let Some(session) = self.cache.remove(&user) {
                    logout_quietly(session);
                }
            }
        }
        Ok(())
    }

    async fn scan_user(&mut self, user: Uuid) -> EngineResult<()> {
        let waits = self.store.waiting_for_user(user).await?;
        if waits.is_empty() {
            return Ok(());
        }
        let index: HashMap<String, &EmailWait> = waits
            .iter()
            .map(|w| (normalize_message_id(&w.message_id), w))
            .collect();

        self.ensure_session(user).await?;

        let matches = {
            let Some(session) = self.cache.get_mut(&user) else {
                return Ok(());
            };
            collect_matches(session, &index)?
        };

        for matched in matches {
            self.resolve(user, matched).await?;
        }
        Ok(())
    }

    async fn resolve(&mut self, user: Uuid, matched: ReplyMatch) -> EngineResult<()> {
        let wait = &matched.wait;
        // Guarded transition; false means another scan already took it.
        if self.store.resolve_wait(wait, &matched.reply).await? {
            let mut event = ContinuationEvent::new(wait.workflow_id, wait.execution_id);
            if wait.is_test {
                event.is_test = true;
                event.target_node_id = self.next_node_after(wait).await?;
            }
            self.broker.publish(&event).await?;
            info!(
                execution = %wait.execution_id,
                node = %wait.node_id,
                "reply matched, execution resumed"
            );
        } else {
            debug!(wait = %wait.id, "wait already resolved, skipping");
        }

        // Seen mail is never rescanned; this is the double-processing
        // guard for the mailbox side.
        if let Some(session) = self.cache.get_mut(&user) {
            session.store(matched.seq.to_string(), "+FLAGS (\\Seen)")?;
        }
        Ok(())
    }

    /// Test runs step one node at a time, so the resume event has to name
    /// the node that follows the suspended one.
    async fn next_node_after(&mut self, wait: &EmailWait) -> EngineResult<Option<String>> {
        let workflow = self.store.load_workflow(wait.workflow_id).await?;
        Ok(workflow
            .as_ref()
            .and_then(|w| w.child_of(&wait.node_id))
            .map(str::to_string))
    }

    async fn ensure_session(&mut self, user: Uuid) -> EngineResult<()> {
        if self.cache.is_fresh(&user) {
            return Ok(());
        }
        if let Some(stale) = self.cache.remove(&user) {
            logout_quietly(stale);
        }

        let cred = self.resolver.require("imap", user).await?;
        let host = cred
            .str_field("host")
            .ok_or_else(|| EngineError::Config("imap credential missing host".into()))?
            .to_string();
        let port = cred.u16_field("port").unwrap_or(993);
        let username = cred.str_field("username").unwrap_or_default().to_string();
        let password = cred.str_field("password").unwrap_or_default().to_string();

        let tls = native_tls::TlsConnector::builder().build()?;
        let client = imap::connect((host.as_str(), port), host.as_str(), &tls)?;
        let mut session = client.login(username, password).map_err(|e| e.0)?;
        session.select("INBOX")?;

        info!("imap session established for user {user}");
        for displaced in self.cache.insert(user, session) {
            logout_quietly(displaced);
        }
        Ok(())
    }
}

/// Fetches every unseen message and keeps the ones whose In-Reply-To
/// points at a tracked wait. Unmatched mail stays unseen; it belongs to
/// the user, not to us.
fn collect_matches(
    session: &mut ImapSession,
    index: &HashMap<String, &EmailWait>,
) -> EngineResult<Vec<ReplyMatch>> {
    let mut matches = Vec::new();
    let unseen = session.search("UNSEEN")?;
    for seq in unseen {
        let fetches = session.fetch(seq.to_string(), "RFC822")?;
        let Some(fetch) = fetches.iter().next() else {
            continue;
        };
        let Some(body) = fetch.body() else {
            continue;
        };
        let Some(message) = MessageParser::default().parse(body) else {
            continue;
        };
        let Some(in_reply_to) = in_reply_to_id(&message) else {
            continue;
        };
        let Some(wait) = index.get(&normalize_message_id(&in_reply_to)) else {
            continue;
        };

        let reply = json!({
            "from": message
                .from()
                .and_then(|f| f.first())
                .and_then(|a| a.address())
                .unwrap_or_default(),
            "subject": message.subject().unwrap_or_default(),
            "body": message.body_text(0).unwrap_or_default(),
            "messageId": message.message_id().unwrap_or_default(),
        });
        matches.push(ReplyMatch {
            seq,
            wait: (*wait).clone(),
            reply,
        });
    }
    Ok(matches)
}

fn in_reply_to_id(message: &mail_parser::Message) -> Option<String> {
    let header = message.in_reply_to();
    header
        .as_text()
        .map(str::to_string)
        .or_else(|| {
            header
                .as_text_list()
                .and_then(|list| list.first().map(|s| s.to_string()))
        })
}

/// Message-IDs arrive with and without angle brackets depending on the
/// sending client; compare them without.
fn normalize_message_id(raw: &str) -> String {
    raw.trim()
        .trim_start_matches('<')
        .trim_end_matches('>')
        .to_string()
}

fn logout_quietly(mut session: ImapSession) {
    if let Err(err) = session.logout() {
        debug!("imap logout failed: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_ids_compare_without_brackets() {
        assert_eq!(normalize_message_id("<abc@host>"), "abc@host");
        assert_eq!(normalize_message_id("abc@host"), "abc@host");
        assert_eq!(normalize_message_id("  <abc@host>  "), "abc@host");
    }

    #[test]
    fn in_reply_to_is_read_from_raw_mail() {
        let raw = b"From: Ann <ann@example.com>\r\n\
            To: bot@flowd.local\r\n\
            Subject: Re: approval needed\r\n\
            Message-ID: <reply-1@example.com>\r\n\
            In-Reply-To: <original-9@flowd.local>\r\n\
            \r\n\
            Approved, go ahead.\r\n";
        let message = MessageParser::default().parse(&raw[..]).expect("parse");
        assert_eq!(
            in_reply_to_id(&message).as_deref(),
            Some("<original-9@flowd.local>")
        );
        assert_eq!(message.subject(), Some("Re: approval needed"));
        assert_eq!(
            message.body_text(0).as_deref(),
            Some("Approved, go ahead.\r\n")
        );
    }
}
