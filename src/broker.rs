use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use tracing::info;

use crate::config::BrokerConfig;
use crate::error::EngineResult;
use crate::models::ContinuationEvent;

/// One message as delivered by the stream. `id` is the broker offset;
/// acknowledging it is the commit.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub id: String,
    pub payload: String,
}

/// The single continuation-event topic, backed by a Redis Stream with one
/// consumer group per deployment. Auto-commit does not exist here by
/// construction: a message leaves the pending list only on explicit ack.
#[derive(Clone)]
pub struct Broker {
    manager: ConnectionManager,
    config: BrokerConfig,
}

impl Broker {
    pub async fn connect(config: BrokerConfig) -> EngineResult<Self> {
        let client = redis::Client::open(config.redis_url.as_str())?;
        let manager = client.get_connection_manager().await?;
        let broker = Self { manager, config };
        broker.ensure_group().await?;
        Ok(broker)
    }

    async fn ensure_group(&self) -> EngineResult<()> {
        let mut con = self.manager.clone();
        let created: Result<(), redis::RedisError> = con
            .xgroup_create_mkstream(&self.config.stream, &self.config.group, "0")
            .await;
        match created {
            Ok(()) => {
                info!(stream = %self.config.stream, group = %self.config.group, "consumer group created");
                Ok(())
            }
            // Group already exists: another worker got there first.
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn publish(&self, event: &ContinuationEvent) -> EngineResult<()> {
        let raw = serde_json::to_string(event)?;
        let mut con = self.manager.clone();
        let _id: String = con
            .xadd(&self.config.stream, "*", &[("payload", raw.as_str())])
            .await?;
        Ok(())
    }

    /// One pipelined append per sweeper batch.
    pub async fn publish_batch(&self, payloads: &[String]) -> EngineResult<()> {
        if payloads.is_empty() {
            return Ok(());
        }
        let mut con = self.manager.clone();
        let mut pipe = redis::pipe();
        for payload in payloads {
            pipe.xadd(&self.config.stream, "*", &[("payload", payload.as_str())]);
        }
        pipe.query_async::<_, ()>(&mut con).await?;
        Ok(())
    }

    /// This consumer's un-acked backlog: messages delivered before a crash
    /// whose offsets were never committed. Drained once at startup so
    /// withheld acks turn into redelivery.
    pub async fn read_backlog(&self, count: usize) -> EngineResult<Vec<Delivery>> {
        let options = StreamReadOptions::default()
            .group(&self.config.group, &self.config.consumer)
            .count(count);
        self.read(&options, "0").await
    }

    /// Block for new messages, up to `count` at a time. An empty result
    /// means the block timeout elapsed.
    pub async fn read_new(&self, count: usize) -> EngineResult<Vec<Delivery>> {
        let options = StreamReadOptions::default()
            .group(&self.config.group, &self.config.consumer)
            .count(count)
            .block(self.config.block_timeout.as_millis() as usize);
        self.read(&options, ">").await
    }

    async fn read(&self, options: &StreamReadOptions, id: &str) -> EngineResult<Vec<Delivery>> {
        let mut con = self.manager.clone();
        let reply: StreamReadReply = con
            .xread_options(&[self.config.stream.as_str()], &[id], options)
            .await?;

        let mut deliveries = Vec::new();
        for key in reply.keys {
            for entry in key.ids {
                let payload = match entry.map.get("payload") {
                    Some(redis::Value::Data(bytes)) => {
                        String::from_utf8_lossy(bytes).into_owned()
                    }
                    _ => String::new(),
                };
                deliveries.push(Delivery {
                    id: entry.id,
                    payload,
                });
            }
        }
        Ok(deliveries)
    }

    /// Commit one message. Called only after full per-message handling.
    pub async fn ack(&self, delivery_id: &str) -> EngineResult<()> {
        let mut con = self.manager.clone();
        let _acked: i64 = con
            .xack(&self.config.stream, &self.config.group, &[delivery_id])
            .await?;
        Ok(())
    }
}
