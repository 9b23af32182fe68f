use std::sync::Arc;

use serde_json::Value;
use tracing::instrument;

use crate::envelope::Envelope;
use crate::error::ShardingError;
use crate::message::{MessageExit, MessageState, WireMessage};
use crate::sharding::Sharding;
use crate::types::{EntityAddress, EntityId, EntityType, PodAddress};

/// User-facing facade for messaging one entity type.
///
/// Derives addresses, serializes envelopes, resolves the owning pod from
/// the local assignment cache, and hands off to the sharding runtime.
pub struct Messenger {
    entity_type: EntityType,
    sharding: Arc<Sharding>,
}

impl Messenger {
    pub(crate) fn new(entity_type: EntityType, sharding: Arc<Sharding>) -> Self {
        Self {
            entity_type,
            sharding,
        }
    }

    pub fn entity_type(&self) -> &EntityType {
        &self.entity_type
    }

    /// Fire-and-forget send. The message is durably persisted by the
    /// owning pod before the call returns.
    #[instrument(skip_all, fields(entity_type = %self.entity_type))]
    pub async fn tell(
        &self,
        entity_id: impl Into<EntityId>,
        tag: impl Into<String>,
        body: Value,
    ) -> Result<(), ShardingError> {
        let message = self.build_message(tag, body);
        self.route(entity_id.into(), message).await?;
        Ok(())
    }

    /// Send and await the terminal processing state of the message.
    ///
    /// The wait is storage-mediated: the caller polls the mailbox store
    /// for the `Processed` state written by the entity's replier. There is
    /// no built-in timeout; bound the call with `tokio::time::timeout` if
    /// the caller needs one.
    #[instrument(skip_all, fields(entity_type = %self.entity_type))]
    pub async fn ask(
        &self,
        entity_id: impl Into<EntityId>,
        tag: impl Into<String>,
        body: Value,
    ) -> Result<MessageExit, ShardingError> {
        let message = self.build_message(tag, body);
        let primary_key = message.primary_key.clone();
        let address = self.route(entity_id.into(), message).await?;

        let poll_interval = self.sharding.config().ask_poll_interval;
        let storage = Arc::clone(self.sharding.storage());
        loop {
            if let Some(MessageState::Processed { exit }) =
                storage.message_state(&address, &primary_key).await?
            {
                return Ok(exit);
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    /// Convenience wrapper around [`ask`](Self::ask) that decodes a
    /// successful exit into a typed value and surfaces failures as
    /// malformed-message errors.
    pub async fn ask_decoded<T: serde::de::DeserializeOwned>(
        &self,
        entity_id: impl Into<EntityId>,
        tag: impl Into<String>,
        body: Value,
    ) -> Result<T, ShardingError> {
        match self.ask(entity_id, tag, body).await? {
            MessageExit::Success { value } => {
                serde_json::from_value(value).map_err(|e| ShardingError::MalformedMessage {
                    reason: "failed to decode reply value".to_string(),
                    source: Some(Box::new(e)),
                })
            }
            MessageExit::Failure { cause } => Err(ShardingError::MalformedMessage {
                reason: format!("entity failed: {cause}"),
                source: None,
            }),
        }
    }

    fn build_message(&self, tag: impl Into<String>, body: Value) -> WireMessage {
        WireMessage::new(self.sharding.next_primary_key(), tag, body)
    }

    /// Resolve the owning pod and dispatch. An unassigned shard means the
    /// cache is stale or the cluster is rebalancing; the caller may
    /// refresh and retry.
    async fn route(
        &self,
        entity_id: EntityId,
        message: WireMessage,
    ) -> Result<EntityAddress, ShardingError> {
        let address = self
            .sharding
            .derive_address(self.entity_type.clone(), entity_id);
        let pod = self.owner_of(&address)?;
        let encoded = Envelope::new(address.clone(), message).encode()?;
        self.sharding.send_envelope(&pod, &encoded).await?;
        Ok(address)
    }

    fn owner_of(&self, address: &EntityAddress) -> Result<PodAddress, ShardingError> {
        match self.sharding.assignments().get(&address.shard_id) {
            Some(Some(pod)) => Ok(pod.clone()),
            _ => Err(ShardingError::not_managed(address.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ShardingConfig;
    use crate::entity::{EntityBehavior, EntityContext, EntityMessage};
    use crate::mailbox::Mailbox;
    use crate::metrics::ClusterMetrics;
    use crate::shard_manager_client::LocalShardManagerClient;
    use crate::storage::memory_mailbox::MemoryMailboxStorage;
    use crate::storage::noop_pods::NoopPods;
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;

    const SHARDS: u32 = 16;

    struct CounterBehavior;

    #[async_trait]
    impl EntityBehavior for CounterBehavior {
        fn entity_type(&self) -> EntityType {
            EntityType::new("Counter")
        }

        async fn run(
            &self,
            _ctx: EntityContext,
            mut mailbox: Mailbox<EntityMessage>,
        ) -> Result<(), ShardingError> {
            let mut count = 0i64;
            while let Some(msg) = mailbox.take().await {
                match msg.message.tag.as_str() {
                    "Inc" => {
                        count += 1;
                        msg.replier.succeed(json!(count)).await?;
                    }
                    "Get" => msg.replier.succeed(json!(count)).await?,
                    "Boom" => msg.replier.fail(json!("boom")).await?,
                    other => {
                        msg.replier
                            .fail_cause(format!("unknown tag: {other}"))
                            .await?
                    }
                }
            }
            Ok(())
        }
    }

    async fn messenger() -> Messenger {
        let config = ShardingConfig {
            number_of_shards: SHARDS,
            send_retry_interval: Duration::from_millis(10),
            ask_poll_interval: Duration::from_millis(5),
            ..Default::default()
        };
        let pod = config.pod_address.clone();
        let sharding = Sharding::new(
            config,
            Arc::new(MemoryMailboxStorage::new()),
            Arc::new(NoopPods),
            Arc::new(LocalShardManagerClient::new(pod, SHARDS)),
            Arc::new(ClusterMetrics::unregistered()),
        )
        .unwrap();
        sharding.start().await.unwrap();
        sharding
            .register_entity(Arc::new(CounterBehavior))
            .await
            .unwrap();
        sharding.make_messenger(EntityType::new("Counter"))
    }

    #[tokio::test]
    async fn ask_returns_entity_reply() {
        let messenger = messenger().await;
        messenger.tell("x", "Inc", Value::Null).await.unwrap();
        messenger.tell("x", "Inc", Value::Null).await.unwrap();
        let exit = messenger.ask("x", "Get", Value::Null).await.unwrap();
        assert_eq!(exit, MessageExit::succeed(json!(2)));
    }

    #[tokio::test]
    async fn ask_decoded_returns_typed_value() {
        let messenger = messenger().await;
        messenger.tell("x", "Inc", Value::Null).await.unwrap();
        let count: i64 = messenger.ask_decoded("x", "Get", Value::Null).await.unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn ask_surfaces_entity_failure() {
        let messenger = messenger().await;
        let exit = messenger.ask("x", "Boom", Value::Null).await.unwrap();
        assert_eq!(exit, MessageExit::fail(json!("boom")));
    }

    #[tokio::test]
    async fn messages_to_different_ids_are_independent() {
        let messenger = messenger().await;
        messenger.tell("x", "Inc", Value::Null).await.unwrap();
        let exit = messenger.ask("y", "Get", Value::Null).await.unwrap();
        assert_eq!(exit, MessageExit::succeed(json!(0)));
    }

    #[tokio::test]
    async fn ask_has_no_builtin_timeout_but_composes_with_one() {
        let messenger = messenger().await;
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            messenger.ask("x", "Get", Value::Null),
        )
        .await
        .expect("ask should resolve well within the timeout")
        .unwrap();
        assert_eq!(result, MessageExit::succeed(json!(0)));
    }
}
