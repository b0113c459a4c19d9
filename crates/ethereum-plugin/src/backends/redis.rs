use crate::utils::types::{AccountSnapshot, PluginStore, StoreError};

use async_trait::async_trait;
use ethers::types::H256;
use log::trace;
use redis::{aio::MultiplexedConnection, AsyncCommands, Client};

fn account_key(account_name: &str) -> String {
    format!("{}:account", account_name)
}

fn channel_owner_key(channel_id: H256) -> String {
    format!("{:?}:incoming-channel", channel_id)
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError(err.to_string())
    }
}

/// Account and channel-ownership persistence on top of Redis.
#[derive(Clone)]
pub struct RedisStore {
    connection: MultiplexedConnection,
}

impl RedisStore {
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let client = Client::open(redis_url)?;
        let connection = client.get_multiplexed_tokio_connection().await?;
        Ok(RedisStore { connection })
    }
}

#[async_trait]
impl PluginStore for RedisStore {
    async fn save_account(&self, snapshot: &AccountSnapshot) -> Result<(), StoreError> {
        let json = serde_json::to_string(snapshot).map_err(|err| StoreError(err.to_string()))?;
        let mut connection = self.connection.clone();
        let _: () = connection.set(account_key(&snapshot.account_name), json).await?;
        trace!("Persisted account {}", snapshot.account_name);
        Ok(())
    }

    async fn load_account(
        &self,
        account_name: &str,
    ) -> Result<Option<AccountSnapshot>, StoreError> {
        let mut connection = self.connection.clone();
        let json: Option<String> = connection.get(account_key(account_name)).await?;
        json.map(|json| serde_json::from_str(&json).map_err(|err| StoreError(err.to_string())))
            .transpose()
    }

    async fn delete_account(&self, account_name: &str) -> Result<(), StoreError> {
        let mut connection = self.connection.clone();
        let _: () = connection.del(account_key(account_name)).await?;
        Ok(())
    }

    async fn load_channel_owner(&self, channel_id: H256) -> Result<Option<String>, StoreError> {
        let mut connection = self.connection.clone();
        let owner: Option<String> = connection.get(channel_owner_key(channel_id)).await?;
        Ok(owner)
    }

    async fn try_link_channel(
        &self,
        channel_id: H256,
        account_name: &str,
    ) -> Result<bool, StoreError> {
        let mut connection = self.connection.clone();
        let key = channel_owner_key(channel_id);
        let linked: bool = connection.set_nx(&key, account_name).await?;
        if linked {
            return Ok(true);
        }
        // lost the race: the channel is ours only if the existing link says so
        let owner: Option<String> = connection.get(&key).await?;
        Ok(owner.as_deref() == Some(account_name))
    }
}
