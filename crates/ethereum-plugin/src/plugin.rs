use crate::account::{FeeAuthorizer, PeerAccount};
use crate::error::PluginError;
use crate::ethereum::ChannelContract;
use crate::utils::types::PluginStore;

use async_trait::async_trait;
use futures::future::BoxFuture;
use log::debug;
use num_bigint::BigInt;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

pub const INFO_PROTOCOL: &str = "info";
pub const MACHINOMY_PROTOCOL: &str = "machinomy";
pub const REQUEST_CLOSE_PROTOCOL: &str = "requestClose";
pub const ILP_PROTOCOL: &str = "ilp";

/// MIME type of a sub-protocol payload, as framed by BTP.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContentType {
    ApplicationOctetStream,
    TextPlainUtf8,
    ApplicationJson,
}

impl ContentType {
    pub fn mime(&self) -> &'static str {
        match self {
            ContentType::ApplicationOctetStream => "application/octet-stream",
            ContentType::TextPlainUtf8 => "text/plain; charset=utf-8",
            ContentType::ApplicationJson => "application/json",
        }
    }
}

/// One named sub-protocol entry of a BTP message.
#[derive(Clone, Debug, PartialEq)]
pub struct ProtocolData {
    pub protocol_name: String,
    pub content_type: ContentType,
    pub data: Vec<u8>,
}

impl ProtocolData {
    pub fn json<T: Serialize>(name: &str, payload: &T) -> Result<Self, PluginError> {
        let data = serde_json::to_vec(payload)
            .map_err(|err| PluginError::Transport(format!("failed to encode {}: {}", name, err)))?;
        Ok(ProtocolData {
            protocol_name: name.to_string(),
            content_type: ContentType::ApplicationJson,
            data,
        })
    }

    pub fn octet(name: &str, data: Vec<u8>) -> Self {
        ProtocolData {
            protocol_name: name.to_string(),
            content_type: ContentType::ApplicationOctetStream,
            data,
        }
    }

    pub fn text(name: &str, data: String) -> Self {
        ProtocolData {
            protocol_name: name.to_string(),
            content_type: ContentType::TextPlainUtf8,
            data: data.into_bytes(),
        }
    }
}

/// The BTP transport seam. The framing layer (websockets, auth, request ids)
/// lives outside the plugin; this is the only surface the plugin needs:
/// deliver sub-protocol entries to the named peer and return its reply.
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send_message(
        &self,
        account_name: &str,
        protocols: Vec<ProtocolData>,
    ) -> Result<Vec<ProtocolData>, PluginError>;
}

/// Handles an ILP Prepare forwarded from the peer; returns Fulfill or Reject
/// bytes.
pub type DataHandler =
    Arc<dyn Fn(Vec<u8>) -> BoxFuture<'static, Result<Vec<u8>, PluginError>> + Send + Sync>;

/// Receives the gwei amount of each validated incoming claim, as a decimal
/// string.
pub type MoneyHandler =
    Arc<dyn Fn(String) -> BoxFuture<'static, Result<(), PluginError>> + Send + Sync>;

/// Plugin-wide knobs. Amounts are gwei, periods are blocks, the watcher
/// interval is milliseconds.
#[derive(Clone, Debug)]
pub struct PluginConfig {
    pub outgoing_channel_amount: u64,
    pub outgoing_dispute_period: u64,
    pub min_incoming_dispute_period: u64,
    pub max_packet_amount: u64,
    pub max_balance: u64,
    pub channel_watcher_interval: u64,
}

impl Default for PluginConfig {
    fn default() -> Self {
        PluginConfig {
            // 0.04 ether
            outgoing_channel_amount: 40_000_000,
            // roughly one day of blocks
            outgoing_dispute_period: 5_760,
            // roughly six hours of blocks
            min_incoming_dispute_period: 1_440,
            max_packet_amount: u64::MAX,
            max_balance: u64::MAX,
            channel_watcher_interval: 60_000,
        }
    }
}

/// Everything shared between the plugin and its accounts.
pub(crate) struct PluginContext<S> {
    pub(crate) config: PluginConfig,
    pub(crate) contract: Arc<dyn ChannelContract>,
    pub(crate) store: S,
    pub(crate) transport: Arc<dyn MessageSender>,
    pub(crate) data_handler: RwLock<Option<DataHandler>>,
    pub(crate) money_handler: RwLock<Option<MoneyHandler>>,
}

/// The plugin shell: owns the per-peer accounts, routes incoming BTP
/// messages to them and exposes the handler registration surface an ILP
/// connector expects.
pub struct EthereumPlugin<S: PluginStore> {
    ctx: Arc<PluginContext<S>>,
    accounts: Mutex<HashMap<String, Arc<PeerAccount<S>>>>,
}

impl<S: PluginStore> EthereumPlugin<S> {
    pub fn new(
        config: PluginConfig,
        contract: Arc<dyn ChannelContract>,
        store: S,
        transport: Arc<dyn MessageSender>,
    ) -> Self {
        EthereumPlugin {
            ctx: Arc::new(PluginContext {
                config,
                contract,
                store,
                transport,
                data_handler: RwLock::new(None),
                money_handler: RwLock::new(None),
            }),
            accounts: Mutex::new(HashMap::new()),
        }
    }

    pub fn register_data_handler(&self, handler: DataHandler) {
        *self.ctx.data_handler.write() = Some(handler);
    }

    pub fn deregister_data_handler(&self) {
        *self.ctx.data_handler.write() = None;
    }

    pub fn register_money_handler(&self, handler: MoneyHandler) {
        *self.ctx.money_handler.write() = Some(handler);
    }

    pub fn deregister_money_handler(&self) {
        *self.ctx.money_handler.write() = None;
    }

    /// Routes a BTP message from the named peer to its account, creating the
    /// account on first contact.
    pub async fn handle_message(
        &self,
        account_name: &str,
        protocols: Vec<ProtocolData>,
    ) -> Result<Vec<ProtocolData>, PluginError> {
        let account = self.account(account_name).await?;
        account.handle_message(protocols).await
    }

    /// Sends an ILP Prepare to the peer and returns the reply packet,
    /// adjusting balances and triggering settlement per the reply type.
    pub async fn send_data(
        &self,
        account_name: &str,
        prepare: Vec<u8>,
    ) -> Result<Vec<u8>, PluginError> {
        let account = self.account(account_name).await?;
        account.send_data(prepare).await
    }

    /// Signs and delivers a claim settling up to `amount` gwei (or the full
    /// payable balance when `None`).
    pub async fn send_money(
        &self,
        account_name: &str,
        amount: Option<BigInt>,
    ) -> Result<(), PluginError> {
        let account = self.account(account_name).await?;
        account.send_money(amount).await.map(|_| ())
    }

    /// Opens an outgoing channel to the peer, or deposits into the existing
    /// one. The fee is submitted to `authorize` before any transaction is
    /// sent.
    pub async fn fund_outgoing_channel(
        &self,
        account_name: &str,
        value_gwei: Option<u64>,
        authorize: Option<FeeAuthorizer>,
    ) -> Result<(), PluginError> {
        let account = self.account(account_name).await?;
        account
            .fund_outgoing_channel(value_gwei, authorize)
            .await
            .map(|_| ())
    }

    /// Asks the peer to redeem its best claim so that our remaining escrow
    /// can be reclaimed once the dispute period elapses.
    pub async fn request_close(&self, account_name: &str) -> Result<(), PluginError> {
        let account = self.account(account_name).await?;
        account.request_close().await
    }

    /// Stops background work for every account. In-flight reducers run to
    /// completion.
    pub async fn disconnect(&self) {
        let accounts = self.accounts.lock().await;
        for account in accounts.values() {
            account.disconnect();
        }
    }

    /// Drops an account from the in-memory map: the watcher is cancelled and
    /// queue listeners are detached. The persisted snapshot remains so the
    /// channels survive a reload.
    pub async fn unload_account(&self, account_name: &str) {
        let mut accounts = self.accounts.lock().await;
        if let Some(account) = accounts.remove(account_name) {
            debug!("Unloading account {}", account_name);
            account.unload();
        }
    }

    pub(crate) async fn account(
        &self,
        account_name: &str,
    ) -> Result<Arc<PeerAccount<S>>, PluginError> {
        let mut accounts = self.accounts.lock().await;
        if let Some(account) = accounts.get(account_name) {
            return Ok(account.clone());
        }
        let account = PeerAccount::load(self.ctx.clone(), account_name.to_string()).await?;
        accounts.insert(account_name.to_string(), account.clone());
        Ok(account)
    }
}
