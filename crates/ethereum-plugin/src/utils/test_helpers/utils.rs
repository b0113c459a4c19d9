use super::fixtures::{ALICE, CONTRACT};
use crate::channel::ChannelView;
use crate::claim::{prefixed_claim_digest, Claim};
use crate::error::PluginError;
use crate::ethereum::{ChainError, ChannelContract};
use crate::plugin::{
    EthereumPlugin, MessageSender, MoneyHandler, PluginConfig, ProtocolData, INFO_PROTOCOL,
    MACHINOMY_PROTOCOL,
};
use crate::utils::types::{AccountSnapshot, PluginStore, StoreError};

use async_trait::async_trait;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, Signature, H256, U256};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;

// In-memory store
#[derive(Clone, Default)]
pub struct TestStore {
    pub accounts: Arc<RwLock<HashMap<String, AccountSnapshot>>>,
    pub channel_owners: Arc<RwLock<HashMap<H256, String>>>,
}

#[async_trait]
impl PluginStore for TestStore {
    async fn save_account(&self, snapshot: &AccountSnapshot) -> Result<(), StoreError> {
        self.accounts
            .write()
            .insert(snapshot.account_name.clone(), snapshot.clone());
        Ok(())
    }

    async fn load_account(
        &self,
        account_name: &str,
    ) -> Result<Option<AccountSnapshot>, StoreError> {
        Ok(self.accounts.read().get(account_name).cloned())
    }

    async fn delete_account(&self, account_name: &str) -> Result<(), StoreError> {
        self.accounts.write().remove(account_name);
        Ok(())
    }

    async fn load_channel_owner(&self, channel_id: H256) -> Result<Option<String>, StoreError> {
        Ok(self.channel_owners.read().get(&channel_id).cloned())
    }

    async fn try_link_channel(
        &self,
        channel_id: H256,
        account_name: &str,
    ) -> Result<bool, StoreError> {
        let mut owners = self.channel_owners.write();
        match owners.get(&channel_id) {
            Some(owner) => Ok(owner == account_name),
            None => {
                owners.insert(channel_id, account_name.to_string());
                Ok(true)
            }
        }
    }
}

/// In-memory chain. Channel visibility and deposit propagation can be
/// deferred by a number of fetches to exercise the retry paths.
pub struct TestContract {
    pub wallet: LocalWallet,
    pub contract_address: Address,
    pub channels: RwLock<HashMap<H256, ChannelView>>,
    pub visible_after: RwLock<HashMap<H256, u32>>,
    pub value_after: RwLock<HashMap<H256, (u32, U256)>>,
    pub open_fee: U256,
    pub deposit_fee: U256,
    pub claim_fee: U256,
    pub opened: RwLock<Vec<(H256, Address, U256, U256)>>,
    pub claims: RwLock<Vec<(H256, U256)>>,
}

impl Default for TestContract {
    fn default() -> Self {
        TestContract {
            wallet: ALICE.clone(),
            contract_address: *CONTRACT,
            channels: RwLock::new(HashMap::new()),
            visible_after: RwLock::new(HashMap::new()),
            value_after: RwLock::new(HashMap::new()),
            open_fee: U256::zero(),
            deposit_fee: U256::zero(),
            claim_fee: U256::zero(),
            opened: RwLock::new(Vec::new()),
            claims: RwLock::new(Vec::new()),
        }
    }
}

impl TestContract {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_claim_fee(mut self, fee: U256) -> Self {
        self.claim_fee = fee;
        self
    }

    pub fn with_open_fee(mut self, fee: U256) -> Self {
        self.open_fee = fee;
        self
    }

    pub fn insert_channel(&self, channel_id: H256, view: ChannelView) {
        self.channels.write().insert(channel_id, view);
    }

    pub fn set_disputed(&self, channel_id: H256, until_block: u64) {
        if let Some(view) = self.channels.write().get_mut(&channel_id) {
            view.disputed_until = Some(U256::from(until_block));
        }
    }

    /// The channel's value reads stale until the `fetches`-th fetch.
    pub fn set_value_after(&self, channel_id: H256, fetches: u32, value: U256) {
        self.value_after.write().insert(channel_id, (fetches, value));
    }
}

#[async_trait]
impl ChannelContract for TestContract {
    fn contract_address(&self) -> Address {
        self.contract_address
    }

    fn own_address(&self) -> Address {
        self.wallet.address()
    }

    fn sign_hash(&self, hash: H256) -> Result<Signature, PluginError> {
        self.wallet
            .sign_hash(hash)
            .map_err(|err| PluginError::Channel(err.to_string()))
    }

    async fn gas_price(&self) -> Result<U256, ChainError> {
        Ok(U256::one())
    }

    async fn fetch_channel(&self, channel_id: H256) -> Result<Option<ChannelView>, ChainError> {
        {
            let mut hidden = self.visible_after.write();
            if let Some(count) = hidden.get_mut(&channel_id) {
                if *count > 0 {
                    *count -= 1;
                    return Ok(None);
                }
            }
        }
        let deferred_value = {
            let mut deferred = self.value_after.write();
            match deferred.get_mut(&channel_id) {
                Some((count, _)) if *count > 1 => {
                    *count -= 1;
                    None
                }
                Some((_, value)) => {
                    let value = *value;
                    deferred.remove(&channel_id);
                    Some(value)
                }
                None => None,
            }
        };
        if let Some(value) = deferred_value {
            if let Some(view) = self.channels.write().get_mut(&channel_id) {
                view.value = value;
            }
        }
        Ok(self.channels.read().get(&channel_id).cloned())
    }

    async fn estimate_open_fee(
        &self,
        _channel_id: H256,
        _receiver: Address,
        _dispute_period: U256,
        _value: U256,
    ) -> Result<U256, ChainError> {
        Ok(self.open_fee)
    }

    async fn open_channel(
        &self,
        channel_id: H256,
        receiver: Address,
        dispute_period: U256,
        value: U256,
    ) -> Result<(), ChainError> {
        self.opened
            .write()
            .push((channel_id, receiver, dispute_period, value));
        self.channels.write().insert(
            channel_id,
            ChannelView {
                sender: self.wallet.address(),
                receiver,
                value,
                dispute_period,
                disputed_until: None,
            },
        );
        Ok(())
    }

    async fn estimate_deposit_fee(
        &self,
        _channel_id: H256,
        _value: U256,
    ) -> Result<U256, ChainError> {
        Ok(self.deposit_fee)
    }

    async fn deposit(&self, channel_id: H256, value: U256) -> Result<(), ChainError> {
        if let Some(view) = self.channels.write().get_mut(&channel_id) {
            view.value += value;
        }
        Ok(())
    }

    async fn estimate_claim_fee(
        &self,
        _channel_id: H256,
        _value: U256,
        _signature: &Signature,
    ) -> Result<U256, ChainError> {
        Ok(self.claim_fee)
    }

    async fn claim_channel(
        &self,
        channel_id: H256,
        value: U256,
        _signature: &Signature,
    ) -> Result<(), ChainError> {
        self.claims.write().push((channel_id, value));
        self.channels.write().remove(&channel_id);
        Ok(())
    }

    async fn start_dispute(&self, channel_id: H256) -> Result<(), ChainError> {
        if let Some(view) = self.channels.write().get_mut(&channel_id) {
            view.disputed_until = Some(U256::from(1u64));
        }
        Ok(())
    }
}

/// Records every message and answers `info` requests with a configured
/// address and `ilp` messages with configured reply bytes.
#[derive(Default)]
pub struct TestTransport {
    pub sent: Mutex<Vec<(String, Vec<ProtocolData>)>>,
    pub info_reply: Option<Address>,
    pub ilp_reply: Mutex<Option<Vec<u8>>>,
}

impl TestTransport {
    pub fn replying_info(address: Address) -> Self {
        TestTransport {
            info_reply: Some(address),
            ..Default::default()
        }
    }

    /// Claims delivered so far, in order.
    pub fn sent_claims(&self) -> Vec<Claim> {
        self.sent
            .lock()
            .iter()
            .flat_map(|(_, protocols)| protocols.iter())
            .filter(|protocol| protocol.protocol_name == MACHINOMY_PROTOCOL)
            .filter_map(|protocol| serde_json::from_slice(&protocol.data).ok())
            .collect()
    }
}

#[async_trait]
impl MessageSender for TestTransport {
    async fn send_message(
        &self,
        account_name: &str,
        protocols: Vec<ProtocolData>,
    ) -> Result<Vec<ProtocolData>, PluginError> {
        let first = protocols
            .first()
            .map(|protocol| protocol.protocol_name.clone());
        self.sent
            .lock()
            .push((account_name.to_string(), protocols));
        match first.as_deref() {
            Some(INFO_PROTOCOL) => {
                if let Some(address) = self.info_reply {
                    let reply =
                        serde_json::json!({ "ethereumAddress": format!("{:?}", address) });
                    return Ok(vec![ProtocolData::json(INFO_PROTOCOL, &reply)?]);
                }
                Ok(Vec::new())
            }
            Some(crate::plugin::ILP_PROTOCOL) => {
                if let Some(reply) = self.ilp_reply.lock().clone() {
                    return Ok(vec![ProtocolData::octet(crate::plugin::ILP_PROTOCOL, reply)]);
                }
                Ok(Vec::new())
            }
            _ => Ok(Vec::new()),
        }
    }
}

pub struct TestContext {
    pub plugin: EthereumPlugin<TestStore>,
    pub store: TestStore,
    pub contract: Arc<TestContract>,
    pub transport: Arc<TestTransport>,
    pub money_events: Arc<Mutex<Vec<String>>>,
}

/// Builds a plugin over the in-memory fakes with a money handler that
/// records every credited amount.
pub fn test_context(
    config: PluginConfig,
    contract: TestContract,
    transport: TestTransport,
) -> TestContext {
    let _ = env_logger::try_init();
    let store = TestStore::default();
    let contract = Arc::new(contract);
    let transport = Arc::new(transport);
    let plugin = EthereumPlugin::new(config, contract.clone(), store.clone(), transport.clone());

    let money_events = Arc::new(Mutex::new(Vec::new()));
    let events = money_events.clone();
    let handler: MoneyHandler = Arc::new(move |amount| {
        let events = events.clone();
        Box::pin(async move {
            events.lock().push(amount);
            Ok(())
        })
    });
    plugin.register_money_handler(handler);

    TestContext {
        plugin,
        store,
        contract,
        transport,
        money_events,
    }
}

/// A wire claim for `value` wei signed by `wallet` the way a peer would sign
/// it.
pub fn signed_claim(wallet: &LocalWallet, contract: Address, channel_id: H256, value: U256) -> Claim {
    let signature = wallet.sign_hash(prefixed_claim_digest(contract, channel_id, value));
    Claim {
        channel_id: format!("{:?}", channel_id),
        contract_address: format!("{:?}", contract),
        value: value.to_string(),
        signature: format!("0x{}", hex::encode(signature.to_vec())),
    }
}

/// An incoming channel as the chain would report it: the peer is the sender,
/// we are the receiver.
pub fn incoming_channel(sender: Address, value: U256, dispute_period: u64) -> ChannelView {
    ChannelView {
        sender,
        receiver: ALICE.address(),
        value,
        dispute_period: U256::from(dispute_period),
        disputed_until: None,
    }
}
