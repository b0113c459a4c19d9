use crate::channel::ChannelView;
use crate::error::PluginError;

use async_trait::async_trait;
use ethers::abi::Detokenize;
use ethers::contract::{abigen, ContractCall, ContractError};
use ethers::middleware::SignerMiddleware;
use ethers::providers::{Http, Middleware, Provider, ProviderError};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, Bytes, Signature, H256, U256};
use futures::future::BoxFuture;
use log::{debug, trace};
use std::sync::Arc;
use thiserror::Error;

pub type EthereumClient = SignerMiddleware<Provider<Http>, LocalWallet>;

/// Callback returning the current gas price in wei. Defaults to the node's
/// `eth_gasPrice` but embedders may plug in their own oracle.
pub type GasPriceOracle =
    Arc<dyn Fn() -> BoxFuture<'static, Result<U256, ChainError>> + Send + Sync>;

#[derive(Debug, Error)]
pub enum ChainError {
    #[error(transparent)]
    Contract(#[from] ContractError<EthereumClient>),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("transaction reverted on-chain")]
    Reverted,

    #[error("transaction was dropped before it was confirmed")]
    Dropped,
}

// Bindings for the unidirectional payment channel contract.
abigen!(
    Unidirectional,
    r#"[
        {"constant":false,"inputs":[{"name":"channelId","type":"bytes32"},{"name":"receiver","type":"address"},{"name":"disputePeriod","type":"uint256"}],"name":"open","outputs":[],"payable":true,"stateMutability":"payable","type":"function"},
        {"constant":false,"inputs":[{"name":"channelId","type":"bytes32"}],"name":"deposit","outputs":[],"payable":true,"stateMutability":"payable","type":"function"},
        {"constant":false,"inputs":[{"name":"channelId","type":"bytes32"},{"name":"value","type":"uint256"},{"name":"signature","type":"bytes"}],"name":"claim","outputs":[],"payable":false,"stateMutability":"nonpayable","type":"function"},
        {"constant":false,"inputs":[{"name":"channelId","type":"bytes32"}],"name":"startDispute","outputs":[],"payable":false,"stateMutability":"nonpayable","type":"function"},
        {"constant":true,"inputs":[{"name":"","type":"bytes32"}],"name":"channels","outputs":[{"name":"sender","type":"address"},{"name":"receiver","type":"address"},{"name":"value","type":"uint256"},{"name":"disputePeriod","type":"uint256"},{"name":"disputedUntil","type":"uint256"}],"payable":false,"stateMutability":"view","type":"function"}
    ]"#
);

/// The on-chain surface the account state machine drives. A trait so the
/// state machine can be exercised against an in-memory chain in tests.
#[async_trait]
pub trait ChannelContract: Send + Sync {
    /// Address of the payment channel contract.
    fn contract_address(&self) -> Address;

    /// Address derived from our private key; receiver of incoming channels.
    fn own_address(&self) -> Address;

    /// Signs a 32-byte digest with our private key.
    fn sign_hash(&self, hash: H256) -> Result<Signature, PluginError>;

    async fn gas_price(&self) -> Result<U256, ChainError>;

    /// Looks up a channel by id. `None` if no channel with that id exists
    /// (the contract reports a zero sender).
    async fn fetch_channel(&self, channel_id: H256) -> Result<Option<ChannelView>, ChainError>;

    async fn estimate_open_fee(
        &self,
        channel_id: H256,
        receiver: Address,
        dispute_period: U256,
        value: U256,
    ) -> Result<U256, ChainError>;

    async fn open_channel(
        &self,
        channel_id: H256,
        receiver: Address,
        dispute_period: U256,
        value: U256,
    ) -> Result<(), ChainError>;

    async fn estimate_deposit_fee(&self, channel_id: H256, value: U256)
        -> Result<U256, ChainError>;

    async fn deposit(&self, channel_id: H256, value: U256) -> Result<(), ChainError>;

    async fn estimate_claim_fee(
        &self,
        channel_id: H256,
        value: U256,
        signature: &Signature,
    ) -> Result<U256, ChainError>;

    async fn claim_channel(
        &self,
        channel_id: H256,
        value: U256,
        signature: &Signature,
    ) -> Result<(), ChainError>;

    async fn start_dispute(&self, channel_id: H256) -> Result<(), ChainError>;
}

/// `ChannelContract` backed by an ethers provider and wallet.
#[derive(Clone)]
pub struct OnchainChannelContract {
    contract: Unidirectional<EthereumClient>,
    client: Arc<EthereumClient>,
    gas_price: GasPriceOracle,
    confirmations: usize,
}

impl OnchainChannelContract {
    pub fn new(
        contract_address: Address,
        client: Arc<EthereumClient>,
        confirmations: usize,
    ) -> Self {
        let gas_price: GasPriceOracle = {
            let client = client.clone();
            Arc::new(move || {
                let client = client.clone();
                Box::pin(async move {
                    let price = client.inner().get_gas_price().await?;
                    Ok(price)
                })
            })
        };
        OnchainChannelContract {
            contract: Unidirectional::new(contract_address, client.clone()),
            client,
            gas_price,
            confirmations,
        }
    }

    pub fn with_gas_price_oracle(mut self, oracle: GasPriceOracle) -> Self {
        self.gas_price = oracle;
        self
    }

    /// Fee for a call at the current gas price.
    async fn fee_for<D: Detokenize>(
        &self,
        call: &ContractCall<EthereumClient, D>,
    ) -> Result<U256, ChainError> {
        let gas = call.estimate_gas().await?;
        let price = (self.gas_price)().await?;
        Ok(gas * price)
    }

    /// Submits a call and waits for it to be mined with the configured number
    /// of confirmations. A receipt with status 0 is reported as a revert.
    async fn submit<D: Detokenize + Send + Sync>(
        &self,
        call: ContractCall<EthereumClient, D>,
    ) -> Result<(), ChainError> {
        let pending = call.send().await?;
        let tx_hash = *pending;
        trace!("Submitted transaction {:?}", tx_hash);
        let receipt = pending
            .confirmations(self.confirmations)
            .await?
            .ok_or(ChainError::Dropped)?;
        if receipt.status == Some(1u64.into()) {
            debug!(
                "Transaction {:?} confirmed in block {:?}",
                tx_hash, receipt.block_number
            );
            Ok(())
        } else {
            Err(ChainError::Reverted)
        }
    }
}

#[async_trait]
impl ChannelContract for OnchainChannelContract {
    fn contract_address(&self) -> Address {
        self.contract.address()
    }

    fn own_address(&self) -> Address {
        self.client.signer().address()
    }

    fn sign_hash(&self, hash: H256) -> Result<Signature, PluginError> {
        self.client
            .signer()
            .sign_hash(hash)
            .map_err(|err| PluginError::Channel(err.to_string()))
    }

    async fn gas_price(&self) -> Result<U256, ChainError> {
        (self.gas_price)().await
    }

    async fn fetch_channel(&self, channel_id: H256) -> Result<Option<ChannelView>, ChainError> {
        let (sender, receiver, value, dispute_period, disputed_until) = self
            .contract
            .channels(channel_id.to_fixed_bytes())
            .call()
            .await?;
        if sender == Address::zero() {
            return Ok(None);
        }
        Ok(Some(ChannelView {
            sender,
            receiver,
            value,
            dispute_period,
            disputed_until: if disputed_until.is_zero() {
                None
            } else {
                Some(disputed_until)
            },
        }))
    }

    async fn estimate_open_fee(
        &self,
        channel_id: H256,
        receiver: Address,
        dispute_period: U256,
        value: U256,
    ) -> Result<U256, ChainError> {
        let call = self
            .contract
            .open(channel_id.to_fixed_bytes(), receiver, dispute_period)
            .value(value);
        self.fee_for(&call).await
    }

    async fn open_channel(
        &self,
        channel_id: H256,
        receiver: Address,
        dispute_period: U256,
        value: U256,
    ) -> Result<(), ChainError> {
        let call = self
            .contract
            .open(channel_id.to_fixed_bytes(), receiver, dispute_period)
            .value(value);
        self.submit(call).await
    }

    async fn estimate_deposit_fee(
        &self,
        channel_id: H256,
        value: U256,
    ) -> Result<U256, ChainError> {
        let call = self.contract.deposit(channel_id.to_fixed_bytes()).value(value);
        self.fee_for(&call).await
    }

    async fn deposit(&self, channel_id: H256, value: U256) -> Result<(), ChainError> {
        let call = self.contract.deposit(channel_id.to_fixed_bytes()).value(value);
        self.submit(call).await
    }

    async fn estimate_claim_fee(
        &self,
        channel_id: H256,
        value: U256,
        signature: &Signature,
    ) -> Result<U256, ChainError> {
        let call = self.contract.claim(
            channel_id.to_fixed_bytes(),
            value,
            Bytes::from(signature.to_vec()),
        );
        self.fee_for(&call).await
    }

    async fn claim_channel(
        &self,
        channel_id: H256,
        value: U256,
        signature: &Signature,
    ) -> Result<(), ChainError> {
        let call = self.contract.claim(
            channel_id.to_fixed_bytes(),
            value,
            Bytes::from(signature.to_vec()),
        );
        self.submit(call).await
    }

    async fn start_dispute(&self, channel_id: H256) -> Result<(), ChainError> {
        let call = self.contract.start_dispute(channel_id.to_fixed_bytes());
        self.submit(call).await
    }
}
