use crate::channel::PaymentChannel;
use crate::claim::{parse_address, parse_h256, parse_signature};

use async_trait::async_trait;
use ethers::types::{H256, U256};
use num_bigint::BigInt;
use num_traits::Zero;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("store error: {0}")]
pub struct StoreError(pub String);

/// Persistence seam for account state.
///
/// Two key families are used: `<accountName>:account` holds the serialized
/// [`AccountSnapshot`], and `<channelId>:incoming-channel` holds the name of
/// the single account a channel may be linked to.
#[async_trait]
pub trait PluginStore: Clone + Send + Sync + 'static {
    async fn save_account(&self, snapshot: &AccountSnapshot) -> Result<(), StoreError>;

    async fn load_account(&self, account_name: &str) -> Result<Option<AccountSnapshot>, StoreError>;

    async fn delete_account(&self, account_name: &str) -> Result<(), StoreError>;

    /// The account a channel is linked to, if any.
    async fn load_channel_owner(&self, channel_id: H256) -> Result<Option<String>, StoreError>;

    /// Links a channel to an account unless it is already linked elsewhere.
    /// Returns whether the channel is now (or already was) owned by
    /// `account_name`.
    async fn try_link_channel(
        &self,
        channel_id: H256,
        account_name: &str,
    ) -> Result<bool, StoreError>;
}

/// Persisted form of a channel. Amounts are decimal strings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelSnapshot {
    pub channel_id: String,
    pub contract_address: String,
    pub sender: String,
    pub receiver: String,
    pub value: String,
    pub dispute_period: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disputed_until: Option<String>,
    pub spent: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

/// Persisted form of a peer account. Balances are decimal gwei strings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountSnapshot {
    pub account_name: String,
    pub receivable_balance: String,
    pub payable_balance: String,
    pub payout_amount: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ethereum_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub incoming_channel: Option<ChannelSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outgoing_channel: Option<ChannelSnapshot>,
}

impl From<&PaymentChannel> for ChannelSnapshot {
    fn from(channel: &PaymentChannel) -> Self {
        ChannelSnapshot {
            channel_id: format!("{:?}", channel.channel_id),
            contract_address: format!("{:?}", channel.contract_address),
            sender: format!("{:?}", channel.sender),
            receiver: format!("{:?}", channel.receiver),
            value: channel.value.to_string(),
            dispute_period: channel.dispute_period.to_string(),
            disputed_until: channel.disputed_until.map(|block| block.to_string()),
            spent: channel.spent.to_string(),
            signature: channel
                .signature
                .as_ref()
                .map(|sig| format!("0x{}", hex::encode(sig.to_vec()))),
        }
    }
}

impl TryFrom<&ChannelSnapshot> for PaymentChannel {
    type Error = StoreError;

    fn try_from(snapshot: &ChannelSnapshot) -> Result<Self, StoreError> {
        let corrupt = |err: crate::error::PluginError| StoreError(err.to_string());
        Ok(PaymentChannel {
            channel_id: parse_h256(&snapshot.channel_id).map_err(corrupt)?,
            contract_address: parse_address(&snapshot.contract_address).map_err(corrupt)?,
            sender: parse_address(&snapshot.sender).map_err(corrupt)?,
            receiver: parse_address(&snapshot.receiver).map_err(corrupt)?,
            value: parse_u256(&snapshot.value)?,
            dispute_period: parse_u256(&snapshot.dispute_period)?,
            disputed_until: snapshot
                .disputed_until
                .as_deref()
                .map(parse_u256)
                .transpose()?,
            spent: parse_u256(&snapshot.spent)?,
            signature: snapshot
                .signature
                .as_deref()
                .map(|sig| parse_signature(sig).map_err(corrupt))
                .transpose()?,
        })
    }
}

fn parse_u256(decimal: &str) -> Result<U256, StoreError> {
    U256::from_dec_str(decimal).map_err(|err| StoreError(format!("bad amount {}: {}", decimal, err)))
}

pub(crate) fn parse_bigint(decimal: &str) -> Result<BigInt, StoreError> {
    BigInt::from_str(decimal).map_err(|err| StoreError(format!("bad amount {}: {}", decimal, err)))
}

/// Wei to gwei, flooring away the sub-gwei remainder.
pub(crate) fn wei_to_gwei(wei: U256) -> BigInt {
    let gwei = wei / U256::exp10(9);
    BigInt::from_str(&gwei.to_string()).expect("decimal digits always parse")
}

/// Gwei to wei. `None` when the amount is not positive or does not fit a
/// `U256`.
pub(crate) fn gwei_to_wei(gwei: &BigInt) -> Option<U256> {
    if gwei <= &BigInt::zero() {
        return None;
    }
    let wei = gwei * BigInt::from(1_000_000_000u64);
    U256::from_dec_str(&wei.to_string()).ok()
}
