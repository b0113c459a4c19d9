//! # ILP Ethereum Payment Channel Plugin
//!
//! Settles Interledger liabilities between two peers over unidirectional
//! on-chain payment channels. Payments move off-chain as signed claims whose
//! monotonically increasing `spent` value the receiver can redeem on-chain
//! at any time; the chain is only touched to open, fund, watch and finally
//! claim a channel.
//!
//! The per-peer state machine lives in [`account::PeerAccount`]: claim
//! validation and signing, channel lifecycle, and balance accounting for the
//! ILP packet flow. All channel mutations are serialized through per-account
//! [`queue::ReducerQueue`]s. The BTP framing layer, the key-value store and
//! the Ethereum node are external collaborators reached through the
//! [`plugin::MessageSender`], [`utils::types::PluginStore`] and
//! [`ethereum::ChannelContract`] seams.

pub mod account;
mod backends;
pub mod channel;
pub mod claim;
pub mod error;
pub mod ethereum;
pub mod plugin;
pub mod queue;
pub mod run;
pub mod utils;
mod watcher;

pub use account::{Balances, FeeAuthorizer, PeerAccount};
pub use backends::redis::RedisStore;
pub use channel::{ChannelView, ClaimablePaymentChannel, PaymentChannel};
pub use claim::Claim;
pub use error::PluginError;
pub use ethereum::{ChannelContract, OnchainChannelContract};
pub use plugin::{
    ContentType, DataHandler, EthereumPlugin, MessageSender, MoneyHandler, PluginConfig,
    ProtocolData,
};
pub use queue::ReducerQueue;
pub use run::{connect_plugin, PluginOpts};
pub use utils::types::{AccountSnapshot, ChannelSnapshot, PluginStore, StoreError};
