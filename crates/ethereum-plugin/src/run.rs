use crate::backends::redis::RedisStore;
use crate::ethereum::OnchainChannelContract;
use crate::plugin::{EthereumPlugin, MessageSender, PluginConfig};

use ethers::middleware::SignerMiddleware;
use ethers::providers::{Http, Provider};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::Address;
use gumdrop::Options;
use log::info;
use std::sync::Arc;
use url::Url;

#[derive(Debug, Options)]
pub struct PluginOpts {
    #[options(help = "print this help message")]
    pub help: bool,

    #[options(help = "The ethereum node URL", default = "http://localhost:8545")]
    pub ethereum_url: Url,

    #[options(help = "The hex private key used to sign claims and transactions")]
    pub private_key: String,

    #[options(help = "The address of the unidirectional payment channel contract")]
    pub contract_address: Address,

    #[options(help = "The redis store URL", default = "redis://127.0.0.1:6379")]
    pub redis_url: String,

    #[options(help = "The chain id", default = "1")]
    pub chain_id: u64,

    #[options(help = "Confirmations to await for each transaction", default = "1")]
    pub confirmations: usize,

    #[options(help = "Default escrow when opening a channel (gwei)", default = "40000000")]
    pub outgoing_channel_amount: u64,

    #[options(help = "Dispute window imposed as sender (blocks)", default = "5760")]
    pub outgoing_dispute_period: u64,

    #[options(help = "Smallest dispute window accepted as receiver (blocks)", default = "1440")]
    pub min_incoming_dispute_period: u64,

    #[options(
        help = "Largest ilp prepare amount accepted (gwei)",
        default = "18446744073709551615"
    )]
    pub max_packet_amount: u64,

    #[options(
        help = "Receivable ceiling per peer (gwei)",
        default = "18446744073709551615"
    )]
    pub max_balance: u64,

    #[options(help = "Channel watcher poll period (ms)", default = "60000")]
    pub channel_watcher_interval: u64,
}

/// Builds a plugin from parsed options and the embedder's BTP transport.
/// The transport (and therefore the process entrypoint) belongs to the
/// connector embedding this plugin.
pub async fn connect_plugin(
    opts: PluginOpts,
    transport: Arc<dyn MessageSender>,
) -> anyhow::Result<EthereumPlugin<RedisStore>> {
    let wallet = opts
        .private_key
        .parse::<LocalWallet>()?
        .with_chain_id(opts.chain_id);
    let own_address = wallet.address();
    let provider = Provider::<Http>::try_from(opts.ethereum_url.as_str())?;
    let client = Arc::new(SignerMiddleware::new(provider, wallet));
    let contract = Arc::new(OnchainChannelContract::new(
        opts.contract_address,
        client,
        opts.confirmations,
    ));
    let store = RedisStore::connect(&opts.redis_url).await?;

    let config = PluginConfig {
        outgoing_channel_amount: opts.outgoing_channel_amount,
        outgoing_dispute_period: opts.outgoing_dispute_period,
        min_incoming_dispute_period: opts.min_incoming_dispute_period,
        max_packet_amount: opts.max_packet_amount,
        max_balance: opts.max_balance,
        channel_watcher_interval: opts.channel_watcher_interval,
    };

    info!(
        "Ethereum payment channel plugin ready (address: {:?}, contract: {:?})",
        own_address, opts.contract_address
    );
    Ok(EthereumPlugin::new(config, contract, store, transport))
}
