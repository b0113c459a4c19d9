use crate::account::{PeerAccount, CHANNEL_WATCHER_PRIORITY};
use crate::channel::ClaimablePaymentChannel;
use crate::utils::types::PluginStore;

use log::{debug, error, trace};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Polls the chain for the account's incoming channel and schedules a claim
/// as soon as the channel enters a dispute. The poll runs as a reducer on
/// the incoming queue so it never interleaves with claim validation, and the
/// claim itself is queued at a higher priority so it runs ahead of anything
/// still pending.
///
/// The task cancels itself once no incoming channel remains; per-tick errors
/// are logged and the timer keeps running.
pub(crate) fn start_channel_watcher<S: PluginStore>(account: Arc<PeerAccount<S>>) -> JoinHandle<()> {
    let period = Duration::from_millis(account.ctx.config.channel_watcher_interval);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        // consume the immediate first tick so polling starts one period in
        interval.tick().await;
        loop {
            interval.tick().await;
            let reducer_account = account.clone();
            let poll = account.incoming.add(
                move |cached| async move { refresh_channel(&reducer_account, cached).await },
                CHANNEL_WATCHER_PRIORITY,
            );
            match poll.await {
                Ok(None) => break,
                Ok(Some(channel)) if channel.is_disputed() => {
                    debug!(
                        "Channel {:?} is disputed until block {}; claiming the best claim",
                        channel.channel_id,
                        channel
                            .disputed_until
                            .map(|block| block.to_string())
                            .unwrap_or_default()
                    );
                    let claim = account.claim_if_profitable(true, None);
                    let account_name = account.account_name.clone();
                    tokio::spawn(async move {
                        if let Err(err) = claim.await {
                            error!(
                                "Failed to claim disputed channel of {}: {}",
                                account_name, err
                            );
                        }
                    });
                }
                Ok(Some(_)) => {}
                Err(err) => error!("Channel watcher poll failed: {}", err),
            }
        }
        trace!(
            "No incoming channel left for {}; stopping the watcher",
            account.account_name
        );
        *account.watcher.lock() = None;
    })
}

async fn refresh_channel<S: PluginStore>(
    account: &Arc<PeerAccount<S>>,
    cached: Option<ClaimablePaymentChannel>,
) -> Result<Option<ClaimablePaymentChannel>, crate::error::PluginError> {
    let channel = match cached {
        Some(channel) => channel,
        None => return Ok(None),
    };
    match account.ctx.contract.fetch_channel(channel.channel_id).await? {
        Some(view) => Ok(Some(channel.refreshed(&view))),
        None => {
            debug!("Channel {:?} is gone from the chain", channel.channel_id);
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::plugin::PluginConfig;
    use crate::utils::test_helpers::fixtures::{BOB, CONTRACT};
    use crate::utils::test_helpers::utils::{
        incoming_channel, signed_claim, test_context, TestContract, TestTransport,
    };
    use ethers::signers::Signer;
    use ethers::types::{H256, U256};
    use std::time::Duration;
    use tokio::time::sleep;

    fn config() -> PluginConfig {
        PluginConfig {
            min_incoming_dispute_period: 40,
            channel_watcher_interval: 25,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn claims_disputed_channel_within_one_interval() {
        let contract = TestContract::new();
        let id = H256::repeat_byte(0x05);
        let five_eth = U256::exp10(18) * 5;
        contract.insert_channel(id, incoming_channel(BOB.address(), five_eth, 100));
        let ctx = test_context(config(), contract, TestTransport::default());
        let account = ctx.plugin.account("peer").await.unwrap();

        account
            .receive_claim(signed_claim(&BOB, *CONTRACT, id, five_eth))
            .await
            .unwrap();
        assert!(account.watcher.lock().is_some());

        ctx.contract.set_disputed(id, 100_000);
        sleep(Duration::from_millis(300)).await;

        assert_eq!(*ctx.contract.claims.read(), vec![(id, five_eth)]);
        assert!(account.incoming.state().is_none());
        // the watcher stopped itself once the channel was gone
        assert!(account.watcher.lock().is_none());
    }

    #[tokio::test]
    async fn watcher_stops_when_the_channel_disappears() {
        let contract = TestContract::new();
        let id = H256::repeat_byte(0x06);
        contract.insert_channel(id, incoming_channel(BOB.address(), U256::exp10(15), 100));
        let ctx = test_context(config(), contract, TestTransport::default());
        let account = ctx.plugin.account("peer").await.unwrap();

        account
            .receive_claim(signed_claim(&BOB, *CONTRACT, id, U256::from(10_000_000_000u64)))
            .await
            .unwrap();
        assert!(account.watcher.lock().is_some());

        // the sender's escrow was returned out from under us
        ctx.contract.channels.write().remove(&id);
        sleep(Duration::from_millis(200)).await;

        assert!(account.incoming.state().is_none());
        assert!(account.watcher.lock().is_none());
        assert!(ctx.contract.claims.read().is_empty());
    }
}
