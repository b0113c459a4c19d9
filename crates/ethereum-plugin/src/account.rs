use crate::channel::{ClaimablePaymentChannel, PaymentChannel};
use crate::claim::{parse_address, prefixed_claim_digest, verify_claim_signature, Claim, ParsedClaim};
use crate::error::PluginError;
use crate::plugin::{
    PluginContext, ProtocolData, ILP_PROTOCOL, INFO_PROTOCOL, MACHINOMY_PROTOCOL,
    REQUEST_CLOSE_PROTOCOL,
};
use crate::queue::ReducerQueue;
use crate::utils::types::{
    gwei_to_wei, parse_bigint, wei_to_gwei, AccountSnapshot, ChannelSnapshot, PluginStore,
};
use crate::watcher;

use bytes::BytesMut;
use ethers::types::{Address, H256, U256};
use futures::future::BoxFuture;
use interledger_packet::{ErrorCode, MaxPacketAmountDetails, Packet, RejectBuilder};
use log::{debug, error, trace};
use num_bigint::BigInt;
use num_traits::Zero;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;

// Priorities on the incoming queue: a pending claim runs before anything
// else that is still waiting.
pub(crate) const SEND_MONEY_PRIORITY: i32 = 0;
pub(crate) const VALIDATE_CLAIM_PRIORITY: i32 = 1;
pub(crate) const CHANNEL_WATCHER_PRIORITY: i32 = 2;
pub(crate) const CLAIM_CHANNEL_PRIORITY: i32 = 3;

const MAX_CHAIN_RETRIES: u32 = 20;
const CHAIN_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Approves or rejects the estimated fee (in wei) of a transaction before it
/// is submitted.
pub type FeeAuthorizer = Box<dyn FnOnce(U256) -> BoxFuture<'static, Result<(), PluginError>> + Send>;

/// Per-peer balances, in gwei.
///
/// `receivable` is what the peer owes us for forwarded Prepares that have not
/// settled yet; `payable` is what we owe the peer; `payout` carries the
/// backlog of unsettled outgoing amounts between settlement attempts.
#[derive(Clone, Debug, Default)]
pub struct Balances {
    pub receivable: BigInt,
    pub payable: BigInt,
    pub payout: BigInt,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InfoMessage {
    ethereum_address: String,
}

/// The per-peer settlement state machine.
///
/// All mutations of the cached incoming and outgoing channels happen inside
/// reducers on the respective queue, so channel updates never interleave.
/// Balances are locked independently and are touched only on the ILP path
/// and inside reducers.
pub struct PeerAccount<S: PluginStore> {
    self_ref: Weak<PeerAccount<S>>,
    pub(crate) ctx: Arc<PluginContext<S>>,
    pub(crate) account_name: String,
    pub(crate) balances: Mutex<Balances>,
    pub(crate) ethereum_address: Mutex<Option<Address>>,
    pub(crate) incoming: ReducerQueue<Option<ClaimablePaymentChannel>>,
    pub(crate) outgoing: ReducerQueue<Option<PaymentChannel>>,
    pub(crate) watcher: Mutex<Option<JoinHandle<()>>>,
}

impl<S: PluginStore> PeerAccount<S> {
    /// Restores the account from its persisted snapshot, or starts fresh.
    pub(crate) async fn load(
        ctx: Arc<PluginContext<S>>,
        account_name: String,
    ) -> Result<Arc<Self>, PluginError> {
        let snapshot = ctx.store.load_account(&account_name).await?;
        let mut balances = Balances::default();
        let mut ethereum_address = None;
        let mut incoming = None;
        let mut outgoing = None;
        if let Some(snapshot) = snapshot {
            balances = Balances {
                receivable: parse_bigint(&snapshot.receivable_balance)?,
                payable: parse_bigint(&snapshot.payable_balance)?,
                payout: parse_bigint(&snapshot.payout_amount)?,
            };
            ethereum_address = snapshot
                .ethereum_address
                .as_deref()
                .map(parse_address)
                .transpose()?;
            incoming = snapshot
                .incoming_channel
                .as_ref()
                .map(PaymentChannel::try_from)
                .transpose()?;
            outgoing = snapshot
                .outgoing_channel
                .as_ref()
                .map(PaymentChannel::try_from)
                .transpose()?;
            debug!("Loaded account {} from the store", account_name);
        }

        let account = Arc::new_cyclic(|weak| PeerAccount {
            self_ref: weak.clone(),
            ctx,
            account_name,
            balances: Mutex::new(balances),
            ethereum_address: Mutex::new(ethereum_address),
            incoming: ReducerQueue::new(incoming),
            outgoing: ReducerQueue::new(outgoing),
            watcher: Mutex::new(None),
        });
        account.spawn_persistence();
        if account.incoming.state().is_some() {
            account.start_watcher_if_needed();
        }
        Ok(account)
    }

    fn arc(&self) -> Arc<Self> {
        self.self_ref.upgrade().expect("account is owned by an Arc")
    }

    /// Dispatches the sub-protocols of one BTP message.
    pub(crate) async fn handle_message(
        &self,
        protocols: Vec<ProtocolData>,
    ) -> Result<Vec<ProtocolData>, PluginError> {
        for protocol in protocols {
            match protocol.protocol_name.as_str() {
                INFO_PROTOCOL => return self.handle_info(&protocol.data),
                MACHINOMY_PROTOCOL => return self.handle_machinomy(&protocol.data),
                REQUEST_CLOSE_PROTOCOL => return Ok(self.handle_request_close().await),
                ILP_PROTOCOL => return Ok(self.handle_ilp(protocol.data).await),
                other => trace!("Ignoring unknown sub-protocol {}", other),
            }
        }
        Ok(Vec::new())
    }

    // ---- address linking ----

    fn handle_info(&self, data: &[u8]) -> Result<Vec<ProtocolData>, PluginError> {
        let message: InfoMessage = serde_json::from_slice(data)
            .map_err(|err| PluginError::Transport(format!("invalid info payload: {}", err)))?;
        let address = parse_address(&message.ethereum_address)?;
        self.link_ethereum_address(address);
        let reply = InfoMessage {
            ethereum_address: format!("{:?}", self.ctx.contract.own_address()),
        };
        Ok(vec![ProtocolData::json(INFO_PROTOCOL, &reply)?])
    }

    /// Stores the peer's payout address on first sight. A linked address is
    /// immutable for the lifetime of the account.
    fn link_ethereum_address(&self, address: Address) {
        let mut linked = self.ethereum_address.lock();
        match *linked {
            None => {
                *linked = Some(address);
                drop(linked);
                debug!(
                    "Linked ethereum address {:?} to account {}",
                    address, self.account_name
                );
                self.persist_soon();
            }
            Some(existing) if existing == address => {}
            Some(existing) => {
                debug!(
                    "Account {} attempted to rebind its address from {:?} to {:?}; ignoring",
                    self.account_name, existing, address
                );
            }
        }
    }

    /// The peer's payout address, asking over the `info` sub-protocol when it
    /// is not linked yet.
    async fn fetch_ethereum_address(&self) -> Result<Address, PluginError> {
        if let Some(address) = *self.ethereum_address.lock() {
            return Ok(address);
        }
        debug!(
            "Requesting the ethereum address of account {}",
            self.account_name
        );
        let request = InfoMessage {
            ethereum_address: format!("{:?}", self.ctx.contract.own_address()),
        };
        let reply = self
            .ctx
            .transport
            .send_message(
                &self.account_name,
                vec![ProtocolData::json(INFO_PROTOCOL, &request)?],
            )
            .await?;
        let info = reply
            .into_iter()
            .find(|protocol| protocol.protocol_name == INFO_PROTOCOL)
            .ok_or(PluginError::NoLinkedAddress)?;
        let message: InfoMessage =
            serde_json::from_slice(&info.data).map_err(|_| PluginError::NoLinkedAddress)?;
        let address =
            parse_address(&message.ethereum_address).map_err(|_| PluginError::NoLinkedAddress)?;
        self.link_ethereum_address(address);
        Ok(address)
    }

    // ---- outgoing channel management ----

    /// Opens an outgoing channel, or deposits into the cached one. Runs on
    /// the outgoing queue.
    pub(crate) fn fund_outgoing_channel(
        &self,
        value_gwei: Option<u64>,
        authorize: Option<FeeAuthorizer>,
    ) -> impl Future<Output = Result<Option<PaymentChannel>, PluginError>> {
        let account = self.arc();
        self.outgoing.add(
            move |channel| async move { account.fund_channel(channel, value_gwei, authorize).await },
            SEND_MONEY_PRIORITY,
        )
    }

    async fn fund_channel(
        &self,
        channel: Option<PaymentChannel>,
        value_gwei: Option<u64>,
        authorize: Option<FeeAuthorizer>,
    ) -> Result<Option<PaymentChannel>, PluginError> {
        let value_gwei = value_gwei.unwrap_or(self.ctx.config.outgoing_channel_amount);
        let value_wei = U256::from(value_gwei) * U256::exp10(9);

        // the chain is the source of truth for whether the channel is live
        let channel = match channel {
            Some(channel) => match self.ctx.contract.fetch_channel(channel.channel_id).await? {
                Some(view) => Some(channel.refreshed(&view)),
                None => {
                    debug!(
                        "Cached outgoing channel {:?} no longer exists; opening a new one",
                        channel.channel_id
                    );
                    None
                }
            },
            None => None,
        };

        match channel {
            None => self.open_channel(value_wei, authorize).await.map(Some),
            Some(channel) => self
                .deposit_to_channel(channel, value_wei, authorize)
                .await
                .map(Some),
        }
    }

    async fn open_channel(
        &self,
        value_wei: U256,
        authorize: Option<FeeAuthorizer>,
    ) -> Result<PaymentChannel, PluginError> {
        let receiver = self.fetch_ethereum_address().await?;
        let channel_id = H256::from(rand::random::<[u8; 32]>());
        let dispute_period = U256::from(self.ctx.config.outgoing_dispute_period);

        let fee = self
            .ctx
            .contract
            .estimate_open_fee(channel_id, receiver, dispute_period, value_wei)
            .await?;
        if let Some(authorize) = authorize {
            authorize(fee).await?;
        }
        debug!(
            "Opening channel {:?} to {:?} for {} wei (fee {} wei)",
            channel_id, receiver, value_wei, fee
        );
        self.ctx
            .contract
            .open_channel(channel_id, receiver, dispute_period, value_wei)
            .await?;

        for _ in 0..MAX_CHAIN_RETRIES {
            if let Some(view) = self.ctx.contract.fetch_channel(channel_id).await? {
                debug!("Outgoing channel {:?} is open", channel_id);
                return Ok(PaymentChannel::from_view(
                    channel_id,
                    self.ctx.contract.contract_address(),
                    &view,
                ));
            }
            sleep(CHAIN_RETRY_DELAY).await;
        }
        Err(PluginError::Channel(format!(
            "channel {:?} is not visible on-chain after opening",
            channel_id
        )))
    }

    async fn deposit_to_channel(
        &self,
        channel: PaymentChannel,
        value_wei: U256,
        authorize: Option<FeeAuthorizer>,
    ) -> Result<PaymentChannel, PluginError> {
        if channel.is_disputed() {
            return Err(PluginError::Channel(format!(
                "channel {:?} is disputed and cannot take deposits",
                channel.channel_id
            )));
        }
        let old_value = channel.value;
        let fee = self
            .ctx
            .contract
            .estimate_deposit_fee(channel.channel_id, value_wei)
            .await?;
        if let Some(authorize) = authorize {
            authorize(fee).await?;
        }
        debug!(
            "Depositing {} wei into channel {:?} (fee {} wei)",
            value_wei, channel.channel_id, fee
        );
        self.ctx
            .contract
            .deposit(channel.channel_id, value_wei)
            .await?;

        let mut channel = channel;
        for _ in 0..MAX_CHAIN_RETRIES {
            if let Some(view) = self.ctx.contract.fetch_channel(channel.channel_id).await? {
                channel = channel.refreshed(&view);
                if channel.value >= old_value + value_wei {
                    debug!("Deposit into channel {:?} is confirmed", channel.channel_id);
                    return Ok(channel);
                }
            }
            sleep(CHAIN_RETRY_DELAY).await;
        }
        Err(PluginError::Channel(format!(
            "deposit into channel {:?} is not reflected on-chain",
            channel.channel_id
        )))
    }

    // ---- outgoing claims ----

    /// Signs and delivers a claim for up to `amount` gwei, defaulting to the
    /// positive part of the payable balance. Runs on the outgoing queue.
    pub(crate) fn send_money(
        &self,
        amount: Option<BigInt>,
    ) -> impl Future<Output = Result<Option<PaymentChannel>, PluginError>> {
        let account = self.arc();
        self.outgoing.add(
            move |channel| async move { account.settle_claim(channel, amount).await },
            SEND_MONEY_PRIORITY,
        )
    }

    async fn settle_claim(
        &self,
        channel: Option<PaymentChannel>,
        amount: Option<BigInt>,
    ) -> Result<Option<PaymentChannel>, PluginError> {
        let budget_gwei = {
            let mut balances = self.balances.lock();
            let addition = amount.unwrap_or_else(|| balances.payable.clone().max(BigInt::zero()));
            balances.payout += addition;
            balances.payout.clone()
        };

        let channel = match channel {
            Some(channel) => channel,
            None => {
                debug!(
                    "Cannot settle with {}: no outgoing channel",
                    self.account_name
                );
                return Ok(None);
            }
        };
        let remaining = channel.remaining();
        if remaining.is_zero() {
            debug!(
                "Cannot settle with {}: channel {:?} is fully spent",
                self.account_name, channel.channel_id
            );
            return Ok(Some(channel));
        }
        let budget_wei = match gwei_to_wei(&budget_gwei) {
            Some(wei) => wei,
            None => {
                trace!("Nothing due to {}", self.account_name);
                return Ok(Some(channel));
            }
        };

        // claims stay valid and only grow, so signing while the channel is
        // disputed is still useful to the receiver
        let increment = remaining.min(budget_wei);
        let new_spent = channel.spent + increment;
        let signature = self.ctx.contract.sign_hash(prefixed_claim_digest(
            channel.contract_address,
            channel.channel_id,
            new_spent,
        ))?;
        let updated = PaymentChannel {
            spent: new_spent,
            signature: Some(signature),
            ..channel
        };
        debug!(
            "Signed claim for {} more wei on channel {:?} (spent {} of {})",
            increment, updated.channel_id, updated.spent, updated.value
        );

        if let Some(claim) = Claim::from_channel(&updated) {
            let message = ProtocolData::json(MACHINOMY_PROTOCOL, &claim)?;
            let transport = self.ctx.transport.clone();
            let account_name = self.account_name.clone();
            tokio::spawn(async move {
                if let Err(err) = transport.send_message(&account_name, vec![message]).await {
                    debug!(
                        "Failed to deliver claim to {} (the next settlement supersedes it): {}",
                        account_name, err
                    );
                }
            });
        }

        let increment_gwei = wei_to_gwei(increment);
        {
            let mut balances = self.balances.lock();
            balances.payable -= &increment_gwei;
            // the backlog is consumed whole by a settlement and may dip
            // negative when the channel covered more than was queued
            let remainder = &balances.payout - &increment_gwei;
            balances.payout = remainder.min(BigInt::zero());
        }
        Ok(Some(updated))
    }

    // ---- incoming claims ----

    fn handle_machinomy(&self, data: &[u8]) -> Result<Vec<ProtocolData>, PluginError> {
        let claim: Claim = serde_json::from_slice(data)
            .map_err(|err| PluginError::InvalidClaim(format!("malformed claim message: {}", err)))?;
        let handle = self.receive_claim(claim);
        let account_name = self.account_name.clone();
        tokio::spawn(async move {
            if let Err(err) = handle.await {
                debug!("Dropped incoming claim from {}: {}", account_name, err);
            }
        });
        Ok(Vec::new())
    }

    /// Queues validation of an incoming claim. Runs on the incoming queue at
    /// claim-validation priority.
    pub(crate) fn receive_claim(
        &self,
        claim: Claim,
    ) -> impl Future<Output = Result<Option<ClaimablePaymentChannel>, PluginError>> {
        let account = self.arc();
        self.incoming.add(
            move |cached| async move { account.validate_claim(cached, claim).await },
            VALIDATE_CLAIM_PRIORITY,
        )
    }

    async fn validate_claim(
        &self,
        cached: Option<ClaimablePaymentChannel>,
        claim: Claim,
    ) -> Result<Option<ClaimablePaymentChannel>, PluginError> {
        let parsed = claim.parse()?;
        match cached {
            None => self.validate_first_claim(parsed).await,
            Some(channel) => self.validate_next_claim(channel, parsed).await,
        }
    }

    /// First claim on this account: the channel must exist on-chain, belong
    /// to us, respect the dispute-period floor, and be linked to no other
    /// account.
    async fn validate_first_claim(
        &self,
        parsed: ParsedClaim,
    ) -> Result<Option<ClaimablePaymentChannel>, PluginError> {
        let contract = &self.ctx.contract;

        let mut attempt = 0;
        let view = loop {
            attempt += 1;
            match contract.fetch_channel(parsed.channel_id).await? {
                Some(view) => break view,
                None if attempt < MAX_CHAIN_RETRIES => {
                    trace!(
                        "Channel {:?} is not visible yet (attempt {}); retrying",
                        parsed.channel_id,
                        attempt
                    );
                    sleep(CHAIN_RETRY_DELAY).await;
                }
                None => {
                    return Err(PluginError::InvalidClaim(format!(
                        "channel {:?} does not exist on-chain",
                        parsed.channel_id
                    )))
                }
            }
        };

        if parsed.contract_address != contract.contract_address() {
            return Err(PluginError::InvalidClaim(format!(
                "claim is against contract {:?}, not {:?}",
                parsed.contract_address,
                contract.contract_address()
            )));
        }
        if !verify_claim_signature(
            &parsed.signature,
            parsed.contract_address,
            parsed.channel_id,
            parsed.value,
            view.sender,
        ) {
            return Err(PluginError::InvalidClaim(
                "signature does not recover to the channel sender".to_string(),
            ));
        }
        if view.receiver != contract.own_address() {
            return Err(PluginError::InvalidClaim(format!(
                "channel receiver {:?} is not our address",
                view.receiver
            )));
        }
        if view.dispute_period < U256::from(self.ctx.config.min_incoming_dispute_period) {
            return Err(PluginError::InvalidClaim(format!(
                "dispute period of {} blocks is below the minimum of {}",
                view.dispute_period, self.ctx.config.min_incoming_dispute_period
            )));
        }
        if let Some(owner) = self.ctx.store.load_channel_owner(parsed.channel_id).await? {
            if owner != self.account_name {
                return Err(PluginError::InvalidClaim(format!(
                    "channel {:?} is already linked to account {}",
                    parsed.channel_id, owner
                )));
            }
        } else if !self
            .ctx
            .store
            .try_link_channel(parsed.channel_id, &self.account_name)
            .await?
        {
            return Err(PluginError::InvalidClaim(format!(
                "channel {:?} was linked to another account",
                parsed.channel_id
            )));
        }

        let channel = PaymentChannel::from_view(parsed.channel_id, parsed.contract_address, &view);
        self.accept_claim(channel, U256::zero(), parsed, true).await
    }

    /// Subsequent claim: it must target the linked channel, fit its capacity
    /// (waiting out an in-flight deposit if needed) and carry a valid
    /// signature.
    async fn validate_next_claim(
        &self,
        cached: ClaimablePaymentChannel,
        parsed: ParsedClaim,
    ) -> Result<Option<ClaimablePaymentChannel>, PluginError> {
        if parsed.channel_id != cached.channel_id {
            return Err(PluginError::InvalidClaim(format!(
                "claim is for channel {:?} but this account is linked to {:?}",
                parsed.channel_id, cached.channel_id
            )));
        }

        let mut channel = cached;
        if parsed.value > channel.value {
            // a deposit may still be propagating
            let mut attempt = 0;
            loop {
                attempt += 1;
                let view = match self.ctx.contract.fetch_channel(channel.channel_id).await? {
                    Some(view) => view,
                    None => {
                        return Err(PluginError::InvalidClaim(format!(
                            "channel {:?} no longer exists on-chain",
                            channel.channel_id
                        )))
                    }
                };
                channel = channel.refreshed(&view);
                if channel.value >= parsed.value {
                    break;
                }
                if attempt >= MAX_CHAIN_RETRIES {
                    return Err(PluginError::InvalidClaim(format!(
                        "claim value {} exceeds the channel value {}",
                        parsed.value, channel.value
                    )));
                }
                trace!(
                    "Claim value {} above channel value {} (attempt {}); waiting for a deposit to confirm",
                    parsed.value,
                    channel.value,
                    attempt
                );
                sleep(CHAIN_RETRY_DELAY).await;
            }
        }

        // re-verify every claim in case the sender rotated keys on-chain
        if !verify_claim_signature(
            &parsed.signature,
            parsed.contract_address,
            channel.channel_id,
            parsed.value,
            channel.sender,
        ) {
            return Err(PluginError::InvalidClaim(
                "signature does not recover to the channel sender".to_string(),
            ));
        }

        let prior_spent = channel.spent;
        self.accept_claim(channel, prior_spent, parsed, false).await
    }

    /// Credits the claim increment and installs the claim as the channel's
    /// best. An increment that buys nothing new on an already linked channel
    /// is a replay and leaves the cached state alone.
    async fn accept_claim(
        &self,
        channel: ClaimablePaymentChannel,
        prior_spent: U256,
        parsed: ParsedClaim,
        first_claim: bool,
    ) -> Result<Option<ClaimablePaymentChannel>, PluginError> {
        let redeemable = parsed.value.min(channel.value);
        match redeemable.checked_sub(prior_spent) {
            Some(increment) if !increment.is_zero() => {
                let amount_gwei = wei_to_gwei(increment);
                if amount_gwei > BigInt::zero() {
                    {
                        let mut balances = self.balances.lock();
                        balances.receivable -= &amount_gwei;
                    }
                    debug!(
                        "Accepted claim for {} gwei on channel {:?} from {}",
                        amount_gwei, channel.channel_id, self.account_name
                    );
                    let handler = self.ctx.money_handler.read().clone();
                    match handler {
                        Some(handler) => {
                            if let Err(err) = handler(amount_gwei.to_string()).await {
                                error!("Money handler failed: {}", err);
                            }
                        }
                        None => {
                            error!("No money handler registered to credit {} gwei", amount_gwei)
                        }
                    }
                } else {
                    debug!(
                        "Accepted claim on channel {:?}; increment of {} wei is below 1 gwei",
                        channel.channel_id, increment
                    );
                }
            }
            _ if !first_claim => {
                debug!(
                    "Ignoring claim on channel {:?} that buys nothing new (replay or regression)",
                    channel.channel_id
                );
                return Ok(Some(channel));
            }
            _ => {
                debug!(
                    "Accepted zero-value claim as proof of ownership of channel {:?}",
                    channel.channel_id
                );
            }
        }

        self.start_watcher_if_needed();
        Ok(Some(ClaimablePaymentChannel {
            contract_address: parsed.contract_address,
            spent: parsed.value,
            signature: Some(parsed.signature),
            ..channel
        }))
    }

    // ---- claiming ----

    /// Queues an attempt to redeem the best incoming claim on-chain. Runs on
    /// the incoming queue ahead of validations and watcher polls.
    pub(crate) fn claim_if_profitable(
        &self,
        require_disputed: bool,
        authorize: Option<FeeAuthorizer>,
    ) -> impl Future<Output = Result<Option<ClaimablePaymentChannel>, PluginError>> {
        let account = self.arc();
        self.incoming.add(
            move |cached| async move {
                account
                    .redeem_claim(cached, require_disputed, authorize)
                    .await
            },
            CLAIM_CHANNEL_PRIORITY,
        )
    }

    async fn redeem_claim(
        &self,
        cached: Option<ClaimablePaymentChannel>,
        require_disputed: bool,
        authorize: Option<FeeAuthorizer>,
    ) -> Result<Option<ClaimablePaymentChannel>, PluginError> {
        let channel = match cached {
            Some(channel) => channel,
            None => {
                trace!("No incoming channel to claim for {}", self.account_name);
                return Ok(None);
            }
        };
        let signature = match channel.signature.clone() {
            Some(signature) => signature,
            None => {
                trace!("No claim to redeem on channel {:?}", channel.channel_id);
                return Ok(Some(channel));
            }
        };

        let view = match self.ctx.contract.fetch_channel(channel.channel_id).await? {
            Some(view) => view,
            None => {
                debug!("Channel {:?} is already closed", channel.channel_id);
                return Ok(None);
            }
        };
        let channel = channel.refreshed(&view);
        if require_disputed && !channel.is_disputed() {
            trace!(
                "Channel {:?} is not disputed; deferring the claim",
                channel.channel_id
            );
            return Ok(Some(channel));
        }

        let fee = self
            .ctx
            .contract
            .estimate_claim_fee(channel.channel_id, channel.spent, &signature)
            .await?;
        match authorize {
            Some(authorize) => authorize(fee).await?,
            None => {
                if fee >= channel.spent {
                    debug!(
                        "Not claiming channel {:?}: fee of {} wei exceeds the claim value of {} wei",
                        channel.channel_id, fee, channel.spent
                    );
                    return Ok(Some(channel));
                }
            }
        }

        debug!(
            "Claiming {} wei from channel {:?} (fee {} wei)",
            channel.spent, channel.channel_id, fee
        );
        self.ctx
            .contract
            .claim_channel(channel.channel_id, channel.spent, &signature)
            .await?;

        for _ in 0..MAX_CHAIN_RETRIES {
            if self
                .ctx
                .contract
                .fetch_channel(channel.channel_id)
                .await?
                .is_none()
            {
                break;
            }
            sleep(CHAIN_RETRY_DELAY).await;
        }
        Ok(None)
    }

    async fn handle_request_close(&self) -> Vec<ProtocolData> {
        if let Err(err) = self.claim_if_profitable(false, None).await {
            error!(
                "Failed to claim channel of {} on close request: {}",
                self.account_name, err
            );
        }
        vec![ProtocolData::text(REQUEST_CLOSE_PROTOCOL, String::new())]
    }

    /// Asks the peer to redeem its claim so our escrow can come back after
    /// the dispute period.
    pub(crate) async fn request_close(&self) -> Result<(), PluginError> {
        self.ctx
            .transport
            .send_message(
                &self.account_name,
                vec![ProtocolData::text(REQUEST_CLOSE_PROTOCOL, String::new())],
            )
            .await?;
        Ok(())
    }

    // ---- ilp packet flow ----

    /// Admits an incoming Prepare against the receivable ceiling, forwards it
    /// to the data handler and rolls the debit back if the reply is a Reject.
    async fn handle_ilp(&self, data: Vec<u8>) -> Vec<ProtocolData> {
        let prepare = match Packet::try_from(BytesMut::from(&data[..])) {
            Ok(Packet::Prepare(prepare)) => prepare,
            Ok(_) => return ilp_reject(ErrorCode::F00_BAD_REQUEST, "expected an ilp prepare", &[]),
            Err(err) => {
                return ilp_reject(
                    ErrorCode::F00_BAD_REQUEST,
                    &format!("invalid ilp packet: {}", err),
                    &[],
                )
            }
        };

        let amount = prepare.amount();
        let max_packet = self.ctx.config.max_packet_amount;
        if amount > max_packet {
            debug!(
                "Rejecting prepare of {} gwei above the packet limit of {}",
                amount, max_packet
            );
            let details = MaxPacketAmountDetails::new(amount, max_packet);
            return ilp_reject(
                ErrorCode::F08_AMOUNT_TOO_LARGE,
                "packet size is too large",
                &details.to_bytes()[..],
            );
        }

        {
            let mut balances = self.balances.lock();
            let admitted = &balances.receivable + BigInt::from(amount);
            if admitted > BigInt::from(self.ctx.config.max_balance) {
                debug!(
                    "Rejecting prepare of {} gwei: receivable balance {} would exceed {}",
                    amount, balances.receivable, self.ctx.config.max_balance
                );
                return ilp_reject(
                    ErrorCode::T04_INSUFFICIENT_LIQUIDITY,
                    "exceeded maximum balance",
                    &[],
                );
            }
            balances.receivable = admitted;
        }
        self.persist_soon();

        let handler = match self.ctx.data_handler.read().clone() {
            Some(handler) => handler,
            None => {
                self.roll_back_receivable(amount);
                return ilp_reject(ErrorCode::F00_BAD_REQUEST, "no data handler registered", &[]);
            }
        };
        match handler(data).await {
            Ok(reply) => {
                if matches!(
                    Packet::try_from(BytesMut::from(&reply[..])),
                    Ok(Packet::Reject(_))
                ) {
                    self.roll_back_receivable(amount);
                }
                vec![ProtocolData::octet(ILP_PROTOCOL, reply)]
            }
            Err(err) => {
                self.roll_back_receivable(amount);
                error!("Unexpected error from the data handler: {}", err);
                ilp_reject(ErrorCode::F00_BAD_REQUEST, &err.to_string(), &[])
            }
        }
    }

    fn roll_back_receivable(&self, amount: u64) {
        {
            let mut balances = self.balances.lock();
            balances.receivable -= BigInt::from(amount);
        }
        self.persist_soon();
    }

    /// Sends an outgoing Prepare over the transport. A Fulfill reply makes
    /// the amount payable and triggers settlement; a T04 Reject also triggers
    /// settlement to break a liquidity stalemate.
    pub(crate) async fn send_data(&self, prepare: Vec<u8>) -> Result<Vec<u8>, PluginError> {
        let amount = match Packet::try_from(BytesMut::from(&prepare[..])) {
            Ok(Packet::Prepare(parsed)) => parsed.amount(),
            Ok(_) => {
                return Err(PluginError::InvalidPacket(
                    "expected an ilp prepare".to_string(),
                ))
            }
            Err(err) => return Err(PluginError::InvalidPacket(err.to_string())),
        };

        let reply = self
            .ctx
            .transport
            .send_message(
                &self.account_name,
                vec![ProtocolData::octet(ILP_PROTOCOL, prepare)],
            )
            .await?;
        let ilp = reply
            .into_iter()
            .find(|protocol| protocol.protocol_name == ILP_PROTOCOL)
            .ok_or_else(|| {
                PluginError::Transport("peer reply carried no ilp sub-protocol".to_string())
            })?;

        match Packet::try_from(BytesMut::from(&ilp.data[..])) {
            Ok(Packet::Fulfill(_)) => {
                {
                    let mut balances = self.balances.lock();
                    balances.payable += BigInt::from(amount);
                }
                self.persist_soon();
                self.settle_soon();
            }
            Ok(Packet::Reject(reject))
                if reject.code() == ErrorCode::T04_INSUFFICIENT_LIQUIDITY =>
            {
                self.settle_soon();
            }
            _ => {}
        }
        Ok(ilp.data)
    }

    fn settle_soon(&self) {
        let handle = self.send_money(None);
        let account_name = self.account_name.clone();
        tokio::spawn(async move {
            if let Err(err) = handle.await {
                error!("Failed to settle with {}: {}", account_name, err);
            }
        });
    }

    // ---- lifecycle ----

    pub(crate) fn start_watcher_if_needed(&self) {
        let mut watcher = self.watcher.lock();
        if watcher.is_none() {
            debug!("Starting channel watcher for account {}", self.account_name);
            *watcher = Some(watcher::start_channel_watcher(self.arc()));
        }
    }

    /// Stops background work; in-flight reducers run to completion.
    pub(crate) fn disconnect(&self) {
        if let Some(handle) = self.watcher.lock().take() {
            handle.abort();
        }
    }

    /// Tears the account down: watcher cancelled, listeners detached, pending
    /// reducers dropped.
    pub(crate) fn unload(&self) {
        self.disconnect();
        self.incoming.remove_all_listeners();
        self.outgoing.remove_all_listeners();
        self.incoming.clear();
        self.outgoing.clear();
    }

    // ---- persistence ----

    fn spawn_persistence(&self) {
        let mut incoming_events = self.incoming.subscribe();
        let account = self.arc();
        tokio::spawn(async move {
            while incoming_events.recv().await.is_some() {
                account.persist().await;
            }
        });
        let mut outgoing_events = self.outgoing.subscribe();
        let account = self.arc();
        tokio::spawn(async move {
            while outgoing_events.recv().await.is_some() {
                account.persist().await;
            }
        });
    }

    fn persist_soon(&self) {
        let store = self.ctx.store.clone();
        let snapshot = self.snapshot();
        let account_name = self.account_name.clone();
        tokio::spawn(async move {
            if let Err(err) = store.save_account(&snapshot).await {
                error!("Failed to persist account {}: {}", account_name, err);
            }
        });
    }

    async fn persist(&self) {
        let snapshot = self.snapshot();
        if let Err(err) = self.ctx.store.save_account(&snapshot).await {
            error!("Failed to persist account {}: {}", self.account_name, err);
        }
    }

    pub(crate) fn snapshot(&self) -> AccountSnapshot {
        let balances = self.balances.lock();
        AccountSnapshot {
            account_name: self.account_name.clone(),
            receivable_balance: balances.receivable.to_string(),
            payable_balance: balances.payable.to_string(),
            payout_amount: balances.payout.to_string(),
            ethereum_address: self
                .ethereum_address
                .lock()
                .map(|address| format!("{:?}", address)),
            incoming_channel: self.incoming.state().as_ref().map(ChannelSnapshot::from),
            outgoing_channel: self.outgoing.state().as_ref().map(ChannelSnapshot::from),
        }
    }
}

fn ilp_reject(code: ErrorCode, message: &str, data: &[u8]) -> Vec<ProtocolData> {
    let reject = RejectBuilder {
        code,
        message: message.as_bytes(),
        triggered_by: None,
        data,
    }
    .build();
    vec![ProtocolData::octet(ILP_PROTOCOL, reject.as_ref().to_vec())]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::{DataHandler, PluginConfig};
    use crate::utils::test_helpers::fixtures::{ALICE, BOB, CONTRACT};
    use crate::utils::test_helpers::utils::{
        incoming_channel, signed_claim, test_context, TestContract, TestTransport,
    };
    use ethers::signers::Signer;
    use interledger_packet::{Address as IlpAddress, FulfillBuilder, PrepareBuilder};
    use std::str::FromStr;
    use std::time::SystemTime;

    const GWEI: u64 = 1_000_000_000;

    fn config() -> PluginConfig {
        PluginConfig {
            min_incoming_dispute_period: 40,
            max_packet_amount: 1_000,
            max_balance: 1_000,
            channel_watcher_interval: 60_000,
            ..Default::default()
        }
    }

    fn prepare_bytes(amount: u64) -> Vec<u8> {
        PrepareBuilder {
            amount,
            destination: IlpAddress::from_str("private.peer").unwrap(),
            expires_at: SystemTime::now() + Duration::from_secs(30),
            execution_condition: &[0u8; 32],
            data: &[],
        }
        .build()
        .as_ref()
        .to_vec()
    }

    fn fulfill_bytes() -> Vec<u8> {
        FulfillBuilder {
            fulfillment: &[0u8; 32],
            data: &[],
        }
        .build()
        .as_ref()
        .to_vec()
    }

    fn reject_bytes(code: ErrorCode) -> Vec<u8> {
        RejectBuilder {
            code,
            message: b"",
            triggered_by: None,
            data: &[],
        }
        .build()
        .as_ref()
        .to_vec()
    }

    fn static_handler(reply: Vec<u8>) -> DataHandler {
        Arc::new(move |_| {
            let reply = reply.clone();
            Box::pin(async move { Ok(reply) })
        })
    }

    fn parse_reply(protocols: &[ProtocolData]) -> Packet {
        assert_eq!(protocols[0].protocol_name, ILP_PROTOCOL);
        Packet::try_from(BytesMut::from(&protocols[0].data[..])).unwrap()
    }

    #[tokio::test]
    async fn links_channel_with_ownership_claim_then_credits_whole_gwei() {
        let contract = TestContract::new();
        let id = H256::repeat_byte(0xbe);
        contract.insert_channel(id, incoming_channel(BOB.address(), U256::exp10(15), 100));
        let ctx = test_context(config(), contract, TestTransport::default());
        let account = ctx.plugin.account("peer").await.unwrap();

        // a zero-value claim proves ownership but moves no money
        let claim = signed_claim(&BOB, *CONTRACT, id, U256::zero());
        let channel = account.receive_claim(claim).await.unwrap().unwrap();
        assert_eq!(channel.spent, U256::zero());
        assert!(channel.signature.is_some());
        assert!(ctx.money_events.lock().is_empty());
        assert!(account.watcher.lock().is_some());

        let claim = signed_claim(&BOB, *CONTRACT, id, U256::from(10u64 * GWEI));
        let channel = account.receive_claim(claim).await.unwrap().unwrap();
        assert_eq!(channel.spent, U256::from(10u64 * GWEI));
        assert_eq!(*ctx.money_events.lock(), vec!["10".to_string()]);
        assert_eq!(account.balances.lock().receivable, BigInt::from(-10));
    }

    #[tokio::test]
    async fn floors_sub_gwei_claim_increments_to_nothing() {
        let contract = TestContract::new();
        let id = H256::repeat_byte(0xbf);
        contract.insert_channel(id, incoming_channel(BOB.address(), U256::exp10(15), 100));
        let ctx = test_context(config(), contract, TestTransport::default());
        let account = ctx.plugin.account("peer").await.unwrap();

        let claim = signed_claim(&BOB, *CONTRACT, id, U256::from(500_000u64));
        let channel = account.receive_claim(claim).await.unwrap().unwrap();
        // the claim is kept as the channel's best even though it credits
        // nothing yet
        assert_eq!(channel.spent, U256::from(500_000u64));
        assert!(ctx.money_events.lock().is_empty());
        assert_eq!(account.balances.lock().receivable, BigInt::from(0));
    }

    #[tokio::test]
    async fn ignores_replayed_claims() {
        let contract = TestContract::new();
        let id = H256::repeat_byte(0xc0);
        contract.insert_channel(id, incoming_channel(BOB.address(), U256::exp10(15), 100));
        let ctx = test_context(config(), contract, TestTransport::default());
        let account = ctx.plugin.account("peer").await.unwrap();

        let claim = signed_claim(&BOB, *CONTRACT, id, U256::from(10u64 * GWEI));
        account.receive_claim(claim.clone()).await.unwrap();
        let channel = account.receive_claim(claim).await.unwrap().unwrap();

        assert_eq!(channel.spent, U256::from(10u64 * GWEI));
        assert_eq!(ctx.money_events.lock().len(), 1);
        assert_eq!(account.balances.lock().receivable, BigInt::from(-10));
    }

    #[tokio::test]
    async fn rejects_claim_on_channel_linked_to_another_account() {
        let contract = TestContract::new();
        let id = H256::repeat_byte(0x01);
        contract.insert_channel(id, incoming_channel(BOB.address(), U256::exp10(15), 100));
        let ctx = test_context(config(), contract, TestTransport::default());

        let account_a = ctx.plugin.account("a").await.unwrap();
        let claim = signed_claim(&BOB, *CONTRACT, id, U256::from(10u64 * GWEI));
        account_a.receive_claim(claim.clone()).await.unwrap();

        let account_b = ctx.plugin.account("b").await.unwrap();
        let err = account_b.receive_claim(claim).await.unwrap_err();
        assert!(matches!(err, PluginError::InvalidClaim(_)));
        assert!(account_b.incoming.state().is_none());
        assert_eq!(
            ctx.store.channel_owners.read().get(&id),
            Some(&"a".to_string())
        );
    }

    #[tokio::test]
    async fn rejects_invalid_first_claims() {
        let contract = TestContract::new();
        let good = H256::repeat_byte(0x11);
        contract.insert_channel(good, incoming_channel(BOB.address(), U256::exp10(15), 100));
        let short_dispute = H256::repeat_byte(0x12);
        contract.insert_channel(
            short_dispute,
            incoming_channel(BOB.address(), U256::exp10(15), 39),
        );
        let not_ours = H256::repeat_byte(0x13);
        contract.insert_channel(
            not_ours,
            crate::channel::ChannelView {
                receiver: Address::repeat_byte(0x44),
                ..incoming_channel(BOB.address(), U256::exp10(15), 100)
            },
        );
        let ctx = test_context(config(), contract, TestTransport::default());
        let account = ctx.plugin.account("peer").await.unwrap();

        // claim against some other contract deployment
        let other_contract = Address::repeat_byte(0x55);
        let wrong_contract = signed_claim(&BOB, other_contract, good, U256::from(10u64));
        assert!(account.receive_claim(wrong_contract).await.is_err());

        // signed by a key that is not the channel sender
        let forged = signed_claim(&ALICE, *CONTRACT, good, U256::from(10u64));
        assert!(account.receive_claim(forged).await.is_err());

        // dispute period below our floor
        let impatient = signed_claim(&BOB, *CONTRACT, short_dispute, U256::from(10u64));
        assert!(account.receive_claim(impatient).await.is_err());

        // we are not the channel receiver
        let misdirected = signed_claim(&BOB, *CONTRACT, not_ours, U256::from(10u64));
        assert!(account.receive_claim(misdirected).await.is_err());

        assert!(account.incoming.state().is_none());
        assert!(ctx.money_events.lock().is_empty());
        assert!(ctx.store.channel_owners.read().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_a_fresh_channel_is_visible() {
        let contract = TestContract::new();
        let id = H256::repeat_byte(0x76);
        contract.insert_channel(id, incoming_channel(BOB.address(), U256::exp10(15), 100));
        // the first two lookups race ahead of block propagation
        contract.visible_after.write().insert(id, 2);
        let ctx = test_context(config(), contract, TestTransport::default());
        let account = ctx.plugin.account("peer").await.unwrap();

        let claim = signed_claim(&BOB, *CONTRACT, id, U256::from(10u64 * GWEI));
        let channel = account.receive_claim(claim).await.unwrap().unwrap();
        assert_eq!(channel.spent, U256::from(10u64 * GWEI));
        assert_eq!(*ctx.money_events.lock(), vec!["10".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_deposit_before_accepting_larger_claim() {
        let contract = TestContract::new();
        let id = H256::repeat_byte(0x77);
        contract.insert_channel(id, incoming_channel(BOB.address(), U256::from(1_000u64), 100));
        let ctx = test_context(config(), contract, TestTransport::default());
        let account = ctx.plugin.account("peer").await.unwrap();

        let claim = signed_claim(&BOB, *CONTRACT, id, U256::from(500u64));
        account.receive_claim(claim).await.unwrap();

        // the deposit only becomes visible on the third fetch
        ctx.contract.set_value_after(id, 3, U256::from(5_000u64));
        let claim = signed_claim(&BOB, *CONTRACT, id, U256::from(5_000u64));
        let channel = account.receive_claim(claim).await.unwrap().unwrap();
        assert_eq!(channel.value, U256::from(5_000u64));
        assert_eq!(channel.spent, U256::from(5_000u64));
    }

    #[tokio::test]
    async fn links_address_once_and_never_rebinds() {
        let ctx = test_context(config(), TestContract::new(), TestTransport::default());
        let account = ctx.plugin.account("peer").await.unwrap();

        let info = serde_json::json!({ "ethereumAddress": format!("{:?}", BOB.address()) });
        let reply = account
            .handle_message(vec![ProtocolData::json(INFO_PROTOCOL, &info).unwrap()])
            .await
            .unwrap();
        let message: serde_json::Value = serde_json::from_slice(&reply[0].data).unwrap();
        assert_eq!(
            message["ethereumAddress"],
            format!("{:?}", ALICE.address())
        );
        assert_eq!(*account.ethereum_address.lock(), Some(BOB.address()));

        let other = serde_json::json!({ "ethereumAddress": format!("{:?}", Address::repeat_byte(0x99)) });
        account
            .handle_message(vec![ProtocolData::json(INFO_PROTOCOL, &other).unwrap()])
            .await
            .unwrap();
        assert_eq!(*account.ethereum_address.lock(), Some(BOB.address()));
    }

    #[tokio::test]
    async fn rolls_back_receivable_when_prepare_is_rejected() {
        let ctx = test_context(config(), TestContract::new(), TestTransport::default());
        ctx.plugin
            .register_data_handler(static_handler(reject_bytes(ErrorCode::F99_APPLICATION_ERROR)));
        let account = ctx.plugin.account("peer").await.unwrap();

        let reply = account
            .handle_message(vec![ProtocolData::octet(ILP_PROTOCOL, prepare_bytes(600))])
            .await
            .unwrap();
        assert!(matches!(parse_reply(&reply), Packet::Reject(_)));
        assert_eq!(account.balances.lock().receivable, BigInt::from(0));
    }

    #[tokio::test]
    async fn rejects_prepare_above_max_packet_amount() {
        let ctx = test_context(config(), TestContract::new(), TestTransport::default());
        ctx.plugin.register_data_handler(static_handler(fulfill_bytes()));
        let account = ctx.plugin.account("peer").await.unwrap();

        // exactly at the limit is fine
        let reply = account
            .handle_message(vec![ProtocolData::octet(ILP_PROTOCOL, prepare_bytes(1_000))])
            .await
            .unwrap();
        assert!(matches!(parse_reply(&reply), Packet::Fulfill(_)));
        assert_eq!(account.balances.lock().receivable, BigInt::from(1_000));

        // one above is not
        let reply = account
            .handle_message(vec![ProtocolData::octet(ILP_PROTOCOL, prepare_bytes(1_001))])
            .await
            .unwrap();
        match parse_reply(&reply) {
            Packet::Reject(reject) => {
                assert_eq!(reject.code(), ErrorCode::F08_AMOUNT_TOO_LARGE);
                let details = MaxPacketAmountDetails::from_bytes(reject.data()).unwrap();
                assert_eq!(details.amount_received(), 1_001);
                assert_eq!(details.max_amount(), 1_000);
            }
            other => panic!("expected F08 reject, got {:?}", other),
        }
        assert_eq!(account.balances.lock().receivable, BigInt::from(1_000));
    }

    #[tokio::test]
    async fn rejects_prepare_beyond_max_balance() {
        let ctx = test_context(config(), TestContract::new(), TestTransport::default());
        ctx.plugin.register_data_handler(static_handler(fulfill_bytes()));
        let account = ctx.plugin.account("peer").await.unwrap();

        // fills the receivable ceiling exactly
        account
            .handle_message(vec![ProtocolData::octet(ILP_PROTOCOL, prepare_bytes(1_000))])
            .await
            .unwrap();
        assert_eq!(account.balances.lock().receivable, BigInt::from(1_000));

        // even one more gwei is over the ceiling
        let reply = account
            .handle_message(vec![ProtocolData::octet(ILP_PROTOCOL, prepare_bytes(1))])
            .await
            .unwrap();
        match parse_reply(&reply) {
            Packet::Reject(reject) => {
                assert_eq!(reject.code(), ErrorCode::T04_INSUFFICIENT_LIQUIDITY)
            }
            other => panic!("expected T04 reject, got {:?}", other),
        }
        assert_eq!(account.balances.lock().receivable, BigInt::from(1_000));
    }

    #[tokio::test]
    async fn opens_channel_with_authorized_fee_and_settles_monotonically() {
        let contract = TestContract::new().with_open_fee(U256::from(12_345u64));
        let transport = TestTransport::replying_info(BOB.address());
        let ctx = test_context(config(), contract, transport);
        let account = ctx.plugin.account("peer").await.unwrap();

        let authorized = Arc::new(Mutex::new(None));
        let seen = authorized.clone();
        let authorize: FeeAuthorizer = Box::new(move |fee| {
            *seen.lock() = Some(fee);
            Box::pin(async { Ok(()) })
        });
        let channel = account
            .fund_outgoing_channel(Some(1_000_000), Some(authorize))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(channel.value, U256::from(1_000_000u64 * GWEI));
        assert_eq!(channel.receiver, BOB.address());
        assert_eq!(*authorized.lock(), Some(U256::from(12_345u64)));
        assert_eq!(*account.ethereum_address.lock(), Some(BOB.address()));

        account.balances.lock().payable = BigInt::from(600);
        let channel = account.send_money(None).await.unwrap().unwrap();
        assert_eq!(channel.spent, U256::from(600u64 * GWEI));
        assert!(verify_claim_signature(
            channel.signature.as_ref().unwrap(),
            *CONTRACT,
            channel.channel_id,
            channel.spent,
            ALICE.address()
        ));
        {
            let balances = account.balances.lock();
            assert_eq!(balances.payable, BigInt::from(0));
            assert_eq!(balances.payout, BigInt::from(0));
        }

        let channel = account
            .send_money(Some(BigInt::from(100)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(channel.spent, U256::from(700u64 * GWEI));

        sleep(Duration::from_millis(50)).await;
        let claims = ctx.transport.sent_claims();
        assert_eq!(claims.len(), 2);
        // delivery tasks race, so check the set rather than the order
        let values: Vec<&str> = claims.iter().map(|claim| claim.value.as_str()).collect();
        assert!(values.contains(&(600u64 * GWEI).to_string().as_str()));
        assert!(values.contains(&(700u64 * GWEI).to_string().as_str()));
        for claim in &claims {
            assert_eq!(claim.parse().unwrap().channel_id, channel.channel_id);
        }
    }

    #[tokio::test]
    async fn send_money_zeroes_payout_backlog_even_when_partially_settled() {
        let ctx = test_context(
            config(),
            TestContract::new(),
            TestTransport::replying_info(BOB.address()),
        );
        let account = ctx.plugin.account("peer").await.unwrap();
        account
            .fund_outgoing_channel(Some(100), None)
            .await
            .unwrap();

        // 600 gwei queued against a 100 gwei channel
        let channel = account
            .send_money(Some(BigInt::from(600)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(channel.spent, U256::from(100u64 * GWEI));

        let balances = account.balances.lock();
        assert_eq!(balances.payable, BigInt::from(-100));
        // the 500 gwei still owed are dropped from the backlog rather than
        // carried forward
        assert_eq!(balances.payout, BigInt::from(0));
    }

    #[tokio::test]
    async fn deposits_into_existing_channel() {
        let ctx = test_context(
            config(),
            TestContract::new(),
            TestTransport::replying_info(BOB.address()),
        );
        let account = ctx.plugin.account("peer").await.unwrap();

        account
            .fund_outgoing_channel(Some(100), None)
            .await
            .unwrap();
        let channel = account
            .fund_outgoing_channel(Some(50), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(channel.value, U256::from(150u64 * GWEI));
        assert_eq!(ctx.contract.opened.read().len(), 1);
    }

    #[tokio::test]
    async fn skips_unprofitable_claim() {
        let contract = TestContract::new().with_claim_fee(U256::from(200_000u64));
        let id = H256::repeat_byte(0x66);
        contract.insert_channel(id, incoming_channel(BOB.address(), U256::from(1_000_000u64), 100));
        let ctx = test_context(config(), contract, TestTransport::default());
        let account = ctx.plugin.account("peer").await.unwrap();

        let claim = signed_claim(&BOB, *CONTRACT, id, U256::from(100_000u64));
        account.receive_claim(claim).await.unwrap();

        let channel = account
            .claim_if_profitable(false, None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(channel.spent, U256::from(100_000u64));
        assert!(ctx.contract.claims.read().is_empty());
        assert!(ctx.contract.channels.read().contains_key(&id));
    }

    #[tokio::test]
    async fn claims_channel_on_close_request() {
        let contract = TestContract::new();
        let id = H256::repeat_byte(0x67);
        contract.insert_channel(id, incoming_channel(BOB.address(), U256::exp10(15), 100));
        let ctx = test_context(config(), contract, TestTransport::default());
        let account = ctx.plugin.account("peer").await.unwrap();

        let claim = signed_claim(&BOB, *CONTRACT, id, U256::from(10u64 * GWEI));
        account.receive_claim(claim).await.unwrap();

        let reply = account
            .handle_message(vec![ProtocolData::text(
                REQUEST_CLOSE_PROTOCOL,
                String::new(),
            )])
            .await
            .unwrap();
        assert_eq!(reply[0].protocol_name, REQUEST_CLOSE_PROTOCOL);
        assert_eq!(
            *ctx.contract.claims.read(),
            vec![(id, U256::from(10u64 * GWEI))]
        );
        assert!(account.incoming.state().is_none());
    }

    #[tokio::test]
    async fn fulfilled_prepares_become_payable_and_trigger_settlement() {
        let contract = TestContract::new();
        let transport = TestTransport::replying_info(BOB.address());
        *transport.ilp_reply.lock() = Some(fulfill_bytes());
        let ctx = test_context(config(), contract, transport);
        let account = ctx.plugin.account("peer").await.unwrap();
        account
            .fund_outgoing_channel(Some(1_000_000), None)
            .await
            .unwrap();

        let reply = account.send_data(prepare_bytes(250)).await.unwrap();
        assert!(matches!(
            Packet::try_from(BytesMut::from(&reply[..])),
            Ok(Packet::Fulfill(_))
        ));
        sleep(Duration::from_millis(50)).await;
        let channel = account.outgoing.state().unwrap();
        assert_eq!(channel.spent, U256::from(250u64 * GWEI));
        assert_eq!(account.balances.lock().payable, BigInt::from(0));

        // a T04 reject breaks the stalemate by settling what is already owed
        account.balances.lock().payable = BigInt::from(50);
        *ctx.transport.ilp_reply.lock() =
            Some(reject_bytes(ErrorCode::T04_INSUFFICIENT_LIQUIDITY));
        let reply = account.send_data(prepare_bytes(5)).await.unwrap();
        assert!(matches!(
            Packet::try_from(BytesMut::from(&reply[..])),
            Ok(Packet::Reject(_))
        ));
        sleep(Duration::from_millis(50)).await;
        let channel = account.outgoing.state().unwrap();
        assert_eq!(channel.spent, U256::from(300u64 * GWEI));
        assert_eq!(account.balances.lock().payable, BigInt::from(0));
    }
}
