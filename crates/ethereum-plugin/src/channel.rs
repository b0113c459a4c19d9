use ethers::core::types::{Address, Signature, H256, U256};

/// The state of a channel as reported by the contract's `channels` view.
#[derive(Clone, Debug, PartialEq)]
pub struct ChannelView {
    pub sender: Address,
    pub receiver: Address,
    pub value: U256,
    pub dispute_period: U256,
    pub disputed_until: Option<U256>,
}

/// An escrowed unidirectional channel together with the best claim known for
/// it. For the outgoing direction `spent`/`signature` track the claim we last
/// signed; for the incoming direction they track the claim we last accepted.
///
/// `spent` never decreases and, for channels we fund, never exceeds `value`.
#[derive(Clone, Debug, PartialEq)]
pub struct PaymentChannel {
    pub channel_id: H256,
    pub contract_address: Address,
    pub sender: Address,
    pub receiver: Address,
    pub value: U256,
    pub dispute_period: U256,
    pub disputed_until: Option<U256>,
    pub spent: U256,
    pub signature: Option<Signature>,
}

/// Incoming-direction channel; its `signature` is present from the moment the
/// first claim on it is accepted.
pub type ClaimablePaymentChannel = PaymentChannel;

impl PaymentChannel {
    /// Builds the initial cached channel from an on-chain view, before any
    /// claim exists.
    pub fn from_view(channel_id: H256, contract_address: Address, view: &ChannelView) -> Self {
        PaymentChannel {
            channel_id,
            contract_address,
            sender: view.sender,
            receiver: view.receiver,
            value: view.value,
            dispute_period: view.dispute_period,
            disputed_until: view.disputed_until,
            spent: U256::zero(),
            signature: None,
        }
    }

    /// Merges a fresh on-chain view into the cached channel. The claim state
    /// (`spent`, `signature`) is ours and is never overwritten by the chain.
    pub fn refreshed(self, view: &ChannelView) -> Self {
        PaymentChannel {
            sender: view.sender,
            receiver: view.receiver,
            value: view.value,
            dispute_period: view.dispute_period,
            disputed_until: view.disputed_until,
            ..self
        }
    }

    /// Escrow still claimable beyond what has already been signed away.
    pub fn remaining(&self) -> U256 {
        self.value.saturating_sub(self.spent)
    }

    pub fn is_disputed(&self) -> bool {
        self.disputed_until.is_some()
    }
}
