use crate::channel::PaymentChannel;
use crate::error::PluginError;

use ethers::core::types::{Address, RecoveryMessage, Signature, H256, U256};
use ethers::core::utils::{hash_message, keccak256};
use serde::{Deserialize, Serialize};

/// A claim as it travels over the `machinomy` sub-protocol. All fields are
/// strings on the wire; amounts are decimal wei, everything else is hex.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Claim {
    pub channel_id: String,
    pub contract_address: String,
    pub value: String,
    pub signature: String,
}

/// A syntactically valid claim with typed fields. Semantic checks (signer,
/// receiver, channel capacity) happen against the on-chain channel.
#[derive(Clone, Debug, PartialEq)]
pub struct ParsedClaim {
    pub channel_id: H256,
    pub contract_address: Address,
    pub value: U256,
    pub signature: Signature,
}

impl Claim {
    /// Builds the wire form of the best claim held in an outgoing channel.
    /// Returns `None` until a claim has been signed.
    pub fn from_channel(channel: &PaymentChannel) -> Option<Claim> {
        let signature = channel.signature.as_ref()?;
        Some(Claim {
            channel_id: format!("{:?}", channel.channel_id),
            contract_address: format!("{:?}", channel.contract_address),
            value: channel.spent.to_string(),
            signature: format!("0x{}", hex::encode(signature.to_vec())),
        })
    }

    pub fn parse(&self) -> Result<ParsedClaim, PluginError> {
        let channel_id = parse_h256(&self.channel_id)
            .map_err(|err| PluginError::InvalidClaim(format!("bad channel id: {}", err)))?;
        let contract_address = parse_address(&self.contract_address)
            .map_err(|err| PluginError::InvalidClaim(format!("bad contract address: {}", err)))?;
        let value = self.value.trim();
        if value.starts_with('-') {
            return Err(PluginError::InvalidClaim("claim value is negative".to_string()));
        }
        let value = U256::from_dec_str(value)
            .map_err(|err| PluginError::InvalidClaim(format!("bad claim value: {}", err)))?;
        let signature = parse_signature(&self.signature)?;
        Ok(ParsedClaim {
            channel_id,
            contract_address,
            value,
            signature,
        })
    }
}

/// `keccak256(abi.encodePacked(contractAddress, channelId, value))`, the
/// payload the channel contract reconstructs when a claim is redeemed.
pub fn claim_payload_digest(contract_address: Address, channel_id: H256, value: U256) -> H256 {
    let mut packed = [0u8; 84];
    packed[..20].copy_from_slice(contract_address.as_bytes());
    packed[20..52].copy_from_slice(channel_id.as_bytes());
    value.to_big_endian(&mut packed[52..]);
    H256::from(keccak256(packed))
}

/// The digest that is actually signed: the payload digest wrapped in the
/// `"\x19Ethereum Signed Message:\n32"` prefix.
pub fn prefixed_claim_digest(contract_address: Address, channel_id: H256, value: U256) -> H256 {
    hash_message(claim_payload_digest(contract_address, channel_id, value))
}

/// Recovers the signer of a claim and compares it against the expected
/// address (the channel's on-chain sender).
pub fn verify_claim_signature(
    signature: &Signature,
    contract_address: Address,
    channel_id: H256,
    value: U256,
    signer: Address,
) -> bool {
    let digest = prefixed_claim_digest(contract_address, channel_id, value);
    signature
        .recover(RecoveryMessage::Hash(digest))
        .map(|recovered| recovered == signer)
        .unwrap_or(false)
}

pub(crate) fn parse_address(hex_str: &str) -> Result<Address, PluginError> {
    let raw = hex::decode(hex_str.trim_start_matches("0x"))
        .map_err(|err| PluginError::InvalidAddress(err.to_string()))?;
    if raw.len() != 20 {
        return Err(PluginError::InvalidAddress(format!(
            "expected 20 bytes, got {}",
            raw.len()
        )));
    }
    Ok(Address::from_slice(&raw))
}

pub(crate) fn parse_h256(hex_str: &str) -> Result<H256, PluginError> {
    let raw = hex::decode(hex_str.trim_start_matches("0x"))
        .map_err(|err| PluginError::InvalidAddress(err.to_string()))?;
    if raw.len() != 32 {
        return Err(PluginError::InvalidAddress(format!(
            "expected 32 bytes, got {}",
            raw.len()
        )));
    }
    Ok(H256::from_slice(&raw))
}

pub(crate) fn parse_signature(hex_str: &str) -> Result<Signature, PluginError> {
    let raw = hex::decode(hex_str.trim_start_matches("0x"))
        .map_err(|err| PluginError::InvalidClaim(format!("bad signature: {}", err)))?;
    Signature::try_from(raw.as_slice())
        .map_err(|err| PluginError::InvalidClaim(format!("bad signature: {}", err)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::signers::{LocalWallet, Signer};

    fn test_wallet() -> LocalWallet {
        "380eb0f3d505f087e438eca80bc4df9a7faa24f868e69fc0440261a0fc0567dc"
            .parse()
            .unwrap()
    }

    fn sign_claim(wallet: &LocalWallet, contract: Address, id: H256, value: U256) -> Signature {
        wallet.sign_hash(prefixed_claim_digest(contract, id, value))
    }

    #[test]
    fn wire_round_trip() {
        let wallet = test_wallet();
        let contract = Address::repeat_byte(0x11);
        let id = H256::repeat_byte(0xbe);
        let value = U256::from(500_000u64);
        let channel = PaymentChannel {
            channel_id: id,
            contract_address: contract,
            sender: wallet.address(),
            receiver: Address::repeat_byte(0x22),
            value: U256::from(1_000_000u64),
            dispute_period: U256::from(100u64),
            disputed_until: None,
            spent: value,
            signature: Some(sign_claim(&wallet, contract, id, value)),
        };

        let claim = Claim::from_channel(&channel).unwrap();
        let json = serde_json::to_string(&claim).unwrap();
        let decoded: Claim = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, claim);

        let parsed = decoded.parse().unwrap();
        assert_eq!(parsed.channel_id, id);
        assert_eq!(parsed.contract_address, contract);
        assert_eq!(parsed.value, value);
        assert_eq!(parsed.signature, channel.signature.unwrap());
    }

    #[test]
    fn recovers_the_signing_address() {
        let wallet = test_wallet();
        let contract = Address::repeat_byte(0xaa);
        let id = H256::repeat_byte(0x01);
        let value = U256::from(42u64);
        let signature = sign_claim(&wallet, contract, id, value);

        assert!(verify_claim_signature(
            &signature,
            contract,
            id,
            value,
            wallet.address()
        ));
        // any other expected signer must fail
        assert!(!verify_claim_signature(
            &signature,
            contract,
            id,
            value,
            Address::repeat_byte(0x99)
        ));
        // a signature over a different value must fail
        assert!(!verify_claim_signature(
            &signature,
            contract,
            id,
            U256::from(43u64),
            wallet.address()
        ));
    }

    #[test]
    fn later_claims_supersede_earlier_ones() {
        let wallet = test_wallet();
        let contract = Address::repeat_byte(0xaa);
        let id = H256::repeat_byte(0x02);

        for spent in [100u64, 250, 1_000] {
            let signature = sign_claim(&wallet, contract, id, U256::from(spent));
            assert!(verify_claim_signature(
                &signature,
                contract,
                id,
                U256::from(spent),
                wallet.address()
            ));
        }
    }

    #[test]
    fn rejects_negative_and_malformed_values() {
        let claim = Claim {
            channel_id: format!("{:?}", H256::repeat_byte(0x03)),
            contract_address: format!("{:?}", Address::repeat_byte(0xaa)),
            value: "-5".to_string(),
            signature: format!("0x{}", hex::encode([0u8; 65])),
        };
        assert!(claim.parse().is_err());

        let claim = Claim {
            value: "12e9".to_string(),
            ..claim
        };
        assert!(claim.parse().is_err());
    }

    #[test]
    fn rejects_short_ids_and_addresses() {
        assert!(parse_h256("0xbeef").is_err());
        assert!(parse_address("0xbeef").is_err());
        // mixed-case hex parses to the same bytes
        let a = parse_address("0x3CDB3d9e1B74692Bb1E3bb5fc81938151cA64b02").unwrap();
        let b = parse_address("0x3cdb3d9e1b74692bb1e3bb5fc81938151ca64b02").unwrap();
        assert_eq!(a, b);
    }
}
