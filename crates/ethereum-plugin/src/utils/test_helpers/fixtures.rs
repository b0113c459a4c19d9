use ethers::signers::LocalWallet;
use ethers::types::Address;
use once_cell::sync::Lazy;
use std::str::FromStr;

// well-known ganache developer keys
pub static ALICE_KEY: &str = "380eb0f3d505f087e438eca80bc4df9a7faa24f868e69fc0440261a0fc0567dc";
pub static BOB_KEY: &str = "cc96601bc52293b53c4736a12af9130abf347669b3813f9ec4cafdf6991b087e";

/// Our wallet: signs outgoing claims and receives incoming channels.
pub static ALICE: Lazy<LocalWallet> = Lazy::new(|| ALICE_KEY.parse().unwrap());

/// The peer's wallet: signs the incoming claims we validate.
pub static BOB: Lazy<LocalWallet> = Lazy::new(|| BOB_KEY.parse().unwrap());

pub static CONTRACT: Lazy<Address> =
    Lazy::new(|| Address::from_str("c92be489639a9c61f517bd3b955840fa19bc9b7c").unwrap());
