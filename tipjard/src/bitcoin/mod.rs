//! Interface to the Bitcoin network.
//!
//! Watch receive addresses for inbound transactions through public block
//! explorers, and track their confirmation count.

pub mod explorer;

use bitcoin::{Address, Amount, Network, Txid};

/// Tolerated absolute difference between the expected and the received
/// amount: 1e-5 BTC, about half a dollar at common prices.
pub const AMOUNT_TOLERANCE: Amount = Amount::from_sat(1_000);

/// Confirmations required before a payment is considered settled.
///
/// Testnet is set higher on purpose, test blocks are cheap to mine.
pub fn required_confirmations(network: Network) -> i32 {
    match network {
        Network::Bitcoin => 3,
        _ => 6,
    }
}

/// The normalized payment state of a watched address.
///
/// `ApiFailed` and `NoPayment` are distinct on purpose: the former means we
/// couldn't get an answer and must retry, the latter is an authoritative
/// "nothing there yet".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeResult {
    /// All explorers were unreachable or returned garbage.
    ApiFailed,
    /// An explorer responded: no transaction credits this address.
    NoPayment,
    /// A transaction paying the address sits in the mempool.
    Pending { txid: Txid, amount: Amount },
    /// A transaction paying the address was included in a block.
    Confirmed {
        txid: Txid,
        amount: Amount,
        confirmations: i32,
    },
}

/// Our view of the block chain, queried one address at a time.
pub trait ExplorerInterface: Send {
    /// Get the payment state of this address.
    ///
    /// The returned amount is the sum of the transaction's outputs crediting
    /// the queried address, not the transaction's total value.
    fn probe_address(&self, address: &Address) -> ProbeResult;
}
