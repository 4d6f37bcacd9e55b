//! Public block explorer clients.
//!
//! We speak the esplora REST dialect: mempool.space as the primary explorer
//! (its testnet4 deployment on testnet), blockstream.info as the mainnet
//! fallback. The first explorer giving us an answer wins.

use crate::bitcoin::{ExplorerInterface, ProbeResult};

use std::{cmp, fmt, str::FromStr, time::Duration};

use bitcoin::{Address, Amount, Network, Txid};

use serde::Deserialize;

/// Hard timeout for a single explorer request.
const EXPLORER_TIMEOUT: Duration = Duration::from_secs(8);

const MEMPOOL_SPACE_MAINNET_URL: &str = "https://mempool.space/api";
const MEMPOOL_SPACE_TESTNET_URL: &str = "https://mempool.space/testnet4/api";
const BLOCKSTREAM_MAINNET_URL: &str = "https://blockstream.info/api";

#[derive(Debug)]
pub enum ExplorerError {
    /// Could not reach the explorer, or it answered with an error status.
    Http(String),
    /// The explorer answered something we couldn't make sense of.
    BadResponse(String),
}

impl fmt::Display for ExplorerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Http(e) => write!(f, "Explorer request failed: {}", e),
            Self::BadResponse(e) => write!(f, "Invalid explorer response: {}", e),
        }
    }
}

impl std::error::Error for ExplorerError {}

/// A transaction as returned by the esplora address endpoint. We only keep
/// the fields we dispatch on.
#[derive(Debug, Clone, Deserialize)]
struct EsploraTx {
    txid: String,
    status: EsploraTxStatus,
    vout: Vec<EsploraTxOut>,
}

#[derive(Debug, Clone, Deserialize)]
struct EsploraTxStatus {
    confirmed: bool,
    block_height: Option<i32>,
}

#[derive(Debug, Clone, Deserialize)]
struct EsploraTxOut {
    scriptpubkey_address: Option<String>,
    value: u64,
}

// The most recent transaction crediting `address`, with the sum of output
// values paying it and its block height if confirmed. The esplora endpoint
// returns transactions newest first, mempool entries leading.
fn detect_payment(
    txs: &[EsploraTx],
    address: &str,
) -> Result<Option<(Txid, Amount, Option<i32>)>, ExplorerError> {
    let mut crediting = txs.iter().filter_map(|tx| {
        let amount: u64 = tx
            .vout
            .iter()
            .filter(|txo| txo.scriptpubkey_address.as_deref() == Some(address))
            .map(|txo| txo.value)
            .sum();
        if amount > 0 {
            Some((tx, Amount::from_sat(amount)))
        } else {
            None
        }
    });

    let (tx, amount) = match crediting.next() {
        Some(found) => found,
        None => return Ok(None),
    };
    // We hand out single-use addresses, more than one inbound transaction is
    // anomalous.
    for (other, _) in crediting {
        log::warn!(
            "Address '{}' is credited by multiple transactions. Ignoring '{}'.",
            address,
            other.txid
        );
    }

    let txid = Txid::from_str(&tx.txid)
        .map_err(|e| ExplorerError::BadResponse(format!("txid '{}': {}", tx.txid, e)))?;
    let block_height = if tx.status.confirmed {
        tx.status.block_height
    } else {
        None
    };
    Ok(Some((txid, amount, block_height)))
}

/// A single esplora-compatible explorer endpoint.
pub struct EsploraClient {
    base_url: &'static str,
    client: reqwest::blocking::Client,
}

impl EsploraClient {
    pub fn new(base_url: &'static str) -> Result<Self, ExplorerError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(EXPLORER_TIMEOUT)
            .build()
            .map_err(|e| ExplorerError::Http(e.to_string()))?;
        Ok(Self { base_url, client })
    }

    pub fn base_url(&self) -> &str {
        self.base_url
    }

    // Transactions involving this address, confirmed and mempool ones. A 404
    // is an authoritative "this explorer doesn't know the address".
    fn address_txs(&self, address: &Address) -> Result<Vec<EsploraTx>, ExplorerError> {
        let url = format!("{}/address/{}/txs", self.base_url, address);
        let resp = self
            .client
            .get(&url)
            .send()
            .map_err(|e| ExplorerError::Http(e.to_string()))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !resp.status().is_success() {
            return Err(ExplorerError::Http(format!(
                "GET {}: status {}",
                url,
                resp.status()
            )));
        }
        resp.json()
            .map_err(|e| ExplorerError::BadResponse(e.to_string()))
    }

    fn tip_height(&self) -> Result<i32, ExplorerError> {
        let url = format!("{}/blocks/tip/height", self.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .map_err(|e| ExplorerError::Http(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(ExplorerError::Http(format!(
                "GET {}: status {}",
                url,
                resp.status()
            )));
        }
        let body = resp
            .text()
            .map_err(|e| ExplorerError::BadResponse(e.to_string()))?;
        body.trim()
            .parse()
            .map_err(|_| ExplorerError::BadResponse(format!("tip height '{}'", body)))
    }

    /// Get the payment state of this address according to this explorer.
    pub fn probe(&self, address: &Address) -> Result<ProbeResult, ExplorerError> {
        let txs = self.address_txs(address)?;
        let (txid, amount, block_height) = match detect_payment(&txs, &address.to_string())? {
            Some(payment) => payment,
            None => return Ok(ProbeResult::NoPayment),
        };

        let height = match block_height {
            Some(height) => height,
            None => return Ok(ProbeResult::Pending { txid, amount }),
        };
        match self.tip_height() {
            Ok(tip) => Ok(ProbeResult::Confirmed {
                txid,
                amount,
                // The transaction can't be above the tip, but don't trust
                // the explorer not to race its own endpoints.
                confirmations: cmp::max(1, tip - height + 1),
            }),
            Err(e) => {
                // We know the funds are there, we just can't count the
                // confirmations. Report the payment as still pending.
                log::warn!(
                    "Explorer '{}': could not get tip height: {}",
                    self.base_url,
                    e
                );
                Ok(ProbeResult::Pending { txid, amount })
            }
        }
    }
}

/// The set of explorers we query, in order, until one answers.
pub struct ExplorerPool {
    clients: Vec<EsploraClient>,
}

impl ExplorerPool {
    pub fn new(network: Network) -> Result<Self, ExplorerError> {
        let clients = match network {
            Network::Bitcoin => vec![
                EsploraClient::new(MEMPOOL_SPACE_MAINNET_URL)?,
                EsploraClient::new(BLOCKSTREAM_MAINNET_URL)?,
            ],
            _ => vec![EsploraClient::new(MEMPOOL_SPACE_TESTNET_URL)?],
        };
        Ok(Self { clients })
    }
}

impl ExplorerInterface for ExplorerPool {
    fn probe_address(&self, address: &Address) -> ProbeResult {
        for client in &self.clients {
            match client.probe(address) {
                Ok(res) => return res,
                Err(e) => {
                    log::warn!(
                        "Explorer '{}' failed to probe '{}': {}. Trying the next one.",
                        client.base_url(),
                        address,
                        e
                    );
                }
            }
        }
        ProbeResult::ApiFailed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADDR: &str = "bc1qcr8te4kr609gcawutmrza0j4xv80jy8z306fyu";
    const OTHER_ADDR: &str = "bc1qnjg0jd8228aq7egyzacy8cys3knf9xvrerkf9g";
    const TXID_1: &str = "f7216a7d1c7a0a1c4b6b7b6e0f8e9d8c7b6a5b4c3d2e1f0a9b8c7d6e5f4a3b2c";
    const TXID_2: &str = "aa16a7d1c7a0a1c4b6b7b6e0f8e9d8c7b6a5b4c3d2e1f0a9b8c7d6e5f4a3b2cc";

    fn tx(txid: &str, confirmed: bool, height: Option<i32>, outputs: &[(&str, u64)]) -> EsploraTx {
        serde_json::from_value(serde_json::json!({
            "txid": txid,
            "status": {
                "confirmed": confirmed,
                "block_height": height,
            },
            "vout": outputs
                .iter()
                .map(|(addr, value)| {
                    serde_json::json!({ "scriptpubkey_address": addr, "value": value })
                })
                .collect::<Vec<_>>(),
        }))
        .unwrap()
    }

    #[test]
    fn detect_no_payment() {
        assert_eq!(detect_payment(&[], ADDR).unwrap(), None);

        // A transaction paying someone else doesn't count.
        let txs = [tx(TXID_1, true, Some(100), &[(OTHER_ADDR, 10_000)])];
        assert_eq!(detect_payment(&txs, ADDR).unwrap(), None);
    }

    #[test]
    fn detect_mempool_payment() {
        let txs = [tx(TXID_1, false, None, &[(ADDR, 10_000), (OTHER_ADDR, 5_000)])];
        let (txid, amount, height) = detect_payment(&txs, ADDR).unwrap().unwrap();
        assert_eq!(txid, Txid::from_str(TXID_1).unwrap());
        // Only the outputs crediting our address are summed.
        assert_eq!(amount, Amount::from_sat(10_000));
        assert_eq!(height, None);
    }

    #[test]
    fn detect_confirmed_payment_sums_outputs() {
        let txs = [tx(TXID_1, true, Some(100), &[(ADDR, 10_000), (ADDR, 2_000)])];
        let (_, amount, height) = detect_payment(&txs, ADDR).unwrap().unwrap();
        assert_eq!(amount, Amount::from_sat(12_000));
        assert_eq!(height, Some(100));
    }

    #[test]
    fn detect_multiple_payments_takes_most_recent() {
        // Esplora returns transactions newest first: the mempool one wins.
        let txs = [
            tx(TXID_2, false, None, &[(ADDR, 3_000)]),
            tx(TXID_1, true, Some(100), &[(ADDR, 10_000)]),
        ];
        let (txid, amount, height) = detect_payment(&txs, ADDR).unwrap().unwrap();
        assert_eq!(txid, Txid::from_str(TXID_2).unwrap());
        assert_eq!(amount, Amount::from_sat(3_000));
        assert_eq!(height, None);
    }

    #[test]
    fn detect_rejects_garbage_txid() {
        let txs = [tx("not a txid", false, None, &[(ADDR, 3_000)])];
        assert!(detect_payment(&txs, ADDR).is_err());
    }

    #[test]
    fn pool_is_network_aware() {
        let mainnet = ExplorerPool::new(Network::Bitcoin).unwrap();
        assert_eq!(mainnet.clients.len(), 2);
        assert!(mainnet.clients[1].base_url().contains("blockstream"));

        // No blockstream fallback on testnet, and the testnet4 path is used.
        let testnet = ExplorerPool::new(Network::Testnet).unwrap();
        assert_eq!(testnet.clients.len(), 1);
        assert!(testnet.clients[0].base_url().contains("testnet4"));
    }
}
