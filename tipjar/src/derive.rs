//! BIP84 receive address derivation.
//!
//! The platform consumes an already-provisioned extended private key in its
//! SLIP-0132 encoding (`zprv` on mainnet, `vprv` on testnet) and hands out
//! one P2WPKH address per donation attempt, derived under
//! `m/84'/0'/0'/0/<index>`.

use std::{error, fmt, str::FromStr};

use bitcoin::{
    base58,
    bip32::{ChainCode, ChildNumber, Fingerprint, Xpriv},
    key::CompressedPublicKey,
    secp256k1, Address, Network, NetworkKind, PrivateKey,
};

/// Version bytes of a mainnet BIP84 extended private key ("zprv").
const ZPRV_VERSION: [u8; 4] = [0x04, 0xb2, 0x43, 0x0c];
/// Version bytes of a testnet BIP84 extended private key ("vprv").
const VPRV_VERSION: [u8; 4] = [0x04, 0x5f, 0x18, 0xbc];

/// Length of a serialized extended key, after the base58check checksum was
/// stripped.
const XKEY_PAYLOAD_LEN: usize = 78;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeriveError {
    /// Not a well-formed zprv/vprv, or its network doesn't match the
    /// requested one.
    InvalidKeyFormat,
    /// The key sits at a depth we cannot map to the BIP84 account level.
    InvalidKeyDepth(u8),
    /// Child derivation yielded an invalid scalar. Cryptographically
    /// negligible; the caller should retry with the next index.
    DerivationFailure,
}

impl fmt::Display for DeriveError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::InvalidKeyFormat => write!(
                f,
                "Invalid extended private key. Expected a base58check-encoded zprv or vprv \
                 matching the configured network."
            ),
            Self::InvalidKeyDepth(depth) => write!(
                f,
                "Extended private key depth {} is not usable. Provide a master, coin-level or \
                 account-level BIP84 key.",
                depth
            ),
            Self::DerivationFailure => write!(f, "Child key derivation failed."),
        }
    }
}

impl error::Error for DeriveError {}

fn normal(index: u32) -> Result<ChildNumber, DeriveError> {
    ChildNumber::from_normal_idx(index).map_err(|_| DeriveError::DerivationFailure)
}

/// A BIP84 extended private key, parsed from its base58check encoding.
///
/// The `Debug` implementation redacts the key material, as this value is
/// carried by configuration structs which end up in logs.
#[derive(Clone, PartialEq)]
pub struct MasterKey {
    xpriv: Xpriv,
    network: Network,
}

impl MasterKey {
    /// Parse a base58check-encoded zprv (mainnet) or vprv (testnet).
    ///
    /// The serialization is the standard BIP32 layout: 4 bytes version,
    /// 1 byte depth, 4 bytes parent fingerprint, 4 bytes child number,
    /// 32 bytes chain code, then a zero marker and the 32-byte secret.
    pub fn from_base58(s: &str) -> Result<MasterKey, DeriveError> {
        let data = base58::decode_check(s).map_err(|_| DeriveError::InvalidKeyFormat)?;
        if data.len() != XKEY_PAYLOAD_LEN {
            return Err(DeriveError::InvalidKeyFormat);
        }

        let network = if data[0..4] == ZPRV_VERSION {
            Network::Bitcoin
        } else if data[0..4] == VPRV_VERSION {
            Network::Testnet
        } else {
            return Err(DeriveError::InvalidKeyFormat);
        };

        let depth = data[4];
        if depth > 3 {
            return Err(DeriveError::InvalidKeyDepth(depth));
        }

        // The key data must be a private key, whose marker is a zero byte.
        if data[45] != 0 {
            return Err(DeriveError::InvalidKeyFormat);
        }
        let private_key = secp256k1::SecretKey::from_slice(&data[46..78])
            .map_err(|_| DeriveError::InvalidKeyFormat)?;

        let mut parent_fingerprint = [0; 4];
        parent_fingerprint.copy_from_slice(&data[5..9]);
        let child_number = u32::from_be_bytes([data[9], data[10], data[11], data[12]]);
        let mut chain_code = [0; 32];
        chain_code.copy_from_slice(&data[13..45]);

        let xpriv = Xpriv {
            network: NetworkKind::from(network),
            depth,
            parent_fingerprint: Fingerprint::from(parent_fingerprint),
            child_number: ChildNumber::from(child_number),
            private_key,
            chain_code: ChainCode::from(chain_code),
        };

        Ok(MasterKey { xpriv, network })
    }

    /// The network this key was encoded for.
    pub fn network(&self) -> Network {
        self.network
    }

    // Derive down to the BIP84 account level, `m/84'/0'/0'`, from wherever
    // this key sits. A depth-1 key is treated as already being at the
    // account level: Electrum exports account keys with a truncated path.
    fn account_key<C: secp256k1::Signing>(
        &self,
        secp: &secp256k1::Secp256k1<C>,
    ) -> Result<Xpriv, DeriveError> {
        let to_account: Vec<ChildNumber> = match self.xpriv.depth {
            0 => vec![
                ChildNumber::Hardened { index: 84 },
                ChildNumber::Hardened { index: 0 },
                ChildNumber::Hardened { index: 0 },
            ],
            1 => vec![],
            2 => vec![ChildNumber::Hardened { index: 0 }],
            3 => vec![],
            depth => return Err(DeriveError::InvalidKeyDepth(depth)),
        };
        self.xpriv
            .derive_priv(secp, &to_account)
            .map_err(|_| DeriveError::DerivationFailure)
    }

    /// Derive the P2WPKH receive address for this index, at
    /// `m/84'/0'/0'/0/<index>`.
    ///
    /// Deterministic: the same key, index and network always produce the
    /// same address. Fails with `InvalidKeyFormat` if `network` doesn't
    /// match the key's encoded network.
    pub fn receive_address<C: secp256k1::Signing>(
        &self,
        index: u32,
        network: Network,
        secp: &secp256k1::Secp256k1<C>,
    ) -> Result<Address, DeriveError> {
        if network != self.network {
            return Err(DeriveError::InvalidKeyFormat);
        }

        let account = self.account_key(secp)?;
        // External (receiving) chain, then the per-donation index.
        let child = account
            .derive_priv(secp, &[normal(0)?, normal(index)?])
            .map_err(|_| DeriveError::DerivationFailure)?;

        let privkey = PrivateKey::new(child.private_key, network);
        let pubkey = CompressedPublicKey::from_private_key(secp, &privkey)
            .expect("a freshly derived key is always compressed");
        Ok(Address::p2wpkh(&pubkey, network))
    }
}

impl FromStr for MasterKey {
    type Err = DeriveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MasterKey::from_base58(s)
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "REDACTED MASTER KEY")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Test vectors from the BIP84 specification, for the mnemonic
    // "abandon abandon abandon abandon abandon abandon abandon abandon
    // abandon abandon abandon about".
    const MASTER_ZPRV: &str = "zprvAWgYBBk7JR8Gjrh4UJQ2uJdG1r3WNRRfURiABBE3RvMXYSrRJL62XuezvGdPvG6GFBZduosCc1YP5wixPox7zhZLfiUm8aunE96BBa4Kei5";
    const ACCOUNT_ZPRV: &str = "zprvAdG4iTXWBoARxkkzNpNh8r6Qag3irQB8PzEMkAFeTRXxHpbF9z4QgEvBRmfvqWvGp42t42nvgGpNgYSJA9iefm1yYNZKEm7z6qUWCroSQnE";
    const FIRST_ADDR: &str = "bc1qcr8te4kr609gcawutmrza0j4xv80jy8z306fyu";
    const SECOND_ADDR: &str = "bc1qnjg0jd8228aq7egyzacy8cys3knf9xvrerkf9g";

    // Re-encode an extended key payload with different version and/or depth
    // bytes, to craft keys the reference vectors don't cover.
    fn reencode(key: &str, version: &[u8; 4], depth: Option<u8>) -> String {
        let mut data = base58::decode_check(key).unwrap();
        data[0..4].copy_from_slice(version);
        if let Some(depth) = depth {
            data[4] = depth;
        }
        base58::encode_check(&data)
    }

    #[test]
    fn derive_from_master_key() {
        let secp = secp256k1::Secp256k1::new();
        let key = MasterKey::from_base58(MASTER_ZPRV).unwrap();
        assert_eq!(key.network(), Network::Bitcoin);

        let addr = key.receive_address(0, Network::Bitcoin, &secp).unwrap();
        assert_eq!(addr.to_string(), FIRST_ADDR);
        let addr = key.receive_address(1, Network::Bitcoin, &secp).unwrap();
        assert_eq!(addr.to_string(), SECOND_ADDR);
    }

    #[test]
    fn derive_from_account_key() {
        // An account-level key (depth 3) must produce the same addresses as
        // the master key it was derived from.
        let secp = secp256k1::Secp256k1::new();
        let key = MasterKey::from_base58(ACCOUNT_ZPRV).unwrap();
        let addr = key.receive_address(0, Network::Bitcoin, &secp).unwrap();
        assert_eq!(addr.to_string(), FIRST_ADDR);
        let addr = key.receive_address(1, Network::Bitcoin, &secp).unwrap();
        assert_eq!(addr.to_string(), SECOND_ADDR);
    }

    #[test]
    fn derivation_is_deterministic() {
        let secp = secp256k1::Secp256k1::new();
        let key = MasterKey::from_base58(MASTER_ZPRV).unwrap();
        for index in [0, 1, 7, 1_000] {
            let a = key.receive_address(index, Network::Bitcoin, &secp).unwrap();
            let b = key.receive_address(index, Network::Bitcoin, &secp).unwrap();
            assert_eq!(a, b);
        }
    }

    #[test]
    fn testnet_key() {
        let secp = secp256k1::Secp256k1::new();
        let vprv = reencode(ACCOUNT_ZPRV, &VPRV_VERSION, None);
        let key = MasterKey::from_base58(&vprv).unwrap();
        assert_eq!(key.network(), Network::Testnet);

        let addr = key.receive_address(0, Network::Testnet, &secp).unwrap();
        assert!(addr.to_string().starts_with("tb1"));

        // A testnet key must not be used to derive mainnet addresses.
        assert_eq!(
            key.receive_address(0, Network::Bitcoin, &secp),
            Err(DeriveError::InvalidKeyFormat)
        );
    }

    #[test]
    fn invalid_keys() {
        // Garbage, valid base58 of the wrong length, wrong version bytes.
        assert_eq!(
            MasterKey::from_base58("not a key"),
            Err(DeriveError::InvalidKeyFormat)
        );
        assert_eq!(
            MasterKey::from_base58(&base58::encode_check(&[0; 12])),
            Err(DeriveError::InvalidKeyFormat)
        );
        let xprv_version = reencode(ACCOUNT_ZPRV, &[0x04, 0x88, 0xad, 0xe4], None);
        assert_eq!(
            MasterKey::from_base58(&xprv_version),
            Err(DeriveError::InvalidKeyFormat)
        );

        // A key deeper than the account level is rejected.
        let too_deep = reencode(ACCOUNT_ZPRV, &ZPRV_VERSION, Some(4));
        assert_eq!(
            MasterKey::from_base58(&too_deep),
            Err(DeriveError::InvalidKeyDepth(4))
        );
    }

    #[test]
    fn debug_is_redacted() {
        let key = MasterKey::from_base58(MASTER_ZPRV).unwrap();
        assert!(!format!("{:?}", key).contains("zprv"));
    }
}
