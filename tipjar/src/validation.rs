//! Input validation for donation requests.
//!
//! Everything here is enforced before any money-related bookkeeping
//! happens: donation bounds, donor metadata limits, and the structural
//! shape of receive addresses.

use std::{error, fmt};

use bitcoin::Network;

use serde::{Deserialize, Serialize};

/// Smallest accepted donation, in US dollars.
pub const MIN_DONATION_USD: f64 = 1.0;
/// Largest accepted donation, in US dollars.
pub const MAX_DONATION_USD: f64 = 100_000.0;

/// Longest accepted donor display name.
pub const MAX_PLAYER_NAME_LEN: usize = 50;
/// Longest accepted donation message.
pub const MAX_MESSAGE_LEN: usize = 500;

/// Length bounds of a bech32 address, separator and checksum included.
const ADDRESS_MIN_LEN: usize = 42;
const ADDRESS_MAX_LEN: usize = 90;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Donation amount outside `[MIN_DONATION_USD, MAX_DONATION_USD]`, or
    /// not a finite number.
    AmountOutOfRange,
    /// Present but blank donor name.
    BlankPlayerName,
    PlayerNameTooLong(usize),
    /// Present but blank donation message.
    BlankMessage,
    MessageTooLong(usize),
    /// Not a plausible bech32 address for the configured network.
    MalformedAddress(&'static str),
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::AmountOutOfRange => write!(
                f,
                "Donation amount must be between {} and {} USD.",
                MIN_DONATION_USD, MAX_DONATION_USD
            ),
            Self::BlankPlayerName => write!(f, "Player name must not be blank."),
            Self::PlayerNameTooLong(len) => write!(
                f,
                "Player name is {} characters long, the maximum is {}.",
                len, MAX_PLAYER_NAME_LEN
            ),
            Self::BlankMessage => write!(f, "Message must not be blank."),
            Self::MessageTooLong(len) => write!(
                f,
                "Message is {} characters long, the maximum is {}.",
                len, MAX_MESSAGE_LEN
            ),
            Self::MalformedAddress(reason) => write!(f, "Malformed address: {}.", reason),
        }
    }
}

impl error::Error for ValidationError {}

/// Check a donation amount against the platform bounds.
pub fn check_donation_amount(amount_usd: f64) -> Result<(), ValidationError> {
    if !amount_usd.is_finite()
        || amount_usd < MIN_DONATION_USD
        || amount_usd > MAX_DONATION_USD
    {
        return Err(ValidationError::AmountOutOfRange);
    }
    Ok(())
}

/// Optional donor-provided display information attached to a donation
/// attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DonorInfo {
    pub player_name: Option<String>,
    #[serde(default)]
    pub use_player_name: bool,
    pub message: Option<String>,
}

impl DonorInfo {
    pub fn check(&self) -> Result<(), ValidationError> {
        if let Some(name) = &self.player_name {
            if name.trim().is_empty() {
                return Err(ValidationError::BlankPlayerName);
            }
            if name.chars().count() > MAX_PLAYER_NAME_LEN {
                return Err(ValidationError::PlayerNameTooLong(name.chars().count()));
            }
        }
        if let Some(message) = &self.message {
            if message.trim().is_empty() {
                return Err(ValidationError::BlankMessage);
            }
            if message.chars().count() > MAX_MESSAGE_LEN {
                return Err(ValidationError::MessageTooLong(message.chars().count()));
            }
        }
        Ok(())
    }

    /// The name to publish on the donation ledger.
    pub fn display_name(&self) -> &str {
        match &self.player_name {
            Some(name) if self.use_player_name => name,
            _ => "Anonymous",
        }
    }
}

/// Structural bech32 shape check: prefix for the configured network, sane
/// length, and the restricted bech32 charset. The checksum is not verified,
/// the explorers reject addresses that don't exist anyway.
pub fn check_address_shape(address: &str, network: Network) -> Result<(), ValidationError> {
    let prefix = match network {
        Network::Bitcoin => "bc1",
        _ => "tb1",
    };
    if !address.starts_with(prefix) {
        return Err(ValidationError::MalformedAddress(
            "wrong prefix for the configured network",
        ));
    }
    if address.len() < ADDRESS_MIN_LEN || address.len() > ADDRESS_MAX_LEN {
        return Err(ValidationError::MalformedAddress("invalid length"));
    }
    for c in address[prefix.len()..].chars() {
        let in_charset = matches!(c, 'a'..='z' | '0'..='9');
        // '1', 'b', 'i' and 'o' are not part of the bech32 charset.
        if !in_charset || matches!(c, '1' | 'b' | 'i' | 'o') {
            return Err(ValidationError::MalformedAddress(
                "invalid bech32 character",
            ));
        }
    }
    Ok(())
}
