//! # Tipjar commands
//!
//! External interface to the payments daemon. These are the entry points the
//! web application's HTTP handlers call into.

mod utils;

use crate::{
    bitcoin::{required_confirmations, ExplorerInterface, ProbeResult, AMOUNT_TOLERANCE},
    database::{
        DatabaseConnection, DatabaseInterface, NewDonation, PaymentMethod, PaymentStatus,
        PendingPayment, PAYMENT_WINDOW_SECS,
    },
    oracle::PriceOracle,
    PaymentsControl, VERSION,
};

use utils::{deser_addr_assume_checked, deser_amount_from_btc, ser_amount};

use std::{convert::TryInto, fmt, time};

use tipjar::{
    payment_uri::payment_uri,
    validation::{self, ValidationError},
    DeriveError, DonorInfo,
};

use bitcoin::{Amount, Network, Txid};

use serde::{Deserialize, Serialize};

// Rate limits, per client session unless noted otherwise.
pub(crate) const GENERATE_ADDRESS_CAPACITY: u32 = 1;
pub(crate) const GENERATE_ADDRESS_REFILL: time::Duration = time::Duration::from_secs(300);
pub(crate) const CHECK_PAYMENT_LIMIT: u32 = 1;
pub(crate) const CHECK_PAYMENT_WINDOW: time::Duration = time::Duration::from_secs(10);
// The price quote is global, not per session.
pub(crate) const PRICE_LIMIT: u32 = 1;
pub(crate) const PRICE_WINDOW: time::Duration = time::Duration::from_secs(30);
const PRICE_GLOBAL_KEY: &str = "global";

// How many consecutive derivation indices we are willing to burn on the
// astronomically unlikely invalid-scalar case.
const MAX_DERIVATION_ATTEMPTS: u32 = 16;

fn curr_timestamp() -> u32 {
    time::SystemTime::now()
        .duration_since(time::UNIX_EPOCH)
        .expect("current system time must be later than epoch")
        .as_secs()
        .try_into()
        .expect("system clock year is earlier than 2106")
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommandError {
    Validation(ValidationError),
    /// The per-session (or global) rate limit was hit. Transient, try again
    /// later.
    RateLimited,
    /// The session does not own a payment at this address.
    NotOwned,
    /// The payment window for this address has closed.
    Expired,
    /// The confirmed amount is below the expected one beyond tolerance.
    /// Terminal: the payment was expired and no donation was created.
    Underpayment {
        expected: Amount,
        received: Amount,
    },
    /// No price source responded.
    OracleUnavailable,
    Derivation(DeriveError),
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Validation(e) => write!(f, "{}", e),
            Self::RateLimited => write!(f, "Too many requests. Please wait a moment and retry."),
            Self::NotOwned => write!(f, "This session does not own a payment at this address."),
            Self::Expired => write!(
                f,
                "This payment window has closed. Please start a new donation."
            ),
            Self::Underpayment { expected, received } => write!(
                f,
                "The confirmed amount {} is below the expected {}. The payment was not accepted.",
                received, expected
            ),
            Self::OracleUnavailable => write!(
                f,
                "Unable to create Bitcoin payment address. Please try again or choose another \
                 method."
            ),
            Self::Derivation(e) => write!(f, "Deriving receive address: {}", e),
        }
    }
}

impl std::error::Error for CommandError {}

impl From<ValidationError> for CommandError {
    fn from(e: ValidationError) -> Self {
        CommandError::Validation(e)
    }
}

impl From<DeriveError> for CommandError {
    fn from(e: DeriveError) -> Self {
        CommandError::Derivation(e)
    }
}

// The `bitcoin:` URI for this payment. The donor's name is only included if
// they asked for it to be published.
fn donation_uri(payment_address: &bitcoin::Address, amount: Amount, donor: &DonorInfo) -> String {
    payment_uri(
        payment_address,
        amount,
        donor
            .player_name
            .as_deref()
            .filter(|_| donor.use_player_name),
        donor.message.as_deref(),
    )
}

// `amount_usd` worth of BTC at `price` USD per BTC.
fn btc_amount(amount_usd: f64, price: f64) -> Result<Amount, CommandError> {
    Amount::from_btc(amount_usd / price).map_err(|_| {
        log::error!(
            "Cannot express {} USD in BTC at price {}.",
            amount_usd,
            price
        );
        CommandError::OracleUnavailable
    })
}

impl PaymentsControl {
    fn network(&self) -> Network {
        self.config.bitcoin_config.network
    }

    // Check that this session owns the pending payment at this address, and
    // that its window is still open if nothing was detected yet.
    fn owned_payment(
        &self,
        db_conn: &mut Box<dyn DatabaseConnection>,
        address: &str,
        session_id: &str,
        now: u32,
    ) -> Result<PendingPayment, CommandError> {
        let payment = db_conn.pending_payment(address).ok_or(CommandError::NotOwned)?;
        if payment.session_id != session_id {
            return Err(CommandError::NotOwned);
        }
        if payment.status == PaymentStatus::Expired
            || (payment.status == PaymentStatus::Initialized && payment.is_expired_at(now))
        {
            return Err(CommandError::Expired);
        }
        Ok(payment)
    }

    /// Get information about the current state of the daemon.
    pub fn get_info(&self) -> GetInfoResult {
        let mut db_conn = self.db.connection();
        let live = db_conn.live_pending_payments();
        let initialized_payments = live
            .iter()
            .filter(|p| p.status == PaymentStatus::Initialized)
            .count();
        GetInfoResult {
            version: VERSION.to_string(),
            network: self.network(),
            required_confirmations: required_confirmations(self.network()),
            initialized_payments,
            pending_payments: live.len() - initialized_payments,
        }
    }

    /// Generate a unique Bitcoin receive address for a donation attempt,
    /// priced at the current BTC/USD quote.
    ///
    /// Calling it again with the same session and USD amount while the
    /// payment window is open returns the already-generated address, with a
    /// freshly quoted BTC amount so the QR code stays accurate if the price
    /// moved.
    pub fn generate_address(
        &self,
        amount_usd: f64,
        session_id: &str,
        donor: DonorInfo,
    ) -> Result<GenerateAddressResult, CommandError> {
        validation::check_donation_amount(amount_usd)?;
        donor.check()?;

        let mut db_conn = self.db.connection();
        let now = curr_timestamp();

        // A client retry is served the address it already has. This happens
        // before the rate limit is charged, nothing is generated on this
        // path.
        if let Some(existing) = db_conn.pending_payment_for_session(session_id, amount_usd, now) {
            let (amount, rate) = match self.oracle.lock().unwrap().usd_per_btc() {
                Ok(price) => (btc_amount(amount_usd, price)?, price),
                Err(e) => {
                    log::warn!(
                        "Could not re-quote existing payment at '{}': {}. Using the stored quote.",
                        existing.address,
                        e
                    );
                    (existing.amount, existing.exchange_rate)
                }
            };
            return Ok(GenerateAddressResult {
                payment_uri: donation_uri(&existing.address, amount, &existing.donor),
                address: existing.address,
                amount_btc: amount,
                amount_usd,
                exchange_rate: rate,
                derivation_index: existing.derivation_index,
            });
        }

        if !self.address_limiter.try_acquire(session_id) {
            return Err(CommandError::RateLimited);
        }

        let price = self
            .oracle
            .lock()
            .unwrap()
            .usd_per_btc()
            .map_err(|_| CommandError::OracleUnavailable)?;
        let amount = btc_amount(amount_usd, price)?;

        // The atomic counter bump is the serialization point guaranteeing
        // every address gets a unique index.
        let mut derived = None;
        for _ in 0..MAX_DERIVATION_ATTEMPTS {
            let index = db_conn.next_derivation_index();
            match self.config.bitcoin_config.master_key.receive_address(
                index,
                self.network(),
                &self.secp,
            ) {
                Ok(address) => {
                    derived = Some((index, address));
                    break;
                }
                Err(DeriveError::DerivationFailure) => {
                    log::warn!(
                        "Derivation yielded an invalid scalar at index {}. Retrying with the \
                         next one.",
                        index
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }
        let (index, address) =
            derived.ok_or(CommandError::Derivation(DeriveError::DerivationFailure))?;

        let payment = PendingPayment {
            session_id: session_id.to_string(),
            address: address.clone(),
            amount,
            amount_usd,
            exchange_rate: price,
            derivation_index: index,
            donor: donor.clone(),
            status: PaymentStatus::Initialized,
            txid: None,
            detected_at: None,
            created_at: now,
            expires_at: now + PAYMENT_WINDOW_SECS,
        };
        db_conn.new_pending_payment(&payment);
        // The poller picks the new row up on its next tick.
        log::info!(
            "Generated address '{}' (index {}) for a {} USD donation by session '{}'.",
            address,
            index,
            amount_usd,
            session_id
        );

        Ok(GenerateAddressResult {
            payment_uri: donation_uri(&address, amount, &donor),
            address,
            amount_btc: amount,
            amount_usd,
            exchange_rate: price,
            derivation_index: index,
        })
    }

    /// Check whether the payment at this address went through. Safe to call
    /// concurrently with the background monitor, both converge on the same
    /// outcome.
    pub fn check_payment(
        &self,
        address: &str,
        session_id: &str,
    ) -> Result<CheckPaymentResult, CommandError> {
        validation::check_address_shape(address, self.network())?;

        let mut db_conn = self.db.connection();
        let now = curr_timestamp();
        let payment = self.owned_payment(&mut db_conn, address, session_id, now)?;

        if !self.check_limiter.try_acquire(session_id) {
            return Err(CommandError::RateLimited);
        }

        let required = required_confirmations(self.network());
        match self.explorer.lock().unwrap().probe_address(&payment.address) {
            // Transient or nothing there yet: the client will poll again.
            ProbeResult::ApiFailed | ProbeResult::NoPayment => {
                Ok(CheckPaymentResult::not_seen())
            }
            ProbeResult::Pending { txid, amount } => {
                if payment.txid != Some(txid) {
                    db_conn.attach_txid(address, &txid, now);
                }
                Ok(CheckPaymentResult::detected(txid, amount, 0, required))
            }
            ProbeResult::Confirmed {
                txid,
                amount,
                confirmations,
            } if confirmations < required => {
                if payment.txid != Some(txid) {
                    db_conn.attach_txid(address, &txid, now);
                }
                Ok(CheckPaymentResult::detected(
                    txid,
                    amount,
                    confirmations,
                    required,
                ))
            }
            ProbeResult::Confirmed {
                txid,
                amount,
                confirmations,
            } => {
                if amount + AMOUNT_TOLERANCE < payment.amount {
                    log::warn!(
                        "Underpayment on '{}': expected {}, received {}. Expiring the payment.",
                        address,
                        payment.amount,
                        amount
                    );
                    db_conn.set_payment_status(address, PaymentStatus::Expired);
                    return Err(CommandError::Underpayment {
                        expected: payment.amount,
                        received: amount,
                    });
                }
                if amount > payment.amount + AMOUNT_TOLERANCE {
                    log::info!(
                        "Overpayment on '{}': expected {}, received {}. Accepting it.",
                        address,
                        payment.amount,
                        amount
                    );
                }

                // This is the donor-facing receipt: value the received funds
                // at the current quote, falling back to the rate locked at
                // generation time if no price source answers.
                let price = match self.oracle.lock().unwrap().usd_per_btc() {
                    Ok(price) => price,
                    Err(e) => {
                        log::warn!(
                            "No fresh quote for the receipt of '{}': {}. Using the stored rate.",
                            address,
                            e
                        );
                        payment.exchange_rate
                    }
                };
                let amount_usd = amount.to_btc() * price;
                validation::check_donation_amount(amount_usd)?;

                if payment.txid != Some(txid) {
                    db_conn.attach_txid(address, &txid, now);
                }
                let created = db_conn.create_donation(&NewDonation {
                    amount_usd,
                    display_name: payment.donor.display_name().to_string(),
                    payment_id: address.to_string(),
                    method: PaymentMethod::Bitcoin,
                    message: payment.donor.message.clone(),
                    created_at: now,
                });
                if !created {
                    log::debug!(
                        "Donation for '{}' was already recorded by a concurrent detection.",
                        address
                    );
                }
                db_conn.set_payment_status(address, PaymentStatus::Confirmed);
                log::info!(
                    "Payment at '{}' confirmed by transaction '{}': {} USD donation recorded.",
                    address,
                    txid,
                    amount_usd
                );

                Ok(CheckPaymentResult::confirmed(
                    txid,
                    amount,
                    amount_usd,
                    confirmations,
                    required,
                ))
            }
        }
    }

    /// Give up on a payment the client no longer intends to complete. Only
    /// transitions addresses nothing was detected for; a no-op otherwise.
    pub fn mark_expired(&self, address: &str, session_id: &str) -> Result<(), CommandError> {
        validation::check_address_shape(address, self.network())?;

        let mut db_conn = self.db.connection();
        let payment = db_conn.pending_payment(address).ok_or(CommandError::NotOwned)?;
        if payment.session_id != session_id {
            return Err(CommandError::NotOwned);
        }

        if db_conn.expire_if_initialized(address) {
            log::info!("Payment at '{}' was abandoned by the client.", address);
        }
        Ok(())
    }

    /// Expire overdue payments and drop terminal rows whose retention
    /// elapsed. The poller runs this hourly, it can also be invoked
    /// on-demand.
    pub fn cleanup_expired(&self) -> CleanupResult {
        let counts = self.db.connection().cleanup_expired(curr_timestamp());
        log::info!(
            "Cleanup: expired {} initialized and {} pending payment(s), deleted {} confirmed \
             and {} stale expired row(s).",
            counts.expired_initialized,
            counts.expired_pending,
            counts.deleted_confirmed,
            counts.deleted_expired
        );
        CleanupResult {
            expired_initialized: counts.expired_initialized,
            expired_pending: counts.expired_pending,
            deleted_confirmed: counts.deleted_confirmed,
            deleted_expired: counts.deleted_expired,
        }
    }

    /// The current USD-per-BTC quote. Globally rate limited, this is meant
    /// to be exposed to browsers.
    pub fn get_price(&self) -> Result<GetPriceResult, CommandError> {
        if !self.price_limiter.try_acquire(PRICE_GLOBAL_KEY) {
            return Err(CommandError::RateLimited);
        }
        let usd_per_btc = self
            .oracle
            .lock()
            .unwrap()
            .usd_per_btc()
            .map_err(|_| CommandError::OracleUnavailable)?;
        Ok(GetPriceResult { usd_per_btc })
    }

    /// The donation ledger, most recent first, stripped down to the fields
    /// browsers may see.
    pub fn list_donations(&self) -> ListDonationsResult {
        let donations = self
            .db
            .connection()
            .list_donations()
            .into_iter()
            .map(|donation| DonationEntry {
                id: donation.id,
                display_name: donation.display_name,
                amount: donation.amount_usd,
            })
            .collect();
        ListDonationsResult { donations }
    }
}

/// Information about the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetInfoResult {
    pub version: String,
    pub network: Network,
    pub required_confirmations: i32,
    /// Addresses handed out with no transaction detected yet.
    pub initialized_payments: usize,
    /// Payments with a detected, not yet settled, transaction.
    pub pending_payments: usize,
}

/// Result of a [`PaymentsControl::generate_address`] call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateAddressResult {
    #[serde(deserialize_with = "deser_addr_assume_checked")]
    pub address: bitcoin::Address,
    #[serde(
        serialize_with = "ser_amount",
        deserialize_with = "deser_amount_from_btc"
    )]
    pub amount_btc: Amount,
    pub amount_usd: f64,
    /// USD per BTC used for the quote.
    pub exchange_rate: f64,
    pub derivation_index: u32,
    /// `bitcoin:` URI encoding the address and amount, for QR display.
    pub payment_uri: String,
}

/// Result of a [`PaymentsControl::check_payment`] call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CheckPaymentResult {
    /// Settled: the donation is on the ledger.
    Confirmed {
        paid: bool,
        tx_hash: Txid,
        #[serde(
            serialize_with = "ser_amount",
            deserialize_with = "deser_amount_from_btc"
        )]
        amount_btc: Amount,
        amount_usd: f64,
        confirmations: i32,
        required_confirmations: i32,
    },
    /// A transaction was seen, not yet buried deep enough.
    Detected {
        paid: bool,
        tx_hash: Txid,
        #[serde(
            serialize_with = "ser_amount",
            deserialize_with = "deser_amount_from_btc"
        )]
        amount_btc: Amount,
        confirmations: i32,
        required_confirmations: i32,
    },
    /// Nothing detected (or the explorers are unreachable, which the client
    /// can't tell apart: it polls again either way).
    NotSeen { paid: bool },
}

impl CheckPaymentResult {
    fn not_seen() -> Self {
        Self::NotSeen { paid: false }
    }

    fn detected(tx_hash: Txid, amount_btc: Amount, confirmations: i32, required: i32) -> Self {
        Self::Detected {
            paid: true,
            tx_hash,
            amount_btc,
            confirmations,
            required_confirmations: required,
        }
    }

    fn confirmed(
        tx_hash: Txid,
        amount_btc: Amount,
        amount_usd: f64,
        confirmations: i32,
        required: i32,
    ) -> Self {
        Self::Confirmed {
            paid: true,
            tx_hash,
            amount_btc,
            amount_usd,
            confirmations,
            required_confirmations: required,
        }
    }
}

/// Result of a [`PaymentsControl::cleanup_expired`] call.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CleanupResult {
    pub expired_initialized: usize,
    pub expired_pending: usize,
    pub deleted_confirmed: usize,
    pub deleted_expired: usize,
}

/// Result of a [`PaymentsControl::get_price`] call.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GetPriceResult {
    pub usd_per_btc: f64,
}

/// A donation as exposed to browsers. The payment id and method are
/// deliberately not leaked.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DonationEntry {
    pub id: i64,
    pub display_name: String,
    pub amount: f64,
}

/// Result of a [`PaymentsControl::list_donations`] call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListDonationsResult {
    pub donations: Vec<DonationEntry>,
}
