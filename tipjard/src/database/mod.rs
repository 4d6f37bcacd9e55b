//! Database interface for the payments daemon.
//!
//! Records pending Bitcoin payment attempts, the donation ledger and the
//! address derivation counter.

pub mod sqlite;

use crate::database::sqlite::{
    schema::{DbDonation, DbPendingPayment},
    SqliteConn, SqliteDb,
};

use std::{fmt, str::FromStr, sync};

use tipjar::DonorInfo;

use bitcoin::{self, Network, Txid};

/// How long a pending payment stays claimable before it expires.
pub const PAYMENT_WINDOW_SECS: u32 = 24 * 60 * 60;

/// How long expired rows are kept around before the cleanup deletes them.
pub const EXPIRED_RETENTION_SECS: u32 = 7 * 24 * 60 * 60;

pub trait DatabaseInterface: Send {
    fn connection(&self) -> Box<dyn DatabaseConnection>;
}

impl DatabaseInterface for SqliteDb {
    fn connection(&self) -> Box<dyn DatabaseConnection> {
        Box::new(self.connection().expect("Database must be available"))
    }
}

impl DatabaseInterface for sync::Arc<sync::Mutex<dyn DatabaseInterface>> {
    fn connection(&self) -> Box<dyn DatabaseConnection> {
        self.lock().unwrap().connection()
    }
}

pub trait DatabaseConnection {
    /// The network we are operating on.
    fn network(&mut self) -> Network;

    /// Atomically read-and-increment the address derivation counter,
    /// returning the prior value. The counter is lazily created at 0.
    fn next_derivation_index(&mut self) -> u32;

    /// Store a new pending payment. The address must not already be in
    /// database.
    fn new_pending_payment(&mut self, payment: &PendingPayment);

    /// Get a pending payment by receive address.
    fn pending_payment(&mut self, address: &str) -> Option<PendingPayment>;

    /// Get the live (not yet terminal, not yet expired at `now`) pending
    /// payment matching this session and USD amount, if any. This is the
    /// idempotency key for address generation.
    fn pending_payment_for_session(
        &mut self,
        session_id: &str,
        amount_usd: f64,
        now: u32,
    ) -> Option<PendingPayment>;

    /// All pending payments still being watched, i.e. in the `initialized`
    /// or `pending` status.
    fn live_pending_payments(&mut self) -> Vec<PendingPayment>;

    /// Record the transaction first seen paying this address, upgrading an
    /// `initialized` row to `pending`. No-op on terminal rows.
    fn attach_txid(&mut self, address: &str, txid: &Txid, detected_at: u32);

    /// Unconditionally set the status of this pending payment. Used for
    /// terminal transitions.
    fn set_payment_status(&mut self, address: &str, status: PaymentStatus);

    /// Transition this payment to `expired` if, and only if, it is still
    /// `initialized`. Returns whether a row was updated.
    fn expire_if_initialized(&mut self, address: &str) -> bool;

    /// Insert a donation unless one already exists for this payment id.
    /// Returns whether the donation was inserted.
    fn create_donation(&mut self, donation: &NewDonation) -> bool;

    /// Get a donation by its payment id, if any.
    fn donation_by_payment_id(&mut self, payment_id: &str) -> Option<Donation>;

    /// The whole donation ledger, most recent first.
    fn list_donations(&mut self) -> Vec<Donation>;

    /// Run the periodic cleanup at time `now`: expire overdue rows, drop
    /// terminal rows whose retention elapsed. Returns the per-action counts.
    fn cleanup_expired(&mut self, now: u32) -> CleanupCounts;
}

impl DatabaseConnection for SqliteConn {
    fn network(&mut self) -> Network {
        self.db_network()
    }

    fn next_derivation_index(&mut self) -> u32 {
        self.db_next_derivation_index()
    }

    fn new_pending_payment(&mut self, payment: &PendingPayment) {
        self.db_new_pending_payment(payment)
    }

    fn pending_payment(&mut self, address: &str) -> Option<PendingPayment> {
        self.db_pending_payment(address).map(|p| p.into())
    }

    fn pending_payment_for_session(
        &mut self,
        session_id: &str,
        amount_usd: f64,
        now: u32,
    ) -> Option<PendingPayment> {
        self.db_pending_payment_for_session(session_id, amount_usd, now)
            .map(|p| p.into())
    }

    fn live_pending_payments(&mut self) -> Vec<PendingPayment> {
        self.db_live_pending_payments()
            .into_iter()
            .map(|p| p.into())
            .collect()
    }

    fn attach_txid(&mut self, address: &str, txid: &Txid, detected_at: u32) {
        self.db_attach_txid(address, txid, detected_at)
    }

    fn set_payment_status(&mut self, address: &str, status: PaymentStatus) {
        self.db_set_payment_status(address, status)
    }

    fn expire_if_initialized(&mut self, address: &str) -> bool {
        self.db_expire_if_initialized(address)
    }

    fn create_donation(&mut self, donation: &NewDonation) -> bool {
        self.db_create_donation(donation)
    }

    fn donation_by_payment_id(&mut self, payment_id: &str) -> Option<Donation> {
        self.db_donation_by_payment_id(payment_id).map(|d| d.into())
    }

    fn list_donations(&mut self) -> Vec<Donation> {
        self.db_list_donations()
            .into_iter()
            .map(|d| d.into())
            .collect()
    }

    fn cleanup_expired(&mut self, now: u32) -> CleanupCounts {
        self.db_cleanup_expired(now)
    }
}

/// Possible (mutually exclusive) status of a pending payment.
///
/// The only permitted transitions are `initialized -> pending -> confirmed`,
/// with `expired` reachable from both non-terminal statuses. `confirmed`
/// and `expired` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PaymentStatus {
    /// Address handed out, no transaction seen yet.
    Initialized,
    /// A transaction paying the address was seen, not confirmed deep enough.
    Pending,
    /// Confirmed with the required depth and amount; the donation exists.
    Confirmed,
    /// Timed out, underpaid, or abandoned. No donation will be created.
    Expired,
}

impl PaymentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PaymentStatus::Confirmed | PaymentStatus::Expired)
    }

    pub fn from_arg(s: &str) -> Option<PaymentStatus> {
        match s {
            "initialized" => Some(PaymentStatus::Initialized),
            "pending" => Some(PaymentStatus::Pending),
            "confirmed" => Some(PaymentStatus::Confirmed),
            "expired" => Some(PaymentStatus::Expired),
            _ => None,
        }
    }

    pub fn to_arg(&self) -> &'static str {
        match self {
            PaymentStatus::Initialized => "initialized",
            PaymentStatus::Pending => "pending",
            PaymentStatus::Confirmed => "confirmed",
            PaymentStatus::Expired => "expired",
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.to_arg())
    }
}

/// How a donation was paid for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PaymentMethod {
    Stripe,
    Paypal,
    Bitcoin,
}

impl PaymentMethod {
    pub fn to_arg(&self) -> &'static str {
        match self {
            PaymentMethod::Stripe => "stripe",
            PaymentMethod::Paypal => "paypal",
            PaymentMethod::Bitcoin => "bitcoin",
        }
    }
}

impl fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.to_arg())
    }
}

/// An in-flight attempt to receive a Bitcoin donation at a derived address.
///
/// All timestamps are the number of seconds since the UNIX epoch.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingPayment {
    pub session_id: String,
    /// The single-use receive address. Unique across the store.
    pub address: bitcoin::Address,
    /// The amount the donor is expected to send.
    pub amount: bitcoin::Amount,
    /// The USD amount the donor asked to give.
    pub amount_usd: f64,
    /// USD per BTC at generation time.
    pub exchange_rate: f64,
    /// Index the address was derived at.
    pub derivation_index: u32,
    pub donor: DonorInfo,
    pub status: PaymentStatus,
    /// The transaction first seen paying the address, if any.
    pub txid: Option<Txid>,
    pub detected_at: Option<u32>,
    pub created_at: u32,
    pub expires_at: u32,
}

impl PendingPayment {
    pub fn is_expired_at(&self, now: u32) -> bool {
        now > self.expires_at
    }
}

impl From<DbPendingPayment> for PendingPayment {
    fn from(db_payment: DbPendingPayment) -> PendingPayment {
        let DbPendingPayment {
            session_id,
            address,
            amount,
            amount_usd,
            exchange_rate,
            derivation_index,
            donor,
            status,
            txid,
            detected_at,
            created_at,
            expires_at,
            ..
        } = db_payment;
        PendingPayment {
            session_id,
            address: address.assume_checked(),
            amount,
            amount_usd,
            exchange_rate,
            derivation_index,
            donor,
            status,
            txid,
            detected_at,
            created_at,
            expires_at,
        }
    }
}

/// A donation to be inserted in the ledger.
#[derive(Debug, Clone, PartialEq)]
pub struct NewDonation {
    pub amount_usd: f64,
    pub display_name: String,
    /// For Bitcoin donations, the receive address. Unique across the ledger.
    pub payment_id: String,
    pub method: PaymentMethod,
    pub message: Option<String>,
    pub created_at: u32,
}

/// A donation ledger record. Terminal: created once, never updated, never
/// deleted.
#[derive(Debug, Clone, PartialEq)]
pub struct Donation {
    pub id: i64,
    pub amount_usd: f64,
    pub display_name: String,
    pub payment_id: String,
    pub method: PaymentMethod,
    pub message: Option<String>,
    pub created_at: u32,
}

impl From<DbDonation> for Donation {
    fn from(db_donation: DbDonation) -> Donation {
        let DbDonation {
            id,
            amount_usd,
            display_name,
            payment_id,
            method,
            message,
            created_at,
        } = db_donation;
        Donation {
            id,
            amount_usd,
            display_name,
            payment_id,
            method,
            message,
            created_at,
        }
    }
}

/// What a cleanup pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupCounts {
    /// `initialized` rows past their expiry, transitioned to `expired`.
    pub expired_initialized: usize,
    /// `pending` rows whose transaction never confirmed in time,
    /// transitioned to `expired`.
    pub expired_pending: usize,
    /// `confirmed` rows deleted (the donation is the authoritative record).
    pub deleted_confirmed: usize,
    /// `expired` rows past the retention window, deleted.
    pub deleted_expired: usize,
}

impl FromStr for PaymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PaymentStatus::from_arg(s).ok_or_else(|| format!("Unknown payment status '{}'", s))
    }
}
