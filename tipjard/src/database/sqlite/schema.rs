use crate::database::{PaymentMethod, PaymentStatus};

use std::{
    convert::{TryFrom, TryInto},
    str::FromStr,
};

use tipjar::DonorInfo;

use bitcoin::{address, Address, Amount, Txid};

pub const SCHEMA: &str = "\
CREATE TABLE version (
    version INTEGER NOT NULL
);

/* About the Bitcoin network. */
CREATE TABLE network (
    network TEXT NOT NULL
);

/* The address derivation counter. A single row, keyed by
 * 'next_derivation_index' and lazily created on first use, whose atomic
 * read-and-increment is what guarantees every handed-out address gets a
 * unique derivation index.
 */
CREATE TABLE derivation_counter (
    key TEXT PRIMARY KEY NOT NULL,
    value INTEGER NOT NULL
);

/* In-flight Bitcoin payment attempts.
 *
 * Statuses: 0 = initialized, 1 = pending, 2 = confirmed, 3 = expired.
 * The 'txid' and 'detected_at' fields are set when a transaction paying
 * the address is first observed.
 *
 * The amount the donor is expected to send is stored in satoshis; the USD
 * amount and the USD-per-BTC exchange rate are snapshots taken at address
 * generation time.
 */
CREATE TABLE pending_payments (
    id INTEGER PRIMARY KEY NOT NULL,
    session_id TEXT NOT NULL,
    address TEXT UNIQUE NOT NULL,
    amount_sat INTEGER NOT NULL,
    amount_usd REAL NOT NULL,
    exchange_rate REAL NOT NULL,
    derivation_index INTEGER NOT NULL,
    player_name TEXT,
    use_player_name BOOLEAN NOT NULL DEFAULT 0 CHECK (use_player_name IN (0,1)),
    message TEXT,
    status INTEGER NOT NULL CHECK (status IN (0,1,2,3)),
    txid TEXT,
    detected_at INTEGER,
    created_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL
);
CREATE INDEX pending_payments_session_amount ON pending_payments (session_id, amount_usd);
CREATE INDEX pending_payments_status_expiry ON pending_payments (status, expires_at);

/* The donation ledger. Insert-only; rows are never updated nor deleted.
 *
 * For Bitcoin donations 'payment_id' is the receive address. Its
 * uniqueness is what deduplicates concurrent detections of the same
 * payment.
 *
 * Payment methods: 0 = stripe, 1 = paypal, 2 = bitcoin.
 */
CREATE TABLE donations (
    id INTEGER PRIMARY KEY NOT NULL,
    amount_usd REAL NOT NULL,
    display_name TEXT NOT NULL,
    payment_id TEXT UNIQUE NOT NULL,
    payment_method INTEGER NOT NULL CHECK (payment_method IN (0,1,2)),
    message TEXT,
    created_at INTEGER NOT NULL
);
";

impl From<i64> for PaymentStatus {
    fn from(value: i64) -> Self {
        match value {
            0 => PaymentStatus::Initialized,
            1 => PaymentStatus::Pending,
            2 => PaymentStatus::Confirmed,
            _ => {
                assert_eq!(value, 3);
                PaymentStatus::Expired
            }
        }
    }
}

impl PaymentStatus {
    pub fn to_sql(self) -> i64 {
        match self {
            PaymentStatus::Initialized => 0,
            PaymentStatus::Pending => 1,
            PaymentStatus::Confirmed => 2,
            PaymentStatus::Expired => 3,
        }
    }
}

impl From<i64> for PaymentMethod {
    fn from(value: i64) -> Self {
        match value {
            0 => PaymentMethod::Stripe,
            1 => PaymentMethod::Paypal,
            _ => {
                assert_eq!(value, 2);
                PaymentMethod::Bitcoin
            }
        }
    }
}

impl PaymentMethod {
    pub fn to_sql(self) -> i64 {
        match self {
            PaymentMethod::Stripe => 0,
            PaymentMethod::Paypal => 1,
            PaymentMethod::Bitcoin => 2,
        }
    }
}

/// A row in the "pending_payments" table.
#[derive(Debug, Clone, PartialEq)]
pub struct DbPendingPayment {
    pub id: i64,
    pub session_id: String,
    pub address: Address<address::NetworkUnchecked>,
    pub amount: Amount,
    pub amount_usd: f64,
    pub exchange_rate: f64,
    pub derivation_index: u32,
    pub donor: DonorInfo,
    pub status: PaymentStatus,
    pub txid: Option<Txid>,
    pub detected_at: Option<u32>,
    pub created_at: u32,
    pub expires_at: u32,
}

impl TryFrom<&rusqlite::Row<'_>> for DbPendingPayment {
    type Error = rusqlite::Error;

    fn try_from(row: &rusqlite::Row) -> Result<Self, Self::Error> {
        let id = row.get(0)?;
        let session_id = row.get(1)?;

        let address: String = row.get(2)?;
        let address = Address::from_str(&address).expect("We only store valid addresses");

        let amount: i64 = row.get(3)?;
        let amount = Amount::from_sat(amount.try_into().expect("We only store sane amounts"));
        let amount_usd = row.get(4)?;
        let exchange_rate = row.get(5)?;
        let derivation_index = row.get(6)?;

        let donor = DonorInfo {
            player_name: row.get(7)?,
            use_player_name: row.get(8)?,
            message: row.get(9)?,
        };

        let status: i64 = row.get(10)?;
        let status = PaymentStatus::from(status);

        let txid: Option<String> = row.get(11)?;
        let txid = txid.map(|t| Txid::from_str(&t).expect("We only store valid txids"));
        let detected_at = row.get(12)?;
        let created_at = row.get(13)?;
        let expires_at = row.get(14)?;

        Ok(DbPendingPayment {
            id,
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
        })
    }
}

/// A row in the "donations" table.
#[derive(Debug, Clone, PartialEq)]
pub struct DbDonation {
    pub id: i64,
    pub amount_usd: f64,
    pub display_name: String,
    pub payment_id: String,
    pub method: PaymentMethod,
    pub message: Option<String>,
    pub created_at: u32,
}

impl TryFrom<&rusqlite::Row<'_>> for DbDonation {
    type Error = rusqlite::Error;

    fn try_from(row: &rusqlite::Row) -> Result<Self, Self::Error> {
        let id = row.get(0)?;
        let amount_usd = row.get(1)?;
        let display_name = row.get(2)?;
        let payment_id = row.get(3)?;
        let method: i64 = row.get(4)?;
        let method = PaymentMethod::from(method);
        let message = row.get(5)?;
        let created_at = row.get(6)?;

        Ok(DbDonation {
            id,
            amount_usd,
            display_name,
            payment_id,
            method,
            message,
            created_at,
        })
    }
}
