//! Implementation of the database interface using SQLite.
//!
//! We use a bundled SQLite that is compiled with SQLITE_THREADSAFE. Sqlite.org states:
//! > Multi-thread. In this mode, SQLite can be safely used by multiple threads provided that
//! > no single database connection is used simultaneously in two or more threads.
//!
//! We leverage SQLite's `unlock_notify` feature to synchronize writes across connection. More
//! about it at https://sqlite.org/unlock_notify.html.

pub mod schema;
mod utils;

use crate::database::{
    sqlite::{
        schema::{DbDonation, DbPendingPayment, SCHEMA},
        utils::{create_fresh_db, db_exec, db_query, db_tx_query, db_version},
    },
    CleanupCounts, NewDonation, PaymentStatus, PendingPayment, EXPIRED_RETENTION_SECS,
};

use std::{convert::TryInto, fmt, io, path};

use bitcoin::{Network, Txid};

const DB_VERSION: i64 = 0;

/// The key of the single derivation counter row.
const DERIVATION_COUNTER_KEY: &str = "next_derivation_index";

#[derive(Debug)]
pub enum SqliteDbError {
    FileCreation(io::Error),
    FileNotFound(path::PathBuf),
    UnsupportedVersion(i64),
    InvalidNetwork(Network),
    Rusqlite(rusqlite::Error),
}

impl std::fmt::Display for SqliteDbError {
    fn fmt(&self, f: &mut fmt::Formatter) -> std::fmt::Result {
        match self {
            SqliteDbError::FileCreation(e) => {
                write!(f, "Error when create SQLite database file: '{}'", e)
            }
            SqliteDbError::FileNotFound(p) => {
                write!(f, "SQLite database file not found at '{}'.", p.display())
            }
            SqliteDbError::UnsupportedVersion(v) => {
                write!(f, "Unsupported database version '{}'.", v)
            }
            SqliteDbError::InvalidNetwork(net) => {
                write!(f, "Database was created for network '{}'.", net)
            }
            SqliteDbError::Rusqlite(e) => write!(f, "SQLite error: '{}'", e),
        }
    }
}

impl std::error::Error for SqliteDbError {}

impl From<io::Error> for SqliteDbError {
    fn from(e: io::Error) -> Self {
        SqliteDbError::FileCreation(e)
    }
}

impl From<rusqlite::Error> for SqliteDbError {
    fn from(e: rusqlite::Error) -> Self {
        SqliteDbError::Rusqlite(e)
    }
}

#[derive(Debug, Clone)]
pub struct FreshDbOptions {
    pub(self) network: Network,
    pub(self) schema: &'static str,
    pub(self) version: i64,
}

impl FreshDbOptions {
    pub fn new(network: Network) -> FreshDbOptions {
        FreshDbOptions {
            network,
            schema: SCHEMA,
            version: DB_VERSION,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SqliteDb {
    db_path: path::PathBuf,
}

impl SqliteDb {
    /// Instantiate an SQLite database either from an existing database file or by creating a fresh
    /// one.
    pub fn new(
        db_path: path::PathBuf,
        fresh_options: Option<FreshDbOptions>,
    ) -> Result<SqliteDb, SqliteDbError> {
        // Create the database if needed, and make sure the db file exists.
        if let Some(options) = fresh_options {
            create_fresh_db(&db_path, options)?;
            log::info!("Created a fresh database at {}.", db_path.display());
        }
        if !db_path.exists() {
            return Err(SqliteDbError::FileNotFound(db_path));
        }

        Ok(SqliteDb { db_path })
    }

    /// Get a new connection to the database.
    pub fn connection(&self) -> Result<SqliteConn, SqliteDbError> {
        let conn = rusqlite::Connection::open(&self.db_path)?;
        conn.busy_timeout(std::time::Duration::from_secs(60))?;
        Ok(SqliteConn { conn })
    }

    /// Perform startup sanity checks.
    pub fn sanity_check(&self, network: Network) -> Result<(), SqliteDbError> {
        let mut conn = self.connection()?;

        let db_version = conn.db_version();
        if db_version != DB_VERSION {
            return Err(SqliteDbError::UnsupportedVersion(db_version));
        }

        // The config and the db should be on the same network.
        let db_net = conn.db_network();
        if db_net != network {
            return Err(SqliteDbError::InvalidNetwork(db_net));
        }

        Ok(())
    }
}

pub struct SqliteConn {
    conn: rusqlite::Connection,
}

impl SqliteConn {
    pub fn db_version(&mut self) -> i64 {
        db_version(&mut self.conn).expect("db must not fail")
    }

    /// The network this database was created for.
    pub fn db_network(&mut self) -> Network {
        db_query(
            &mut self.conn,
            "SELECT network FROM network",
            rusqlite::params![],
            |row| {
                let net: String = row.get(0)?;
                Ok(net)
            },
        )
        .expect("Db must not fail")
        .pop()
        .expect("There is always a row in the network table")
        .parse()
        .expect("Insane database: can't parse network string")
    }

    /// Atomically read-and-increment the derivation counter, returning the
    /// prior value. The counter row is lazily created on first use.
    pub fn db_next_derivation_index(&mut self) -> u32 {
        let mut index: i64 = 0;
        db_exec(&mut self.conn, |db_tx| {
            let current: Option<i64> = db_tx_query(
                db_tx,
                "SELECT value FROM derivation_counter WHERE key = ?1",
                rusqlite::params![DERIVATION_COUNTER_KEY],
                |row| row.get(0),
            )?
            .pop();
            if let Some(value) = current {
                db_tx.execute(
                    "UPDATE derivation_counter SET value = value + 1 WHERE key = ?1",
                    rusqlite::params![DERIVATION_COUNTER_KEY],
                )?;
                index = value;
            } else {
                db_tx.execute(
                    "INSERT INTO derivation_counter (key, value) VALUES (?1, 1)",
                    rusqlite::params![DERIVATION_COUNTER_KEY],
                )?;
                index = 0;
            }
            Ok(())
        })
        .expect("Database must be available");
        index.try_into().expect("Counter must fit in u32")
    }

    /// Store a new pending payment.
    /// Will panic if given an address that is already in DB.
    pub fn db_new_pending_payment(&mut self, payment: &PendingPayment) {
        db_exec(&mut self.conn, |db_tx| {
            db_tx
                .execute(
                    "INSERT INTO pending_payments (session_id, address, amount_sat, amount_usd, \
                     exchange_rate, derivation_index, player_name, use_player_name, message, \
                     status, txid, detected_at, created_at, expires_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                    rusqlite::params![
                        payment.session_id,
                        payment.address.to_string(),
                        payment.amount.to_sat(),
                        payment.amount_usd,
                        payment.exchange_rate,
                        payment.derivation_index,
                        payment.donor.player_name,
                        payment.donor.use_player_name,
                        payment.donor.message,
                        payment.status.to_sql(),
                        payment.txid.map(|t| t.to_string()),
                        payment.detected_at,
                        payment.created_at,
                        payment.expires_at,
                    ],
                )
                .map(|_| ())
        })
        .expect("Database must be available")
    }

    /// Get a pending payment by receive address.
    pub fn db_pending_payment(&mut self, address: &str) -> Option<DbPendingPayment> {
        db_query(
            &mut self.conn,
            "SELECT * FROM pending_payments WHERE address = ?1",
            rusqlite::params![address],
            |row| row.try_into(),
        )
        .expect("Db must not fail")
        .pop()
    }

    /// Get the most recent live pending payment for this session and USD
    /// amount, if any.
    pub fn db_pending_payment_for_session(
        &mut self,
        session_id: &str,
        amount_usd: f64,
        now: u32,
    ) -> Option<DbPendingPayment> {
        db_query(
            &mut self.conn,
            "SELECT * FROM pending_payments WHERE session_id = ?1 AND amount_usd = ?2 \
             AND status IN (?3, ?4) AND expires_at >= ?5 ORDER BY created_at DESC, id DESC",
            rusqlite::params![
                session_id,
                amount_usd,
                PaymentStatus::Initialized.to_sql(),
                PaymentStatus::Pending.to_sql(),
                now,
            ],
            |row| row.try_into(),
        )
        .expect("Db must not fail")
        .into_iter()
        .next()
    }

    /// All pending payments in a non-terminal status.
    pub fn db_live_pending_payments(&mut self) -> Vec<DbPendingPayment> {
        db_query(
            &mut self.conn,
            "SELECT * FROM pending_payments WHERE status IN (?1, ?2) ORDER BY id",
            rusqlite::params![
                PaymentStatus::Initialized.to_sql(),
                PaymentStatus::Pending.to_sql(),
            ],
            |row| row.try_into(),
        )
        .expect("Db must not fail")
    }

    /// Record the transaction paying this address, upgrading the row from
    /// `initialized` to `pending`. No-op on terminal rows.
    pub fn db_attach_txid(&mut self, address: &str, txid: &Txid, detected_at: u32) {
        db_exec(&mut self.conn, |db_tx| {
            db_tx
                .execute(
                    "UPDATE pending_payments SET txid = ?2, detected_at = ?3, \
                     status = CASE WHEN status = ?4 THEN ?5 ELSE status END \
                     WHERE address = ?1 AND status IN (?4, ?5)",
                    rusqlite::params![
                        address,
                        txid.to_string(),
                        detected_at,
                        PaymentStatus::Initialized.to_sql(),
                        PaymentStatus::Pending.to_sql(),
                    ],
                )
                .map(|_| ())
        })
        .expect("Database must be available")
    }

    /// Unconditionally set the status of this pending payment.
    pub fn db_set_payment_status(&mut self, address: &str, status: PaymentStatus) {
        db_exec(&mut self.conn, |db_tx| {
            db_tx
                .execute(
                    "UPDATE pending_payments SET status = ?2 WHERE address = ?1",
                    rusqlite::params![address, status.to_sql()],
                )
                .map(|_| ())
        })
        .expect("Database must be available")
    }

    /// Expire this payment if it is still `initialized`. Returns whether a
    /// row was updated.
    pub fn db_expire_if_initialized(&mut self, address: &str) -> bool {
        let mut updated = false;
        db_exec(&mut self.conn, |db_tx| {
            let affected = db_tx.execute(
                "UPDATE pending_payments SET status = ?2 WHERE address = ?1 AND status = ?3",
                rusqlite::params![
                    address,
                    PaymentStatus::Expired.to_sql(),
                    PaymentStatus::Initialized.to_sql(),
                ],
            )?;
            updated = affected > 0;
            Ok(())
        })
        .expect("Database must be available");
        updated
    }

    /// Insert a donation unless one already exists with this payment id.
    /// Returns whether a row was inserted.
    pub fn db_create_donation(&mut self, donation: &NewDonation) -> bool {
        let mut inserted = false;
        db_exec(&mut self.conn, |db_tx| {
            let affected = db_tx.execute(
                "INSERT OR IGNORE INTO donations (amount_usd, display_name, payment_id, \
                 payment_method, message, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    donation.amount_usd,
                    donation.display_name,
                    donation.payment_id,
                    donation.method.to_sql(),
                    donation.message,
                    donation.created_at,
                ],
            )?;
            inserted = affected > 0;
            Ok(())
        })
        .expect("Database must be available");
        inserted
    }

    /// Get a donation by payment id.
    pub fn db_donation_by_payment_id(&mut self, payment_id: &str) -> Option<DbDonation> {
        db_query(
            &mut self.conn,
            "SELECT * FROM donations WHERE payment_id = ?1",
            rusqlite::params![payment_id],
            |row| row.try_into(),
        )
        .expect("Db must not fail")
        .pop()
    }

    /// The whole donation ledger, most recent first.
    pub fn db_list_donations(&mut self) -> Vec<DbDonation> {
        db_query(
            &mut self.conn,
            "SELECT * FROM donations ORDER BY id DESC",
            rusqlite::params![],
            |row| row.try_into(),
        )
        .expect("Db must not fail")
    }

    /// Run the periodic cleanup at time `now`.
    pub fn db_cleanup_expired(&mut self, now: u32) -> CleanupCounts {
        let mut counts = CleanupCounts::default();
        db_exec(&mut self.conn, |db_tx| {
            counts.expired_initialized = db_tx.execute(
                "UPDATE pending_payments SET status = ?1 WHERE status = ?2 AND expires_at < ?3",
                rusqlite::params![
                    PaymentStatus::Expired.to_sql(),
                    PaymentStatus::Initialized.to_sql(),
                    now,
                ],
            )?;
            counts.expired_pending = db_tx.execute(
                "UPDATE pending_payments SET status = ?1 WHERE status = ?2 AND expires_at < ?3",
                rusqlite::params![
                    PaymentStatus::Expired.to_sql(),
                    PaymentStatus::Pending.to_sql(),
                    now,
                ],
            )?;
            // The donation ledger is the authoritative record of a confirmed
            // payment, the pending row is of no further use.
            counts.deleted_confirmed = db_tx.execute(
                "DELETE FROM pending_payments WHERE status = ?1",
                rusqlite::params![PaymentStatus::Confirmed.to_sql()],
            )?;
            counts.deleted_expired = db_tx.execute(
                "DELETE FROM pending_payments WHERE status = ?1 AND created_at + ?2 < ?3",
                rusqlite::params![
                    PaymentStatus::Expired.to_sql(),
                    EXPIRED_RETENTION_SECS,
                    now,
                ],
            )?;
            Ok(())
        })
        .expect("Database must be available");
        counts
    }
}
