use crate::{
    bitcoin::{ExplorerInterface, ProbeResult, AMOUNT_TOLERANCE},
    database::{
        DatabaseConnection, DatabaseInterface, NewDonation, PaymentMethod, PaymentStatus,
        PendingPayment,
    },
};

use std::{convert::TryInto, sync, time};

use tipjar::validation;

use bitcoin::{Amount, Txid};

fn curr_timestamp() -> u32 {
    time::SystemTime::now()
        .duration_since(time::UNIX_EPOCH)
        .expect("current system time must be later than epoch")
        .as_secs()
        .try_into()
        .expect("system clock year is earlier than 2106")
}

// The payment is confirmed deeply enough: validate the received amount and
// atomically materialize the donation. The unique payment id makes the
// insertion idempotent with regard to a concurrent client-side check, the
// first writer wins.
fn settle_payment(
    db_conn: &mut Box<dyn DatabaseConnection>,
    payment: &PendingPayment,
    txid: Txid,
    received: Amount,
    now: u32,
) {
    let address = payment.address.to_string();

    if received + AMOUNT_TOLERANCE < payment.amount {
        log::warn!(
            "Underpayment on '{}': expected {}, received {}. Expiring the payment, no donation \
             is created.",
            address,
            payment.amount,
            received
        );
        db_conn.set_payment_status(&address, PaymentStatus::Expired);
        return;
    }
    if received > payment.amount + AMOUNT_TOLERANCE {
        log::info!(
            "Overpayment on '{}': expected {}, received {}. Accepting it.",
            address,
            payment.amount,
            received
        );
    }

    // Credit the donor the USD amount originally quoted, at the exchange
    // rate locked when the address was generated.
    let amount_usd = payment.amount.to_btc() * payment.exchange_rate;
    if validation::check_donation_amount(amount_usd).is_err() {
        log::error!(
            "Confirmed payment at '{}' maps to {} USD, outside the donation bounds. Leaving the \
             row to the cleanup.",
            address,
            amount_usd
        );
        return;
    }

    if payment.txid != Some(txid) {
        db_conn.attach_txid(&address, &txid, now);
    }
    let created = db_conn.create_donation(&NewDonation {
        amount_usd,
        display_name: payment.donor.display_name().to_string(),
        payment_id: address.clone(),
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
    db_conn.set_payment_status(&address, PaymentStatus::Confirmed);
    log::info!(
        "Payment at '{}' confirmed by transaction '{}': {} USD donation recorded.",
        address,
        txid,
        amount_usd
    );
}

// Take one monitoring step for a single pending payment.
fn monitor_payment(
    explorer: &sync::Arc<sync::Mutex<dyn ExplorerInterface>>,
    db_conn: &mut Box<dyn DatabaseConnection>,
    payment: &PendingPayment,
    required_confs: i32,
    now: u32,
) {
    // Terminal rows aren't returned to us, but a concurrent client check
    // may have transitioned the row since we loaded it.
    if payment.status.is_terminal() {
        return;
    }

    let address = payment.address.to_string();
    if payment.is_expired_at(now) {
        log::info!(
            "Payment at '{}' reached its expiry without confirming. Expiring it.",
            address
        );
        db_conn.set_payment_status(&address, PaymentStatus::Expired);
        return;
    }

    match explorer.lock().unwrap().probe_address(&payment.address) {
        ProbeResult::ApiFailed => {
            // Transient, the next tick retries.
            log::debug!("All explorers failed for '{}'.", address);
        }
        ProbeResult::NoPayment => {}
        ProbeResult::Pending { txid, .. } => {
            if payment.txid != Some(txid) {
                log::info!(
                    "Detected mempool transaction '{}' paying address '{}'.",
                    txid,
                    address
                );
                db_conn.attach_txid(&address, &txid, now);
            }
        }
        ProbeResult::Confirmed {
            txid,
            amount,
            confirmations,
        } => {
            if confirmations < required_confs {
                if payment.txid != Some(txid) {
                    db_conn.attach_txid(&address, &txid, now);
                }
                log::debug!(
                    "Transaction '{}' paying '{}' has {}/{} confirmations.",
                    txid,
                    address,
                    confirmations,
                    required_confs
                );
                return;
            }
            settle_payment(db_conn, payment, txid, amount, now);
        }
    }
}

/// Probe all live pending payments once against the explorers.
pub fn poll(
    explorer: &sync::Arc<sync::Mutex<dyn ExplorerInterface>>,
    db: &sync::Arc<sync::Mutex<dyn DatabaseInterface>>,
    required_confs: i32,
) {
    let mut db_conn = db.connection();
    let now = curr_timestamp();
    let payments = db_conn.live_pending_payments();
    log::debug!("Monitoring {} pending payment(s).", payments.len());
    for payment in payments {
        monitor_payment(explorer, &mut db_conn, &payment, required_confs, now);
    }
}

/// Expire overdue payments and drop terminal rows past retention.
pub fn cleanup(db: &sync::Arc<sync::Mutex<dyn DatabaseInterface>>) {
    let counts = db.connection().cleanup_expired(curr_timestamp());
    log::info!(
        "Cleanup pass: expired {} initialized and {} pending payment(s), deleted {} confirmed \
         and {} stale expired row(s).",
        counts.expired_initialized,
        counts.expired_pending,
        counts.deleted_confirmed,
        counts.deleted_expired
    );
}
