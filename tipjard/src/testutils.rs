use crate::{
    bitcoin::{ExplorerInterface, ProbeResult},
    config::{BitcoinConfig, Config},
    database::{
        CleanupCounts, DatabaseConnection, DatabaseInterface, Donation, NewDonation,
        PaymentStatus, PendingPayment, EXPIRED_RETENTION_SECS,
    },
    oracle::{OracleError, PriceOracle},
    poller::PollerMessage,
    DaemonHandle, PaymentsControl,
};

use std::{
    collections::HashMap,
    env, fs, path, process,
    str::FromStr,
    sync::{self, mpsc},
    thread, time,
};

use tipjar::MasterKey;

use bitcoin::{Network, Txid};

/// The BIP84 reference account key ("abandon abandon ... about"), whose
/// first two receive addresses are `DUMMY_ADDR_0` and `DUMMY_ADDR_1`.
pub const DUMMY_MASTER_KEY: &str = "zprvAdG4iTXWBoARxkkzNpNh8r6Qag3irQB8PzEMkAFeTRXxHpbF9z4QgEvBRmfvqWvGp42t42nvgGpNgYSJA9iefm1yYNZKEm7z6qUWCroSQnE";
pub const DUMMY_ADDR_0: &str = "bc1qcr8te4kr609gcawutmrza0j4xv80jy8z306fyu";
pub const DUMMY_ADDR_1: &str = "bc1qnjg0jd8228aq7egyzacy8cys3knf9xvrerkf9g";
/// The key's first change address, handy when a test needs an address the
/// daemon will never hand out.
pub const DUMMY_ADDR_2: &str = "bc1q8c6fshw2dlwun7ekn9qwf37cu2rn755upcp6el";
pub const DUMMY_TXID: &str = "f7216a7d1c7a0a1c4b6b7b6e0f8e9d8c7b6a5b4c3d2e1f0a9b8c7d6e5f4a3b2c";

pub fn dummy_txid() -> Txid {
    Txid::from_str(DUMMY_TXID).unwrap()
}

/// An explorer stub always answering with a preset result.
#[derive(Clone)]
pub struct DummyExplorer {
    result: sync::Arc<sync::Mutex<ProbeResult>>,
}

impl DummyExplorer {
    pub fn new() -> Self {
        Self {
            result: sync::Arc::new(sync::Mutex::new(ProbeResult::NoPayment)),
        }
    }

    /// Set what the explorer will answer from now on. Clones share the
    /// state, keep one to steer the daemon's copy.
    pub fn set_probe_result(&self, result: ProbeResult) {
        *self.result.lock().unwrap() = result;
    }
}

impl ExplorerInterface for DummyExplorer {
    fn probe_address(&self, _: &bitcoin::Address) -> ProbeResult {
        self.result.lock().unwrap().clone()
    }
}

/// A price oracle stub answering with a preset quote.
#[derive(Clone)]
pub struct DummyOracle {
    price: sync::Arc<sync::Mutex<Result<f64, OracleError>>>,
}

impl DummyOracle {
    pub fn new(price: f64) -> Self {
        Self {
            price: sync::Arc::new(sync::Mutex::new(Ok(price))),
        }
    }

    pub fn set_price(&self, price: f64) {
        *self.price.lock().unwrap() = Ok(price);
    }

    pub fn fail(&self) {
        *self.price.lock().unwrap() = Err(OracleError::NoPricesAvailable);
    }
}

impl PriceOracle for DummyOracle {
    fn usd_per_btc(&self) -> Result<f64, OracleError> {
        self.price.lock().unwrap().clone()
    }
}

struct DummyDbState {
    next_derivation_index: u32,
    payments: HashMap<String, PendingPayment>,
    donations: Vec<Donation>,
}

/// An in-memory database.
#[derive(Clone)]
pub struct DummyDatabase {
    db: sync::Arc<sync::RwLock<DummyDbState>>,
}

impl DummyDatabase {
    pub fn new() -> DummyDatabase {
        DummyDatabase {
            db: sync::Arc::new(sync::RwLock::new(DummyDbState {
                next_derivation_index: 0,
                payments: HashMap::new(),
                donations: Vec::new(),
            })),
        }
    }
}

impl DatabaseInterface for DummyDatabase {
    fn connection(&self) -> Box<dyn DatabaseConnection> {
        Box::new(DummyDatabase {
            db: self.db.clone(),
        })
    }
}

impl DatabaseConnection for DummyDatabase {
    fn network(&mut self) -> Network {
        Network::Bitcoin
    }

    fn next_derivation_index(&mut self) -> u32 {
        let mut db = self.db.write().unwrap();
        let index = db.next_derivation_index;
        db.next_derivation_index += 1;
        index
    }

    fn new_pending_payment(&mut self, payment: &PendingPayment) {
        let mut db = self.db.write().unwrap();
        let address = payment.address.to_string();
        assert!(
            !db.payments.contains_key(&address),
            "Address '{}' is already in DB",
            address
        );
        db.payments.insert(address, payment.clone());
    }

    fn pending_payment(&mut self, address: &str) -> Option<PendingPayment> {
        self.db.read().unwrap().payments.get(address).cloned()
    }

    fn pending_payment_for_session(
        &mut self,
        session_id: &str,
        amount_usd: f64,
        now: u32,
    ) -> Option<PendingPayment> {
        self.db
            .read()
            .unwrap()
            .payments
            .values()
            .filter(|p| {
                p.session_id == session_id
                    && p.amount_usd == amount_usd
                    && !p.status.is_terminal()
                    && p.expires_at >= now
            })
            .max_by_key(|p| p.created_at)
            .cloned()
    }

    fn live_pending_payments(&mut self) -> Vec<PendingPayment> {
        let mut payments: Vec<_> = self
            .db
            .read()
            .unwrap()
            .payments
            .values()
            .filter(|p| !p.status.is_terminal())
            .cloned()
            .collect();
        payments.sort_by_key(|p| p.derivation_index);
        payments
    }

    fn attach_txid(&mut self, address: &str, txid: &Txid, detected_at: u32) {
        let mut db = self.db.write().unwrap();
        if let Some(payment) = db.payments.get_mut(address) {
            if payment.status.is_terminal() {
                return;
            }
            payment.txid = Some(*txid);
            payment.detected_at = Some(detected_at);
            if payment.status == PaymentStatus::Initialized {
                payment.status = PaymentStatus::Pending;
            }
        }
    }

    fn set_payment_status(&mut self, address: &str, status: PaymentStatus) {
        let mut db = self.db.write().unwrap();
        db.payments
            .get_mut(address)
            .expect("Payment must be in DB")
            .status = status;
    }

    fn expire_if_initialized(&mut self, address: &str) -> bool {
        let mut db = self.db.write().unwrap();
        if let Some(payment) = db.payments.get_mut(address) {
            if payment.status == PaymentStatus::Initialized {
                payment.status = PaymentStatus::Expired;
                return true;
            }
        }
        false
    }

    fn create_donation(&mut self, donation: &NewDonation) -> bool {
        let mut db = self.db.write().unwrap();
        if db
            .donations
            .iter()
            .any(|d| d.payment_id == donation.payment_id)
        {
            return false;
        }
        let id = db.donations.len() as i64 + 1;
        db.donations.push(Donation {
            id,
            amount_usd: donation.amount_usd,
            display_name: donation.display_name.clone(),
            payment_id: donation.payment_id.clone(),
            method: donation.method,
            message: donation.message.clone(),
            created_at: donation.created_at,
        });
        true
    }

    fn donation_by_payment_id(&mut self, payment_id: &str) -> Option<Donation> {
        self.db
            .read()
            .unwrap()
            .donations
            .iter()
            .find(|d| d.payment_id == payment_id)
            .cloned()
    }

    fn list_donations(&mut self) -> Vec<Donation> {
        let mut donations = self.db.read().unwrap().donations.clone();
        donations.reverse();
        donations
    }

    fn cleanup_expired(&mut self, now: u32) -> CleanupCounts {
        let mut db = self.db.write().unwrap();
        let mut counts = CleanupCounts::default();
        for payment in db.payments.values_mut() {
            if payment.expires_at < now {
                if payment.status == PaymentStatus::Initialized {
                    payment.status = PaymentStatus::Expired;
                    counts.expired_initialized += 1;
                } else if payment.status == PaymentStatus::Pending {
                    payment.status = PaymentStatus::Expired;
                    counts.expired_pending += 1;
                }
            }
        }
        let confirmed: Vec<_> = db
            .payments
            .iter()
            .filter(|(_, p)| p.status == PaymentStatus::Confirmed)
            .map(|(addr, _)| addr.clone())
            .collect();
        counts.deleted_confirmed = confirmed.len();
        for addr in confirmed {
            db.payments.remove(&addr);
        }
        let stale: Vec<_> = db
            .payments
            .iter()
            .filter(|(_, p)| {
                p.status == PaymentStatus::Expired && p.created_at + EXPIRED_RETENTION_SECS < now
            })
            .map(|(addr, _)| addr.clone())
            .collect();
        counts.deleted_expired = stale.len();
        for addr in stale {
            db.payments.remove(&addr);
        }
        counts
    }
}

pub struct DummyTipjar {
    pub tmp_dir: path::PathBuf,
    pub handle: DaemonHandle,
}

static COUNTER: sync::atomic::AtomicUsize = sync::atomic::AtomicUsize::new(0);
fn uid() -> usize {
    COUNTER.fetch_add(1, sync::atomic::Ordering::Relaxed)
}

pub fn tmp_dir() -> path::PathBuf {
    env::temp_dir().join(format!(
        "tipjard-{}-{:?}-{}",
        process::id(),
        thread::current().id(),
        uid(),
    ))
}

impl DummyTipjar {
    /// Creates a new DummyTipjar interface. The poll interval is set large
    /// enough that the poller only runs when `trigger_poll` is called.
    pub fn new(
        explorer: impl ExplorerInterface + 'static,
        oracle: impl PriceOracle + 'static,
        db: impl DatabaseInterface + 'static,
    ) -> DummyTipjar {
        let tmp_dir = tmp_dir();
        fs::create_dir_all(&tmp_dir).unwrap();

        let bitcoin_config = BitcoinConfig {
            network: Network::Bitcoin,
            poll_interval_secs: time::Duration::from_secs(3_600),
            master_key: MasterKey::from_base58(DUMMY_MASTER_KEY).unwrap(),
        };
        let config = Config {
            data_dir: Some(tmp_dir.clone()),
            log_level: log::LevelFilter::Debug,
            bitcoin_config,
        };

        let handle = DaemonHandle::start(config, Some(explorer), Some(oracle), Some(db)).unwrap();
        let tipjar = DummyTipjar { tmp_dir, handle };
        // Wait out the poller's startup poll, so tests fully control any
        // subsequent one.
        tipjar.trigger_poll();
        tipjar
    }

    pub fn control(&self) -> &PaymentsControl {
        &self.handle.control
    }

    /// Have the poller run one monitoring pass, and wait for its completion.
    pub fn trigger_poll(&self) {
        let (sender, receiver) = mpsc::sync_channel(0);
        self.handle
            .poller_sender
            .send(PollerMessage::PollNow(sender))
            .expect("Poller must be alive");
        receiver.recv().expect("Poller must signal completion");
    }

    pub fn shutdown(self) {
        self.handle.stop().unwrap();
        fs::remove_dir_all(self.tmp_dir).unwrap();
    }
}
