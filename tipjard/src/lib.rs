mod bitcoin;
pub mod commands;
pub mod config;
mod database;
pub mod datadir;
mod oracle;
mod poller;
mod ratelimit;
#[cfg(test)]
mod testutils;

pub use crate::bitcoin::{
    explorer::{EsploraClient, ExplorerError, ExplorerPool},
    required_confirmations, ExplorerInterface, ProbeResult, AMOUNT_TOLERANCE,
};
pub use crate::database::{
    sqlite::{FreshDbOptions, SqliteDb, SqliteDbError},
    CleanupCounts, DatabaseConnection, DatabaseInterface, Donation, NewDonation, PaymentMethod,
    PaymentStatus, PendingPayment, EXPIRED_RETENTION_SECS, PAYMENT_WINDOW_SECS,
};
pub use crate::oracle::{
    MedianPriceOracle, OracleError, PriceOracle, PriceSource, ALL_PRICE_SOURCES,
};
pub use crate::poller::PollerMessage;
pub use tipjar;

use crate::{
    config::{Config, ConfigError},
    datadir::DataDirectory,
    ratelimit::{FixedWindow, TokenBucket},
};

use std::{
    error, fmt, io, path,
    sync::{self, mpsc},
    thread,
};

use ::bitcoin::secp256k1;

#[cfg(not(test))]
use std::panic;
// A panic in any thread should stop the main thread, and print the panic.
#[cfg(not(test))]
pub fn setup_panic_hook() {
    panic::set_hook(Box::new(move |panic_info| {
        let file = panic_info
            .location()
            .map(|l| l.file())
            .unwrap_or_else(|| "'unknown'");
        let line = panic_info
            .location()
            .map(|l| l.line().to_string())
            .unwrap_or_else(|| "'unknown'".to_string());

        let bt = backtrace::Backtrace::new();
        let info = panic_info
            .payload()
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic_info.payload().downcast_ref::<String>().cloned());
        log::error!(
            "panic occurred at line {} of file {}: {:?}\n{:?}",
            line,
            file,
            info,
            bt
        );
    }));
}

#[derive(Debug, Clone)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

pub const VERSION: Version = Version { major: 1, minor: 0 };

#[derive(Debug)]
pub enum StartupError {
    Io(io::Error),
    DefaultDataDirNotFound,
    DatadirCreation(path::PathBuf, io::Error),
    Config(ConfigError),
    Database(SqliteDbError),
    Explorer(ExplorerError),
    Oracle(OracleError),
}

impl fmt::Display for StartupError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "{}", e),
            Self::DefaultDataDirNotFound => write!(
                f,
                "No data directory was specified and a default path could not be determined for \
                 this platform."
            ),
            Self::DatadirCreation(dir_path, e) => write!(
                f,
                "Could not create data directory at '{}': '{}'",
                dir_path.display(),
                e
            ),
            Self::Config(e) => write!(f, "Invalid configuration: '{}'.", e),
            Self::Database(e) => write!(f, "Error initializing database: '{}'.", e),
            Self::Explorer(e) => write!(f, "Error setting up the explorer clients: '{}'.", e),
            Self::Oracle(e) => write!(f, "Error setting up the price oracle: '{}'.", e),
        }
    }
}

impl error::Error for StartupError {}

impl From<io::Error> for StartupError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<SqliteDbError> for StartupError {
    fn from(e: SqliteDbError) -> Self {
        Self::Database(e)
    }
}

// Connect to the SQLite database. Create it if starting fresh, and do some
// sanity checks.
fn setup_sqlite(
    config: &Config,
    data_dir: &DataDirectory,
    fresh_data_dir: bool,
) -> Result<SqliteDb, StartupError> {
    let db_path = data_dir.sqlite_db_file_path();
    let options = if fresh_data_dir {
        Some(FreshDbOptions::new(config.bitcoin_config.network))
    } else {
        None
    };
    let sqlite = SqliteDb::new(db_path, options)?;
    sqlite.sanity_check(config.bitcoin_config.network)?;
    log::info!("Database initialized and checked.");

    Ok(sqlite)
}

/// The API to interact with the payments daemon, either from the web
/// application's HTTP handlers or from tests.
#[derive(Clone)]
pub struct PaymentsControl {
    config: Config,
    explorer: sync::Arc<sync::Mutex<dyn ExplorerInterface>>,
    oracle: sync::Arc<sync::Mutex<dyn PriceOracle>>,
    db: sync::Arc<sync::Mutex<dyn DatabaseInterface>>,
    secp: secp256k1::Secp256k1<secp256k1::All>,
    address_limiter: sync::Arc<TokenBucket>,
    check_limiter: sync::Arc<FixedWindow>,
    price_limiter: sync::Arc<FixedWindow>,
}

impl PaymentsControl {
    pub(crate) fn new(
        config: Config,
        explorer: sync::Arc<sync::Mutex<dyn ExplorerInterface>>,
        oracle: sync::Arc<sync::Mutex<dyn PriceOracle>>,
        db: sync::Arc<sync::Mutex<dyn DatabaseInterface>>,
        secp: secp256k1::Secp256k1<secp256k1::All>,
    ) -> PaymentsControl {
        PaymentsControl {
            config,
            explorer,
            oracle,
            db,
            secp,
            address_limiter: sync::Arc::new(TokenBucket::new(
                commands::GENERATE_ADDRESS_CAPACITY,
                commands::GENERATE_ADDRESS_REFILL,
            )),
            check_limiter: sync::Arc::new(FixedWindow::new(
                commands::CHECK_PAYMENT_LIMIT,
                commands::CHECK_PAYMENT_WINDOW,
            )),
            price_limiter: sync::Arc::new(FixedWindow::new(
                commands::PRICE_LIMIT,
                commands::PRICE_WINDOW,
            )),
        }
    }

    // Useful for unit tests to directly mess up with the DB
    #[cfg(test)]
    pub fn db(&self) -> sync::Arc<sync::Mutex<dyn DatabaseInterface>> {
        self.db.clone()
    }
}

/// The handle to a payments daemon: the payments poller thread watching the
/// block chain, and the `PaymentsControl` API to interact with it.
pub struct DaemonHandle {
    pub poller_sender: mpsc::SyncSender<poller::PollerMessage>,
    pub poller_handle: thread::JoinHandle<()>,
    pub control: PaymentsControl,
}

impl DaemonHandle {
    /// This starts the payments daemon. A user of this interface should
    /// regularly poll the `is_alive` method to check for internal errors. To
    /// shut down the daemon use the `stop` method.
    ///
    /// You may specify custom explorer, price oracle and database
    /// interfaces. For each of them the default is used if `None`: the
    /// public esplora explorers, the median price oracle, and SQLite.
    pub fn start(
        config: Config,
        explorer: Option<impl ExplorerInterface + 'static>,
        oracle: Option<impl PriceOracle + 'static>,
        db: Option<impl DatabaseInterface + 'static>,
    ) -> Result<Self, StartupError> {
        config.check().map_err(StartupError::Config)?;
        let network = config.bitcoin_config.network;
        let secp = secp256k1::Secp256k1::new();

        // First, check the data directory.
        let data_dir = DataDirectory::new(
            config
                .data_dir()
                .ok_or(StartupError::DefaultDataDirNotFound)?,
        );
        let fresh_data_dir = !data_dir.exists() || !data_dir.sqlite_db_file_path().exists();
        if !data_dir.exists() {
            data_dir
                .init()
                .map_err(|e| StartupError::DatadirCreation(data_dir.path().to_path_buf(), e))?;
            log::info!(
                "Created a new data directory at '{}'",
                data_dir.path().to_string_lossy()
            );
        }

        // Then set up the database backend.
        let db = match db {
            Some(db) => sync::Arc::from(sync::Mutex::from(db)),
            None => sync::Arc::from(sync::Mutex::from(setup_sqlite(
                &config,
                &data_dir,
                fresh_data_dir,
            )?)) as sync::Arc<sync::Mutex<dyn DatabaseInterface>>,
        };

        // And the explorer and price oracle interfaces.
        let explorer = match explorer {
            Some(explorer) => sync::Arc::from(sync::Mutex::from(explorer)),
            None => sync::Arc::from(sync::Mutex::from(
                ExplorerPool::new(network).map_err(StartupError::Explorer)?,
            )) as sync::Arc<sync::Mutex<dyn ExplorerInterface>>,
        };
        let oracle = match oracle {
            Some(oracle) => sync::Arc::from(sync::Mutex::from(oracle)),
            None => sync::Arc::from(sync::Mutex::from(
                MedianPriceOracle::new().map_err(StartupError::Oracle)?,
            )) as sync::Arc<sync::Mutex<dyn PriceOracle>>,
        };

        // Start the poller thread. Keep the thread handle to be able to
        // check if it crashed.
        let mut payments_poller = poller::Poller::new(explorer.clone(), db.clone(), network);
        let (poller_sender, poller_receiver) = mpsc::sync_channel(0);
        let poller_handle = thread::Builder::new()
            .name("Payments poller".to_string())
            .spawn({
                let poll_interval = config.bitcoin_config.poll_interval_secs;
                move || {
                    log::info!("Payments poller started.");
                    payments_poller.poll_forever(poll_interval, poller_receiver);
                    log::info!("Payments poller stopped.");
                }
            })
            .expect("Spawning the poller thread must never fail.");

        // Create the API the external world will use to talk to us.
        let control = PaymentsControl::new(config, explorer, oracle, db, secp);

        Ok(DaemonHandle {
            poller_sender,
            poller_handle,
            control,
        })
    }

    /// Start the payments daemon with the default explorer, oracle and
    /// database interfaces.
    pub fn start_default(config: Config) -> Result<DaemonHandle, StartupError> {
        Self::start(
            config,
            Option::<ExplorerPool>::None,
            Option::<MedianPriceOracle>::None,
            Option::<SqliteDb>::None,
        )
    }

    pub fn control(&self) -> &PaymentsControl {
        &self.control
    }

    /// Check whether the daemon is still up and running. This needs to be
    /// regularly polled to check for internal errors. If this returns
    /// `false`, collect the error using the `stop` method.
    pub fn is_alive(&self) -> bool {
        !self.poller_handle.is_finished()
    }

    /// Stop the payments daemon.
    pub fn stop(self) -> Result<(), Box<dyn error::Error>> {
        self.poller_sender
            .send(poller::PollerMessage::Shutdown)
            .expect("The other end should never have hung up before this.");
        self.poller_handle.join().expect("Poller thread must not panic");
        Ok(())
    }
}
