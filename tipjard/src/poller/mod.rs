mod looper;

use crate::{
    bitcoin::{required_confirmations, ExplorerInterface},
    database::DatabaseInterface,
};

use std::{
    sync::{self, mpsc},
    time,
};

use bitcoin::Network;

/// How often the expiry cleanup runs.
const CLEANUP_INTERVAL: time::Duration = time::Duration::from_secs(60 * 60);

#[derive(Debug, Clone)]
pub enum PollerMessage {
    Shutdown,
    /// Ask the payments poller to poll immediately, get notified through the
    /// passed channel once it's done.
    PollNow(mpsc::SyncSender<()>),
}

/// The payments poller handler.
pub struct Poller {
    explorer: sync::Arc<sync::Mutex<dyn ExplorerInterface>>,
    db: sync::Arc<sync::Mutex<dyn DatabaseInterface>>,
    required_confs: i32,
}

impl Poller {
    pub fn new(
        explorer: sync::Arc<sync::Mutex<dyn ExplorerInterface>>,
        db: sync::Arc<sync::Mutex<dyn DatabaseInterface>>,
        network: Network,
    ) -> Poller {
        Poller {
            explorer,
            db,
            required_confs: required_confirmations(network),
        }
    }

    /// Continuously watch the live pending payments.
    /// - `poll_interval`: how frequently to probe the explorers.
    /// - `receiver`: the channel over which we are told to shut down, or to
    ///   poll right now.
    ///
    /// Typically this would run for the whole duration of the program in a
    /// thread, and the main thread would send `PollerMessage::Shutdown` when
    /// shutting down.
    pub fn poll_forever(
        &mut self,
        poll_interval: time::Duration,
        receiver: mpsc::Receiver<PollerMessage>,
    ) {
        let mut last_poll = None;
        let mut last_cleanup = time::Instant::now();

        loop {
            // How long to wait before the next poll.
            let time_before_poll = if let Some(last_poll) = last_poll {
                let time_since_poll = time::Instant::now().duration_since(last_poll);
                poll_interval.saturating_sub(time_since_poll)
            } else {
                // Don't wait before doing the first poll.
                time::Duration::ZERO
            };

            // Wait for the duration of the interval between polls, but
            // listen to messages in the meantime.
            match receiver.recv_timeout(time_before_poll) {
                Ok(PollerMessage::Shutdown) => {
                    log::info!("Payments poller was told to shut down.");
                    return;
                }
                Ok(PollerMessage::PollNow(sender)) => {
                    // We've been asked to poll, don't wait any further and
                    // signal completion to the caller.
                    last_poll = Some(time::Instant::now());
                    looper::poll(&self.explorer, &self.db, self.required_confs);
                    if let Err(e) = sender.send(()) {
                        log::error!("Error sending immediate poll completion signal: {}.", e);
                    }
                    continue;
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    // It's been long enough since the last poll.
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    log::error!("Payments poller communication channel got disconnected. Exiting.");
                    return;
                }
            }
            last_poll = Some(time::Instant::now());

            looper::poll(&self.explorer, &self.db, self.required_confs);

            if last_cleanup.elapsed() >= CLEANUP_INTERVAL {
                looper::cleanup(&self.db);
                last_cleanup = time::Instant::now();
            }
        }
    }
}
