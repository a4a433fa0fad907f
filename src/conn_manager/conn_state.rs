use anyhow::{anyhow, bail, ensure, Context, Result};
use tracing::{debug, error, info, trace, warn};

use parking_lot::{Mutex, RwLock};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    sync::{mpsc::UnboundedSender, watch},
    time::Instant,
};

use crate::{
    config::printer_id::PrinterId,
    conn_manager::{
        conn_bambu::{command::Command, message::Message},
        transport::{Topics, Transport},
        worker_message::WorkerMsg,
    },
    status::{reduce, PrinterSnapshot},
};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    #[default]
    NoState,
    Connected,
    Disconnected,
    Paused,
    /// terminal
    Quit,
}

/// Lifecycle of one printer connection and owner of its live snapshot.
///
/// Shared between the session driver and the watchdog. Locks are only held for
/// the duration of a field access, never across an `.await`.
pub struct PrinterConn {
    id: PrinterId,
    transport: Arc<dyn Transport>,
    topics: Topics,
    timeout: Duration,

    state: Mutex<ConnectionState>,
    snapshot: RwLock<Arc<PrinterSnapshot>>,
    last_message: Mutex<Instant>,
    awaiting_fresh: AtomicBool,
    /// raised once, by the next disconnect
    fatal: Mutex<Option<anyhow::Error>>,

    tx: UnboundedSender<(PrinterId, WorkerMsg)>,
    shutdown: watch::Sender<bool>,
}

/// MARK: getters
impl PrinterConn {
    pub fn new(
        id: PrinterId,
        transport: Arc<dyn Transport>,
        topics: Topics,
        snapshot: PrinterSnapshot,
        timeout: Duration,
        tx: UnboundedSender<(PrinterId, WorkerMsg)>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            id,
            transport,
            topics,
            timeout,
            state: Mutex::new(ConnectionState::NoState),
            snapshot: RwLock::new(Arc::new(snapshot)),
            last_message: Mutex::new(Instant::now()),
            awaiting_fresh: AtomicBool::new(false),
            fatal: Mutex::new(None),
            tx,
            shutdown,
        }
    }

    pub fn id(&self) -> &PrinterId {
        &self.id
    }

    pub fn topics(&self) -> &Topics {
        &self.topics
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn snapshot(&self) -> Arc<PrinterSnapshot> {
        self.snapshot.read().clone()
    }

    pub fn is_awaiting_fresh_data(&self) -> bool {
        self.awaiting_fresh.load(Ordering::SeqCst)
    }

    pub fn last_message(&self) -> Instant {
        *self.last_message.lock()
    }

    pub fn set_last_message(&self, at: Instant) {
        *self.last_message.lock() = at;
    }

    pub fn has_fatal(&self) -> bool {
        self.fatal.lock().is_some()
    }

    /// flips to `true` once the connection quits
    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn is_quit(&self) -> bool {
        self.state() == ConnectionState::Quit
    }

    fn notify(&self, msg: WorkerMsg) {
        if self.tx.send((self.id.clone(), msg)).is_err() {
            trace!("no subscriber for printer {}", self.id.to_string());
        }
    }
}

/// MARK: transitions
impl PrinterConn {
    /// Transport (re)connected. Ignored while paused.
    pub fn on_connect(&self) -> Result<()> {
        let mut state = self.state.lock();
        match *state {
            ConnectionState::Paused => {
                debug!("connected while paused, not subscribing");
                return Ok(());
            }
            ConnectionState::Quit => {
                debug!("connected after quit, ignoring");
                return Ok(());
            }
            _ => {}
        }

        self.transport
            .subscribe(&self.topics.report)
            .context("subscribing to report topic")?;
        *self.last_message.lock() = Instant::now();
        *state = ConnectionState::Connected;
        drop(state);

        info!("printer {} connected", self.id.to_string());
        self.notify(WorkerMsg::Connected);
        Ok(())
    }

    /// Transport dropped. A stored fatal error ends the session here and is returned.
    pub fn on_disconnect(&self) -> Result<()> {
        if let Some(e) = self.fatal.lock().take() {
            error!("printer {} quitting after fatal error", self.id.to_string());
            *self.state.lock() = ConnectionState::Quit;
            self.shutdown.send_replace(true);
            self.notify(WorkerMsg::Quit(self.snapshot()));
            return Err(e);
        }

        let mut state = self.state.lock();
        match *state {
            ConnectionState::Quit | ConnectionState::Paused => {
                trace!("disconnect while {:?}", *state);
            }
            _ => {
                *state = ConnectionState::Disconnected;
                drop(state);
                warn!("printer {} disconnected", self.id.to_string());
                self.notify(WorkerMsg::Disconnected);
            }
        }
        Ok(())
    }

    pub fn pause(&self) -> Result<()> {
        let mut state = self.state.lock();
        match *state {
            ConnectionState::Paused => return Ok(()),
            ConnectionState::Quit => bail!("cannot pause, connection has quit"),
            _ => {}
        }

        if self.transport.is_connected() {
            self.transport
                .unsubscribe(&self.topics.report)
                .context("unsubscribing from report topic")?;
        }
        *state = ConnectionState::Paused;
        drop(state);

        info!("printer {} paused", self.id.to_string());
        self.notify(WorkerMsg::Paused);
        Ok(())
    }

    /// Only a paused connection with a live transport can resume; anything else quits.
    pub fn resume(&self) -> Result<()> {
        let mut state = self.state.lock();
        if *state == ConnectionState::Paused && self.transport.is_connected() {
            self.transport
                .subscribe(&self.topics.report)
                .context("resubscribing to report topic")?;
            *self.last_message.lock() = Instant::now();
            *state = ConnectionState::Connected;
            drop(state);

            info!("printer {} resumed", self.id.to_string());
            self.notify(WorkerMsg::Connected);
            return Ok(());
        }

        let prev = *state;
        drop(state);
        warn!("cannot resume from {:?}, quitting", prev);
        self.request_quit()?;
        bail!("resume from {:?} is not possible, connection quit", prev)
    }

    /// Disconnect, enter `Quit` and wake both tasks. Safe to call more than once;
    /// subscribers get a `Quit` on every call.
    pub fn request_quit(&self) -> Result<()> {
        let prev = std::mem::replace(&mut *self.state.lock(), ConnectionState::Quit);
        if prev == ConnectionState::Quit {
            trace!("printer {} already quit", self.id.to_string());
            self.notify(WorkerMsg::Quit(self.snapshot()));
            return Ok(());
        }
        debug!("printer {} quitting from {:?}", self.id.to_string(), prev);

        self.shutdown.send_replace(true);
        let res = if self.transport.is_connected() {
            self.transport.disconnect().context("disconnecting")
        } else {
            Ok(())
        };
        self.notify(WorkerMsg::Quit(self.snapshot()));
        res
    }

    /// Store a transport failure and drop the connection; surfaces on the next disconnect.
    /// If the disconnect can't be queued the shutdown signal is raised instead, and the
    /// session driver surfaces the error when it wakes.
    pub fn record_fatal(&self, e: anyhow::Error) {
        error!("fatal error on printer {}: {:?}", self.id.to_string(), e);
        {
            let mut fatal = self.fatal.lock();
            if fatal.is_none() {
                *fatal = Some(e);
            }
        }
        if let Err(e) = self.transport.disconnect() {
            warn!("could not request disconnect, signalling shutdown: {:?}", e);
            self.shutdown.send_replace(true);
        }
    }
}

/// MARK: messages
impl PrinterConn {
    /// Fold one message into the snapshot and publish the result
    pub fn on_message(&self, message: &Message) {
        if self.is_quit() {
            trace!("message after quit, dropping");
            return;
        }

        *self.last_message.lock() = Instant::now();
        if self.awaiting_fresh.swap(false, Ordering::SeqCst) {
            debug!("printer {} is reporting again", self.id.to_string());
        }

        let prev = self.snapshot();
        let next = Arc::new(reduce(&prev, message));
        *self.snapshot.write() = next.clone();

        self.notify(WorkerMsg::StatusUpdate(next));
    }

    pub fn publish(&self, command: &Command) -> Result<()> {
        trace!("publishing {:?}", command);
        self.transport
            .publish(&self.topics.request, command.get_payload())
            .with_context(|| format!("publishing {:?}", command))
    }

    pub fn request_full_state(&self) -> Result<()> {
        self.publish(&Command::PushAll)?;
        self.publish(&Command::GetVersion)?;
        Ok(())
    }

    /// One watchdog pass. Returns whether a refresh was requested.
    pub fn watchdog_tick(&self, now: Instant) -> Result<bool> {
        if self.state() != ConnectionState::Connected {
            return Ok(false);
        }

        {
            let mut last = self.last_message.lock();
            if now.saturating_duration_since(*last) <= self.timeout {
                return Ok(false);
            }
            *last = now;
        }
        self.awaiting_fresh.store(true, Ordering::SeqCst);

        warn!(
            "no message from printer {} in {:?}, requesting full state",
            self.id.to_string(),
            self.timeout
        );
        self.request_full_state()?;
        Ok(true)
    }
}
