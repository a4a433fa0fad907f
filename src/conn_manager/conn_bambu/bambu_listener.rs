use anyhow::{anyhow, bail, ensure, Context, Result};
use tracing::{debug, error, info, trace, warn};

use rumqttc::{
    ConnectReturnCode, ConnectionError, Event, EventLoop, Incoming, Outgoing, SubscribeReasonCode,
};
use std::{sync::Arc, time::Duration};

use crate::conn_manager::{conn_state::PrinterConn, transport::Transport};

use super::{bambu_proto::MqttTransport, parse::parse_message};

/// how long to keep polling after quit so the Disconnect packet goes out
const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

/// Session driver: owns the MQTT event loop and feeds the connection
pub(super) struct BambuListener {
    conn: Arc<PrinterConn>,
    transport: Arc<MqttTransport>,
    eventloop: EventLoop,
    reconnect_delay: Duration,
}

impl BambuListener {
    pub fn new(
        conn: Arc<PrinterConn>,
        transport: Arc<MqttTransport>,
        eventloop: EventLoop,
        reconnect_delay: Duration,
    ) -> Self {
        Self {
            conn,
            transport,
            eventloop,
            reconnect_delay,
        }
    }

    /// Runs until the connection quits. A fatal transport error is returned once.
    pub(super) async fn run(mut self) -> Result<()> {
        let mut shutdown = self.conn.subscribe_shutdown();

        loop {
            if *shutdown.borrow() {
                if self.conn.has_fatal() {
                    // the disconnect never got queued, so no Disconnect event will arrive
                    self.transport.set_connected(false);
                    return self.conn.on_disconnect();
                }
                debug!("Listener task got kill command");
                if self.transport.is_connected() {
                    self.flush_disconnect().await;
                }
                break;
            }

            let event = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                event = self.eventloop.poll() => event,
            };

            match event {
                Ok(event) => self.handle_event(event)?,
                Err(e) => {
                    self.handle_error(e)?;
                    if self.conn.is_quit() {
                        break;
                    }
                    self.eventloop.clean();
                    tokio::select! {
                        _ = tokio::time::sleep(self.reconnect_delay) => {
                            debug!("Reconnecting...");
                        }
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }

        self.transport.set_connected(false);
        debug!("session driver for {} stopped", self.conn.id().to_string());
        Ok(())
    }

    /// MARK: main event handler
    fn handle_event(&mut self, event: Event) -> Result<()> {
        match event {
            Event::Incoming(Incoming::ConnAck(c)) => {
                debug!("got ConnAck: {:?}", c.code);
                if c.code == ConnectReturnCode::Success {
                    self.transport.set_connected(true);
                    if let Err(e) = self.conn.on_connect() {
                        self.conn.record_fatal(e);
                    }
                } else {
                    self.conn
                        .record_fatal(anyhow!("connection refused: {:?}", c.code));
                }
            }
            Event::Incoming(Incoming::SubAck(s)) => {
                debug!("got SubAck");
                if s.return_codes
                    .iter()
                    .any(|&r| r == SubscribeReasonCode::Failure)
                {
                    error!("Failed to subscribe to topic");
                } else if let Err(e) = self.conn.request_full_state() {
                    self.conn.record_fatal(e);
                }
            }
            Event::Incoming(Incoming::Publish(p)) => {
                if p.topic != self.conn.topics().report {
                    trace!("publish on unexpected topic: {}", p.topic);
                    return Ok(());
                }
                let msg = parse_message(&p);
                self.conn.on_message(&msg);
            }
            Event::Incoming(Incoming::Disconnect) | Event::Outgoing(Outgoing::Disconnect) => {
                debug!("disconnect");
                self.transport.set_connected(false);
                self.conn.on_disconnect()?;
            }
            Event::Incoming(Incoming::PingResp) | Event::Outgoing(_) => {}
            Event::Incoming(event) => {
                trace!("incoming other event: {:?}", event);
            }
        }
        Ok(())
    }

    fn handle_error(&mut self, e: ConnectionError) -> Result<()> {
        let fatal = matches!(
            e,
            ConnectionError::ConnectionRefused(_) | ConnectionError::Tls(_)
        );
        if fatal {
            self.conn
                .record_fatal(anyhow::Error::new(e).context("mqtt connection"));
        } else {
            warn!("Error in eventloop: {:?}", e);
        }
        self.transport.set_connected(false);
        self.conn.on_disconnect()
    }

    async fn flush_disconnect(&mut self) {
        let flush = async {
            loop {
                match self.eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        };
        if tokio::time::timeout(DISCONNECT_GRACE, flush).await.is_err() {
            trace!("disconnect not flushed");
        }
    }
}
