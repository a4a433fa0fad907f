use anyhow::{anyhow, bail, ensure, Context, Result};
use tracing::{debug, error, info, trace, warn};

use rumqttc::{
    tokio_rustls::rustls::{
        self,
        client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
        crypto::{verify_tls12_signature, verify_tls13_signature, WebPkiSupportedAlgorithms},
        pki_types::{CertificateDer, ServerName, UnixTime},
        DigitallySignedStruct, SignatureScheme,
    },
    AsyncClient, MqttOptions, QoS,
};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{sync::RwLock, task::JoinHandle};

use crate::{
    config::{printer_config::PrinterConfigBambu, printer_id::PrinterId, WatchdogConfig},
    conn_manager::{
        conn_state::{ConnectionState, PrinterConn},
        transport::{Topics, Transport},
        watchdog::run_watchdog,
        worker_message::WorkerMsg,
    },
    status::PrinterSnapshot,
};

use super::{bambu_listener::BambuListener, command::Command};

pub const MQTT_USER: &str = "bblp";

/// Accepts the self-signed certificate every printer presents on the LAN.
/// The chain is not checked, handshake signatures still are.
#[derive(Debug)]
pub struct LanCertVerifier {
    algorithms: WebPkiSupportedAlgorithms,
}

impl LanCertVerifier {
    pub fn new() -> Self {
        Self {
            algorithms: rustls::crypto::ring::default_provider().signature_verification_algorithms,
        }
    }
}

impl ServerCertVerifier for LanCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        trace!("accepting printer certificate for {:?}", server_name);
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// MARK: transport

/// [`Transport`] over the rumqttc request queue
pub struct MqttTransport {
    client: AsyncClient,
    connected: AtomicBool,
}

impl MqttTransport {
    pub fn new(client: AsyncClient) -> Self {
        Self {
            client,
            connected: AtomicBool::new(false),
        }
    }

    /// set by the session driver on ConnAck and on disconnect
    pub(super) fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }
}

impl Transport for MqttTransport {
    fn subscribe(&self, topic: &str) -> Result<()> {
        self.client.try_subscribe(topic, QoS::AtMostOnce)?;
        Ok(())
    }

    fn unsubscribe(&self, topic: &str) -> Result<()> {
        self.client.try_unsubscribe(topic)?;
        Ok(())
    }

    fn publish(&self, topic: &str, payload: String) -> Result<()> {
        self.client
            .try_publish(topic, QoS::AtMostOnce, false, payload)?;
        Ok(())
    }

    fn disconnect(&self) -> Result<()> {
        self.client.try_disconnect()?;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// MARK: client

/// One printer session: the MQTT session driver plus its watchdog
pub struct BambuClient {
    printer_cfg: Arc<RwLock<PrinterConfigBambu>>,
    conn: Arc<PrinterConn>,
    listener: Option<JoinHandle<Result<()>>>,
    watchdog: Option<JoinHandle<()>>,
}

impl BambuClient {
    pub async fn new_and_init(
        printer_cfg: Arc<RwLock<PrinterConfigBambu>>,
        watchdog_cfg: &WatchdogConfig,
        tx: tokio::sync::mpsc::UnboundedSender<(PrinterId, WorkerMsg)>,
    ) -> Result<Self> {
        debug!("init lan mqtt listener");
        let client_id = format!("bambu-watcher-{}", nanoid::nanoid!(8));

        let printer = printer_cfg.read().await;

        if printer.host.is_empty() {
            bail!("missing host");
        }
        if printer.serial.is_empty() {
            bail!("missing serial");
        }

        let mut mqttoptions = MqttOptions::new(client_id, &printer.host, printer.port);
        mqttoptions.set_keep_alive(Duration::from_secs(5));
        mqttoptions.set_credentials(MQTT_USER, &printer.access_code);

        let client_config = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(LanCertVerifier::new()))
            .with_no_client_auth();

        let transport = rumqttc::Transport::tls_with_config(rumqttc::TlsConfiguration::Rustls(
            Arc::new(client_config),
        ));
        mqttoptions.set_transport(transport);

        // full reports from the H2D are larger than the default limit
        mqttoptions.set_max_packet_size(100 * 1024, 100 * 1024);

        debug!("connecting, printer = {}", &printer.name);
        let (client, eventloop) = AsyncClient::new(mqttoptions, 10);

        let transport = Arc::new(MqttTransport::new(client));
        let conn = Arc::new(PrinterConn::new(
            printer.id.clone(),
            transport.clone(),
            Topics::for_serial(&printer.serial),
            PrinterSnapshot::for_serial(&printer.serial),
            watchdog_cfg.timeout(),
            tx,
        ));
        drop(printer);

        let listener = BambuListener::new(
            conn.clone(),
            transport,
            eventloop,
            watchdog_cfg.reconnect_delay(),
        );
        let listener = tokio::task::spawn(listener.run());
        let watchdog = tokio::task::spawn(run_watchdog(conn.clone(), watchdog_cfg.interval()));

        Ok(Self {
            printer_cfg,
            conn,
            listener: Some(listener),
            watchdog: Some(watchdog),
        })
    }

    pub fn id(&self) -> &PrinterId {
        self.conn.id()
    }

    pub async fn name(&self) -> String {
        self.printer_cfg.read().await.name.clone()
    }

    pub fn conn(&self) -> &Arc<PrinterConn> {
        &self.conn
    }

    pub fn snapshot(&self) -> Arc<PrinterSnapshot> {
        self.conn.snapshot()
    }

    pub fn state(&self) -> ConnectionState {
        self.conn.state()
    }

    pub fn pause(&self) -> Result<()> {
        self.conn.pause()
    }

    pub fn resume(&self) -> Result<()> {
        self.conn.resume()
    }

    pub fn publish(&self, command: Command) -> Result<()> {
        self.conn.publish(&command)
    }

    /// Disconnect and wait for both tasks to finish
    pub async fn quit(&mut self) -> Result<()> {
        if let Err(e) = self.conn.request_quit() {
            warn!("error while disconnecting: {:?}", e);
        }
        let watchdog = match self.watchdog.take() {
            Some(handle) => handle.await.context("joining watchdog"),
            None => Ok(()),
        };
        let listener = self.join().await;
        watchdog?;
        listener
    }

    /// Wait for the session driver to end; returns the fatal error that ended it, if any
    pub async fn join(&mut self) -> Result<()> {
        match self.listener.take() {
            Some(handle) => handle.await.context("joining session driver")?,
            None => Ok(()),
        }
    }
}
