#![allow(unused_variables)]
#![allow(unused_imports)]
#![allow(unused_mut)]
#![allow(dead_code)]
#![allow(unused_doc_comments)]

use anyhow::{anyhow, bail, ensure, Context, Result};
use tracing::{debug, error, info, trace, warn};

use std::{collections::HashMap, env, path::PathBuf};

use bambu_watcher::{
    config::{printer_id::PrinterId, AppConfig},
    logging, BambuClient, WorkerMsg,
};

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    let config = match env::args().nth(1).map(PathBuf::from) {
        Some(path) => AppConfig::load_from_file(&path)?,
        None => AppConfig::from_env().context("no config file given, and env incomplete")?,
    };

    let _guard = logging::init_logs(config.log_dir());

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<(PrinterId, WorkerMsg)>();

    let mut clients = Vec::new();
    let mut names = HashMap::new();
    for printer in config.printers() {
        let name = printer.read().await.name.clone();
        match BambuClient::new_and_init(printer, config.watchdog(), tx.clone()).await {
            Ok(client) => {
                info!("started session for {}", name);
                names.insert(client.id().clone(), name);
                clients.push(client);
            }
            Err(e) => error!("could not start session for {}: {:?}", name, e),
        }
    }
    drop(tx);

    if clients.is_empty() {
        bail!("no printers to watch");
    }

    let mut ended = 0;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received ctrl-c, shutting down");
                break;
            }
            msg = rx.recv() => {
                let Some((id, msg)) = msg else {
                    debug!("all sessions ended");
                    break;
                };
                let name = names.get(&id).map(|s| s.as_str()).unwrap_or("?");
                match msg {
                    WorkerMsg::StatusUpdate(snapshot) => info!("{}: {}", name, snapshot.summary()),
                    WorkerMsg::Quit(snapshot) => {
                        warn!("{}: session ended, last state: {}", name, snapshot.summary());
                        ended += 1;
                        if ended == clients.len() {
                            break;
                        }
                    }
                    other => info!("{}: {:?}", name, other),
                }
            }
        }
    }

    for client in clients.iter_mut() {
        if let Err(e) = client.quit().await {
            error!("session {} ended with error: {:?}", client.id().to_string(), e);
        }
    }

    Ok(())
}
