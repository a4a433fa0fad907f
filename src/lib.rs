#![allow(unused_variables)]
#![allow(unused_imports)]
#![allow(unused_mut)]
#![allow(dead_code)]
#![allow(unused_doc_comments)]

pub mod config;
pub mod conn_manager;
pub mod file_transfer;
pub mod logging;
pub mod status;

pub use conn_manager::{
    conn_bambu::{command::Command, BambuClient},
    ConnectionState, PrinterConn, WorkerMsg,
};
pub use status::{reduce, PrinterSnapshot};
