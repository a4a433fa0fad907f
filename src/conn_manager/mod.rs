pub mod conn_bambu;
pub mod conn_state;
pub mod transport;
pub mod watchdog;
pub mod worker_message;

use anyhow::{anyhow, bail, ensure, Context, Result};
use tracing::{debug, error, info, trace, warn};

pub use conn_state::{ConnectionState, PrinterConn};
pub use transport::{Topics, Transport};
pub use worker_message::WorkerMsg;
