pub mod bambu_listener;
pub mod bambu_proto;
pub mod command;
pub mod message;
pub mod parse;

use anyhow::{anyhow, bail, ensure, Context, Result};
use tracing::{debug, error, info, trace, warn};

pub use bambu_proto::BambuClient;
