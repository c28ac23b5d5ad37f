#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! holocron library: the tunnel lifecycle building blocks behind the agent
//! binary.
//!
//! - `tunnel`: command facade (status, start, stop, test)
//! - `launch`: start/stop engine and establishment verification
//! - `detect`: process-table detection with stale lock healing
//! - `diagnostics`: TCP and HTTP probes through a SOCKS endpoint
//! - `server` / `protocol`: framed controller channel
//! - `config`: configuration loading

pub mod artifacts;
pub mod config;
pub mod detect;
pub mod diagnostics;
pub mod error;
pub mod extract;
pub mod launch;
pub mod logs;
pub mod ports;
pub mod process;
pub mod profile;
pub mod protocol;
pub mod server;
pub mod tunnel;
pub mod uri;
pub mod util;

// Re-export key types at crate root for convenience.
pub use config::Config;
pub use error::TunnelError;
pub use profile::{BackendKind, ConnectionProfile};
pub use tunnel::{TunnelManager, TunnelState};
