//! # parley-core
//!
//! Foundation types shared by every parley crate:
//!
//! - [`ids`]: connection ids and human-enterable session codes
//! - [`protocol`]: the tagged JSON envelopes exchanged over the socket
//! - [`errors`]: the relay error taxonomy and its stable wire codes
//! - [`logging`]: `tracing` subscriber setup

#![deny(unsafe_code)]

pub mod constants;
pub mod errors;
pub mod ids;
pub mod logging;
pub mod protocol;

pub use errors::RelayError;
pub use ids::{ConnectionId, SessionCode};
pub use protocol::{Inbound, Outbound, ParsedFrame, Role, SessionSettings, TranslationMode};
