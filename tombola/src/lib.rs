#![allow(clippy::new_without_default)]

/// Identifier of a betting agency. One agency maps to one connection in a given run.
pub type AgencyId = u32;

pub mod bets;
pub mod config;
pub mod logging;
pub mod monitor;
pub mod net;
pub mod server;
pub mod session;
