//! ICB bridge library.
//!
//! Relays a single ICB group and a single Matrix room: the read loop
//! handles packets from the ICB server, and the transaction receiver
//! forwards room messages pushed by the home server into the group.

pub mod config;
pub mod dispatch;
pub mod link;
pub mod login;
pub mod read_loop;
pub mod registration;
pub mod supervisor;
pub mod transactions;
