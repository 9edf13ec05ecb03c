//! Shared protocol definitions for the ICB bridge.
//!
//! [`packet`] covers the ICB wire format; [`appservice`] covers the
//! transactions a Matrix home server pushes to an application service.

pub mod appservice;
pub mod packet;
