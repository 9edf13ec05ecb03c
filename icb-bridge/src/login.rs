//! Joining the configured group.

use icb_proto::packet::Packet;

use crate::link::{LinkError, LinkWriter};

/// Sends the login packet that joins `group` as `nick`.
///
/// The server's acknowledgment arrives later through the read loop.
///
/// # Errors
///
/// Returns [`LinkError`] if the packet cannot be written.
pub async fn login(writer: &LinkWriter, nick: &str, group: &str) -> Result<(), LinkError> {
    tracing::info!(nick = %nick, "joining: {group:?}");
    writer.write(&Packet::login(nick, group)).await
}
