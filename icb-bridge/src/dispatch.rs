//! Reactions to packets received from the ICB server.
//!
//! [`react`] decides what a packet means; [`dispatch`] carries it out.
//! Only a server ping causes a write; everything else is console output.

use icb_proto::packet::{CommandCode, Packet};

use crate::link::LinkWriter;

/// What the bridge does in response to one packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reaction {
    /// Nothing observable.
    Silent,
    /// Emit a log line.
    Log(String),
    /// Print a line to standard output.
    Print(String),
    /// Write a packet back to the server before reading the next one.
    Reply(Packet),
}

/// Maps a packet to its reaction.
///
/// Packets with too few fields for their code are [`Reaction::Silent`].
#[must_use]
pub fn react(packet: &Packet) -> Reaction {
    match packet.code() {
        CommandCode::Open => packet.field(1).map_or_else(
            || under_length(packet),
            |sender| Reaction::Log(format!("{sender}> {}", packet.join_from(2))),
        ),
        CommandCode::Personal => packet.field(1).map_or_else(
            || under_length(packet),
            |sender| {
                Reaction::Print(format!(
                    "private msg from: {sender}> {}",
                    packet.join_from(2)
                ))
            },
        ),
        CommandCode::Status => Reaction::Print(format!("-> {}", packet.join_from(1))),
        CommandCode::Error => Reaction::Print(format!("ERROR> {}", packet.join_from(1))),
        CommandCode::Protocol => match (packet.field(2), packet.field(3)) {
            (Some(host), Some(server)) => {
                Reaction::Print(format!("-> Connected to {host} ({server})"))
            }
            _ => under_length(packet),
        },
        CommandCode::Beep => Reaction::Print("-> BEEP".to_string()),
        CommandCode::Ping => Reaction::Reply(Packet::pong()),
        CommandCode::LoginOk
        | CommandCode::NoOp
        | CommandCode::Important
        | CommandCode::Exit
        | CommandCode::Command
        | CommandCode::CommandOutput
        | CommandCode::Pong
        | CommandCode::Unknown(_) => Reaction::Silent,
    }
}

fn under_length(packet: &Packet) -> Reaction {
    tracing::debug!(
        code = %packet.code(),
        fields = packet.fields().len(),
        "ignoring packet with too few fields"
    );
    Reaction::Silent
}

/// Reacts to one packet.
///
/// A [`Reaction::Reply`] is written before this returns, so a ping is
/// answered before the read loop reads again. Write failures are logged.
pub async fn dispatch(packet: &Packet, writer: &LinkWriter) {
    match react(packet) {
        Reaction::Silent => {}
        Reaction::Log(line) => tracing::info!("{line}"),
        Reaction::Print(line) => println!("{line}"),
        Reaction::Reply(reply) => {
            if let Err(e) = writer.write(&reply).await {
                tracing::warn!(code = %reply.code(), error = %e, "failed to reply to group server");
            }
        }
    }
}
