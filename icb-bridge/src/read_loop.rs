//! The group read loop.
//!
//! A single task owns the inbound side of the link. It reads one frame,
//! dispatches it, and only then reads the next, so packets are handled in
//! arrival order and a ping is answered before anything after it is read.

use icb_proto::packet::{self, ReadError};
use tokio::task::JoinHandle;

use crate::dispatch;
use crate::link::{LinkWriter, PacketSource};

/// Why the read loop stopped.
#[derive(Debug)]
pub struct ReadLoopExit {
    /// The framing failure that ended the loop.
    pub error: ReadError,
    /// Packets decoded and dispatched before it stopped.
    pub packets: u64,
}

/// Reads and dispatches packets until the source fails.
///
/// Undecodable payloads are logged and skipped. A read failure leaves the
/// stream unusable, so it ends the loop.
pub async fn run<S: PacketSource>(mut source: S, writer: LinkWriter) -> ReadLoopExit {
    let mut packets = 0;
    loop {
        let payload = match source.read().await {
            Ok(payload) => payload,
            Err(error) => {
                tracing::error!(error = %error, packets, "reading from group server failed");
                return ReadLoopExit { error, packets };
            }
        };

        match packet::decode(&payload) {
            Ok(packet) => {
                packets += 1;
                dispatch::dispatch(&packet, &writer).await;
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    raw = ?String::from_utf8_lossy(&payload),
                    "error decoding packet"
                );
            }
        }
    }
}

/// Spawns [`run`] as a background task.
pub fn spawn<S>(source: S, writer: LinkWriter) -> JoinHandle<ReadLoopExit>
where
    S: PacketSource + 'static,
{
    tokio::spawn(run(source, writer))
}
