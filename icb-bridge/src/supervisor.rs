//! Process supervision.
//!
//! The read loop, the group writer, and the transaction receiver run as
//! separate tasks. The bridge is only useful while all of them are alive,
//! so whichever stops first decides how the process exits.

use tokio::task::JoinHandle;

use crate::read_loop::ReadLoopExit;

/// Why the bridge is shutting down.
#[derive(Debug)]
pub enum Shutdown {
    /// The read loop hit a framing failure.
    ReadLoop(ReadLoopExit),
    /// The read loop task panicked or was cancelled.
    ReadLoopAborted(String),
    /// The group writer task stopped after a failed write.
    Writer,
    /// The transaction receiver stopped.
    Server,
    /// An interrupt signal was received.
    Interrupted,
}

impl Shutdown {
    /// Process exit status for this shutdown.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Interrupted => 0,
            Self::ReadLoop(_) | Self::ReadLoopAborted(_) | Self::Writer | Self::Server => 1,
        }
    }
}

/// Waits until the read loop, the writer, or the receiver stops, or Ctrl-C
/// arrives.
///
/// The writer task only ends once its socket has failed, since the read
/// loop and the receiver each hold a [`LinkWriter`](crate::link::LinkWriter).
pub async fn supervise(
    read_task: JoinHandle<ReadLoopExit>,
    writer_task: JoinHandle<()>,
    server_task: JoinHandle<()>,
) -> Shutdown {
    let shutdown = tokio::select! {
        result = read_task => match result {
            Ok(exit) => Shutdown::ReadLoop(exit),
            Err(e) => Shutdown::ReadLoopAborted(e.to_string()),
        },
        _ = writer_task => Shutdown::Writer,
        _ = server_task => Shutdown::Server,
        _ = tokio::signal::ctrl_c() => Shutdown::Interrupted,
    };

    match &shutdown {
        Shutdown::ReadLoop(exit) => {
            tracing::error!(error = %exit.error, packets = exit.packets, "group read loop stopped");
        }
        Shutdown::ReadLoopAborted(reason) => {
            tracing::error!(reason = %reason, "group read loop aborted");
        }
        Shutdown::Writer => tracing::error!("group writer stopped"),
        Shutdown::Server => tracing::error!("transaction receiver stopped"),
        Shutdown::Interrupted => tracing::info!("interrupted, shutting down"),
    }
    shutdown
}
