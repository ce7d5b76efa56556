//! Byte-stream transport to the SAM-BA ROM monitor.
//!
//! Host to target: an ASCII command terminated by `#`, optionally followed
//! by a raw binary payload. Target to host: raw bytes, collected against a
//! per-command timeout budget.

#[cfg(test)]
pub(crate) mod mock;
mod serial;

pub use serial::SerialTransport;

use std::time::Duration;

/// Reply budget for sync and no-op commands.
pub(crate) const TIMEOUT_QUICK: Duration = Duration::from_millis(100);
/// Reply budget for memory access commands.
pub(crate) const TIMEOUT_NORMAL: Duration = Duration::from_secs(1);
/// Reply budget for region erase and buffer commands.
pub(crate) const TIMEOUT_LONG: Duration = Duration::from_secs(5);
/// Reply budget for a full chip erase.
pub(crate) const TIMEOUT_CHIP_ERASE: Duration = Duration::from_secs(300);

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("no response from the target within {0:?}")]
    Timeout(Duration),
    #[error("the serial connection failed")]
    Io(#[from] std::io::Error),
    #[error("the serial port could not be opened")]
    Port(#[from] serialport::Error),
    #[error("the connection to the target was lost")]
    Disconnected,
}

/// The byte-stream contract the SAM-BA client drives.
///
/// Commands are strictly serialized: the next command is not sent until the
/// previous one's reply has been consumed or timed out.
pub trait Transport: Send {
    /// Send an ASCII command, appending the `#` terminator.
    fn send_command(&mut self, command: &str) -> Result<(), TransportError>;

    /// Send a raw binary payload following a command.
    fn send_data(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Collect reply bytes until `expected` bytes have arrived, a trailing
    /// NUL is seen after at least two bytes, or `timeout` elapses.
    ///
    /// A timeout with nothing accumulated is an error; a timeout with a
    /// partial reply returns the partial reply and leaves length checks to
    /// the caller.
    fn read_reply(
        &mut self,
        timeout: Duration,
        expected: Option<usize>,
    ) -> Result<Vec<u8>, TransportError>;
}
