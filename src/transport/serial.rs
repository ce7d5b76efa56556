//! serialport-backed transport with a background reader thread.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serialport::{FlowControl, SerialPort};

use super::{Transport, TransportError};
use crate::buffer::ByteBuffer;

/// Baud rate the SAM-BA monitor runs at.
pub const BAUD_RATE: u32 = 921_600;

/// Quiet time preceding each host write.
const WRITE_DELAY: Duration = Duration::from_millis(50);

/// Poll interval of the reader thread's blocking reads.
const READ_POLL: Duration = Duration::from_millis(10);

/// A [`Transport`] over a serial port.
///
/// A single long-lived reader thread drains the port into a channel; the
/// command issuer accumulates the channel's chunks into an input buffer
/// until a reply is complete. Dropping the transport stops the reader.
pub struct SerialTransport {
    writer: Box<dyn SerialPort>,
    incoming: Receiver<Vec<u8>>,
    input: ByteBuffer,
    scratch: ByteBuffer,
    stop: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
}

impl SerialTransport {
    /// Open `path` with the settings the monitor expects: 921600 baud, 8N1,
    /// hardware flow control.
    pub fn open(path: &str) -> Result<Self, TransportError> {
        let writer = serialport::new(path, BAUD_RATE)
            .flow_control(FlowControl::Hardware)
            .timeout(READ_POLL)
            .open()?;
        let reader = writer.try_clone()?;
        Ok(Self::from_port(reader, writer))
    }

    /// Build a transport from an already-opened port pair.
    pub fn from_port(reader: Box<dyn SerialPort>, writer: Box<dyn SerialPort>) -> Self {
        let (sender, incoming) = mpsc::channel();
        let stop = Arc::new(AtomicBool::new(false));
        let reader = {
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || read_loop(reader, sender, stop))
        };
        Self {
            writer,
            incoming,
            input: ByteBuffer::new(),
            scratch: ByteBuffer::new(),
            stop,
            reader: Some(reader),
        }
    }

    /// Discard bytes left over from a previous exchange.
    fn discard_stale(&mut self) {
        while self.incoming.try_recv().is_ok() {}
        self.input.reset();
    }
}

impl Transport for SerialTransport {
    fn send_command(&mut self, command: &str) -> Result<(), TransportError> {
        tracing::trace!("command: {command}#");
        self.discard_stale();
        self.scratch.reset();
        self.scratch.copy(command.as_bytes());
        self.scratch.push(b'#');
        // The monitor drops bytes that arrive while it is still chewing on
        // the previous message.
        std::thread::sleep(WRITE_DELAY);
        self.writer.write_all(self.scratch.view())?;
        self.writer.flush()?;
        Ok(())
    }

    fn send_data(&mut self, data: &[u8]) -> Result<(), TransportError> {
        tracing::trace!("payload: {} bytes", data.len());
        std::thread::sleep(WRITE_DELAY);
        self.writer.write_all(data)?;
        self.writer.flush()?;
        Ok(())
    }

    fn read_reply(
        &mut self,
        timeout: Duration,
        expected: Option<usize>,
    ) -> Result<Vec<u8>, TransportError> {
        let deadline = Instant::now() + timeout;
        loop {
            if reply_complete(self.input.view(), expected) {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            match self.incoming.recv_timeout(deadline - now) {
                Ok(chunk) => self.input.copy(&chunk),
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => return Err(TransportError::Disconnected),
            }
        }

        let reply = match expected {
            // Consume exactly the expected count; later bytes stay queued.
            Some(count) => {
                let mut reply = Vec::with_capacity(count);
                while reply.len() < count {
                    match self.input.shift() {
                        Some(byte) => reply.push(byte),
                        None => break,
                    }
                }
                reply
            }
            None => {
                let reply = self.input.view().to_vec();
                self.input.reset();
                reply
            }
        };

        if reply.is_empty() {
            return Err(TransportError::Timeout(timeout));
        }
        Ok(reply)
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }
}

/// A reply is complete once the expected size is reached or a NUL
/// terminator trails at least two bytes of payload.
fn reply_complete(accumulated: &[u8], expected: Option<usize>) -> bool {
    if let Some(count) = expected {
        if accumulated.len() >= count {
            return true;
        }
    }
    accumulated.len() > 2 && accumulated.last() == Some(&0)
}

fn read_loop(mut port: Box<dyn SerialPort>, sender: Sender<Vec<u8>>, stop: Arc<AtomicBool>) {
    let mut chunk = [0u8; 256];
    while !stop.load(Ordering::Relaxed) {
        match port.read(&mut chunk) {
            Ok(0) => break,
            Ok(count) => {
                if sender.send(chunk[..count].to_vec()).is_err() {
                    break;
                }
            }
            Err(error) if error.kind() == std::io::ErrorKind::TimedOut => continue,
            Err(error) if error.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(error) => {
                tracing::debug!("serial reader stopped: {error}");
                break;
            }
        }
    }
}
