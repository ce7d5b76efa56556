//! Client for the SAM-BA ROM monitor protocol.
//!
//! All numeric command fields are lowercase hex, zero-padded to eight
//! digits for addresses and sizes and to two digits for byte values.

use crc::{Crc, CRC_16_XMODEM};

use crate::transport::{
    Transport, TransportError, TIMEOUT_CHIP_ERASE, TIMEOUT_LONG, TIMEOUT_NORMAL, TIMEOUT_QUICK,
};

#[derive(Debug, thiserror::Error)]
pub enum SambaError {
    #[error("transport failure")]
    Transport(#[from] TransportError),
    #[error("short response: expected {expected} bytes, got {got}")]
    ShortResponse { expected: usize, got: usize },
    #[error("response does not acknowledge the '{0}' command")]
    Nak(char),
    #[error("malformed response to the '{0}' command")]
    Malformed(char),
    #[error("the connected bootloader does not support {0}")]
    Unsupported(&'static str),
}

/// Extensions advertised by the bootloader's version banner.
///
/// Arduino-derived bootloaders announce them as single letters inside an
/// `[Arduino:...]` bracket; the presence of the bracket also means the
/// board's USB CDC stack caps reads at 63 bytes.
#[derive(Debug, Default, Clone, Copy)]
struct Capabilities {
    chip_erase: bool,
    write_buffer: bool,
    checksum_buffer: bool,
    protect: bool,
    read_buffer_size: usize,
}

impl Capabilities {
    fn parse(version: &str) -> Self {
        let mut caps = Self::default();
        let Some(start) = version.find("[Arduino:") else {
            return caps;
        };
        let extensions = &version[start + "[Arduino:".len()..];
        let Some(end) = extensions.find(']') else {
            return caps;
        };
        for letter in extensions[..end].chars() {
            match letter {
                'X' => caps.chip_erase = true,
                'Y' => caps.write_buffer = true,
                'Z' => caps.checksum_buffer = true,
                'P' => caps.protect = true,
                _ => {}
            }
        }
        caps.read_buffer_size = 63;
        caps
    }
}

/// A connected SAM-BA monitor.
///
/// Creation takes an already-opened transport; the client lives for the
/// whole programming session and serializes every command it issues.
pub struct SamBa {
    transport: Box<dyn Transport>,
    caps: Capabilities,
    version: Option<String>,
}

impl SamBa {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport,
            caps: Capabilities::default(),
            version: None,
        }
    }

    /// Switch the monitor to binary mode and discover its extensions.
    pub fn connect(&mut self) -> Result<(), SambaError> {
        self.set_binary_mode()?;
        let version = self.read_version()?;
        self.caps = Capabilities::parse(&version);
        tracing::info!("connected to SAM-BA monitor: {version}");
        tracing::debug!("capabilities: {:?}", self.caps);
        self.version = Some(version);
        Ok(())
    }

    /// The version banner read during [`connect`](SamBa::connect).
    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn can_chip_erase(&self) -> bool {
        self.caps.chip_erase
    }

    pub fn can_write_buffer(&self) -> bool {
        self.caps.write_buffer
    }

    pub fn can_checksum_buffer(&self) -> bool {
        self.caps.checksum_buffer
    }

    pub fn can_protect(&self) -> bool {
        self.caps.protect
    }

    fn set_binary_mode(&mut self) -> Result<(), SambaError> {
        self.transport.send_command("N")?;
        let reply = self.transport.read_reply(TIMEOUT_QUICK, Some(2))?;
        expect_len(&reply, 2, 'N')?;
        Ok(())
    }

    fn read_version(&mut self) -> Result<String, SambaError> {
        self.transport.send_command("V")?;
        let mut reply = self.transport.read_reply(TIMEOUT_NORMAL, None)?;
        reply.truncate(256);
        strip_terminator(&mut reply);
        let version = String::from_utf8_lossy(&reply).trim_end().to_string();
        if version.is_empty() {
            return Err(SambaError::Malformed('V'));
        }
        Ok(version)
    }

    pub fn read_byte(&mut self, addr: u32) -> Result<u8, SambaError> {
        self.transport.send_command(&format!("o{addr:08x},4"))?;
        let reply = self.transport.read_reply(TIMEOUT_NORMAL, Some(1))?;
        expect_len(&reply, 1, 'o')?;
        Ok(reply[0])
    }

    pub fn write_byte(&mut self, addr: u32, value: u8) -> Result<(), SambaError> {
        self.transport
            .send_command(&format!("O{addr:08x},{value:02x}"))?;
        Ok(())
    }

    pub fn read_word(&mut self, addr: u32) -> Result<u32, SambaError> {
        self.transport.send_command(&format!("w{addr:08x},4"))?;
        let reply = self.transport.read_reply(TIMEOUT_NORMAL, Some(4))?;
        expect_len(&reply, 4, 'w')?;
        Ok(u32::from_le_bytes([reply[0], reply[1], reply[2], reply[3]]))
    }

    pub fn write_word(&mut self, addr: u32, value: u32) -> Result<(), SambaError> {
        self.transport
            .send_command(&format!("W{addr:08x},{value:08x}"))?;
        Ok(())
    }

    /// Read a block of target memory.
    pub fn read(&mut self, addr: u32, data: &mut [u8]) -> Result<(), SambaError> {
        if data.is_empty() {
            return Ok(());
        }
        if self.caps.read_buffer_size == 0 {
            // Power-of-two transfers above 32 bytes wedge some USB CDC
            // stacks; peel off one byte so the remainder is odd-sized.
            if data.len() > 32 && data.len().is_power_of_two() {
                data[0] = self.read_byte(addr)?;
                self.read_chunk(addr + 1, &mut data[1..])?;
            } else {
                self.read_chunk(addr, data)?;
            }
        } else {
            let limit = self.caps.read_buffer_size;
            let mut offset = 0;
            while offset < data.len() {
                let count = limit.min(data.len() - offset);
                self.read_chunk(addr + offset as u32, &mut data[offset..offset + count])?;
                offset += count;
            }
        }
        Ok(())
    }

    fn read_chunk(&mut self, addr: u32, data: &mut [u8]) -> Result<(), SambaError> {
        self.transport
            .send_command(&format!("R{addr:08x},{:08x}", data.len()))?;
        let reply = self.transport.read_reply(TIMEOUT_NORMAL, Some(data.len()))?;
        expect_len(&reply, data.len(), 'R')?;
        data.copy_from_slice(&reply[..data.len()]);
        Ok(())
    }

    /// Write a block of target memory.
    pub fn write(&mut self, addr: u32, data: &[u8]) -> Result<(), SambaError> {
        self.transport
            .send_command(&format!("S{addr:08x},{:08x}", data.len()))?;
        self.transport.send_data(data)?;
        Ok(())
    }

    /// Start execution at `addr`. Returns without waiting for completion.
    pub fn go(&mut self, addr: u32) -> Result<(), SambaError> {
        self.transport.send_command(&format!("G{addr:08x}"))?;
        Ok(())
    }

    /// Erase the entire flash, starting at `addr`.
    pub fn chip_erase(&mut self, addr: u32) -> Result<(), SambaError> {
        if !self.caps.chip_erase {
            return Err(SambaError::Unsupported("chip erase"));
        }
        self.transport.send_command(&format!("X{addr:08x}"))?;
        let reply = self.transport.read_reply(TIMEOUT_CHIP_ERASE, Some(3))?;
        expect_ack(&reply, 3, 'X')
    }

    /// Ask the bootloader to copy `size` bytes from `src` to `dst` on the
    /// target itself. Two-phase: the source is staged first.
    pub fn write_buffer(&mut self, src: u32, dst: u32, size: u32) -> Result<(), SambaError> {
        if !self.caps.write_buffer {
            return Err(SambaError::Unsupported("buffer write"));
        }
        self.transport.send_command(&format!("Y{src:08x},0"))?;
        let reply = self.transport.read_reply(TIMEOUT_NORMAL, Some(3))?;
        expect_ack(&reply, 3, 'Y')?;
        self.transport
            .send_command(&format!("Y{dst:08x},{size:08x}"))?;
        let reply = self.transport.read_reply(TIMEOUT_LONG, Some(3))?;
        expect_ack(&reply, 3, 'Y')
    }

    /// Have the bootloader checksum `size` bytes at `addr`.
    pub fn checksum_buffer(&mut self, addr: u32, size: u32) -> Result<u32, SambaError> {
        if !self.caps.checksum_buffer {
            return Err(SambaError::Unsupported("buffer checksum"));
        }
        self.transport
            .send_command(&format!("Z{addr:08x},{size:08x}"))?;
        let reply = self.transport.read_reply(TIMEOUT_LONG, Some(12))?;
        expect_ack(&reply, 12, 'Z')?;
        let digits = std::str::from_utf8(&reply[1..9]).map_err(|_| SambaError::Malformed('Z'))?;
        u32::from_str_radix(digits, 16).map_err(|_| SambaError::Malformed('Z'))
    }
}

/// Strip the CR/LF-style terminator pair, comparing before truncating.
fn strip_terminator(reply: &mut Vec<u8>) {
    if reply.len() >= 2 && reply[reply.len() - 2..] == [0x0a, 0x0c] {
        reply.truncate(reply.len() - 2);
    }
}

fn expect_len(reply: &[u8], expected: usize, command: char) -> Result<(), SambaError> {
    if reply.len() < expected {
        tracing::debug!(
            "'{command}' reply too short: {} of {expected} bytes",
            reply.len()
        );
        return Err(SambaError::ShortResponse {
            expected,
            got: reply.len(),
        });
    }
    Ok(())
}

fn expect_ack(reply: &[u8], expected: usize, command: char) -> Result<(), SambaError> {
    expect_len(reply, expected, command)?;
    if reply[0] != command as u8 {
        return Err(SambaError::Nak(command));
    }
    Ok(())
}

/// CRC-16 CCITT (XModem flavor) used by the checksum extension.
pub(crate) fn crc16(data: &[u8]) -> u16 {
    Crc::<u16>::new(&CRC_16_XMODEM).checksum(data)
}
