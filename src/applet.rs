//! The word-copy applet: a Thumb code blob parked in target SRAM.
//!
//! The SAM-BA monitor has no command that feeds the NVM controller's write
//! buffer, so the engine uploads this loop once per session and launches it
//! to move words from an SRAM page buffer into the memory-mapped buffer.
//! The blob ends in five parameter cells the host pokes between runs.

use crate::samba::{SamBa, SambaError};

/// Thumb-1 machine code of the copy loop; the trailing 20 bytes are the
/// stack, reset-vector, destination, source and word-count cells.
const CODE: [u8; 52] = [
    0x09, 0x48, 0x0a, 0x49, 0x0a, 0x4a, 0x02, 0xe0, // ldr r0/r1/r2; b check
    0x08, 0xc9, 0x08, 0xc0, 0x01, 0x3a, 0x00, 0x2a, // ldmia; stmia; subs; cmp
    0xfa, 0xd1, 0x04, 0x48, 0x00, 0x28, 0x01, 0xd1, // bne copy; done check
    0x01, 0x48, 0x85, 0x46, 0x70, 0x47, 0xc0, 0x46, // mov sp; bx lr; nop
    0x00, 0x00, 0x00, 0x00, // stack
    0x00, 0x00, 0x00, 0x00, // reset vector
    0x00, 0x00, 0x00, 0x00, // destination
    0x00, 0x00, 0x00, 0x00, // source
    0x00, 0x00, 0x00, 0x00, // word count
];

const OFF_START: u32 = 0x00;
const OFF_STACK: u32 = 0x20;
const OFF_RESET: u32 = 0x24;
const OFF_DST: u32 = 0x28;
const OFF_SRC: u32 = 0x2c;
const OFF_WORDS: u32 = 0x30;

/// Host-side handle to the applet image at a fixed SRAM base.
///
/// The code blob is uploaded lazily by the first parameter write and never
/// again for the lifetime of the session.
pub(crate) struct WordCopyApplet {
    addr: u32,
    installed: bool,
}

impl WordCopyApplet {
    pub fn new(addr: u32) -> Self {
        Self {
            addr,
            installed: false,
        }
    }

    /// Size of the applet image, parameter cells included.
    pub fn size() -> u32 {
        CODE.len() as u32
    }

    pub fn set_dst_addr(&mut self, samba: &mut SamBa, dst: u32) -> Result<(), SambaError> {
        self.write_cell(samba, OFF_DST, dst)
    }

    pub fn set_src_addr(&mut self, samba: &mut SamBa, src: u32) -> Result<(), SambaError> {
        self.write_cell(samba, OFF_SRC, src)
    }

    pub fn set_words(&mut self, samba: &mut SamBa, words: u32) -> Result<(), SambaError> {
        self.write_cell(samba, OFF_WORDS, words)
    }

    pub fn set_stack(&mut self, samba: &mut SamBa, stack: u32) -> Result<(), SambaError> {
        self.write_cell(samba, OFF_STACK, stack)
    }

    /// Launch the applet on a Cortex-M target and return immediately; the
    /// caller polls the NVM controller for completion.
    pub fn runv(&mut self, samba: &mut SamBa) -> Result<(), SambaError> {
        // Entry address with the Thumb bit set.
        samba.write_word(self.addr + OFF_RESET, self.addr + OFF_START + 1)?;
        // A go() at the stack cell is treated like a reset entry: initial SP
        // from that word, PC from the reset vector after it.
        samba.go(self.addr + OFF_STACK)
    }

    fn write_cell(&mut self, samba: &mut SamBa, offset: u32, value: u32) -> Result<(), SambaError> {
        if !self.installed {
            tracing::debug!("installing word-copy applet at {:#010x}", self.addr);
            samba.write(self.addr, &CODE)?;
            self.installed = true;
        }
        samba.write_word(self.addr + offset, value)
    }
}
