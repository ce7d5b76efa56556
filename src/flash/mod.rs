//! NVM programming engine.
//!
//! The two supported controller generations share their option
//! bookkeeping, page-buffer pipelining and applet preparation through
//! [`FlashCore`]; everything register-shaped lives in the family drivers.

mod d2x;
mod d5x;

pub use d2x::D2xNvmFlash;
pub use d5x::D5xNvmFlash;

use crate::applet::WordCopyApplet;
use crate::samba::{SamBa, SambaError};

#[derive(Debug, thiserror::Error)]
pub enum FlashError {
    #[error("communication with the monitor failed")]
    Samba(#[from] SambaError),
    #[error("invalid flash geometry: {0}")]
    Config(&'static str),
    #[error("offset {offset:#x} is not aligned to the {page_size}-byte page size")]
    Offset { offset: u32, page_size: u32 },
    #[error(
        "erase of {size:#x} bytes at {offset:#x} is not aligned to the {granule:#x}-byte erase granule or exceeds the flash"
    )]
    Erase { offset: u32, size: u32, granule: u32 },
    #[error("page {page} is beyond the last page ({pages} pages)")]
    Page { page: u32, pages: u32 },
    #[error("the NVM controller flagged an error after command {command:#04x}")]
    Cmd { command: u8 },
    #[error("{given} lock regions given, the device has {supported}")]
    Region { given: usize, supported: u32 },
}

/// An option value latched by a setter and flushed by `write_options`.
#[derive(Debug)]
pub(crate) struct FlashOption<T> {
    value: T,
    dirty: bool,
}

impl<T> FlashOption<T> {
    fn new(value: T) -> Self {
        Self {
            value,
            dirty: false,
        }
    }

    pub fn set(&mut self, value: T) {
        self.value = value;
        self.dirty = true;
    }

    pub fn get(&self) -> &T {
        &self.value
    }

    pub fn dirty(&self) -> bool {
        self.dirty
    }

    pub fn clear(&mut self) {
        self.dirty = false;
    }
}

/// Flip the masked bits of `byte` to match `on`; reports whether the byte
/// changed.
pub(crate) fn apply_mask(byte: &mut u8, mask: u8, on: bool) -> bool {
    let current = *byte & mask != 0;
    if current == on {
        return false;
    }
    if on {
        *byte |= mask;
    } else {
        *byte &= !mask;
    }
    true
}

/// State shared by the family drivers: the client, the device geometry,
/// the applet, the SRAM page-buffer pair and the latched options.
pub(crate) struct FlashCore {
    pub samba: SamBa,
    pub name: &'static str,
    pub addr: u32,
    pub pages: u32,
    pub page_size: u32,
    pub planes: u32,
    pub lock_region_count: u32,
    pub stack: u32,
    pub applet: WordCopyApplet,
    pub erase_auto: bool,
    pub bod: FlashOption<bool>,
    pub bor: FlashOption<bool>,
    pub security: FlashOption<bool>,
    pub regions: FlashOption<Vec<bool>>,
    page_buffer_a: u32,
    page_buffer_b: u32,
    on_buffer_a: bool,
}

impl FlashCore {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        samba: SamBa,
        name: &'static str,
        addr: u32,
        pages: u32,
        page_size: u32,
        planes: u32,
        lock_region_count: u32,
        user: u32,
        stack: u32,
    ) -> Result<Self, FlashError> {
        if !pages.is_power_of_two() {
            return Err(FlashError::Config("page count is not a power of two"));
        }
        if !page_size.is_power_of_two() {
            return Err(FlashError::Config("page size is not a power of two"));
        }
        if !lock_region_count.is_power_of_two() {
            return Err(FlashError::Config(
                "lock region count is not a power of two",
            ));
        }
        // The page buffers sit right behind the applet image, which is
        // already a multiple of four bytes long.
        let page_buffer_a = user + WordCopyApplet::size();
        let page_buffer_b = page_buffer_a + page_size;
        Ok(Self {
            samba,
            name,
            addr,
            pages,
            page_size,
            planes,
            lock_region_count,
            stack,
            applet: WordCopyApplet::new(user),
            erase_auto: true,
            bod: FlashOption::new(false),
            bor: FlashOption::new(false),
            security: FlashOption::new(false),
            regions: FlashOption::new(vec![false; lock_region_count as usize]),
            page_buffer_a,
            page_buffer_b,
            on_buffer_a: true,
        })
    }

    pub fn total_size(&self) -> u32 {
        self.pages * self.page_size
    }

    /// SRAM page buffer the next host upload lands in.
    pub fn active_buffer(&self) -> u32 {
        if self.on_buffer_a {
            self.page_buffer_a
        } else {
            self.page_buffer_b
        }
    }

    pub fn validate_page(&self, page: u32) -> Result<(), FlashError> {
        if page >= self.pages {
            return Err(FlashError::Page {
                page,
                pages: self.pages,
            });
        }
        Ok(())
    }

    /// Upload bytes into the active SRAM page buffer.
    pub fn load_buffer(&mut self, data: &[u8]) -> Result<(), SambaError> {
        self.samba.write(self.active_buffer(), data)
    }

    /// Point the applet at the active page buffer and flip the pair so the
    /// caller's next upload targets the idle buffer while the run drains.
    pub fn prepare_applet(&mut self, dst: u32, words: u32) -> Result<(), SambaError> {
        let src = self.active_buffer();
        self.applet.set_stack(&mut self.samba, self.stack)?;
        self.applet.set_words(&mut self.samba, words)?;
        self.applet.set_dst_addr(&mut self.samba, dst)?;
        self.applet.set_src_addr(&mut self.samba, src)?;
        self.on_buffer_a = !self.on_buffer_a;
        Ok(())
    }

    /// Run the prepared applet; returns without waiting.
    pub fn run_applet(&mut self) -> Result<(), SambaError> {
        self.applet.runv(&mut self.samba)
    }

    /// Validate an erase request against the granule and the flash size.
    pub fn validate_erase(&self, offset: u32, size: u32, granule: u32) -> Result<(), FlashError> {
        if offset % granule != 0 || u64::from(offset) + u64::from(size) > u64::from(self.total_size())
        {
            return Err(FlashError::Erase {
                offset,
                size,
                granule,
            });
        }
        Ok(())
    }

    pub fn clear_option_flags(&mut self) {
        self.bod.clear();
        self.bor.clear();
        self.security.clear();
        self.regions.clear();
    }
}

/// The operations a family NVM driver provides to callers.
///
/// Option setters only latch the request; `write_options` flushes every
/// dirty option in one pass over the user row.
pub trait NvmFlash {
    fn name(&self) -> &str;
    /// Base address of the flash.
    fn address(&self) -> u32;
    fn num_pages(&self) -> u32;
    fn page_size(&self) -> u32;
    fn total_size(&self) -> u32 {
        self.num_pages() * self.page_size()
    }
    fn planes(&self) -> u32;
    /// Number of lock regions the device carries.
    fn lock_regions(&self) -> u32;

    /// Erase automatically before writes into an untouched granule.
    fn set_erase_auto(&mut self, enable: bool);

    /// Erase from `offset` to the end of the flash, delegating to the
    /// bootloader's chip-erase extension when it is available.
    fn erase_all(&mut self, offset: u32) -> Result<(), FlashError>;

    /// Erase a granule-aligned range.
    fn erase(&mut self, offset: u32, size: u32) -> Result<(), FlashError>;

    /// Commit the active SRAM page buffer to `page`.
    fn write_page(&mut self, page: u32) -> Result<(), FlashError>;

    /// Read back `page` into `data`.
    fn read_page(&mut self, page: u32, data: &mut [u8]) -> Result<(), FlashError>;

    /// Upload `data` into the active SRAM page buffer.
    fn load_buffer(&mut self, data: &[u8]) -> Result<(), FlashError>;

    /// Have the bootloader copy the active SRAM page buffer to the flash
    /// offset `dst`.
    fn write_buffer(&mut self, dst: u32, size: u32) -> Result<(), FlashError>;

    fn set_lock_regions(&mut self, regions: Vec<bool>) -> Result<(), FlashError>;
    fn get_lock_regions(&mut self) -> Result<Vec<bool>, FlashError>;

    fn can_bod(&self) -> bool;
    fn get_bod(&mut self) -> Result<bool, FlashError>;
    fn set_bod(&mut self, enable: bool);

    fn can_bor(&self) -> bool;
    fn get_bor(&mut self) -> Result<bool, FlashError>;
    fn set_bor(&mut self, enable: bool);

    fn get_security(&mut self) -> Result<bool, FlashError>;
    /// Request the security bit; one-shot, applied by `write_options`.
    fn set_security(&mut self);

    /// Flush every latched option change to the user row, skipping the
    /// erase-and-rewrite when nothing actually changed.
    fn write_options(&mut self) -> Result<(), FlashError>;

    /// The client this driver runs on.
    fn samba(&mut self) -> &mut SamBa;
}
