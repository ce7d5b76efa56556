//! Buffer-level programming operations on top of a [`Device`].

use crate::buffer::ByteBuffer;
use crate::device::Device;
use crate::flash::FlashError;
use crate::samba::crc16;

/// Events emitted while a flashing operation runs.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    /// A human-readable milestone.
    Status { message: String },
    /// `done` of `total` pages processed.
    Progress { done: u32, total: u32 },
}

/// Progress reporting for the flashing procedure.
///
/// Holds a handler closure called for every [`ProgressEvent`].
pub struct FlashProgress {
    handler: Box<dyn Fn(ProgressEvent)>,
}

impl FlashProgress {
    pub fn new(handler: impl Fn(ProgressEvent) + 'static) -> Self {
        Self {
            handler: Box::new(handler),
        }
    }

    /// A progress reporter that swallows every event.
    pub fn empty() -> Self {
        Self::new(|_| {})
    }

    fn status(&self, message: impl Into<String>) {
        (self.handler)(ProgressEvent::Status {
            message: message.into(),
        });
    }

    fn progress(&self, done: u32, total: u32) {
        (self.handler)(ProgressEvent::Progress { done, total });
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FlasherError {
    #[error("flash operation failed")]
    Flash(#[from] FlashError),
    #[error(
        "the image ({size} bytes at offset {offset:#x}) does not fit the flash ({available} bytes)"
    )]
    FileSize {
        size: usize,
        offset: u32,
        available: u32,
    },
}

/// Drives whole-image erase, write, read and verify cycles against a
/// device's flash.
pub struct Flasher {
    device: Device,
    progress: FlashProgress,
    scratch: ByteBuffer,
}

impl Flasher {
    pub fn new(device: Device, progress: FlashProgress) -> Self {
        Self {
            device,
            progress,
            scratch: ByteBuffer::new(),
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut Device {
        &mut self.device
    }

    pub fn into_device(self) -> Device {
        self.device
    }

    /// Erase from `offset` to the end of the flash.
    pub fn erase(&mut self, offset: u32) -> Result<(), FlasherError> {
        self.progress.status("Erase flash");
        self.device.flash_mut().erase_all(offset)?;
        Ok(())
    }

    /// Program `data` page by page starting at the page-aligned `offset`,
    /// zero-padding the tail of the last page.
    pub fn write(&mut self, data: &[u8], offset: u32) -> Result<(), FlasherError> {
        let page_size = self.device.flash().page_size();
        let total_size = self.device.flash().total_size();
        if offset % page_size != 0 || offset >= total_size {
            return Err(FlashError::Offset { offset, page_size }.into());
        }
        let available = total_size - offset;
        if data.len() > available as usize {
            return Err(FlasherError::FileSize {
                size: data.len(),
                offset,
                available,
            });
        }

        let first_page = offset / page_size;
        let total_pages = data.len().div_ceil(page_size as usize) as u32;
        self.progress.status(format!(
            "Write {} bytes to flash ({total_pages} pages)",
            data.len()
        ));

        for (index, chunk) in data.chunks(page_size as usize).enumerate() {
            self.scratch.reset();
            self.scratch.copy(chunk);
            self.scratch.fill(0, page_size as usize - chunk.len());
            let flash = self.device.flash_mut();
            flash.load_buffer(self.scratch.view())?;
            flash.write_page(first_page + index as u32)?;
            self.progress.progress(index as u32 + 1, total_pages);
        }
        Ok(())
    }

    /// Read `data.len()` bytes back from the page-aligned `offset`.
    pub fn read(&mut self, offset: u32, data: &mut [u8]) -> Result<(), FlasherError> {
        let page_size = self.device.flash().page_size();
        if offset % page_size != 0 {
            return Err(FlashError::Offset { offset, page_size }.into());
        }

        let first_page = offset / page_size;
        let total_pages = data.len().div_ceil(page_size as usize) as u32;
        self.progress
            .status(format!("Read {} bytes from flash", data.len()));

        let mut page_data = vec![0u8; page_size as usize];
        for (index, chunk) in data.chunks_mut(page_size as usize).enumerate() {
            self.device
                .flash_mut()
                .read_page(first_page + index as u32, &mut page_data)?;
            chunk.copy_from_slice(&page_data[..chunk.len()]);
            self.progress.progress(index as u32 + 1, total_pages);
        }
        Ok(())
    }

    /// Compare `data` against the flash contents at `offset`.
    ///
    /// Uses the bootloader's checksum extension when it is available and
    /// falls back to reading pages back otherwise. Returns the index of
    /// the first mismatching page, or `None` when everything matches.
    pub fn verify(&mut self, data: &[u8], offset: u32) -> Result<Option<u32>, FlasherError> {
        let page_size = self.device.flash().page_size();
        if offset % page_size != 0 {
            return Err(FlashError::Offset { offset, page_size }.into());
        }

        let first_page = offset / page_size;
        let total_pages = data.len().div_ceil(page_size as usize) as u32;
        self.progress
            .status(format!("Verify {} bytes of flash", data.len()));

        let use_checksum = self.device.flash_mut().samba().can_checksum_buffer();
        let base = self.device.flash().address() + offset;
        let mut page_data = vec![0u8; page_size as usize];
        for (index, chunk) in data.chunks(page_size as usize).enumerate() {
            let page = first_page + index as u32;
            let matches = if use_checksum {
                let addr = base + index as u32 * page_size;
                let expected = u32::from(crc16(chunk));
                let actual = self
                    .device
                    .flash_mut()
                    .samba()
                    .checksum_buffer(addr, chunk.len() as u32)
                    .map_err(FlashError::from)?;
                expected == actual
            } else {
                self.device.flash_mut().read_page(page, &mut page_data)?;
                page_data[..chunk.len()] == *chunk
            };
            if !matches {
                tracing::warn!("verify failed at page {page}");
                return Ok(Some(page));
            }
            self.progress.progress(index as u32 + 1, total_pages);
        }
        Ok(None)
    }

    /// Lock or unlock every region, flushing the change immediately.
    pub fn lock_all(&mut self, lock: bool) -> Result<(), FlasherError> {
        self.progress.status(if lock {
            "Lock all regions"
        } else {
            "Unlock all regions"
        });
        let flash = self.device.flash_mut();
        let count = flash.lock_regions();
        flash.set_lock_regions(vec![lock; count as usize])?;
        flash.write_options()?;
        Ok(())
    }
}
