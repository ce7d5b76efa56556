//! NVM controller driver for the SAM D5x/E5x families.
//!
//! The controller's CTRLA/CTRLB/INTFLAG/STATUS registers are 16 bits wide
//! and are accessed as byte pairs, low byte first; `ADDR` is 32 bits and
//! takes byte addresses. The erase granule is a block of sixteen pages,
//! and the one-page user row is written in quad-word chunks with `WQW`.

use super::{apply_mask, FlashCore, FlashError, NvmFlash};
use crate::samba::SamBa;

const REG_BASE: u32 = 0x4100_4000;
const REG_CTRLA: u32 = REG_BASE;
const REG_CTRLB: u32 = REG_BASE + 0x04;
const REG_INTFLAG: u32 = REG_BASE + 0x10;
const REG_STATUS: u32 = REG_BASE + 0x12;
const REG_ADDR: u32 = REG_BASE + 0x14;
const REG_RUNLOCK: u32 = REG_BASE + 0x18;

const STATUS_READY: u16 = 0x0001;
/// ADDRE | PROGE | LOCKE | ECCSE | NVME | SEESFULL.
const INTFLAG_ERROR: u16 = 0x00ce;

/// CTRLB.CMDEX key; commands are ignored without it.
const CMDEX_KEY: u16 = 0xa500;

const CMD_EP: u8 = 0x00;
const CMD_EB: u8 = 0x01;
const CMD_WP: u8 = 0x03;
const CMD_WQW: u8 = 0x04;
#[allow(dead_code)]
const CMD_LR: u8 = 0x11;
#[allow(dead_code)]
const CMD_UR: u8 = 0x12;
const CMD_PBC: u8 = 0x15;
const CMD_SSB: u8 = 0x16;

/// Erase granule: a block of sixteen pages.
const ERASE_BLOCK_PAGES: u32 = 16;
const QUAD_WORD_BYTES: u32 = 16;

const USER_PAGE_ADDR: u32 = 0x80_4000;
/// The BOD33 fuse is a *disable* bit on this family.
const UP_BOD33_DISABLE_OFFSET: usize = 0;
const UP_BOD33_DISABLE_MASK: u8 = 0x01;
const UP_BOD33_RESET_OFFSET: usize = 1;
const UP_BOD33_RESET_MASK: u8 = 0x02;
const UP_LOCK_OFFSET: usize = 8;

/// DSU STATUSB; bit 0 reports the security state.
const DSU_STATUSB: u32 = 0x4100_2102;

/// Driver for the D5x-generation NVM controller.
pub struct D5xNvmFlash {
    core: FlashCore,
}

impl D5xNvmFlash {
    pub fn new(
        samba: SamBa,
        name: &'static str,
        pages: u32,
        page_size: u32,
        user: u32,
        stack: u32,
    ) -> Result<Self, FlashError> {
        Ok(Self {
            core: FlashCore::new(samba, name, 0x0, pages, page_size, 1, 32, user, stack)?,
        })
    }

    fn read_reg16(&mut self, reg: u32) -> Result<u16, FlashError> {
        let low = self.core.samba.read_byte(reg)?;
        let high = self.core.samba.read_byte(reg + 1)?;
        Ok(u16::from(low) | (u16::from(high) << 8))
    }

    fn write_reg16(&mut self, reg: u32, value: u16) -> Result<(), FlashError> {
        self.core.samba.write_byte(reg, value as u8)?;
        self.core.samba.write_byte(reg + 1, (value >> 8) as u8)?;
        Ok(())
    }

    fn write_reg32(&mut self, reg: u32, value: u32) -> Result<(), FlashError> {
        Ok(self.core.samba.write_word(reg, value)?)
    }

    fn wait_ready(&mut self) -> Result<(), FlashError> {
        while self.read_reg16(REG_STATUS)? & STATUS_READY == 0 {}
        Ok(())
    }

    /// Issue a controller command between two ready fences and surface any
    /// error flag it raises.
    fn command(&mut self, command: u8) -> Result<(), FlashError> {
        self.wait_ready()?;
        self.write_reg16(REG_CTRLB, CMDEX_KEY | u16::from(command))?;
        self.wait_ready()?;
        if self.read_reg16(REG_INTFLAG)? & INTFLAG_ERROR != 0 {
            self.write_reg16(REG_INTFLAG, INTFLAG_ERROR)?;
            return Err(FlashError::Cmd { command });
        }
        Ok(())
    }

    fn erase_granule(&self) -> u32 {
        self.core.page_size * ERASE_BLOCK_PAGES
    }

    fn read_user_page(&mut self) -> Result<Vec<u8>, FlashError> {
        let mut page = vec![0u8; self.core.page_size as usize];
        self.core.samba.read(USER_PAGE_ADDR, &mut page)?;
        Ok(page)
    }

    /// Erase the user page and stream the image back through the page
    /// buffer in quad-word chunks.
    fn write_user_page(&mut self, page: &[u8]) -> Result<(), FlashError> {
        tracing::info!("rewriting the NVM user page");
        self.wait_ready()?;
        self.write_reg32(REG_ADDR, USER_PAGE_ADDR)?;
        self.command(CMD_EP)?;

        for (index, chunk) in page.chunks(QUAD_WORD_BYTES as usize).enumerate() {
            let dst = USER_PAGE_ADDR + index as u32 * QUAD_WORD_BYTES;
            self.core.load_buffer(chunk)?;
            self.command(CMD_PBC)?;
            self.core.prepare_applet(dst, QUAD_WORD_BYTES / 4)?;
            self.wait_ready()?;
            self.core.run_applet()?;
            self.write_reg32(REG_ADDR, dst)?;
            self.command(CMD_WQW)?;
        }
        Ok(())
    }
}

impl NvmFlash for D5xNvmFlash {
    fn name(&self) -> &str {
        self.core.name
    }

    fn address(&self) -> u32 {
        self.core.addr
    }

    fn num_pages(&self) -> u32 {
        self.core.pages
    }

    fn page_size(&self) -> u32 {
        self.core.page_size
    }

    fn planes(&self) -> u32 {
        self.core.planes
    }

    fn lock_regions(&self) -> u32 {
        self.core.lock_region_count
    }

    fn set_erase_auto(&mut self, enable: bool) {
        self.core.erase_auto = enable;
    }

    fn erase_all(&mut self, offset: u32) -> Result<(), FlashError> {
        if self.core.samba.can_chip_erase() {
            let addr = self.core.addr + offset;
            self.core.samba.chip_erase(addr)?;
            return Ok(());
        }
        self.erase(offset, self.core.total_size().saturating_sub(offset))
    }

    fn erase(&mut self, offset: u32, size: u32) -> Result<(), FlashError> {
        let granule = self.erase_granule();
        self.core.validate_erase(offset, size, granule)?;
        let mut at = offset;
        while at < offset + size {
            self.wait_ready()?;
            self.write_reg32(REG_ADDR, self.core.addr + at)?;
            self.command(CMD_EB)?;
            at += granule;
        }
        Ok(())
    }

    fn write_page(&mut self, page: u32) -> Result<(), FlashError> {
        self.core.validate_page(page)?;

        // Disable both caches and clear the automatic write modes.
        let ctrla = self.read_reg16(REG_CTRLA)?;
        self.write_reg16(REG_CTRLA, (ctrla | (0x3 << 14)) & 0xffcf)?;

        if self.core.erase_auto && page % ERASE_BLOCK_PAGES == 0 {
            self.erase(page * self.core.page_size, self.erase_granule())?;
        }

        self.command(CMD_PBC)?;
        let addr = self.core.addr + page * self.core.page_size;
        self.core.prepare_applet(addr, self.core.page_size / 4)?;
        self.wait_ready()?;
        self.core.run_applet()?;
        // Byte addressing.
        self.write_reg32(REG_ADDR, addr)?;
        self.command(CMD_WP)
    }

    fn read_page(&mut self, page: u32, data: &mut [u8]) -> Result<(), FlashError> {
        self.core.validate_page(page)?;
        let addr = self.core.addr + page * self.core.page_size;
        Ok(self.core.samba.read(addr, data)?)
    }

    fn load_buffer(&mut self, data: &[u8]) -> Result<(), FlashError> {
        Ok(self.core.load_buffer(data)?)
    }

    fn write_buffer(&mut self, dst: u32, size: u32) -> Result<(), FlashError> {
        if self.core.erase_auto && dst % self.erase_granule() == 0 {
            self.erase(dst, size)?;
        }
        let src = self.core.active_buffer();
        let addr = self.core.addr + dst;
        Ok(self.core.samba.write_buffer(src, addr, size)?)
    }

    fn set_lock_regions(&mut self, regions: Vec<bool>) -> Result<(), FlashError> {
        if regions.len() > self.core.lock_region_count as usize {
            return Err(FlashError::Region {
                given: regions.len(),
                supported: self.core.lock_region_count,
            });
        }
        self.core.regions.set(regions);
        Ok(())
    }

    fn get_lock_regions(&mut self) -> Result<Vec<bool>, FlashError> {
        let lock = self.core.samba.read_word(REG_RUNLOCK)?;
        // A cleared bit means the region is locked.
        Ok((0..self.core.lock_region_count)
            .map(|region| lock & (1 << region) == 0)
            .collect())
    }

    fn can_bod(&self) -> bool {
        true
    }

    fn get_bod(&mut self) -> Result<bool, FlashError> {
        let byte = self
            .core
            .samba
            .read_byte(USER_PAGE_ADDR + UP_BOD33_DISABLE_OFFSET as u32)?;
        Ok(byte & UP_BOD33_DISABLE_MASK == 0)
    }

    fn set_bod(&mut self, enable: bool) {
        self.core.bod.set(enable);
    }

    fn can_bor(&self) -> bool {
        true
    }

    fn get_bor(&mut self) -> Result<bool, FlashError> {
        let byte = self
            .core
            .samba
            .read_byte(USER_PAGE_ADDR + UP_BOD33_RESET_OFFSET as u32)?;
        Ok(byte & UP_BOD33_RESET_MASK != 0)
    }

    fn set_bor(&mut self, enable: bool) {
        self.core.bor.set(enable);
    }

    fn get_security(&mut self) -> Result<bool, FlashError> {
        Ok(self.core.samba.read_byte(DSU_STATUSB)? & 0x01 != 0)
    }

    fn set_security(&mut self) {
        self.core.security.set(true);
    }

    fn write_options(&mut self) -> Result<(), FlashError> {
        let any_page_option =
            self.core.bod.dirty() || self.core.bor.dirty() || self.core.regions.dirty();
        if any_page_option {
            let mut page = self.read_user_page()?;
            let mut changed = false;

            if self.core.bor.dirty() {
                let enable = *self.core.bor.get();
                changed |= apply_mask(
                    &mut page[UP_BOD33_RESET_OFFSET],
                    UP_BOD33_RESET_MASK,
                    enable,
                );
            }
            if self.core.bod.dirty() {
                let enable = *self.core.bod.get();
                // Set means disabled.
                changed |= apply_mask(
                    &mut page[UP_BOD33_DISABLE_OFFSET],
                    UP_BOD33_DISABLE_MASK,
                    !enable,
                );
            }
            if self.core.regions.dirty() {
                let wanted = self.core.regions.get().clone();
                for (region, lock) in wanted.iter().enumerate() {
                    let byte = UP_LOCK_OFFSET + region / 8;
                    let mask = 1 << (region % 8);
                    // A cleared bit locks the region.
                    changed |= apply_mask(&mut page[byte], mask, !lock);
                }
            }

            if changed {
                self.write_user_page(&page)?;
            }
        }

        if self.core.security.dirty() && *self.core.security.get() && !self.get_security()? {
            self.command(CMD_SSB)?;
        }

        self.core.clear_option_flags();
        Ok(())
    }

    fn samba(&mut self) -> &mut SamBa {
        &mut self.core.samba
    }
}
