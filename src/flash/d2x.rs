//! NVM controller driver for the SAM D2x, L21 and R21 families.
//!
//! All controller registers are 32 bits wide and the `ADDR` register takes
//! half-word addresses. The erase granule is a row of four pages, and the
//! fuse-like options live in a four-page user row that must be read in
//! full, erased with `EAR` and rewritten page by page with `WAP`.

use bitfield::bitfield;

use super::{apply_mask, FlashCore, FlashError, NvmFlash};
use crate::samba::SamBa;

const REG_BASE: u32 = 0x4100_4000;
const REG_CTRLA: u32 = REG_BASE;
const REG_CTRLB: u32 = REG_BASE + 0x04;
const REG_INTFLAG: u32 = REG_BASE + 0x14;
const REG_STATUS: u32 = REG_BASE + 0x18;
const REG_ADDR: u32 = REG_BASE + 0x1c;
const REG_LOCK: u32 = REG_BASE + 0x20;

const INTFLAG_READY: u32 = 0x01;
const INTFLAG_ERROR: u32 = 0x02;
const STATUS_SB: u32 = 0x100;

/// CTRLA.CMDEX key; commands are ignored without it.
const CMDEX_KEY: u32 = 0xa500;

const CMD_ER: u8 = 0x02;
const CMD_WP: u8 = 0x04;
const CMD_EAR: u8 = 0x05;
const CMD_WAP: u8 = 0x06;
#[allow(dead_code)]
const CMD_LR: u8 = 0x40;
#[allow(dead_code)]
const CMD_UR: u8 = 0x41;
const CMD_PBC: u8 = 0x44;
const CMD_SSB: u8 = 0x45;

/// Erase granule: a row of four pages.
const ERASE_ROW_PAGES: u32 = 4;

const USER_ROW_ADDR: u32 = 0x80_4000;
const UR_BOD33_ENABLE_OFFSET: usize = 1;
const UR_BOD33_ENABLE_MASK: u8 = 0x06;
const UR_BOD33_RESET_OFFSET: usize = 1;
const UR_BOD33_RESET_MASK: u8 = 0x07;
const UR_LOCK_OFFSET: usize = 6;

bitfield! {
    /// NVMCTRL CTRLB.
    struct CtrlB(u32);
    impl Debug;
    /// Manual page writes.
    manw, set_manw: 7;
    /// NVM cache disable.
    cachedis, set_cachedis: 18;
}

/// Driver for the D2x-generation NVM controller.
pub struct D2xNvmFlash {
    core: FlashCore,
}

impl D2xNvmFlash {
    pub fn new(
        samba: SamBa,
        name: &'static str,
        pages: u32,
        page_size: u32,
        user: u32,
        stack: u32,
    ) -> Result<Self, FlashError> {
        Ok(Self {
            core: FlashCore::new(samba, name, 0x0, pages, page_size, 1, 16, user, stack)?,
        })
    }

    fn read_reg(&mut self, reg: u32) -> Result<u32, FlashError> {
        Ok(self.core.samba.read_word(reg)?)
    }

    fn write_reg(&mut self, reg: u32, value: u32) -> Result<(), FlashError> {
        Ok(self.core.samba.write_word(reg, value)?)
    }

    fn wait_ready(&mut self) -> Result<(), FlashError> {
        while self.read_reg(REG_INTFLAG)? & INTFLAG_READY == 0 {}
        Ok(())
    }

    /// Issue a controller command between two ready fences and surface any
    /// error flag it raises.
    fn command(&mut self, command: u8) -> Result<(), FlashError> {
        self.wait_ready()?;
        self.write_reg(REG_CTRLA, CMDEX_KEY | u32::from(command))?;
        self.wait_ready()?;
        if self.read_reg(REG_INTFLAG)? & INTFLAG_ERROR != 0 {
            self.write_reg(REG_INTFLAG, INTFLAG_ERROR)?;
            return Err(FlashError::Cmd { command });
        }
        Ok(())
    }

    fn erase_granule(&self) -> u32 {
        self.core.page_size * ERASE_ROW_PAGES
    }

    fn user_row_size(&self) -> usize {
        (self.core.page_size * ERASE_ROW_PAGES) as usize
    }

    fn read_user_row(&mut self) -> Result<Vec<u8>, FlashError> {
        let mut row = vec![0u8; self.user_row_size()];
        self.core.samba.read(USER_ROW_ADDR, &mut row)?;
        Ok(row)
    }

    /// Erase the aux row and write the full image back page by page.
    fn write_user_row(&mut self, row: &[u8]) -> Result<(), FlashError> {
        tracing::info!("rewriting the NVM user row");
        self.wait_ready()?;
        self.write_reg(REG_ADDR, USER_ROW_ADDR / 2)?;
        self.command(CMD_EAR)?;

        let page_size = self.core.page_size;
        for (index, chunk) in row.chunks(page_size as usize).enumerate() {
            let dst = USER_ROW_ADDR + index as u32 * page_size;
            self.core.load_buffer(chunk)?;
            self.command(CMD_PBC)?;
            self.core.prepare_applet(dst, page_size / 4)?;
            self.wait_ready()?;
            self.core.run_applet()?;
            self.write_reg(REG_ADDR, dst / 2)?;
            self.command(CMD_WAP)?;
        }
        Ok(())
    }
}

impl NvmFlash for D2xNvmFlash {
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
            self.write_reg(REG_ADDR, (self.core.addr + at) / 2)?;
            self.command(CMD_ER)?;
            at += granule;
        }
        Ok(())
    }

    fn write_page(&mut self, page: u32) -> Result<(), FlashError> {
        self.core.validate_page(page)?;

        // Disable the NVM cache and select manual page writes.
        let mut ctrlb = CtrlB(self.read_reg(REG_CTRLB)?);
        ctrlb.set_manw(true);
        ctrlb.set_cachedis(true);
        let ctrlb = ctrlb.0;
        self.write_reg(REG_CTRLB, ctrlb)?;

        if self.core.erase_auto && page % ERASE_ROW_PAGES == 0 {
            self.erase(page * self.core.page_size, self.erase_granule())?;
        }

        self.command(CMD_PBC)?;
        let addr = self.core.addr + page * self.core.page_size;
        self.core.prepare_applet(addr, self.core.page_size / 4)?;
        self.wait_ready()?;
        self.core.run_applet()?;
        // Half-word addressing.
        self.write_reg(REG_ADDR, addr / 2)?;
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
        let lock = self.read_reg(REG_LOCK)?;
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
            .read_byte(USER_ROW_ADDR + UR_BOD33_ENABLE_OFFSET as u32)?;
        Ok(byte & UR_BOD33_ENABLE_MASK != 0)
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
            .read_byte(USER_ROW_ADDR + UR_BOD33_RESET_OFFSET as u32)?;
        Ok(byte & UR_BOD33_RESET_MASK != 0)
    }

    fn set_bor(&mut self, enable: bool) {
        self.core.bor.set(enable);
    }

    fn get_security(&mut self) -> Result<bool, FlashError> {
        Ok(self.read_reg(REG_STATUS)? & STATUS_SB != 0)
    }

    fn set_security(&mut self) {
        self.core.security.set(true);
    }

    fn write_options(&mut self) -> Result<(), FlashError> {
        let any_row_option =
            self.core.bod.dirty() || self.core.bor.dirty() || self.core.regions.dirty();
        if any_row_option {
            let mut row = self.read_user_row()?;
            let mut changed = false;

            if self.core.bor.dirty() {
                let enable = *self.core.bor.get();
                changed |= apply_mask(&mut row[UR_BOD33_RESET_OFFSET], UR_BOD33_RESET_MASK, enable);
            }
            if self.core.bod.dirty() {
                let enable = *self.core.bod.get();
                changed |= apply_mask(
                    &mut row[UR_BOD33_ENABLE_OFFSET],
                    UR_BOD33_ENABLE_MASK,
                    enable,
                );
            }
            if self.core.regions.dirty() {
                let wanted = self.core.regions.get().clone();
                for (region, lock) in wanted.iter().enumerate() {
                    let byte = UR_LOCK_OFFSET + region / 8;
                    let mask = 1 << (region % 8);
                    // A cleared bit locks the region.
                    changed |= apply_mask(&mut row[byte], mask, !lock);
                }
            }

            if changed {
                self.write_user_row(&row)?;
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
