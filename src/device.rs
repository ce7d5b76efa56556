//! Target identification and device lifecycle.
//!
//! Identification probes CPUID/CHIPID/DSU registers in a strict order;
//! reading an address a given core family does not map can hang the
//! target, so the order is not negotiable.

use bitfield::bitfield;

use crate::flash::{D2xNvmFlash, D5xNvmFlash, FlashError, NvmFlash};
use crate::samba::{SamBa, SambaError};

const CPUID_ADDR: u32 = 0xe000_ed00;
const CPUID_PARTNO_MASK: u32 = 0x0000_fff0;
const CPUID_CORTEX_M0P: u32 = 0xc600;
const CPUID_CORTEX_M4: u32 = 0xc240;

/// CHIPID of the ARM7/9-era parts.
const CHIPID_ARM79_ADDR: u32 = 0xffff_f240;
/// CHIPID CIDR/EXID pairs of the SAM3/4 parts.
const CHIPID_CIDR_ADDR: u32 = 0x400e_0740;
const CHIPID_EXID_ADDR: u32 = 0x400e_0744;
const CHIPID_CIDR_ALT_ADDR: u32 = 0x400e_0940;
const CHIPID_EXID_ALT_ADDR: u32 = 0x400e_0944;

/// DSU device identification register of the SAM D/E/L/R parts.
const DSU_DID_ADDR: u32 = 0x4100_2018;

/// AIRCR write requesting a system reset.
const AIRCR_ADDR: u32 = 0xe000_ed0c;
const AIRCR_SYSRESETREQ: u32 = 0x05fa_0004;

/// Die and revision fields are ignored when dispatching on the DID.
const DID_VARIANT_MASK: u32 = 0xffff_00ff;
/// Version field ignored when dispatching on a CHIPID value.
const CHIPID_FAMILY_MASK: u32 = 0x7fff_ffe0;

bitfield! {
    /// DSU Device Identification register.
    #[derive(Clone, Copy)]
    pub struct DeviceId(u32);
    impl Debug;
    /// Processor generation.
    pub processor, _: 31, 28;
    /// Product family.
    pub family, _: 27, 23;
    /// Product series within the family.
    pub series, _: 21, 16;
    /// Die number.
    pub die, _: 15, 12;
    /// Die revision.
    pub revision, _: 11, 8;
    /// Device selection within the series.
    pub devsel, _: 7, 0;
}

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("communication with the monitor failed")]
    Samba(#[from] SambaError),
    #[error(
        "unsupported device: chip id {chip_id:#010x}/{ext_chip_id:#010x}, device id {device_id:#010x}"
    )]
    Unsupported {
        chip_id: u32,
        ext_chip_id: u32,
        device_id: u32,
    },
    #[error("the NVM driver could not be constructed")]
    Flash(#[from] FlashError),
}

/// Supported device families.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Samd11,
    Samd21,
    Samr21,
    Saml21,
    Samd51,
    Same51,
    Same53,
    Same54,
}

#[derive(Clone, Copy)]
enum NvmVariant {
    D2x,
    D5x,
}

struct DeviceEntry {
    device_id: u32,
    name: &'static str,
    family: Family,
    variant: NvmVariant,
    pages: u32,
    page_size: u32,
    user: u32,
    stack: u32,
}

macro_rules! entry {
    ($id:literal, $name:literal, $family:ident, $variant:ident, $pages:literal, $size:literal, $user:literal, $stack:literal) => {
        DeviceEntry {
            device_id: $id,
            name: $name,
            family: Family::$family,
            variant: NvmVariant::$variant,
            pages: $pages,
            page_size: $size,
            user: $user,
            stack: $stack,
        }
    };
}

/// DID variants (die and revision masked off) to device geometry.
#[rustfmt::skip]
const DEVICES: &[DeviceEntry] = &[
    // SAMD11
    entry!(0x1003_0000, "ATSAMD11D14AM", Samd11, D2x,  256, 64, 0x2000_0800, 0x2000_1000),
    entry!(0x1003_0003, "ATSAMD11D14AS", Samd11, D2x,  256, 64, 0x2000_0800, 0x2000_1000),
    entry!(0x1003_0006, "ATSAMD11C14A",  Samd11, D2x,  256, 64, 0x2000_0800, 0x2000_1000),
    // SAMD21
    entry!(0x1001_0000, "ATSAMD21J18A", Samd21, D2x, 4096, 64, 0x2000_4000, 0x2000_8000),
    entry!(0x1001_0001, "ATSAMD21J17A", Samd21, D2x, 2048, 64, 0x2000_2000, 0x2000_4000),
    entry!(0x1001_0002, "ATSAMD21J16A", Samd21, D2x, 1024, 64, 0x2000_1000, 0x2000_2000),
    entry!(0x1001_0003, "ATSAMD21J15A", Samd21, D2x,  512, 64, 0x2000_0800, 0x2000_1000),
    entry!(0x1001_0005, "ATSAMD21G18A", Samd21, D2x, 4096, 64, 0x2000_4000, 0x2000_8000),
    entry!(0x1001_0006, "ATSAMD21G17A", Samd21, D2x, 2048, 64, 0x2000_2000, 0x2000_4000),
    entry!(0x1001_0007, "ATSAMD21G16A", Samd21, D2x, 1024, 64, 0x2000_1000, 0x2000_2000),
    entry!(0x1001_0008, "ATSAMD21G15A", Samd21, D2x,  512, 64, 0x2000_0800, 0x2000_1000),
    entry!(0x1001_000a, "ATSAMD21E18A", Samd21, D2x, 4096, 64, 0x2000_4000, 0x2000_8000),
    entry!(0x1001_000b, "ATSAMD21E17A", Samd21, D2x, 2048, 64, 0x2000_2000, 0x2000_4000),
    entry!(0x1001_000c, "ATSAMD21E16A", Samd21, D2x, 1024, 64, 0x2000_1000, 0x2000_2000),
    entry!(0x1001_000d, "ATSAMD21E15A", Samd21, D2x,  512, 64, 0x2000_0800, 0x2000_1000),
    // SAMR21
    entry!(0x1001_0019, "ATSAMR21G18A", Samr21, D2x, 4096, 64, 0x2000_4000, 0x2000_8000),
    entry!(0x1001_001a, "ATSAMR21G17A", Samr21, D2x, 2048, 64, 0x2000_2000, 0x2000_4000),
    entry!(0x1001_001b, "ATSAMR21G16A", Samr21, D2x, 1024, 64, 0x2000_1000, 0x2000_2000),
    entry!(0x1001_001c, "ATSAMR21E18A", Samr21, D2x, 4096, 64, 0x2000_4000, 0x2000_8000),
    entry!(0x1001_001d, "ATSAMR21E17A", Samr21, D2x, 2048, 64, 0x2000_2000, 0x2000_4000),
    entry!(0x1001_001e, "ATSAMR21E16A", Samr21, D2x, 1024, 64, 0x2000_1000, 0x2000_2000),
    // SAML21
    entry!(0x1081_0000, "ATSAML21J18A", Saml21, D2x, 4096, 64, 0x2000_4000, 0x2000_8000),
    entry!(0x1081_000f, "ATSAML21J18B", Saml21, D2x, 4096, 64, 0x2000_4000, 0x2000_8000),
    entry!(0x1081_0010, "ATSAML21J17B", Saml21, D2x, 2048, 64, 0x2000_2000, 0x2000_4000),
    entry!(0x1081_0011, "ATSAML21J16B", Saml21, D2x, 1024, 64, 0x2000_1000, 0x2000_2000),
    // SAMD51
    entry!(0x6006_0000, "ATSAMD51P20A", Samd51, D5x, 2048, 512, 0x2000_4000, 0x2000_8000),
    entry!(0x6006_0001, "ATSAMD51P19A", Samd51, D5x, 1024, 512, 0x2000_4000, 0x2000_8000),
    entry!(0x6006_0002, "ATSAMD51N20A", Samd51, D5x, 2048, 512, 0x2000_4000, 0x2000_8000),
    entry!(0x6006_0003, "ATSAMD51N19A", Samd51, D5x, 1024, 512, 0x2000_4000, 0x2000_8000),
    entry!(0x6006_0004, "ATSAMD51J20A", Samd51, D5x, 2048, 512, 0x2000_4000, 0x2000_8000),
    entry!(0x6006_0005, "ATSAMD51J19A", Samd51, D5x, 1024, 512, 0x2000_4000, 0x2000_8000),
    entry!(0x6006_0006, "ATSAMD51J18A", Samd51, D5x,  512, 512, 0x2000_4000, 0x2000_8000),
    entry!(0x6006_0007, "ATSAMD51G19A", Samd51, D5x, 1024, 512, 0x2000_4000, 0x2000_8000),
    entry!(0x6006_0008, "ATSAMD51G18A", Samd51, D5x,  512, 512, 0x2000_4000, 0x2000_8000),
    // SAME51
    entry!(0x6181_0000, "ATSAME51N20A", Same51, D5x, 2048, 512, 0x2000_4000, 0x2000_8000),
    entry!(0x6181_0001, "ATSAME51N19A", Same51, D5x, 1024, 512, 0x2000_4000, 0x2000_8000),
    entry!(0x6181_0002, "ATSAME51J19A", Same51, D5x, 1024, 512, 0x2000_4000, 0x2000_8000),
    entry!(0x6181_0003, "ATSAME51J18A", Same51, D5x,  512, 512, 0x2000_4000, 0x2000_8000),
    entry!(0x6181_0004, "ATSAME51J20A", Same51, D5x, 2048, 512, 0x2000_4000, 0x2000_8000),
    // SAME53
    entry!(0x6183_0000, "ATSAME53N20A", Same53, D5x, 2048, 512, 0x2000_4000, 0x2000_8000),
    entry!(0x6183_0001, "ATSAME53N19A", Same53, D5x, 1024, 512, 0x2000_4000, 0x2000_8000),
    entry!(0x6183_0002, "ATSAME53J20A", Same53, D5x, 2048, 512, 0x2000_4000, 0x2000_8000),
    entry!(0x6183_0003, "ATSAME53J19A", Same53, D5x, 1024, 512, 0x2000_4000, 0x2000_8000),
    entry!(0x6183_0004, "ATSAME53J18A", Same53, D5x,  512, 512, 0x2000_4000, 0x2000_8000),
    // SAME54
    entry!(0x6184_0000, "ATSAME54P20A", Same54, D5x, 2048, 512, 0x2000_4000, 0x2000_8000),
    entry!(0x6184_0001, "ATSAME54P19A", Same54, D5x, 1024, 512, 0x2000_4000, 0x2000_8000),
    entry!(0x6184_0002, "ATSAME54N20A", Same54, D5x, 2048, 512, 0x2000_4000, 0x2000_8000),
    entry!(0x6184_0003, "ATSAME54N19A", Same54, D5x, 1024, 512, 0x2000_4000, 0x2000_8000),
];

/// An identified target with its NVM driver attached.
pub struct Device {
    family: Family,
    flash: Box<dyn NvmFlash>,
}

impl Device {
    /// Identify the attached target and construct its NVM driver.
    pub fn create(mut samba: SamBa) -> Result<Self, DeviceError> {
        let (chip_id, ext_chip_id, device_id) = identify(&mut samba)?;

        if chip_id != 0 {
            // A CHIPID-bearing part (SAM3/4/7/9). Recognized, but there is
            // no NVM driver for those families here.
            tracing::debug!(
                "no NVM driver for chip id {chip_id:#010x} (family key {:#010x})",
                chip_id & CHIPID_FAMILY_MASK
            );
            return Err(DeviceError::Unsupported {
                chip_id,
                ext_chip_id,
                device_id,
            });
        }

        let variant = device_id & DID_VARIANT_MASK;
        let Some(entry) = DEVICES.iter().find(|entry| entry.device_id == variant) else {
            return Err(DeviceError::Unsupported {
                chip_id,
                ext_chip_id,
                device_id,
            });
        };
        tracing::info!("device: {} {:?}", entry.name, DeviceId(device_id));

        let flash: Box<dyn NvmFlash> = match entry.variant {
            NvmVariant::D2x => Box::new(D2xNvmFlash::new(
                samba,
                entry.name,
                entry.pages,
                entry.page_size,
                entry.user,
                entry.stack,
            )?),
            NvmVariant::D5x => Box::new(D5xNvmFlash::new(
                samba,
                entry.name,
                entry.pages,
                entry.page_size,
                entry.user,
                entry.stack,
            )?),
        };
        Ok(Self {
            family: entry.family,
            flash,
        })
    }

    pub fn family(&self) -> Family {
        self.family
    }

    pub fn flash(&self) -> &dyn NvmFlash {
        self.flash.as_ref()
    }

    pub fn flash_mut(&mut self) -> &mut dyn NvmFlash {
        self.flash.as_mut()
    }

    /// Reset the target through AIRCR.
    ///
    /// The core usually resets before the monitor acknowledges the write,
    /// so an apparent failure here is expected and swallowed.
    pub fn reset(&mut self) {
        if let Err(error) = self
            .flash
            .samba()
            .write_word(AIRCR_ADDR, AIRCR_SYSRESETREQ)
        {
            tracing::debug!("reset request not acknowledged: {error}");
        }
    }
}

/// Probe the identification registers, strictly ordered.
fn identify(samba: &mut SamBa) -> Result<(u32, u32, u32), SambaError> {
    let mut chip_id = 0;
    let mut ext_chip_id = 0;
    let mut device_id = 0;

    let reset_vector = samba.read_word(0x0)?;
    if reset_vector >> 24 == 0xea {
        // An ARM7/9 jump instruction sits at the reset vector.
        chip_id = samba.read_word(CHIPID_ARM79_ADDR)?;
    } else {
        let cpuid = samba.read_word(CPUID_ADDR)? & CPUID_PARTNO_MASK;
        match cpuid {
            CPUID_CORTEX_M0P => {
                device_id = samba.read_word(DSU_DID_ADDR)?;
            }
            CPUID_CORTEX_M4 => {
                // SAM4 parts map their boot ROM high; the initial stack
                // pointer at offset 4 tells the two lines apart.
                let entry = samba.read_word(0x4)?;
                if entry >> 20 == 0x800 {
                    (chip_id, ext_chip_id) = read_chipid(samba)?;
                } else {
                    device_id = samba.read_word(DSU_DID_ADDR)?;
                }
            }
            _ => {
                (chip_id, ext_chip_id) = read_chipid(samba)?;
            }
        }
    }

    tracing::debug!(
        "identification: chip id {chip_id:#010x}/{ext_chip_id:#010x}, device id {device_id:#010x}"
    );
    Ok((chip_id, ext_chip_id, device_id))
}

fn read_chipid(samba: &mut SamBa) -> Result<(u32, u32), SambaError> {
    let cidr = samba.read_word(CHIPID_CIDR_ADDR)?;
    if cidr != 0 {
        Ok((cidr, samba.read_word(CHIPID_EXID_ADDR)?))
    } else {
        Ok((
            samba.read_word(CHIPID_CIDR_ALT_ADDR)?,
            samba.read_word(CHIPID_EXID_ALT_ADDR)?,
        ))
    }
}
