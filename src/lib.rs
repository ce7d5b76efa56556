//! Host-side programmer for the SAM-BA ROM bootloader found on
//! Atmel/Microchip SAM microcontrollers.
//!
//! The crate speaks the monitor's ASCII command protocol over a serial
//! byte stream, identifies the attached device, and erases, programs,
//! verifies and configures its on-chip flash, including lock regions and
//! brown-out options. Page programming is double-buffered: while a small
//! word-copy applet drains one SRAM page buffer into the NVM controller,
//! the host uploads the next page into the other.
//!
//! ```no_run
//! use sam_ba::{Device, FlashProgress, Flasher, SamBa, SerialTransport};
//!
//! # fn main() -> Result<(), sam_ba::Error> {
//! let transport = SerialTransport::open("/dev/ttyACM0")?;
//! let mut samba = SamBa::new(Box::new(transport));
//! samba.connect()?;
//!
//! let device = Device::create(samba)?;
//! let mut flasher = Flasher::new(device, FlashProgress::new(|event| println!("{event:?}")));
//! flasher.erase(0)?;
//! flasher.write(&[0xa5; 256], 0)?;
//! flasher.into_device().reset();
//! # Ok(())
//! # }
//! ```

mod applet;
mod buffer;
mod device;
mod error;
mod flash;
mod flasher;
mod samba;
mod transport;

pub use device::{Device, DeviceError, DeviceId, Family};
pub use error::Error;
pub use flash::{D2xNvmFlash, D5xNvmFlash, FlashError, NvmFlash};
pub use flasher::{FlashProgress, Flasher, FlasherError, ProgressEvent};
pub use samba::{SamBa, SambaError};
pub use transport::{SerialTransport, Transport, TransportError};
