use thiserror::Error;

use crate::device::DeviceError;
use crate::flash::FlashError;
use crate::flasher::FlasherError;
use crate::samba::SambaError;
use crate::transport::TransportError;

/// Any error the crate surfaces.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Samba(#[from] SambaError),
    #[error(transparent)]
    Flash(#[from] FlashError),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Flasher(#[from] FlasherError),
}
