//! Firmware update transfer driven by the mesh stack's OTA client callbacks.
//!
//! Image contents are not verified here; the bootloader validates the image
//! when the boot partition is switched. The only gate before commit is that
//! the received byte count matches the size declared in the image header.

use core::mem;

use log::{error, info, warn};

use crate::{
    config::OtaConfig,
    error::OtaError,
    types::{NodeAction, StackStatus},
};

/// Inactive application partition opened for sequential writes.
pub trait UpdateSlot {
    fn write(&mut self, chunk: &[u8]) -> Result<(), OtaError>;
    fn close(&mut self) -> Result<(), OtaError>;
    /// Makes this partition the next boot target.
    fn set_boot(&mut self) -> Result<(), OtaError>;
}

pub trait FirmwareStore {
    type Slot: UpdateSlot;

    fn open_update_slot(&mut self) -> Result<Self::Slot, OtaError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtaPhase {
    Start,
    Receive,
    Apply,
    Check,
    Finish,
    Other(u16),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OtaHeader {
    pub manufacturer_code: u16,
    pub image_type: u16,
    pub file_version: u32,
    pub image_size: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct OtaEvent<'a> {
    pub phase: OtaPhase,
    pub status: StackStatus,
    pub header: Option<OtaHeader>,
    pub payload: &'a [u8],
}

impl<'a> OtaEvent<'a> {
    pub fn new(phase: OtaPhase) -> Self {
        Self {
            phase,
            status: StackStatus::OK,
            header: None,
            payload: &[],
        }
    }

    pub fn with_header(mut self, header: OtaHeader) -> Self {
        self.header = Some(header);
        self
    }

    pub fn with_payload(mut self, payload: &'a [u8]) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_status(mut self, status: StackStatus) -> Self {
        self.status = status;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtaStatus {
    Receiving,
    Verifying,
    Applying,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtaOutcome {
    Continue,
    /// Reboot now. `committed` is false when the new image could not be
    /// selected and the old one stays the boot target.
    Restart { committed: bool },
}

impl OtaOutcome {
    pub fn action(self) -> Option<NodeAction> {
        match self {
            Self::Continue => None,
            Self::Restart { .. } => Some(NodeAction::Restart),
        }
    }
}

enum Session<S> {
    Idle,
    Receiving { slot: S, declared: u32, offset: u32 },
    Verifying { slot: S, declared: u32 },
    /// New image selected, waiting for the restart.
    Applying,
    Failed,
}

impl<S> Session<S> {
    fn status(&self) -> Option<OtaStatus> {
        match self {
            Self::Idle => None,
            Self::Receiving { .. } => Some(OtaStatus::Receiving),
            Self::Verifying { .. } => Some(OtaStatus::Verifying),
            Self::Applying => Some(OtaStatus::Applying),
            Self::Failed => Some(OtaStatus::Failed),
        }
    }
}

pub struct OtaUpdater<F: FirmwareStore> {
    firmware: F,
    config: OtaConfig,
    session: Session<F::Slot>,
    last_header: Option<OtaHeader>,
}

impl<F: FirmwareStore> OtaUpdater<F> {
    pub fn new(firmware: F, config: OtaConfig) -> Self {
        Self {
            firmware,
            config,
            session: Session::Idle,
            last_header: None,
        }
    }

    pub fn status(&self) -> Option<OtaStatus> {
        self.session.status()
    }

    pub fn offset(&self) -> Option<u32> {
        match self.session {
            Session::Receiving { offset, .. } => Some(offset),
            Session::Verifying { declared, .. } => Some(declared),
            Session::Idle | Session::Applying | Session::Failed => None,
        }
    }

    pub fn firmware(&self) -> &F {
        &self.firmware
    }

    pub fn handle(&mut self, event: OtaEvent<'_>) -> Result<OtaOutcome, OtaError> {
        if !event.status.is_ok() {
            return Err(OtaError::StackStatus(event.status.0));
        }

        if let Some(header) = event.header {
            self.last_header = Some(header);
        }

        match event.phase {
            OtaPhase::Start => self.start(event.header),
            OtaPhase::Receive => self.receive(event.header, event.payload),
            OtaPhase::Apply => {
                info!("OTA upgrade apply");
                Ok(OtaOutcome::Continue)
            }
            OtaPhase::Check => self.check(),
            OtaPhase::Finish => Ok(self.finish()),
            OtaPhase::Other(code) => {
                info!("OTA upgrade status: 0x{code:04x}");
                Ok(OtaOutcome::Continue)
            }
        }
    }

    fn start(&mut self, header: Option<OtaHeader>) -> Result<OtaOutcome, OtaError> {
        if matches!(
            self.session,
            Session::Receiving { .. } | Session::Verifying { .. } | Session::Applying
        ) {
            warn!("OTA upgrade restarted, abandoning the open session");
        }
        self.session = Session::Idle;

        if let Some(header) = header {
            if header.manufacturer_code != self.config.manufacturer_code
                || header.image_type != self.config.image_type
            {
                warn!(
                    "OTA image identity 0x{:04x}/0x{:04x} differs from 0x{:04x}/0x{:04x}",
                    header.manufacturer_code,
                    header.image_type,
                    self.config.manufacturer_code,
                    self.config.image_type
                );
            }
        }

        info!("OTA upgrade started");
        let slot = self.firmware.open_update_slot().map_err(|err| {
            error!("OTA upgrade begin failed: {err}");
            err
        })?;

        self.session = Session::Receiving {
            slot,
            declared: header.map(|header| header.image_size).unwrap_or(0),
            offset: 0,
        };
        Ok(OtaOutcome::Continue)
    }

    fn receive(&mut self, header: Option<OtaHeader>, payload: &[u8]) -> Result<OtaOutcome, OtaError> {
        let Session::Receiving {
            slot,
            declared,
            offset,
        } = &mut self.session
        else {
            warn!("OTA data received without an open session");
            return Err(OtaError::NoSession);
        };

        if let Some(header) = header {
            *declared = header.image_size;
        }

        let chunk_offset = *offset;
        // Offset follows the transfer protocol, not what reached flash.
        *offset = offset.saturating_add(payload.len() as u32);
        info!("OTA upgrade received {:06}/{} bytes", *offset, *declared);

        if payload.is_empty() {
            return Ok(OtaOutcome::Continue);
        }

        if let Err(err) = slot.write(payload) {
            let err = match err {
                OtaError::Write { reason, .. } => OtaError::Write {
                    offset: chunk_offset,
                    reason,
                },
                other => other,
            };
            error!("OTA upgrade write failed: {err}");
            if self.config.strict_writes {
                self.session = Session::Failed;
                return Err(err);
            }
        }

        Ok(OtaOutcome::Continue)
    }

    fn check(&mut self) -> Result<OtaOutcome, OtaError> {
        match mem::replace(&mut self.session, Session::Failed) {
            Session::Receiving {
                slot,
                declared,
                offset,
            } => {
                if offset != declared {
                    error!("OTA upgrade check failed: received {offset} of {declared} bytes");
                    return Err(OtaError::SizeMismatch {
                        declared,
                        received: offset,
                    });
                }
                self.session = Session::Verifying { slot, declared };
                Ok(OtaOutcome::Continue)
            }
            verifying @ Session::Verifying { .. } => {
                self.session = verifying;
                Ok(OtaOutcome::Continue)
            }
            Session::Idle => {
                self.session = Session::Idle;
                error!("OTA upgrade check without an open session");
                Err(OtaError::NoSession)
            }
            Session::Applying | Session::Failed => {
                self.session = Session::Failed;
                Err(OtaError::NoSession)
            }
        }
    }

    fn finish(&mut self) -> OtaOutcome {
        let committed = match mem::replace(&mut self.session, Session::Idle) {
            Session::Receiving { slot, .. } | Session::Verifying { slot, .. } => {
                Self::commit(slot)
            }
            Session::Idle | Session::Applying | Session::Failed => {
                warn!("OTA upgrade finished without a usable session");
                false
            }
        };

        if let Some(header) = self.last_header {
            info!(
                "OTA upgrade finished: version: 0x{:x}, manufacturer code: 0x{:x}, image type: 0x{:x}, total size: {}",
                header.file_version, header.manufacturer_code, header.image_type, header.image_size
            );
        }

        self.session = if committed {
            Session::Applying
        } else {
            Session::Failed
        };
        OtaOutcome::Restart { committed }
    }

    /// Selects the new image only after the partition closed cleanly. A close
    /// failure means the image did not validate, so the running image stays the
    /// boot target.
    fn commit(mut slot: F::Slot) -> bool {
        if let Err(err) = slot.close() {
            error!("OTA upgrade end failed: {err}");
            return false;
        }

        if let Err(err) = slot.set_boot() {
            error!("OTA upgrade set boot partition failed: {err}");
            return false;
        }

        true
    }
}
