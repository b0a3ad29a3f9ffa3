//! Enumerates candidate adapters, switches any application-mode probe
//! into bootloader mode, and re-scans until a bootloader-mode handle is
//! ready for the rest of the crate to drive.

use std::thread;
use std::time::Duration;

use log::{info, warn};
use rusb::Context;

use crate::dfu::Dfu;
use crate::error::Error;
use crate::identity::Generation;
use crate::transport::{self, Transport};

const STLINK_VID: u16 = 0x0483;
const PID_V2_BOOTLOADER: u16 = 0x3748;
const PID_V3_BOOTLOADER: u16 = 0x374D;
const PID_V21_APPLICATION: u16 = 0x374B;
const PID_V21_MSD_APPLICATION: u16 = 0x3752;
const PID_V3_APPLICATION: u16 = 0x374F;

const OPENMOKO_VID: u16 = 0x1D50;
const BMP_APPLICATION_PID: u16 = 0x6018;
const BMP_DFU_INTERFACE: u16 = 4;

const MODE_SWITCH_READY: u16 = 0x8000;
const MAX_RESCAN_PASSES: u32 = 4;

/// Session-only edits that never live in the 64-byte configuration sector
/// (see [`crate::config::ConfigEdits`] for the on-flash fields).
#[derive(Clone, Debug, Default)]
pub struct EditIntent {
    pub stlink_type: Option<char>,
    pub software_version: Option<u16>,
}

/// Encodes a `S.J.X` version triple the way the wire protocol expects it:
/// `(S & 0xF) << 12 | (J & 0x3F) << 6 | (X & 0x3F)`.
pub fn encode_software_version(s: u8, j: u8, x: u8) -> u16 {
    ((s as u16 & 0xF) << 12) | ((j as u16 & 0x3F) << 6) | (x as u16 & 0x3F)
}

/// Enumerates candidate adapters, switching any application-mode probe
/// into bootloader mode and re-scanning as needed, up to
/// `MAX_RESCAN_PASSES` passes. Returns an opened, interface-claimed
/// transport and the bootloader generation inferred from the product ID
/// alone (refined further once identity is read, see
/// [`crate::identity::read`]).
pub fn find(ctx: &Context) -> Result<(Transport, Generation), Error> {
    for pass in 0..MAX_RESCAN_PASSES {
        let candidates = transport::enumerate(ctx)?;
        let mut switched = false;

        for candidate in candidates {
            if candidate.vendor_id == STLINK_VID {
                match candidate.product_id {
                    PID_V2_BOOTLOADER => {
                        info!("found v2 bootloader (pass {})", pass);
                        return Ok((Transport::open(&candidate.device, 0, 1, 2)?, Generation::V2));
                    }
                    PID_V3_BOOTLOADER => {
                        info!("found v3 bootloader (pass {})", pass);
                        return Ok((Transport::open(&candidate.device, 0, 1, 1)?, Generation::V3));
                    }
                    PID_V21_APPLICATION | PID_V21_MSD_APPLICATION | PID_V3_APPLICATION => {
                        if trigger_mode_switch(&candidate.device)? {
                            switched = true;
                        }
                    }
                    _ => {}
                }
            } else if candidate.vendor_id == OPENMOKO_VID && candidate.product_id == BMP_APPLICATION_PID {
                detach_bmp(&candidate.device)?;
                switched = true;
            }
        }

        if !switched {
            break;
        }
    }

    Err(Error::NotFound)
}

/// Probes an application-mode ST-Link with the `MODE` command; if it
/// reports `0x8000` ("ready to switch"), triggers the DNLOAD handshake and
/// waits the 3 s the bootloader needs to re-enumerate.
fn trigger_mode_switch(device: &rusb::Device<Context>) -> Result<bool, Error> {
    let transport = Transport::open(device, 0, 1, 1)?;
    let dfu = Dfu::new(&transport);
    let reply = dfu.mode(false)?;
    if reply == Some(MODE_SWITCH_READY) {
        dfu.mode(true)?;
        thread::sleep(Duration::from_secs(3));
        Ok(true)
    } else {
        Ok(false)
    }
}

/// Issues a class `DFU_DETACH` control transfer against the alternate-host
/// probe's DFU interface and waits 2 s for it to re-enumerate in
/// bootloader mode.
fn detach_bmp(device: &rusb::Device<Context>) -> Result<(), Error> {
    let transport = Transport::open(device, BMP_DFU_INTERFACE as u8, 0, 0)?;
    let dfu = Dfu::new(&transport);
    dfu.class_detach(1000, BMP_DFU_INTERFACE)?;
    thread::sleep(Duration::from_secs(2));
    Ok(())
}

/// Reads the `STATE` probe and warns (without failing) if any bit outside
/// `0x0003` is set. The meaning of those upper bits is unclear; the check
/// is kept bit-for-bit rather than reinterpreted.
pub fn current_mode(dfu: &Dfu) -> Result<Option<u8>, Error> {
    let raw = dfu.read_state_probe()?;
    if raw & !0x0003u16 != 0 {
        warn!("adapter reported unexpected mode bits: 0x{:04x}", raw);
        return Ok(None);
    }
    let low_byte = (raw & 0xFF) as u8;
    if (raw >> 8) == 0 {
        Ok(Some(low_byte))
    } else {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_software_version_packs_fields() {
        assert_eq!(encode_software_version(1, 8, 0x34), 0x1234);
    }

    #[test]
    fn encode_software_version_masks_each_field() {
        assert_eq!(encode_software_version(0xFF, 0xFF, 0xFF), 0xFFFF);
    }
}
