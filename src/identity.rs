//! Device identity and key derivation: reads chip ID and static info from
//! an adapter already in bootloader mode, then derives the per-device
//! firmware key and anti-clone tag from it.

use log::info;

use crate::cipher::{self, Block, Key};
use crate::config::ConfigRecord;
use crate::dfu::Dfu;
use crate::error::Error;

/// Which bootloader generation a probe exposes. Endpoint assignment and
/// erase/write granularity both key off this (see [`crate::flash`] and
/// [`crate::probe`]).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Generation {
    V2,
    V21,
    V3,
}

/// Everything learned about an adapter once it is in bootloader mode and
/// has been read once.
pub struct AdapterInfo {
    pub generation: Generation,
    pub software_version: u16,
    pub bootloader_pid: u16,
    pub reported_flash_size_kb: u32,
    pub stlink_type: char,
    pub chip_id: [u8; 12],
    pub hardware_version: u32,
    pub mode: u8,
    pub firmware_key: Key,
    pub anti_clone_tag: Block,
    pub config: Option<ConfigRecord>,
}

impl AdapterInfo {
    /// Bit 0 of `hardware_version`: the probe reports a nominal flash size
    /// that should be treated as a full 128 KiB regardless of the raw
    /// value.
    fn overwrite_128k(hardware_version: u32) -> bool {
        hardware_version & 0x1 != 0
    }

    /// Bit 1 of `hardware_version`: 20 KiB of flash is reserved and must be
    /// excluded from the writable/effective size.
    fn reserved_20k(hardware_version: u32) -> bool {
        hardware_version & 0x2 != 0
    }

    pub fn effective_flash_size_kb(&self) -> u32 {
        if Self::overwrite_128k(self.hardware_version) {
            128
        } else {
            self.reported_flash_size_kb
        }
    }

    pub fn reserved_flash_kb(&self) -> u32 {
        if Self::reserved_20k(self.hardware_version) {
            20
        } else {
            0
        }
    }
}

/// Reads identity from a probe already in bootloader mode, as given an
/// initial generation guess from [`crate::probe`] (refined here from the
/// device's own mode byte).
pub fn read(dfu: &Dfu, initial_generation: Generation) -> Result<AdapterInfo, Error> {
    let info_raw = dfu.read_info()?;
    let software_version = u16::from_be_bytes([info_raw[0], info_raw[1]]);
    let bootloader_pid = u16::from_le_bytes([info_raw[4], info_raw[5]]);

    let magic = dfu.read_magic(0x08, 0, 20)?;
    let reported_flash_size_kb = u16::from_le_bytes([magic[0], magic[1]]) as u32;
    let stlink_type = magic[4] as char;
    let mut chip_id = [0u8; 12];
    chip_id.copy_from_slice(&magic[8..20]);

    let mode_probe = dfu.read_state_probe()?;
    let mode = (mode_probe & 0xFF) as u8;
    let generation = refine_generation(initial_generation, mode);

    let mut derivation_block: Block = [0u8; 16];
    derivation_block[..4].copy_from_slice(&info_raw[..4]);
    derivation_block[4..16].copy_from_slice(&chip_id);

    let firmware_key = cipher::derive("I am key, wawawa", &derivation_block);
    let anti_clone_tag = cipher::derive("What are you doing", &derivation_block);

    let (config, hardware_version) = if generation != Generation::V2 {
        match read_config_and_hw_version(dfu) {
            Ok(pair) => pair,
            Err(_) => (None, 0),
        }
    } else {
        (None, 0)
    };

    info!(
        "adapter identified: type={} version=0x{:04x} chip_id={:02x?}",
        stlink_type, software_version, chip_id
    );

    Ok(AdapterInfo {
        generation,
        software_version,
        bootloader_pid,
        reported_flash_size_kb,
        stlink_type,
        chip_id,
        hardware_version,
        mode,
        firmware_key,
        anti_clone_tag,
        config,
    })
}

fn refine_generation(initial: Generation, mode: u8) -> Generation {
    match mode {
        0 | 1 => initial,
        2 => Generation::V21,
        _ if mode >= 3 => Generation::V3,
        _ => initial,
    }
}

/// `MAGIC(0x09)` (64-byte config) and `MAGIC(0x0A)` (16-byte hw-version
/// block), tolerating the libusb "unsupported" stall some bootloaders
/// return for these two reads.
fn read_config_and_hw_version(dfu: &Dfu) -> Result<(Option<ConfigRecord>, u32), Error> {
    let raw_config = dfu.read_magic(0x09, 0x40, 64)?;
    let config = ConfigRecord::parse(&raw_config);

    let raw_hw = dfu.read_magic(0x0A, 0, 16)?;
    let hardware_version = u32::from_le_bytes([raw_hw[0], raw_hw[1], raw_hw[2], raw_hw[3]]);

    Ok((Some(config), hardware_version))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effective_flash_size_honors_overwrite_bit() {
        let info = sample_info(0x1, 64);
        assert_eq!(info.effective_flash_size_kb(), 128);
    }

    #[test]
    fn effective_flash_size_falls_back_to_reported() {
        let info = sample_info(0x0, 64);
        assert_eq!(info.effective_flash_size_kb(), 64);
    }

    #[test]
    fn reserved_flash_honors_reserved_bit() {
        let info = sample_info(0x2, 64);
        assert_eq!(info.reserved_flash_kb(), 20);
        assert_eq!(sample_info(0x0, 64).reserved_flash_kb(), 0);
    }

    #[test]
    fn refine_generation_promotes_on_mode_byte() {
        assert_eq!(refine_generation(Generation::V2, 2), Generation::V21);
        assert_eq!(refine_generation(Generation::V2, 3), Generation::V3);
        assert_eq!(refine_generation(Generation::V2, 0), Generation::V2);
    }

    fn sample_info(hardware_version: u32, reported_flash_size_kb: u32) -> AdapterInfo {
        AdapterInfo {
            generation: Generation::V3,
            software_version: 0,
            bootloader_pid: 0,
            reported_flash_size_kb,
            stlink_type: 'S',
            chip_id: [0; 12],
            hardware_version,
            mode: 3,
            firmware_key: [0; 16],
            anti_clone_tag: [0; 16],
            config: None,
        }
    }
}
