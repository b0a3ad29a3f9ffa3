//! Flash programming engine: firmware image preprocessing, the
//! erase/address/download write loop, and the configuration-sector write.

use std::fs;
use std::path::Path;

use log::info;

use crate::cipher::{self, Key};
use crate::config::{self, ConfigEdits, ConfigRecord};
use crate::dfu::Dfu;
use crate::error::Error;
use crate::identity::{AdapterInfo, Generation};

const BASE_ADDRESS_V2: u32 = 0x0800_0000 + 0x4000;
const BASE_ADDRESS_V3: u32 = 0x0800_0000 + 0x2_0000;
const FLASH_ORIGIN: u32 = 0x0800_0000;
const CHUNK_LEN: usize = 2048;
const DECRYPT_CHUNK_LEN: usize = 0xC00;
const DEFAULT_DECRYPT_KEY: &str = "best performance";
const CONFIG_SECTOR_ADDRESS: u32 = 0x0800_3C00;
const CONFIG_SECTOR_LEN: u32 = 0x400;
const FIRMWARE_EXISTS_MARKER: [u8; 4] = [0xD3, 0x27, 0x00, 0xA5];

/// V3 sector-start table, relative to `FLASH_ORIGIN`: index is the sector
/// number passed to `ERASE_SECTOR`.
const V3_SECTORS: [u32; 8] = [
    0x0000, 0x4000, 0x8000, 0xC000, 0x1_0000, 0x2_0000, 0x4_0000, 0x6_0000,
];

fn base_address(generation: Generation) -> u32 {
    match generation {
        Generation::V2 | Generation::V21 => BASE_ADDRESS_V2,
        Generation::V3 => BASE_ADDRESS_V3,
    }
}

fn decrypt_key_bytes(key: &str) -> Key {
    let source = if key.is_empty() { DEFAULT_DECRYPT_KEY } else { key };
    let mut out = [0u8; 16];
    let bytes = source.as_bytes();
    let n = bytes.len().min(16);
    out[..n].copy_from_slice(&bytes[..n]);
    out
}

/// Reads a firmware image from `path`, optionally decrypting it in
/// `DECRYPT_CHUNK_LEN`-byte chunks with `decrypt_key`, optionally saving
/// the decrypted buffer alongside it, and padding the result to a 16-byte
/// boundary with `0xFF`.
pub fn load_image(path: &Path, decrypt_key: Option<&str>, save_decrypted: bool) -> Result<Vec<u8>, Error> {
    let mut image = fs::read(path)?;
    if image.is_empty() {
        return Err(Error::EmptyImage);
    }

    if let Some(key) = decrypt_key {
        let key_bytes = decrypt_key_bytes(key);
        for chunk in image.chunks_mut(DECRYPT_CHUNK_LEN) {
            cipher::decrypt_buffer(&key_bytes, chunk);
        }
        if save_decrypted {
            let mut dec_path = path.to_path_buf();
            let mut name = dec_path.file_name().unwrap_or_default().to_os_string();
            name.push(".dec");
            dec_path.set_file_name(name);
            fs::write(&dec_path, &image)?;
        }
    }

    let pad = (16 - image.len() % 16) % 16;
    image.resize(image.len() + pad, 0xFF);
    Ok(image)
}

/// `(effective_flash_size_kb - 1 - 16 - reserved_flash_kb) * 1024`: the
/// largest image this adapter accepts.
pub fn available_bytes(info: &AdapterInfo) -> usize {
    let kb = info
        .effective_flash_size_kb()
        .saturating_sub(1)
        .saturating_sub(16)
        .saturating_sub(info.reserved_flash_kb());
    kb as usize * 1024
}

/// Rejects images too large for the adapter before any write occurs.
pub fn check_size(info: &AdapterInfo, image: &[u8]) -> Result<(), Error> {
    let available = available_bytes(info);
    if image.len() > available {
        return Err(Error::ImageTooLarge {
            image_size: image.len(),
            available,
        });
    }
    Ok(())
}

fn v3_sector_for_offset(offset: u32) -> Option<u8> {
    V3_SECTORS
        .iter()
        .position(|&s| s == offset)
        .map(|i| i as u8)
}

/// Writes `image` starting at the generation-appropriate base address,
/// erasing pages (V2/V2.1) or sectors (V3) as the write crosses their
/// boundaries, reporting percentage progress as it goes.
///
/// V3's sector index is resolved once against [`V3_SECTORS`] at the base
/// address (the base is always one of the table's 8 entries), then counted
/// up by one for every subsequent 16 KiB boundary crossed, rather than
/// re-matching each boundary's absolute address against the table — a
/// write starting mid-table still advances sector numbers sequentially
/// even though the table's own address deltas are uneven past the first
/// few entries.
pub fn write_image(dfu: &Dfu, info: &AdapterInfo, image: &[u8]) -> Result<(), Error> {
    let base = base_address(info.generation);
    let total = image.len();
    let mut offset = 0usize;

    let base_sector = match info.generation {
        Generation::V3 => v3_sector_for_offset(base - FLASH_ORIGIN),
        Generation::V2 | Generation::V21 => None,
    };

    while offset < total {
        let chunk_len = CHUNK_LEN.min(total - offset);
        let addr = base + offset as u32;
        let chunk = &image[offset..offset + chunk_len];

        let block_num = match info.generation {
            Generation::V2 | Generation::V21 => {
                dfu.erase(addr)?;
                2
            }
            Generation::V3 => {
                if offset % 0x4000 == 0 {
                    let sector = base_sector
                        .map(|s| s.wrapping_add((offset / 0x4000) as u8))
                        .unwrap_or(0xFF);
                    dfu.erase_sector(sector)?;
                    2
                } else {
                    3
                }
            }
        };

        dfu.set_address(addr)?;
        dfu.download_encrypted(&info.firmware_key, chunk, block_num)?;

        offset += chunk_len;
        let percent = (offset as f64 / total as f64) * 100.0;
        info!("flashing: {:.1}% ({}/{} bytes)", percent, offset, total);
    }

    Ok(())
}

/// Writes the 64-byte configuration sector plus the anti-clone tag,
/// adapter-type byte, software version, and firmware-exists marker.
/// `stlink_type` and `software_version` come from the session-only
/// [`crate::probe::EditIntent`], not the 64-byte sector.
pub fn write_config_area(
    dfu: &Dfu,
    info: &AdapterInfo,
    current: &ConfigRecord,
    edits: &ConfigEdits,
    stlink_type: char,
    software_version: u16,
) -> Result<(), Error> {
    let key = &info.firmware_key;

    dfu.erase(CONFIG_SECTOR_ADDRESS)?;

    dfu.set_address(CONFIG_SECTOR_ADDRESS)?;
    dfu.download_encrypted(key, &info.anti_clone_tag, 2)?;

    let mut type_block = [0xFFu8; 16];
    type_block[0] = stlink_type as u8;
    dfu.set_address(CONFIG_SECTOR_ADDRESS + 0x20)?;
    dfu.download_encrypted(key, &type_block, 2)?;

    let config_bytes = config::apply(current, edits);
    dfu.set_address(CONFIG_SECTOR_ADDRESS + 0x30)?;
    dfu.download_encrypted(key, &config_bytes, 2)?;

    let mut version_block = [0xFFu8; 16];
    version_block[14] = (software_version >> 8) as u8;
    version_block[15] = (software_version & 0xFF) as u8;
    dfu.set_address(CONFIG_SECTOR_ADDRESS + CONFIG_SECTOR_LEN - 0x10)?;
    dfu.download_encrypted(key, &version_block, 2)?;

    let last_page_addr = FLASH_ORIGIN + info.effective_flash_size_kb() * 1024 - 16;
    dfu.erase(last_page_addr)?;
    let mut exists_block = [0xFFu8; 16];
    exists_block[12..16].copy_from_slice(&FIRMWARE_EXISTS_MARKER);
    dfu.set_address(last_page_addr)?;
    dfu.download_encrypted(key, &exists_block, 2)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v3_sector_lookup_matches_fixed_table() {
        assert_eq!(v3_sector_for_offset(0), Some(0));
        assert_eq!(v3_sector_for_offset(0x4000), Some(1));
        assert_eq!(v3_sector_for_offset(0x6_0000), Some(7));
        assert_eq!(v3_sector_for_offset(0x1234), None);
    }

    #[test]
    fn decrypt_key_bytes_falls_back_to_default() {
        let default = decrypt_key_bytes("");
        let mut expected = [0u8; 16];
        expected[..DEFAULT_DECRYPT_KEY.len()].copy_from_slice(DEFAULT_DECRYPT_KEY.as_bytes());
        assert_eq!(default, expected);
    }

    #[test]
    fn base_address_differs_between_generations() {
        assert_eq!(base_address(Generation::V2), 0x0800_4000);
        assert_eq!(base_address(Generation::V3), 0x0802_0000);
    }

    #[test]
    fn v3_base_sector_matches_table_and_counts_up_across_boundaries() {
        let base = base_address(Generation::V3);
        let base_sector = v3_sector_for_offset(base - FLASH_ORIGIN).unwrap();
        assert_eq!(base_sector, 5);
        // A 20 KiB image crosses exactly one 16 KiB boundary (at image
        // offset 0x4000): sector 5 at the start, sector 6 at the boundary.
        assert_eq!(base_sector.wrapping_add(0), 5);
        assert_eq!(base_sector.wrapping_add(1), 6);
    }
}
