//! The vendor DFU command layer: 16-byte command framing, status/state
//! polling, and the encrypted block-download sequence.

use std::thread;
use std::time::Duration;

use log::{debug, trace};
use num_enum::{FromPrimitive, IntoPrimitive};
use thiserror::Error as ThisError;

use crate::cipher::{self, Key};
use crate::error::Error;
use crate::transport::Transport;

/// Command-packet magic bytes (offset 0).
pub const MAGIC_INFO: u8 = 0xF1;
pub const MAGIC_DFU: u8 = 0xF3;
pub const MAGIC_MODE: u8 = 0xF9;
pub const MAGIC_STATE: u8 = 0xF5;

/// DFU sub-commands (offset 1, when `magic == MAGIC_DFU`).
pub const DFU_DETACH: u8 = 0x00;
pub const DFU_DNLOAD: u8 = 0x01;
pub const DFU_UPLOAD: u8 = 0x02;
pub const DFU_GETSTATUS: u8 = 0x03;
pub const DFU_CLRSTATUS: u8 = 0x04;
pub const DFU_GETSTATE: u8 = 0x05;
pub const DFU_ABORT: u8 = 0x06;
pub const DFU_EXIT: u8 = 0x07;

/// Flash sub-commands, carried as the payload of a block-0 `DFU_DNLOAD`.
pub const FLASH_GET: u8 = 0x00;
pub const FLASH_SET_ADDRESS_POINTER: u8 = 0x21;
pub const FLASH_ERASE: u8 = 0x41;
pub const FLASH_ERASE_SECTOR: u8 = 0x42;
pub const FLASH_READ_UNPROTECT: u8 = 0x92;

/// Every command packet on the wire is exactly this many bytes.
pub const COMMAND_LEN: usize = 16;

/// Status codes returned by `DFU_GETSTATUS` (`stlink.h`'s `DeviceStatus`).
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoPrimitive, FromPrimitive)]
pub enum DeviceStatus {
    Ok = 0x00,
    ErrTarget = 0x01,
    ErrFile = 0x02,
    ErrWrite = 0x03,
    ErrErase = 0x04,
    ErrCheckErased = 0x05,
    ErrProg = 0x06,
    ErrVerify = 0x07,
    ErrAddress = 0x08,
    ErrNotDone = 0x09,
    ErrFirmware = 0x0A,
    ErrVendor = 0x0B,
    ErrUsbr = 0x0C,
    ErrPor = 0x0D,
    #[num_enum(default)]
    ErrUnknown = 0x0E,
    ErrStalledPkt = 0x0F,
}

/// Device states (`stlink.h`'s `DeviceState`).
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoPrimitive, FromPrimitive)]
pub enum DeviceState {
    AppIdle = 0,
    AppDetach = 1,
    DfuIdle = 2,
    DfuDnloadSync = 3,
    DfuDnBusy = 4,
    DfuDnloadIdle = 5,
    DfuManifestSync = 6,
    DfuManifest = 7,
    DfuManifestWaitReset = 8,
    DfuUploadIdle = 9,
    DfuError = 10,
    #[num_enum(default)]
    Unknown = 0xFF,
}

#[derive(ThisError, Debug)]
pub enum DfuStatusError {
    #[error("status response too short ({0} bytes)")]
    ShortResponse(usize),
}

/// Parsed response to `DFU_GETSTATUS`.
#[derive(Copy, Clone, Debug)]
pub struct DfuStatus {
    pub status: DeviceStatus,
    pub poll_timeout_ms: u32,
    pub state: DeviceState,
    pub string_index: u8,
}

impl DfuStatus {
    fn parse(buf: &[u8]) -> Result<Self, DfuStatusError> {
        if buf.len() < 6 {
            return Err(DfuStatusError::ShortResponse(buf.len()));
        }
        let poll_timeout_ms = u32::from_le_bytes([buf[1], buf[2], buf[3], 0]);
        Ok(DfuStatus {
            status: DeviceStatus::from(buf[0]),
            poll_timeout_ms,
            state: DeviceState::from(buf[4]),
            string_index: buf[5],
        })
    }
}

/// Builds a 16-byte command packet.
pub fn command(magic: u8, sub: u8, w_value: u16, w_index: u16, w_length: u16) -> [u8; COMMAND_LEN] {
    let mut buf = [0u8; COMMAND_LEN];
    buf[0] = magic;
    buf[1] = sub;
    buf[2..4].copy_from_slice(&w_value.to_le_bytes());
    buf[4..6].copy_from_slice(&w_index.to_le_bytes());
    buf[6..8].copy_from_slice(&w_length.to_le_bytes());
    buf
}

/// `wIndex` for a `DFU_DNLOAD` command: the payload's byte sum mod 2^16.
pub fn checksum(data: &[u8]) -> u16 {
    data.iter().fold(0u32, |acc, &b| acc + b as u32) as u16
}

/// Drives the DFU command layer over an open [`Transport`].
pub struct Dfu<'t> {
    transport: &'t Transport,
}

impl<'t> Dfu<'t> {
    pub fn new(transport: &'t Transport) -> Self {
        Self { transport }
    }

    fn exchange(&self, cmd: &[u8; COMMAND_LEN], reply_len: usize) -> Result<Vec<u8>, Error> {
        self.transport.bulk_out(cmd)?;
        if reply_len == 0 {
            return Ok(Vec::new());
        }
        self.transport.bulk_in(reply_len)
    }

    /// `INFO(0x80)`: returns the 6-byte raw response (software version,
    /// bootloader PID). See `identity::read`.
    pub fn read_info(&self) -> Result<[u8; 6], Error> {
        let cmd = command(MAGIC_INFO, 0x80, 0, 0, 6);
        let reply = self.exchange(&cmd, 6)?;
        let mut out = [0u8; 6];
        out.copy_from_slice(&reply[..6.min(reply.len())]);
        Ok(out)
    }

    /// `MAGIC(sub)`: a generic read against the `MAGIC_DFU` magic byte, used
    /// for the chip-id (`0x08`), config (`0x09`), and hw-version (`0x0A`)
    /// reads in `identity::read`.
    pub fn read_magic(&self, sub: u8, w_value: u16, len: usize) -> Result<Vec<u8>, Error> {
        let cmd = command(MAGIC_DFU, sub, w_value, 0, len as u16);
        self.exchange(&cmd, len)
    }

    /// `STATE` probe (magic `0xF5`): returns `data[0] << 8 | data[1]`, with
    /// the mode byte in `data[1]` (low byte) and a status flag in `data[0]`
    /// (high byte) — matches `stlink_current_mode`'s big-endian packing,
    /// not the little-endian wire order used elsewhere. Used to refine the
    /// bootloader generation and the "any unexpected bit set" check in
    /// `probe::current_mode`.
    pub fn read_state_probe(&self) -> Result<u16, Error> {
        let cmd = command(MAGIC_STATE, 0, 0, 0, 2);
        let reply = self.exchange(&cmd, 2)?;
        Ok(u16::from_be_bytes([reply[0], reply.get(1).copied().unwrap_or(0)]))
    }

    /// `MODE` probe/trigger (magic `0xF9`). When `trigger` is `true`, the
    /// sub-byte is set to `DFU_DNLOAD` and no reply is read back (matches
    /// `stlink_dfu_mode()`'s write-only trigger path).
    pub fn mode(&self, trigger: bool) -> Result<Option<u16>, Error> {
        let sub = if trigger { DFU_DNLOAD } else { 0 };
        let cmd = command(MAGIC_MODE, sub, 0, 0, if trigger { 0 } else { 2 });
        if trigger {
            self.transport.bulk_out(&cmd)?;
            Ok(None)
        } else {
            let reply = self.exchange(&cmd, 2)?;
            Ok(Some(u16::from_be_bytes([reply[0], reply[1]])))
        }
    }

    pub fn get_status(&self) -> Result<DfuStatus, Error> {
        let cmd = command(MAGIC_DFU, DFU_GETSTATUS, 0, 0, 6);
        let reply = self.exchange(&cmd, 6)?;
        Ok(DfuStatus::parse(&reply).map_err(|_| Error::UnknownDfuStatus(0xFF))?)
    }

    pub fn clear_status(&self) -> Result<(), Error> {
        let cmd = command(MAGIC_DFU, DFU_CLRSTATUS, 0, 0, 0);
        self.transport.bulk_out(&cmd)?;
        Ok(())
    }

    pub fn set_address(&self, address: u32) -> Result<(), Error> {
        let payload = [
            FLASH_SET_ADDRESS_POINTER,
            (address & 0xFF) as u8,
            ((address >> 8) & 0xFF) as u8,
            ((address >> 16) & 0xFF) as u8,
            ((address >> 24) & 0xFF) as u8,
        ];
        self.download(None, &payload, 0)
    }

    pub fn erase(&self, address: u32) -> Result<(), Error> {
        let payload = [
            FLASH_ERASE,
            (address & 0xFF) as u8,
            ((address >> 8) & 0xFF) as u8,
            ((address >> 16) & 0xFF) as u8,
            ((address >> 24) & 0xFF) as u8,
        ];
        self.download(None, &payload, 0)
    }

    pub fn erase_sector(&self, sector: u8) -> Result<(), Error> {
        let payload = [FLASH_ERASE_SECTOR, sector];
        self.download(None, &payload, 0)
    }

    /// `DFU_DNLOAD` followed by the mandated two status polls (one right
    /// after the transfer, one after sleeping the reported poll timeout).
    /// When `key` is `Some`, `payload` is encrypted in place (block-by-block)
    /// before it is sent — callers are expected to pass `None` for block-0
    /// flash sub-commands and block 1, and `Some`
    /// for every block `>= 2` (see `Dfu::download_encrypted`).
    pub fn download(&self, key: Option<&Key>, payload: &[u8], block_num: u16) -> Result<(), Error> {
        let w_index = checksum(payload);
        let mut buf = payload.to_vec();
        if let Some(key) = key {
            debug_assert!(block_num >= 2, "only blocks >= 2 are encrypted on the wire");
            cipher::encrypt_buffer(key, &mut buf);
        }
        let cmd = command(MAGIC_DFU, DFU_DNLOAD, block_num, w_index, buf.len() as u16);
        trace!("DNLOAD block {} ({} bytes, wIndex=0x{:04x})", block_num, buf.len(), w_index);
        self.transport.bulk_out(&cmd)?;
        if !buf.is_empty() {
            self.transport.bulk_out(&buf)?;
        }

        let first = self.get_status()?;
        if first.state != DeviceState::DfuDnBusy || first.status != DeviceStatus::Ok {
            return Err(Self::map_status_error(first));
        }

        thread::sleep(Duration::from_millis(first.poll_timeout_ms as u64));

        let second = self.get_status()?;
        if second.state != DeviceState::DfuDnloadIdle {
            return Err(Self::map_status_error(second));
        }
        debug!("DNLOAD block {} complete", block_num);
        Ok(())
    }

    /// Convenience wrapper for an encrypted write (block number `>= 2`).
    pub fn download_encrypted(&self, key: &Key, payload: &[u8], block_num: u16) -> Result<(), Error> {
        self.download(Some(key), payload, block_num)
    }

    fn map_status_error(status: DfuStatus) -> Error {
        match status.status {
            DeviceStatus::ErrVendor => Error::ReadOnlyProtection,
            DeviceStatus::ErrTarget => Error::InvalidAddress,
            other => Error::UnknownDfuStatus(u8::from(other)),
        }
    }

    pub fn exit(&self) -> Result<(), Error> {
        let cmd = command(MAGIC_DFU, DFU_EXIT, 0, 0, 0);
        self.transport.bulk_out(&cmd)?;
        Ok(())
    }

    /// Class `DFU_DETACH` control transfer, used only against the
    /// alternate-host probe (see [`crate::probe`]).
    pub fn class_detach(&self, timeout_ms: u16, interface: u16) -> Result<(), Error> {
        self.transport.control_out(DFU_DETACH, timeout_ms, interface, &[])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn command_packet_is_sixteen_bytes() {
        let cmd = command(MAGIC_DFU, DFU_DNLOAD, 2, 0x1234, 64);
        assert_eq!(cmd.len(), COMMAND_LEN);
    }

    #[test]
    fn command_layout_matches_wire_order() {
        let cmd = command(MAGIC_DFU, DFU_DNLOAD, 0x0002, 0x1234, 0x0040);
        let expected: [u8; 16] = hex!("F3010200341240000000000000000000");
        assert_eq!(cmd, expected);
    }

    #[test]
    fn checksum_is_byte_sum_mod_65536() {
        let data = [0xFFu8; 300];
        let expected = (0xFFu32 * 300) as u16;
        assert_eq!(checksum(&data), expected);
    }

    #[test]
    fn checksum_must_be_taken_over_plaintext_not_ciphertext() {
        let key: Key = hex!("000102030405060708090A0B0C0D0E0F");
        let payload = [0x5Au8; 16];
        let mut ciphertext = payload;
        cipher::encrypt_buffer(&key, &mut ciphertext);
        assert_ne!(
            checksum(&payload),
            checksum(&ciphertext),
            "wIndex must be computed before encryption, per the wire checksum over plaintext"
        );
    }

    #[test]
    fn state_probe_reply_is_big_endian_with_mode_in_low_byte() {
        // stlink_current_mode: value = data[0] << 8 | data[1], mode = data[1].
        let reply = [0x00u8, 0x03];
        let raw = u16::from_be_bytes(reply);
        assert_eq!(raw, 0x0003);
        assert_eq!((raw & 0xFF) as u8, 3, "mode byte must come from the low byte");
        assert_eq!(raw & !0x0003u16, 0, "mode 3 must pass the 0xfffc mask check");
    }

    #[test]
    fn status_parse_extracts_24bit_poll_timeout() {
        let raw = [0x00u8, 0x64, 0x00, 0x00, 0x05, 0x00];
        let status = DfuStatus::parse(&raw).unwrap();
        assert_eq!(status.status, DeviceStatus::Ok);
        assert_eq!(status.poll_timeout_ms, 100);
        assert_eq!(status.state, DeviceState::DfuDnloadIdle);
    }

    #[test]
    fn status_parse_rejects_short_buffer() {
        assert!(DfuStatus::parse(&[0, 1, 2]).is_err());
    }

    #[test]
    fn unknown_status_code_maps_to_err_unknown() {
        assert_eq!(DeviceStatus::from(0x42u8), DeviceStatus::ErrUnknown);
    }
}
