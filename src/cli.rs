//! Command-line argument parsing via `structopt`.
//!
//! Note: the protocol option `-v`/`--ver` (set reported firmware version)
//! claims the short form `-v`. The ambient verbosity flag added here is
//! therefore long-form only (`--verbose`), to avoid a collision `structopt`
//! would otherwise reject.

use std::num::ParseIntError;
use std::path::PathBuf;

use structopt::StructOpt;

use crate::config::{ConfigEdits, FieldAction, McoOutput, McoSource, StartupPref};
use crate::probe::{encode_software_version, EditIntent};

#[derive(StructOpt, Debug)]
#[structopt(
    name = "stlink-flash",
    about = "Firmware flashing and configuration utility for ST-Link debug probes"
)]
pub struct Opts {
    /// Read and print adapter identity; do not write anything.
    #[structopt(short = "p", long = "probe")]
    pub probe: bool,

    /// Decrypt the firmware image before flashing. An empty value selects
    /// the adapter's default key.
    #[structopt(short = "d", long = "decrypt")]
    pub decrypt: Option<String>,

    /// Persist the decrypted image next to the source file as `<name>.dec`.
    #[structopt(long = "save_dec")]
    pub save_dec: bool,

    /// Adapter type character to write to the configuration sector (one of
    /// A, B, E, F, G, J, M, S).
    #[structopt(short = "t", long = "st_type")]
    pub st_type: Option<char>,

    /// Reported firmware version, as `S.J.X`.
    #[structopt(short = "v", long = "ver")]
    pub ver: Option<String>,

    /// Force a rewrite of the configuration sector with current values.
    #[structopt(short = "f", long = "fix")]
    pub fix: bool,

    /// Set the configured USB current draw, in mA.
    #[structopt(long = "usb_cur")]
    pub usb_cur: Option<u16>,
    #[structopt(long = "rm_usb_cur")]
    pub rm_usb_cur: bool,

    /// Set the mass-storage volume label (up to 11 characters).
    #[structopt(long = "msd_name")]
    pub msd_name: Option<String>,
    #[structopt(long = "rm_msd_name")]
    pub rm_msd_name: bool,

    /// Set the mbed board name (up to 4 characters).
    #[structopt(long = "mbed_name")]
    pub mbed_name: Option<String>,
    #[structopt(long = "rm_mbed_name")]
    pub rm_mbed_name: bool,

    /// Set the DFU options bitfield (bit0 No Power Off, bit1 Autostart).
    #[structopt(long = "dfu_opt")]
    pub dfu_opt: Option<u8>,
    #[structopt(long = "rm_dfu_opt")]
    pub rm_dfu_opt: bool,

    /// Set the dynamic option character (V=MSD Off, M=MSD On, W=MSD Always Off).
    #[structopt(long = "dynamic_opt")]
    pub dynamic_opt: Option<char>,
    #[structopt(long = "rm_dynamic_opt")]
    pub rm_dynamic_opt: bool,

    /// Set the MCO output byte, as hex (source in the low nibble, divider-1 in the high nibble).
    #[structopt(long = "mco_out", parse(try_from_str = parse_hex_u8))]
    pub mco_out: Option<u8>,
    #[structopt(long = "rm_mco_out")]
    pub rm_mco_out: bool,

    /// Set the startup power preference (0=High, 1=Balanced, 2=Low, 3=Default).
    #[structopt(long = "startup")]
    pub startup: Option<u8>,
    #[structopt(long = "rm_startup")]
    pub rm_startup: bool,

    /// Increase logging verbosity; repeatable.
    #[structopt(long = "verbose", parse(from_occurrences))]
    pub verbose: u8,

    /// Firmware image to flash. Application in flash is started when
    /// called without this argument.
    pub firmware: Option<PathBuf>,
}

fn parse_hex_u8(s: &str) -> Result<u8, ParseIntError> {
    let trimmed = s.trim_start_matches("0x").trim_start_matches("0X");
    u8::from_str_radix(trimmed, 16)
}

fn field<T: Clone>(set: Option<T>, remove: bool) -> FieldAction<T> {
    if let Some(v) = set {
        FieldAction::Add(v)
    } else if remove {
        FieldAction::Remove
    } else {
        FieldAction::Copy
    }
}

impl Opts {
    /// Builds the on-flash `ConfigEdits` this invocation requests. A
    /// `--fix` pass and an empty setter string both degrade to `Remove`:
    /// passing `""` to a setter clears the field rather than leaving it
    /// untouched.
    pub fn config_edits(&self) -> ConfigEdits {
        let msd_volume = match &self.msd_name {
            Some(s) if s.is_empty() => FieldAction::Remove,
            Some(s) => FieldAction::Add(s.clone()),
            None => field(None, self.rm_msd_name),
        };
        let mbed_name = match &self.mbed_name {
            Some(s) if s.is_empty() => FieldAction::Remove,
            Some(s) => FieldAction::Add(s.clone()),
            None => field(None, self.rm_mbed_name),
        };
        let dynamic_option = match self.dynamic_opt {
            Some(c) => FieldAction::Add(c),
            None => field(None, self.rm_dynamic_opt),
        };
        let mco_output = match self.mco_out {
            Some(byte) => match McoSource::from_nibble(byte & 0x0F) {
                Some(source) => FieldAction::Add(McoOutput { source, divider: (byte >> 4) + 1 }),
                None => FieldAction::Copy,
            },
            None => field(None, self.rm_mco_out),
        };
        let startup_pref = match self.startup.and_then(StartupPref::from_byte) {
            Some(pref) => FieldAction::Add(pref),
            None => field(None, self.rm_startup),
        };

        ConfigEdits {
            usb_current_ma: field(self.usb_cur, self.rm_usb_cur),
            msd_volume,
            mbed_name,
            dfu_options: field(self.dfu_opt, self.rm_dfu_opt),
            dynamic_option,
            mco_output,
            startup_pref,
        }
    }

    /// Builds the session-only `EditIntent` (adapter type, reported
    /// version) this invocation requests.
    pub fn edit_intent(&self) -> EditIntent {
        EditIntent {
            stlink_type: self.st_type,
            software_version: self.ver.as_deref().and_then(parse_version_triple),
        }
    }

    /// `None` when `--decrypt` was not given; `Some("")` selects the
    /// adapter's default decrypt key (handled in `flash::load_image`).
    pub fn decrypt_key(&self) -> Option<&str> {
        self.decrypt.as_deref()
    }

    /// Any configuration-sector edit was requested: a `--fix`, or any
    /// individual `set`/`rm_` configuration flag. Flashing a firmware image
    /// alone does not imply a config-sector rewrite.
    pub fn wants_write(&self) -> bool {
        self.fix
            || self.st_type.is_some()
            || self.ver.is_some()
            || self.usb_cur.is_some()
            || self.rm_usb_cur
            || self.msd_name.is_some()
            || self.rm_msd_name
            || self.mbed_name.is_some()
            || self.rm_mbed_name
            || self.dfu_opt.is_some()
            || self.rm_dfu_opt
            || self.dynamic_opt.is_some()
            || self.rm_dynamic_opt
            || self.mco_out.is_some()
            || self.rm_mco_out
            || self.startup.is_some()
            || self.rm_startup
    }
}

fn parse_version_triple(s: &str) -> Option<u16> {
    let mut parts = s.splitn(3, '.');
    let s_part: u8 = parts.next()?.parse().ok()?;
    let j_part: u8 = parts.next()?.parse().ok()?;
    let x_part: u8 = parts.next()?.parse().ok()?;
    Some(encode_software_version(s_part, j_part, x_part))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_version_triple_packs_fields() {
        assert_eq!(parse_version_triple("1.8.52"), Some(encode_software_version(1, 8, 52)));
    }

    #[test]
    fn parse_version_triple_rejects_malformed_input() {
        assert_eq!(parse_version_triple("1.8"), None);
        assert_eq!(parse_version_triple("a.b.c"), None);
    }

    #[test]
    fn parse_hex_u8_accepts_0x_prefix() {
        assert_eq!(parse_hex_u8("0x1A").unwrap(), 0x1A);
        assert_eq!(parse_hex_u8("1A").unwrap(), 0x1A);
    }
}
