use std::process::ExitCode;

use log::{error, info};
use structopt::StructOpt;

use stlink::cli::Opts;
use stlink::config::ConfigRecord;
use stlink::dfu::Dfu;
use stlink::identity::{self, AdapterInfo};
use stlink::{flash, probe, transport};

fn init_logging(verbose: u8) {
    let mut builder = pretty_env_logger::formatted_builder();
    let level = match verbose {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    if std::env::var("RUST_LOG").is_err() {
        builder.filter_level(level);
    } else {
        builder.parse_default_env();
    }
    let _ = builder.try_init();
}

fn print_identity(info: &AdapterInfo) {
    let ver_type = if info.generation == identity::Generation::V21 { 'M' } else { 'S' };
    let s = (info.software_version >> 12) & 0xF;
    let j = (info.software_version >> 6) & 0x3F;
    let x = info.software_version & 0x3F;
    println!("Version: V{}J{}{}{}", s, j, ver_type, x);

    print!("Chip ID: ");
    for quad in info.chip_id.chunks(4) {
        for b in quad.iter().rev() {
            print!("{:02X}", b);
        }
        print!(" ");
    }
    println!();

    let msd_disabled = info
        .config
        .as_ref()
        .and_then(ConfigRecord::dynamic_option)
        .map(|c| c == 'V')
        .unwrap_or(false);
    println!(
        "STLink Type: {} [{}]",
        info.stlink_type,
        stlink::config::describe_stlink_type(info.stlink_type, msd_disabled)
    );

    println!("Firmware key: {}", hex_string(&info.firmware_key));
    println!("Anti-clone tag: {}", hex_string(&info.anti_clone_tag));
}

fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn run() -> Result<(), stlink::Error> {
    let opts = Opts::from_args();
    init_logging(opts.verbose);

    let ctx = transport::context()?;
    let (transport_handle, generation) = probe::find(&ctx)?;
    let dfu = Dfu::new(&transport_handle);
    let mut info = identity::read(&dfu, generation)?;

    print_identity(&info);

    match probe::current_mode(&dfu)? {
        Some(mode) => info!("current mode: {}", mode),
        None => {
            error!("ST-Link dongle is not in the correct mode. Please unplug and plug the dongle again.");
            return Ok(());
        }
    }

    if opts.probe {
        return Ok(());
    }

    let mut flash_ok = true;

    if let Some(path) = &opts.firmware {
        let image = flash::load_image(path, opts.decrypt_key(), opts.save_dec)?;
        match flash::check_size(&info, &image).and_then(|()| flash::write_image(&dfu, &info, &image)) {
            Ok(()) => info!("firmware flashed successfully"),
            Err(e) => {
                error!("flashing failed: {}", e);
                flash_ok = false;
            }
        }
    }

    if flash_ok && opts.wants_write() {
        let edit_intent = opts.edit_intent();
        let config_edits = opts.config_edits();
        let current = info
            .config
            .take()
            .unwrap_or_else(|| ConfigRecord::parse(&[0xFF; stlink::config::CONFIG_LEN]));
        let stlink_type = edit_intent.stlink_type.unwrap_or(info.stlink_type);
        let software_version = edit_intent.software_version.unwrap_or(info.software_version);

        flash::write_config_area(&dfu, &info, &current, &config_edits, stlink_type, software_version)?;
        info!("configuration sector updated");
    }

    dfu.exit()?;
    Ok(())
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}
