//! # propsync CLI
//!
//! Command-line utilities for poking at device endpoints while wiring
//! up a bridge.

use anyhow::{Context, Result};
use propsync_adapter_http::{HttpDevice, HttpDeviceConfig};
use propsync_core::DeviceProtocol;
use std::env;

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_help();
        return Ok(());
    }

    match args[1].as_str() {
        "get" => {
            if args.len() < 4 {
                eprintln!("Usage: propsync get <base-url> <key>...");
                std::process::exit(1);
            }
            let device = device(&args[2])?;
            let keys: Vec<String> = args[3..].to_vec();
            let props = device
                .get_properties(&keys)
                .await
                .context("Failed to read properties")?;
            println!("{}", serde_json::to_string_pretty(&props)?);
        }
        "set" => {
            if args.len() < 6 {
                eprintln!("Usage: propsync set <base-url> <key> <call> <value-json>");
                std::process::exit(1);
            }
            let device = device(&args[2])?;
            let value = serde_json::from_str(&args[5])
                .with_context(|| format!("Invalid JSON value: {}", args[5]))?;
            device
                .set_property(&args[3], &args[4], &value)
                .await
                .context("Failed to write property")?;
            println!("OK");
        }
        "help" | "--help" | "-h" => {
            print_help();
        }
        cmd => {
            eprintln!("Unknown command: {cmd}");
            print_help();
            std::process::exit(1);
        }
    }

    Ok(())
}

fn device(base_url: &str) -> Result<HttpDevice> {
    HttpDevice::new(HttpDeviceConfig {
        base_url: base_url.to_string(),
        token: env::var("PROPSYNC_DEVICE_TOKEN").ok(),
        ..HttpDeviceConfig::default()
    })
    .context("Failed to create device client")
}

fn print_help() {
    println!(
        r#"propsync CLI

USAGE:
    propsync <COMMAND> [OPTIONS]

COMMANDS:
    get <base-url> <key>...                  Read device properties
    set <base-url> <key> <call> <value-json> Write one device property
    help                                     Show this help message

The bearer token, if the device needs one, is read from the
PROPSYNC_DEVICE_TOKEN environment variable.

EXAMPLES:
    propsync get http://192.168.4.1 power hum temp_dec
    propsync set http://192.168.4.1 power set_power '"on"'
"#
    );
}
