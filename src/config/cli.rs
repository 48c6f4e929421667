//! Command-line argument parsing

use clap::{Parser, Subcommand};

use crate::protocol::DEFAULT_DEVICE_NAME_PREFIX;

#[derive(Parser, Debug, Clone)]
#[clap(name = "linkedlamp-provisioner", version, author)]
#[clap(about = "Find LinkedLamp devices over BLE and hand them WiFi credentials")]
pub struct CliArgs {
    /// Bluetooth adapter name (default adapter if omitted)
    #[clap(short, long, global = true)]
    pub adapter: Option<String>,

    /// Advertised name prefix of the lamps
    #[clap(short, long, global = true, default_value = DEFAULT_DEVICE_NAME_PREFIX)]
    pub filter: String,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// List nearby lamps
    Scan {
        /// Scan window in seconds
        #[clap(short, long, default_value = "5")]
        window_secs: u64,

        /// Stop at the first lamp found
        #[clap(long)]
        first: bool,

        /// Print results as JSON
        #[clap(long)]
        json: bool,
    },

    /// Send WiFi credentials to a lamp
    Provision {
        /// WiFi network name
        #[clap(long)]
        ssid: String,

        /// WiFi passphrase
        #[clap(long, env = "LINKEDLAMP_WIFI_PASSWORD", hide_env_values = true)]
        password: String,

        /// Group the lamp joins
        #[clap(short, long)]
        group: String,

        /// Device address; scans for the first lamp when omitted
        #[clap(short, long)]
        device: Option<String>,

        /// Length of one scan window in seconds
        #[clap(long, default_value = "5")]
        scan_window_secs: u64,

        /// Give up waiting for the lamp's answer after this many seconds
        #[clap(long, default_value = "30")]
        timeout_secs: u64,

        /// Number of empty scan windows before giving up
        #[clap(long, default_value = "10")]
        max_scan_attempts: u32,
    },
}
