// This file is part of xmgmtd, an application to manage PCIe-attached reconfigurable accelerator cards.
//
// Copyright 2025 Canonical Ltd.
//
// SPDX-License-Identifier: GPL-3.0-only
//
// xmgmtd is free software: you can redistribute it and/or modify it under the terms of the GNU General Public License version 3, as published by the Free Software Foundation.
//
// xmgmtd is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranties of MERCHANTABILITY, SATISFACTORY QUALITY, or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with this program.  If not, see http://www.gnu.org/licenses/.


//! Command-line client for the xmgmtd daemon.
//!
//! Every subcommand is a single DBus call on the system bus. Replies are printed to stdout;
//! daemon errors come back as DBus errors whose message starts with the `XmgmtError` variant,
//! e.g. `XmgmtError::Busy: ...`, and are printed to stderr with a non-zero exit status.
//!
//! ```bash
//! xmgmt info
//! xmgmt download ./kernel.xclbin
//! xmgmt scale 250 400
//! xmgmt clear datapath
//! ```

use clap::{Parser, Subcommand, arg, command};
use log::{debug, error};
use std::path::PathBuf;

mod control;
mod proxies;
mod status;

use control::control_handler;
use status::{StatusQuery, status_handler};

#[derive(Parser, Debug)]
#[command(name = "xmgmt")]
#[command(bin_name = "xmgmt")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the device snapshot (identity, link, clocks, sensors, loaded image)
    Info,
    /// Print firewall status and recent trips
    Errors,
    /// Print the reset stage and any operation holding the device
    State,
    #[command(flatten)]
    Control(ControlCommand),
}

#[derive(Subcommand, Debug)]
pub enum ControlCommand {
    /// Download a container image into the reconfigurable region
    Download { file: PathBuf },
    /// Ask an in-flight download to stop at its next chunk boundary
    Cancel,
    /// Set clock targets in MHz; a zero leaves that clock unchanged
    Scale {
        #[arg(long, default_value_t = 0)]
        region: u32,
        #[arg(required = true, num_args = 1..)]
        mhz: Vec<u16>,
    },
    /// Reset the whole device and clear every firewall
    HotReset,
    /// Reset the reconfigurable region only
    LogicReset,
    /// Cold reset; the loaded image and clock settings are lost
    Reboot,
    /// Clear one firewall domain: management_control, user_control or datapath
    Clear { domain: String },
    /// Send a raw command code with an optional payload file
    Submit {
        code: u32,
        #[arg(long)]
        payload: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let cli = Cli::parse();
    debug!("parsed cli command with {cli:?}");
    let result = match &cli.command {
        Commands::Info => status_handler(StatusQuery::Info).await,
        Commands::Errors => status_handler(StatusQuery::Errors).await,
        Commands::State => status_handler(StatusQuery::ResetState).await,
        Commands::Control(command) => control_handler(command).await,
    };
    match result {
        Ok(msg) => println!("{msg}"),
        Err(e) => {
            error!("{e}");
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
    Ok(())
}
