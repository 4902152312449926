use clap::{Parser, Subcommand};
use meshprov_core::server::DEFAULT_LISTEN_ADDRESS;
use std::path::PathBuf;
use std::time::Duration;

use crate::utils::parse_u16;

#[derive(Parser, Debug)]
#[command(name = "meshprov")]
#[command(author, version, about, long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Cli {
    /// Address of the device bridge (host:port)
    #[arg(short, long, global = true, env = "MESHPROV_BRIDGE", default_value = "127.0.0.1:8000")]
    pub bridge: String,

    /// Node directory file
    #[arg(long, global = true, env = "MESHPROV_DB", default_value = "database/nodes.json")]
    pub db: PathBuf,

    /// How long to wait for the device to answer (e.g. 10s, 500ms)
    #[arg(short = 't', long, global = true, default_value = "10s", value_parser = humantime::parse_duration)]
    pub timeout: Duration,

    /// Skip adding the default subnet, application key and local address range on connect
    #[arg(long, global = true)]
    pub skip_setup: bool,

    /// Output in JSON format
    #[arg(short = 'j', long, global = true)]
    pub json: bool,

    /// Enable debug logging
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    /// Enable verbose logging
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Serve length-prefixed JSON requests over TCP
    Serve {
        /// Listen address
        #[arg(short, long, default_value = DEFAULT_LISTEN_ADDRESS)]
        listen: String,
    },

    /// Interactive provisioning shell
    Shell,

    /// List nodes in the directory without connecting to the device
    Nodes,

    /// Scan for unprovisioned devices
    Scan {
        /// How long to scan
        #[arg(short = 'D', long, default_value = "10s", value_parser = humantime::parse_duration)]
        duration: Duration,
    },

    /// Provision a device and configure it
    Provision {
        /// Device UUID (32 hex digits)
        uuid: String,

        /// How long to scan for the device first
        #[arg(long, default_value = "5s", value_parser = humantime::parse_duration)]
        scan: Duration,
    },

    /// Reset a node and remove it from the directory
    Unprovision {
        /// Unicast address (decimal or 0x-prefixed hex)
        #[arg(value_parser = parse_u16)]
        address: u16,
    },

    /// Set the publish address of a model
    Publish(ModelTarget),

    /// Replace the subscriptions of a model with one address
    Subscribe(ModelTarget),
}

#[derive(clap::Args, Debug, Clone, Copy)]
pub struct ModelTarget {
    /// Unicast address of the node
    #[arg(value_parser = parse_u16)]
    pub node: u16,

    /// Element index on the node
    #[arg(value_parser = parse_u16)]
    pub element: u16,

    /// Model identifier
    #[arg(value_parser = parse_u16)]
    pub model_id: u16,

    /// Publish or subscribe address
    #[arg(value_parser = parse_u16)]
    pub address: u16,
}
