//! Command-line interface definitions for tim-gateway.
//!
//! Uses clap's derive API for type-safe argument parsing.

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Intercepting gateway for a federated messaging network.
///
/// Runs an inbound gateway that gates and relays federation traffic towards
/// the local homeserver, and an outbound gateway that terminates CONNECT
/// tunnels with impersonating certificates so outgoing federation requests
/// can be checked against the partner allow-list.
#[derive(Parser, Debug)]
#[command(name = "tim-gateway")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to run (defaults to `run`).
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Path to additional config file.
    ///
    /// Merged on top of the system and user configs.
    #[arg(short = 'c', long = "config", value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// Evaluate and log federation checks without rejecting anything.
    ///
    /// Intended for isolated test environments only.
    #[arg(long = "no-enforce")]
    pub no_enforce: bool,

    /// Override the inbound gateway listen address.
    #[arg(long = "inbound-listen", value_name = "ADDR")]
    pub inbound_listen: Option<SocketAddr>,

    /// Override the outbound gateway listen address.
    #[arg(long = "outbound-listen", value_name = "ADDR")]
    pub outbound_listen: Option<SocketAddr>,

    /// Increase log verbosity.
    ///
    /// -v info, -vv debug, -vvv trace.
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

/// Subcommands for tim-gateway.
#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Commands {
    /// Run both gateways (default).
    Run,

    /// Write a fresh root CA certificate and key for the outbound gateway.
    #[command(name = "generate-ca")]
    GenerateCa {
        /// Directory that receives `ca.crt` and `ca.key`.
        #[arg(short = 'o', long = "out", value_name = "DIR")]
        out: PathBuf,

        /// Common name of the root certificate.
        #[arg(long = "common-name", default_value = "TIM Gateway Root CA")]
        common_name: String,
    },
}

impl Cli {
    /// The command to execute, `run` when none was given.
    pub fn command(&self) -> &Commands {
        self.command.as_ref().unwrap_or(&Commands::Run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults_to_run() {
        let cli = Cli::parse_from(["tim-gateway"]);
        assert_eq!(cli.command(), &Commands::Run);
        assert!(!cli.no_enforce);
        assert_eq!(cli.verbose, 0);
        assert!(cli.config.is_none());
    }

    #[test]
    fn test_cli_parse_with_options() {
        let cli = Cli::parse_from([
            "tim-gateway",
            "-c",
            "/etc/tim/extra.toml",
            "--no-enforce",
            "--inbound-listen",
            "127.0.0.1:9000",
            "-vv",
            "run",
        ]);

        assert_eq!(cli.config, Some(PathBuf::from("/etc/tim/extra.toml")));
        assert!(cli.no_enforce);
        assert_eq!(cli.inbound_listen, Some("127.0.0.1:9000".parse().unwrap()));
        assert!(cli.outbound_listen.is_none());
        assert_eq!(cli.verbose, 2);
    }

    #[test]
    fn test_generate_ca_command() {
        let cli = Cli::parse_from(["tim-gateway", "generate-ca", "--out", "/tmp/ca"]);

        match cli.command() {
            Commands::GenerateCa { out, common_name } => {
                assert_eq!(out, &PathBuf::from("/tmp/ca"));
                assert_eq!(common_name, "TIM Gateway Root CA");
            }
            other => panic!("Expected GenerateCa command, got {:?}", other),
        }
    }

    #[test]
    fn test_invalid_listen_address_rejected() {
        let result = Cli::try_parse_from(["tim-gateway", "--outbound-listen", "nope"]);
        assert!(result.is_err());
    }
}
