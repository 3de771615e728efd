//! Command line interface

use std::convert::TryFrom;

use clap::{App, Arg, ArgGroup};

use crate::config::Config;

/// CLI manager
pub struct CLI;

impl CLI {
    /// Parse the command line
    pub fn parse(args: Vec<&str>) -> Result<Config, String> {
        // Create the `App` instance
        let app = App::new(args[0].to_string())
            .version(clap::crate_version!())
            .about(clap::crate_description!())
            .arg(
                Arg::with_name("target")
                    .index(1)
                    .required(true)
                    .help("Path to the target executable"),
            )
            .arg(
                Arg::with_name("qemu")
                    .long("qemu")
                    .help("Run the target under the qemu fork server"),
            )
            .arg(
                Arg::with_name("valgrind")
                    .long("valgrind")
                    .help("Run the target under the valgrind superblock tracer"),
            )
            .group(
                ArgGroup::with_name("backend")
                    .args(&["qemu", "valgrind"])
                    .required(true),
            )
            .arg(
                Arg::with_name("input")
                    .short("i")
                    .long("input")
                    .required(true)
                    .takes_value(true)
                    .help("Path to a directory containing seed inputs"),
            )
            .arg(
                Arg::with_name("output")
                    .short("o")
                    .long("output")
                    .takes_value(true)
                    .default_value("output")
                    .help("Path to a directory used to write crashing inputs"),
            )
            .arg(
                Arg::with_name("workdir")
                    .long("workdir")
                    .takes_value(true)
                    .default_value(".")
                    .help("Working directory for the fork server plumbing"),
            )
            .arg(
                Arg::with_name("timeout")
                    .long("timeout")
                    .takes_value(true)
                    .default_value("1")
                    .help("Per execution timeout in seconds, 0 to disable"),
            )
            .arg(
                Arg::with_name("stat_interval")
                    .long("stat_interval")
                    .takes_value(true)
                    .default_value("100")
                    .help("Status line refresh interval in milliseconds"),
            )
            .arg(
                Arg::with_name("verbose")
                    .short("v")
                    .long("verbose")
                    .help("Set verbose mode"),
            );

        // Match the program args
        let matches = app
            .get_matches_from_safe(args)
            .map_err(|error| format!("{}", error))?;

        // Create the program `Config`
        Config::try_from(&matches).map_err(|error| format!("{}", error))
    }
}
