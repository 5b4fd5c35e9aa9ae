//! Command-line configuration.
//!
//! Every value has a hardcoded default, overridable from the command
//! line via one `Arg` per flag, `ArgAction::Count` for `-v`.

use clap::{Arg, ArgAction, Command};
use log::LevelFilter;

const DEFAULT_PORT: u16 = 10010;
const DEFAULT_CACHE_ROOT: &str = "/var/cache/allkorrect";

/// Parsed startup configuration for `allkorrectd`.
#[derive(Debug, Clone)]
pub struct Config {
    /// TCP port the daemon listens on.
    pub port: u16,
    /// Root directory of the blob/tmp cache.
    pub cache_root: std::path::PathBuf,
    /// Log verbosity, derived from repeated `-v`.
    pub log_level: LevelFilter,
}

impl Config {
    /// Parses `std::env::args()`.
    pub fn from_args() -> Self {
        let matches = Command::new("allkorrectd")
            .version(clap::crate_version!())
            .author("AllKorrect contributors")
            .about("Root-privileged sandboxed execution daemon")
            .arg(
                Arg::new("port")
                    .long("port")
                    .value_name("PORT")
                    .default_value("10010")
                    .help("TCP port to listen on"),
            )
            .arg(
                Arg::new("cache-root")
                    .long("cache-root")
                    .value_name("DIR")
                    .default_value(DEFAULT_CACHE_ROOT)
                    .help("Directory used to store blobs and session tmp files"),
            )
            .arg(
                Arg::new("v")
                    .short('v')
                    .action(ArgAction::Count)
                    .help("Sets the level of verbosity"),
            )
            .get_matches();

        let port = matches
            .get_one::<String>("port")
            .expect("has default")
            .parse()
            .unwrap_or(DEFAULT_PORT);

        let cache_root = matches
            .get_one::<String>("cache-root")
            .expect("has default")
            .into();

        let verbosity = matches.get_count("v");
        let log_level = match verbosity {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        Config {
            port,
            cache_root,
            log_level,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            port: DEFAULT_PORT,
            cache_root: DEFAULT_CACHE_ROOT.into(),
            log_level: LevelFilter::Info,
        }
    }
}
