//! `allkorrectd` entry point.
//!
//! Parses configuration, verifies the process is running as `uid 0`
//! (the sandbox cannot drop privileges to `nobody` otherwise), prepares
//! the cache root, starts the cache janitor, and runs the accept loop
//! until SIGINT.

use allkorrect::error::AllKorrectError;
use allkorrect::{config::Config, daemon, exec, fs, fs::Namespace};

fn main() {
    if let Err(e) = run() {
        log::error!("{e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), AllKorrectError> {
    let config = Config::from_args();

    env_logger::Builder::new()
        .filter_level(config.log_level)
        .format_timestamp_nanos()
        .init();

    if !nix::unistd::Uid::effective().is_root() {
        return Err(AllKorrectError::FatalConfig(
            "allkorrectd must run as uid 0".to_string(),
        ));
    }

    log::info!("cache root: {}", config.cache_root.display());
    let namespace = Namespace::init(&config.cache_root)?;

    exec::init()?;

    fs::janitor::spawn(namespace.clone());

    daemon::install_signal_handler()?;
    daemon::run(config.port, namespace)
}
