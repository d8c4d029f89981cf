#[macro_use]
extern crate log;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use flexi_logger::{Duplicate, FileSpec, LoggerHandle};
use iron::prelude::*;

mod auth;
mod cgi;
mod config;
mod error;
mod git;
mod http;
mod invoke;
mod provision;
mod resolve;
mod util;

use crate::config::{Args, Config};

fn main() {
    let args = Args::parse();
    let _logger = match init_logging(&args) {
        Ok(handle) => handle,
        Err(err) => {
            eprintln!("gitgate: {:#}", err);
            std::process::exit(2);
        }
    };

    if let Err(err) = run(&args) {
        error!("{:#}", err);
        std::process::exit(1);
    }
}

fn init_logging(args: &Args) -> Result<LoggerHandle> {
    let level = if args.debug { "debug" } else { "info" };
    let mut logger = flexi_logger::Logger::try_with_env_or_str(level)?;
    if let Some(ref path) = args.log_file {
        logger = logger
            .log_to_file(FileSpec::try_from(path).with_context(|| format!("log file {}", path.display()))?)
            .append()
            .duplicate_to_stderr(Duplicate::Warn);
    }
    Ok(logger.start()?)
}

fn run(args: &Args) -> Result<()> {
    let config = Arc::new(Config::from_args(args)?);
    info!(
        "serving {} on {}:{} (git exec-path {})",
        config.doc_root.display(),
        config.host,
        config.port,
        config.exec_path.display()
    );
    debug!("{:?}", config);

    let mut chain = Chain::new(git::Server::new(config.clone()));
    let (log_before, log_after) = logger::Logger::new(None);
    chain.link_before(log_before);
    chain.link_after(log_after);

    let mut iron = Iron::new(chain);
    iron.threads = 1;
    iron.http((config.host.as_str(), config.port))
        .map_err(|err| anyhow::anyhow!("listen on {}:{}: {}", config.host, config.port, err))?;
    Ok(())
}
