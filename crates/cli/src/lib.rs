#![deny(rust_2018_idioms)]
#![allow(clippy::missing_const_for_fn, clippy::future_not_send)]

use std::process::ExitCode;

use clap::Parser;
use miette::Result;
use tracing::{debug, info, warn};

use crate::args::{Args, Command};

pub mod args;
mod child;
mod run;

async fn init() -> Result<(Args, Option<tracing_appender::non_blocking::WorkerGuard>)> {
	let log_on = args::logging::preargs();
	let args = Args::parse();

	let guard = if log_on {
		if args.logging.verbose > 0 || args.logging.log_file.is_some() {
			warn!("ignoring logging options from args");
		}
		None
	} else {
		args::logging::postargs(&args.logging).await?
	};

	Ok((args, guard))
}

/// Convert an exit code to what this process can exit with.
pub(crate) fn exit_code(code: i32) -> ExitCode {
	u8::try_from(code).map_or(ExitCode::FAILURE, ExitCode::from)
}

pub async fn run() -> Result<ExitCode> {
	let (args, _guard) = init().await?;
	info!(version=%env!("CARGO_PKG_VERSION"), "starting");
	debug!(?args, "arguments");

	match args.command {
		Command::Run(run) => run::run(run).await,
		Command::Child(child) => child::run(child).await,
		Command::Diagram => {
			print!("{}", procwarden_supervisor::state::diagram());
			Ok(ExitCode::SUCCESS)
		}
	}
}
