use std::process::ExitCode;

use miette::{IntoDiagnostic, Result};
use procwarden_supervisor::{
	parent::ParentMonitor,
	shutdown::{ShutdownChannel, ShutdownListener},
};
use tokio::{select, signal::ctrl_c, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::args::ChildArgs;

pub async fn run(args: ChildArgs) -> Result<ExitCode> {
	let shutdown = CancellationToken::new();

	let channel = args
		.pipe_name
		.map_or_else(ShutdownChannel::current_process, ShutdownChannel::named);
	let listener = ShutdownListener::listen(channel, {
		let shutdown = shutdown.clone();
		let ignore = args.ignore_exit_signal;
		move || {
			if ignore {
				info!("exit requested, ignoring");
			} else {
				shutdown.cancel();
			}
		}
	})
	.into_diagnostic()?;
	info!(channel=%listener.channel(), "listening for exit requests");

	let _monitor = ParentMonitor::start(args.parent_pid, {
		let shutdown = shutdown.clone();
		move |pid| {
			info!(?pid, "parent exited");
			shutdown.cancel();
		}
	});

	println!("started {}", std::process::id());

	select! {
		() = shutdown.cancelled() => info!("shutting down"),
		() = sleep(args.lifetime) => info!(lifetime=?args.lifetime, "lifetime elapsed"),
		_ = ctrl_c() => info!("interrupted"),
	}

	println!("exiting");
	Ok(ExitCode::from(args.exit_code))
}
