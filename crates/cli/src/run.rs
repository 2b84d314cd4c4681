use std::{env::current_dir, process::ExitCode};

use miette::{miette, IntoDiagnostic, Result};
use procwarden_supervisor::{parent::PARENT_PID_ENV, ProcessSupervisor, SupervisorSettings};
use tokio::{select, signal::ctrl_c, sync::broadcast::error::RecvError};
use tracing::{debug, info, warn};

use crate::{args::RunArgs, exit_code};

pub async fn run(args: RunArgs) -> Result<ExitCode> {
	let (program, rest) = args
		.program
		.split_first()
		.ok_or_else(|| miette!("no program to run"))?;
	let workdir = match args.workdir {
		Some(dir) => dir,
		None => current_dir().into_diagnostic()?,
	};

	let mut settings = SupervisorSettings::new(workdir, program)
		.with_args(rest.iter().map(|arg| arg.to_string_lossy()))
		.with_capture_stderr(args.capture_stderr)
		.with_env(PARENT_PID_ENV, std::process::id().to_string());
	for (key, value) in args.env {
		settings = settings.with_env(key, value);
	}
	debug!(?settings, "supervisor settings");

	let supervisor = ProcessSupervisor::new(settings);
	let mut output = supervisor.output();
	let mut errors = supervisor.errors();
	let mut state = supervisor.subscribe_state();

	supervisor.start().await.into_diagnostic()?;
	if let Some(err) = supervisor.start_error() {
		return Err(err.into());
	}

	let mut interrupts = 0_u8;
	loop {
		select! {
			line = output.recv() => match line {
				Ok(line) => println!("{line}"),
				Err(RecvError::Lagged(n)) => warn!(n, "output lines dropped"),
				Err(RecvError::Closed) => break,
			},
			line = errors.recv() => match line {
				Ok(line) => eprintln!("{line}"),
				Err(RecvError::Lagged(n)) => warn!(n, "error lines dropped"),
				Err(RecvError::Closed) => break,
			},
			_ = state.wait_for(|state| state.is_terminal()) => break,
			signal = ctrl_c() => {
				signal.into_diagnostic()?;
				interrupts = interrupts.saturating_add(1);
				let timeout = if interrupts > 1 {
					info!("interrupted again, killing");
					None
				} else {
					info!(timeout=?args.stop_timeout, "interrupted, stopping");
					Some(args.stop_timeout)
				};
				tokio::spawn(supervisor.stop(timeout));
			}
		}
	}

	while let Ok(line) = output.try_recv() {
		println!("{line}");
	}
	while let Ok(line) = errors.try_recv() {
		eprintln!("{line}");
	}

	let final_state = supervisor.state();
	let code = supervisor
		.process_info()
		.and_then(|info| info.exit_code)
		.unwrap_or(-1);
	info!(state=%final_state, code, "supervised program finished");

	Ok(exit_code(code))
}
