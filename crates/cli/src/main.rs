#![deny(rust_2018_idioms)]

use std::process::ExitCode;

use miette::Result;

#[tokio::main]
async fn main() -> Result<ExitCode> {
	procwarden_cli::run().await
}
