use std::{io, mem, time::Duration};

use tokio::{
	net::windows::named_pipe::{ClientOptions, NamedPipeClient, NamedPipeServer, ServerOptions},
	time::sleep,
};
use tracing::trace;
use windows_sys::Win32::Foundation::ERROR_PIPE_BUSY;

pub type Connection = NamedPipeClient;

fn pipe_address(name: &str) -> String {
	format!(r"\\.\pipe\{name}")
}

#[derive(Debug)]
pub struct Server {
	address: String,
	next: NamedPipeServer,
}

impl Server {
	pub fn bind(name: &str) -> io::Result<Self> {
		let address = pipe_address(name);
		let next = ServerOptions::new()
			.first_pipe_instance(true)
			.create(&address)?;
		trace!(%address, "created shutdown pipe");
		Ok(Self { address, next })
	}

	pub async fn accept(&mut self) -> io::Result<NamedPipeServer> {
		self.next.connect().await?;
		let next = ServerOptions::new().create(&self.address)?;
		Ok(mem::replace(&mut self.next, next))
	}
}

pub async fn connect(name: &str) -> io::Result<Connection> {
	let address = pipe_address(name);
	loop {
		match ClientOptions::new().open(&address) {
			Ok(client) => return Ok(client),
			Err(err) if err.raw_os_error() == Some(ERROR_PIPE_BUSY as i32) => {
				trace!(%address, "shutdown pipe busy, retrying");
			}
			Err(err) => return Err(err),
		}

		sleep(Duration::from_millis(50)).await;
	}
}
