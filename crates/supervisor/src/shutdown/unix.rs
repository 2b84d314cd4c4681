use std::{
	fs, io,
	os::unix::fs::FileTypeExt,
	path::{Path, PathBuf},
};

use tokio::net::{UnixListener, UnixStream};
use tracing::{trace, warn};

pub type Connection = UnixStream;

pub fn socket_path(name: &str) -> PathBuf {
	std::env::temp_dir().join(format!("{name}.sock"))
}

#[derive(Debug)]
pub struct Server {
	listener: UnixListener,
	path: PathBuf,
}

impl Server {
	pub fn bind(name: &str) -> io::Result<Self> {
		let path = socket_path(name);
		clear_stale_socket(&path)?;
		let listener = UnixListener::bind(&path)?;
		trace!(path=%path.display(), "bound shutdown socket");
		Ok(Self { listener, path })
	}

	pub async fn accept(&mut self) -> io::Result<Connection> {
		let (stream, _) = self.listener.accept().await?;
		Ok(stream)
	}
}

impl Drop for Server {
	fn drop(&mut self) {
		if let Err(err) = fs::remove_file(&self.path) {
			if err.kind() != io::ErrorKind::NotFound {
				warn!(path=%self.path.display(), %err, "failed to remove shutdown socket");
			}
		}
	}
}

pub async fn connect(name: &str) -> io::Result<Connection> {
	UnixStream::connect(socket_path(name)).await
}

fn clear_stale_socket(path: &Path) -> io::Result<()> {
	match fs::symlink_metadata(path) {
		Ok(metadata) => {
			if !metadata.file_type().is_socket() {
				return Err(io::Error::new(
					io::ErrorKind::AlreadyExists,
					"path already exists and is not a Unix domain socket",
				));
			}

			if std::os::unix::net::UnixStream::connect(path).is_ok() {
				return Err(io::Error::new(
					io::ErrorKind::AddrInUse,
					"another listener is live on this channel",
				));
			}

			fs::remove_file(path)?;
			trace!(path=%path.display(), "cleared stale shutdown socket");
			Ok(())
		}
		Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
		Err(err) => Err(err),
	}
}
