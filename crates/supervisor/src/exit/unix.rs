use std::io;

use nix::{errno::Errno, sys::signal::kill, unistd::Pid};
use tokio::time::sleep;

use super::POLL_INTERVAL;

pub enum Process {
	#[cfg(target_os = "linux")]
	PidFd(tokio::io::unix::AsyncFd<std::os::fd::OwnedFd>),
	Polling(Pid),
}

impl Process {
	pub fn open(pid: u32) -> io::Result<Option<Self>> {
		let Some(pid) = i32::try_from(pid).ok().filter(|pid| *pid > 0) else {
			return Ok(None);
		};

		#[cfg(target_os = "linux")]
		match linux::pidfd_open(pid) {
			Ok(Some(fd)) => match tokio::io::unix::AsyncFd::new(fd) {
				Ok(fd) => return Ok(Some(Self::PidFd(fd))),
				Err(err) => {
					tracing::debug!(%err, "cannot register pidfd, falling back to polling");
				}
			},
			Ok(None) => return Ok(None),
			Err(err) if err.raw_os_error() == Some(libc::ENOSYS) => {
				tracing::debug!("pidfd_open unsupported, falling back to polling");
			}
			Err(err) => return Err(err),
		}

		let pid = Pid::from_raw(pid);
		Ok(alive(pid).then_some(Self::Polling(pid)))
	}

	pub fn has_exited(&self) -> bool {
		match self {
			#[cfg(target_os = "linux")]
			Self::PidFd(fd) => linux::pidfd_ready(fd.get_ref()),
			Self::Polling(pid) => !alive(*pid),
		}
	}

	pub async fn exited(&self) {
		match self {
			#[cfg(target_os = "linux")]
			Self::PidFd(fd) => {
				if fd.readable().await.is_ok() {
					return;
				}
				while !linux::pidfd_ready(fd.get_ref()) {
					sleep(POLL_INTERVAL).await;
				}
			}
			Self::Polling(pid) => {
				while alive(*pid) {
					sleep(POLL_INTERVAL).await;
				}
			}
		}
	}
}

fn alive(pid: Pid) -> bool {
	match kill(pid, None) {
		Ok(()) | Err(Errno::EPERM) => true,
		Err(_) => false,
	}
}

#[cfg(target_os = "linux")]
mod linux {
	use std::{
		io,
		os::fd::{AsRawFd, FromRawFd, OwnedFd},
	};

	pub fn pidfd_open(pid: libc::pid_t) -> io::Result<Option<OwnedFd>> {
		// SAFETY: pidfd_open takes a pid and flags, and returns a new fd or -1
		let fd = unsafe { libc::syscall(libc::SYS_pidfd_open, pid, 0) };
		if fd < 0 {
			let err = io::Error::last_os_error();
			return if err.raw_os_error() == Some(libc::ESRCH) {
				Ok(None)
			} else {
				Err(err)
			};
		}

		let fd = i32::try_from(fd).map_err(|_| io::Error::other("pidfd out of range"))?;
		// SAFETY: the syscall succeeded, so fd is a freshly opened descriptor we now own
		Ok(Some(unsafe { OwnedFd::from_raw_fd(fd) }))
	}

	pub fn pidfd_ready(fd: &OwnedFd) -> bool {
		let mut pollfd = libc::pollfd {
			fd: fd.as_raw_fd(),
			events: libc::POLLIN,
			revents: 0,
		};
		// SAFETY: one valid pollfd, zero timeout
		let ready = unsafe { libc::poll(&mut pollfd, 1, 0) };
		ready > 0
	}
}
