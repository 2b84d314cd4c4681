use std::io;

use tokio::time::sleep;
use windows_sys::Win32::{
	Foundation::{CloseHandle, GetLastError, ERROR_INVALID_PARAMETER, HANDLE, WAIT_OBJECT_0},
	System::Threading::{
		OpenProcess, WaitForSingleObject, PROCESS_QUERY_LIMITED_INFORMATION, PROCESS_SYNCHRONIZE,
	},
};

use super::POLL_INTERVAL;

pub struct Process {
	handle: HANDLE,
}

// SAFETY: process handles may be used from any thread
unsafe impl Send for Process {}
// SAFETY: only waited on, never mutated
unsafe impl Sync for Process {}

impl Process {
	pub fn open(pid: u32) -> io::Result<Option<Self>> {
		if pid == 0 {
			return Ok(None);
		}

		// SAFETY: plain FFI call; a null handle signals failure
		let handle = unsafe {
			OpenProcess(
				PROCESS_SYNCHRONIZE | PROCESS_QUERY_LIMITED_INFORMATION,
				0,
				pid,
			)
		};
		if handle.is_null() {
			// SAFETY: plain FFI call
			let code = unsafe { GetLastError() };
			return if code == ERROR_INVALID_PARAMETER {
				Ok(None)
			} else {
				#[allow(clippy::cast_possible_wrap)]
				Err(io::Error::from_raw_os_error(code as i32))
			};
		}

		Ok(Some(Self { handle }))
	}

	pub fn has_exited(&self) -> bool {
		// SAFETY: the handle is open for as long as self lives
		unsafe { WaitForSingleObject(self.handle, 0) == WAIT_OBJECT_0 }
	}

	pub async fn exited(&self) {
		while !self.has_exited() {
			sleep(POLL_INTERVAL).await;
		}
	}
}

impl Drop for Process {
	fn drop(&mut self) {
		// SAFETY: the handle was opened by us and is closed only here
		unsafe { CloseHandle(self.handle) };
	}
}
