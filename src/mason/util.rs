// Copyright (c) 2019 Jason White
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN
// THE SOFTWARE.

use std::fs;
use std::os::unix::io::{AsRawFd, RawFd};

use nix::fcntl::{self, OFlag};
use nix::sys::stat::Mode;
use nix::unistd;

use crate::error::Error;

/// Owned raw file descriptor, closed on drop.
struct Fd(RawFd);

impl Drop for Fd {
    fn drop(&mut self) {
        let _ = unistd::close(self.0);
    }
}

/// Saves the current working directory, enters `dir`, and restores the
/// saved directory on drop. The working directory is process-global, so
/// this is only sound while a single worker runs at a time.
pub(crate) struct CwdGuard {
    saved: Fd,
}

impl CwdGuard {
    pub fn enter(dir: &fs::File) -> Result<CwdGuard, Error> {
        let saved = Fd(fcntl::open(".", OFlag::O_RDONLY, Mode::empty())?);
        unistd::fchdir(dir.as_raw_fd())?;
        Ok(CwdGuard { saved })
    }
}

impl Drop for CwdGuard {
    fn drop(&mut self) {
        let _ = unistd::fchdir(self.saved.0);
    }
}
