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

//! The side-effect server: an out-of-band service that captures the file
//! accesses a child process performs between `start` and `stop`. The
//! command runner brackets every spawned shell with it and reconciles the
//! report against the store.

use std::path::PathBuf;

use crate::error::Error;

/// File accesses observed during one tracer session. Paths are relative to
/// the traced command's working directory.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct FileInfo {
    pub reads: Vec<PathBuf>,
    pub writes: Vec<PathBuf>,
}

impl FileInfo {
    pub fn new() -> FileInfo {
        FileInfo::default()
    }
}

pub trait Tracer: Send {
    /// Starts a capture session.
    fn start(&mut self) -> Result<(), Error>;

    /// Ends the session and yields the accesses observed since `start`.
    fn stop(&mut self) -> Result<FileInfo, Error>;
}

/// A tracer that observes nothing. Used when no interception mechanism is
/// available; commands still run, they just report no implicit
/// dependencies.
#[derive(Debug, Default)]
pub struct NullTracer;

impl Tracer for NullTracer {
    fn start(&mut self) -> Result<(), Error> {
        Ok(())
    }

    fn stop(&mut self) -> Result<FileInfo, Error> {
        Ok(FileInfo::new())
    }
}
