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

//! Running a single command node.
//!
//! A command's name is its shell command string, dispatched on the first
//! byte: `,` selects variable-substitution mode (no process is spawned),
//! `@` silences the echo, anything else is a normal command. Normal
//! commands run under the side-effect tracer inside the node's directory; a
//! freshly allocated duplicate node takes ownership of the observed outputs
//! and the original row is collected on success.

use std::ffi::OsStr;
use std::fs;
use std::io::Write;
use std::os::unix::ffi::OsStrExt;
use std::process;
use std::str;

use failure::{format_err, Fail};

use crate::error::{Error, ResultExt};
use crate::store::{Flags, NodeId, NodeKind, Store};
use crate::trace::Tracer;
use crate::util::CwdGuard;

#[derive(Debug, Fail, Eq, PartialEq)]
#[fail(display = "*** Command {} failed", id)]
pub struct CommandFailed {
    pub id: NodeId,
}

/// Everything the runner needs to know about the node, copied out of the
/// working graph before any action runs.
pub(crate) struct Target {
    pub id: NodeId,
    pub dir: NodeId,
    pub kind: NodeKind,
    pub flags: Flags,
    pub name: String,
}

/// Runs a command node. On success the original node row is deleted,
/// leaving the duplicate as the live command node. On failure the
/// duplicate is deleted instead.
pub(crate) fn run(
    store: &dyn Store,
    tracer: &mut dyn Tracer,
    target: &Target,
) -> Result<(), Error> {
    if target.name.starts_with(',') {
        return var_replace(store, target);
    }

    let dup = store.create_dup_node(target.dir, &target.name, target.kind)?;

    match spawn(store, tracer, target, dup) {
        Ok(()) => {
            store.delete_node(target.id)?;
            Ok(())
        }
        Err(err) => {
            let _ = store.delete_node(dup);
            Err(err.context(CommandFailed { id: target.id }).into())
        }
    }
}

fn spawn(
    store: &dyn Store,
    tracer: &mut dyn Tracer,
    target: &Target,
    dup: NodeId,
) -> Result<(), Error> {
    let (echo, cmd) = if target.name.starts_with('@') {
        (false, &target.name[1..])
    } else {
        (true, target.name.as_str())
    };

    let dir = store.open_node_dir(target.dir)?.ok_or_else(|| {
        format_err!("directory for node {} does not exist", target.id)
    })?;
    let _cwd = CwdGuard::enter(&dir)?;

    if echo {
        println!("[{}:{}] {}", target.id, dup, cmd);
    }

    tracer
        .start()
        .context("failed starting the side-effect tracer")?;

    let status = process::Command::new("/bin/sh")
        .arg("-c")
        .arg(cmd)
        .status();

    // The session ends whether or not the spawn worked.
    let finfo = tracer
        .stop()
        .context("failed stopping the side-effect tracer")?;

    let status = status.context("failed spawning /bin/sh")?;
    if !status.success() {
        return Err(format_err!("command exited with {}", status));
    }

    store.write_files(dup, cmd, &finfo)?;

    Ok(())
}

/// Variable-substitution command: `, INPUT > OUTPUT`. Copies INPUT to
/// OUTPUT, replacing every `@IDENT@` with the variable's value from the
/// store and linking the variable as a dependency of this command. An `@`
/// run without a closing `@` passes through untouched. Does not fork and
/// does not involve the tracer or a duplicate node.
fn var_replace(store: &dyn Store, target: &Target) -> Result<(), Error> {
    if !target.name.starts_with(',') {
        return Err(format_err!(
            "variable command must begin with ',': '{}'",
            target.name
        ));
    }
    let line = target.name[1..].trim_start();

    let dir = store.open_node_dir(target.dir)?.ok_or_else(|| {
        format_err!("directory for node {} does not exist", target.id)
    })?;
    let _cwd = CwdGuard::enter(&dir)?;

    println!("{}", line);

    let bytes = line.as_bytes();
    let gt = bytes.iter().position(|&b| b == b'>').ok_or_else(|| {
        format_err!("unable to find '>' in variable command '{}'", line)
    })?;
    if gt == 0 {
        return Err(format_err!(
            "the '>' symbol can't be at the start of the variable command"
        ));
    }

    // The byte before '>' terminates the input path; the output path
    // starts two bytes past it.
    let input = OsStr::from_bytes(&bytes[..gt - 1]);
    let output = OsStr::from_bytes(bytes.get(gt + 2..).unwrap_or(&[]));

    let data = fs::read(input)
        .with_context(|_| format!("failed reading {:?}", input))?;
    let mut out = fs::File::create(output)
        .with_context(|_| format!("failed creating {:?}", output))?;

    let mut p = 0;
    let end = data.len();

    while p < end {
        let at = match data[p..].iter().position(|&b| b == b'@') {
            Some(offset) => p + offset,
            None => end,
        };
        out.write_all(&data[p..at])?;
        if at >= end {
            break;
        }

        p = at;
        let mut rat = p + 1;
        while rat < end
            && (data[rat].is_ascii_alphanumeric() || data[rat] == b'_')
        {
            rat += 1;
        }

        if rat < end && data[rat] == b'@' {
            // Identifiers are ASCII by construction.
            let name = str::from_utf8(&data[p + 1..rat])?;
            let var = store.write_var(name, &mut out)?;
            store.create_link(var, target.id)?;
            p = rat + 1;
        } else {
            // No closing '@'; the run passes through verbatim.
            out.write_all(&data[p..rat])?;
            p = rat;
        }
    }

    Ok(())
}
