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

//! Build descriptions.
//!
//! Each directory may carry a `rules.json` describing the commands that run
//! there and the subdirectories to descend into. The parse worker feeds
//! every `CREATE`-flagged directory node through a [`Parser`], which
//! materializes the description as store rows and links.

use std::fs;
use std::io;
use std::path::Path;

use failure::format_err;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::builder::CircularDependency;
use crate::error::{Error, ResultExt};
use crate::graph::{Graph, NodeIndex, NodeState};
use crate::store::{Flags, NodeId, NodeKind, NodeRecord, Store};
use crate::util::CwdGuard;

/// Name of the per-directory build description file.
pub const RULES_FILE: &str = "rules.json";

/// Materializes graph structure from a directory's build description. The
/// parser may insert nodes and edges into the live working graph; the
/// driver picks them up on subsequent iterations.
pub trait Parser: Sync {
    fn parse(
        &self,
        store: &dyn Store,
        graph: &mut Graph,
        dir: NodeIndex,
    ) -> Result<(), Error>;
}

/// A rule in the build description: a command plus its declared endpoints.
#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct Rule {
    #[serde(default)]
    pub inputs: Vec<String>,

    /// The shell command. A leading `@` silences the echo; a leading `,`
    /// marks a variable-substitution command.
    pub command: String,

    #[serde(default)]
    pub outputs: Vec<String>,
}

/// A build description. A description is a list of rules plus the
/// subdirectories to recurse into.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct Rules {
    #[serde(default)]
    pub subdirs: Vec<String>,

    #[serde(default)]
    pub rules: Vec<Rule>,
}

impl Rules {
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Rules, Error> {
        let f = fs::File::open(path)?;
        Self::from_reader(io::BufReader::new(f))
    }

    pub fn from_reader<R: io::Read>(reader: R) -> Result<Rules, Error> {
        Ok(serde_json::from_reader(reader)?)
    }

    #[cfg(test)]
    pub fn from_str(s: &str) -> Result<Rules, Error> {
        Ok(serde_json::from_str(s)?)
    }
}

/// The shipped parser: reads `rules.json` from the directory being parsed.
#[derive(Debug, Default)]
pub struct RulesParser;

impl RulesParser {
    pub fn new() -> RulesParser {
        RulesParser
    }
}

impl Parser for RulesParser {
    fn parse(
        &self,
        store: &dyn Store,
        graph: &mut Graph,
        dir: NodeIndex,
    ) -> Result<(), Error> {
        let (dir_id, dir_name) = {
            let node = graph.node(dir);
            (node.id, node.name.clone())
        };

        let handle = store.open_node_dir(dir_id)?.ok_or_else(|| {
            format_err!(
                "directory '{}' (node {}) does not exist",
                dir_name,
                dir_id
            )
        })?;

        let rules = {
            let _cwd = CwdGuard::enter(&handle)?;
            match fs::File::open(RULES_FILE) {
                Ok(f) => Rules::from_reader(io::BufReader::new(f))
                    .with_context(|_| {
                        format!(
                            "failed parsing {} in '{}'",
                            RULES_FILE, dir_name
                        )
                    })?,
                Err(ref err) if err.kind() == io::ErrorKind::NotFound => {
                    // No description, nothing to do.
                    return Ok(());
                }
                Err(err) => return Err(err.into()),
            }
        };

        for name in &rules.subdirs {
            let child = match store.lookup_node(dir_id, name)? {
                Some(record) => record,
                None => {
                    let id =
                        store.create_node(dir_id, name, NodeKind::Dir)?;
                    store.set_flags(id, Flags::CREATE)?;
                    NodeRecord {
                        id,
                        dir: dir_id,
                        kind: NodeKind::Dir,
                        name: name.clone(),
                        flags: Flags::CREATE,
                    }
                }
            };

            store.create_link(dir_id, child.id)?;

            // Insert the subdirectory into the live graph so it gets
            // parsed later in this same phase.
            let index = match graph.find_node(child.id) {
                Some(index) => index,
                None => graph.create_node(&child),
            };

            if graph.node(index).state() == NodeState::Processing {
                return Err(CircularDependency {
                    src: dir_id,
                    dest: child.id,
                }
                .into());
            }

            graph.create_edge(dir, index);
        }

        for rule in &rules.rules {
            let cmd = match store.lookup_node(dir_id, &rule.command)? {
                Some(record) => record.id,
                None => {
                    let id = store.create_node(
                        dir_id,
                        &rule.command,
                        NodeKind::Command,
                    )?;
                    // A command never seen before has to run.
                    store.add_modify(id)?;
                    id
                }
            };

            for input in &rule.inputs {
                let file = file_node(store, dir_id, input)?;
                store.create_link(file, cmd)?;
            }

            for output in &rule.outputs {
                let file = file_node(store, dir_id, output)?;
                store.create_link(cmd, file)?;
            }
        }

        debug!(
            "parsed {} rule(s) and {} subdir(s) in '{}'",
            rules.rules.len(),
            rules.subdirs.len(),
            dir_name
        );

        Ok(())
    }
}

fn file_node(
    store: &dyn Store,
    dir: NodeId,
    name: &str,
) -> Result<NodeId, Error> {
    match store.lookup_node(dir, name)? {
        Some(record) => Ok(record.id),
        None => store.create_node(dir, name, NodeKind::File),
    }
}
