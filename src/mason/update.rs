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

//! Phase orchestration: the parse phase followed by the execute phase, each
//! one graph construction plus one topological drain inside a store
//! transaction. Parsing rolls back on error; execution always commits so
//! partial progress is retained for the next run.

use std::time::Instant;

use log::info;

use crate::builder;
use crate::driver;
use crate::error::Error;
use crate::progress::Progress;
use crate::rules::Parser;
use crate::store::{Flags, NodeKind, Store};
use crate::trace::Tracer;
use crate::work::{ParseWork, UpdateWork};

/// Runtime options, usually loaded from the store's persisted
/// configuration and overridden by command line flags.
#[derive(Clone, Copy, Debug)]
pub struct Options {
    pub keep_going: bool,
    pub show_progress: bool,
}

impl Options {
    pub fn from_store(store: &dyn Store) -> Result<Options, Error> {
        Ok(Options {
            keep_going: store.config_int("keep_going")? != 0,
            show_progress: store.config_int("show_progress")? != 0,
        })
    }
}

pub struct Updater<'a, S> {
    store: &'a S,
    options: Options,
}

impl<'a, S: Store> Updater<'a, S> {
    pub fn new(store: &'a S, options: Options) -> Updater<'a, S> {
        Updater { store, options }
    }

    /// Runs the parse phase followed by the execute phase.
    pub fn run<P, T>(&self, parser: &P, tracer: &mut T) -> Result<(), Error>
    where
        P: Parser,
        T: Tracer,
    {
        self.parse_phase(parser)?;
        self.execute_phase(tracer)?;
        Ok(())
    }

    /// Materializes graph structure from every CREATE-flagged directory.
    /// The transaction is rolled back if anything fails.
    pub fn parse_phase<P: Parser>(&self, parser: &P) -> Result<(), Error> {
        let start = Instant::now();

        let graph =
            builder::build(self.store, NodeKind::Dir, &[Flags::CREATE])?;

        if graph.num_nodes() > 0 {
            info!("parsing {} build description(s)", graph.num_nodes());
        }
        let mut progress =
            Progress::new(self.options.show_progress, graph.num_nodes());

        self.store.begin()?;

        // Parsing never keeps going past a failure; a half-parsed graph is
        // not worth keeping.
        let work = ParseWork::new(self.store, parser);
        match driver::execute(graph, work, false, &mut progress) {
            Ok(()) => {
                self.store.commit()?;
                info!(
                    "parse phase finished in {}",
                    humantime::format_duration(start.elapsed())
                );
                Ok(())
            }
            Err(err) => {
                self.store.rollback()?;
                Err(err)
            }
        }
    }

    /// Applies MODIFY and DELETE work in dependency order. The transaction
    /// commits even on failure so completed work is not repeated.
    pub fn execute_phase<T: Tracer>(
        &self,
        tracer: &mut T,
    ) -> Result<(), Error> {
        let start = Instant::now();

        let graph = builder::build(
            self.store,
            NodeKind::Command,
            &[Flags::MODIFY, Flags::DELETE],
        )?;

        let mut progress =
            Progress::new(self.options.show_progress, graph.num_nodes());

        self.store.begin()?;

        let result = {
            let work = UpdateWork::new(self.store, tracer);
            driver::execute(
                graph,
                work,
                self.options.keep_going,
                &mut progress,
            )
        };

        self.store.commit()?;
        info!(
            "execute phase finished in {}",
            humantime::format_duration(start.elapsed())
        );

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::Path;

    use tempfile::tempdir;

    use crate::db::Database;
    use crate::driver::DriverError;
    use crate::rules::RulesParser;
    use crate::store::NodeId;
    use crate::trace::NullTracer;
    use crate::util::testing::cwd_lock;

    const QUIET: Options = Options {
        keep_going: false,
        show_progress: false,
    };

    fn logged_command(db: &Database, tag: &str) -> NodeId {
        let name = format!("echo {} >> log.txt", tag);
        let id = db.create_node(0, &name, NodeKind::Command).unwrap();
        db.set_flags(id, Flags::MODIFY).unwrap();
        id
    }

    fn read_log(root: &Path) -> String {
        fs::read_to_string(root.join("log.txt")).unwrap_or_default()
    }

    #[test]
    fn test_linear_chain_runs_in_dependency_order() {
        let _cwd = cwd_lock();
        let dir = tempdir().unwrap();
        let db = Database::in_memory(dir.path());

        let a = logged_command(&db, "A");
        let b = logged_command(&db, "B");
        let c = logged_command(&db, "C");
        db.create_link(a, b).unwrap();
        db.create_link(b, c).unwrap();

        Updater::new(&db, QUIET)
            .execute_phase(&mut NullTracer::default())
            .unwrap();

        assert_eq!(read_log(dir.path()), "A\nB\nC\n");

        // Every command ended up with an empty flag set on its live row.
        for tag in &["A", "B", "C"] {
            let name = format!("echo {} >> log.txt", tag);
            let record = db.lookup_node(0, &name).unwrap().unwrap();
            assert_eq!(record.flags, Flags::empty());
        }
    }

    #[test]
    fn test_diamond_runs_sources_before_sinks() {
        let _cwd = cwd_lock();
        let dir = tempdir().unwrap();
        let db = Database::in_memory(dir.path());

        let a = logged_command(&db, "A");
        let b = logged_command(&db, "B");
        let c = logged_command(&db, "C");
        let d = logged_command(&db, "D");
        db.create_link(a, b).unwrap();
        db.create_link(a, c).unwrap();
        db.create_link(b, d).unwrap();
        db.create_link(c, d).unwrap();

        Updater::new(&db, QUIET)
            .execute_phase(&mut NullTracer::default())
            .unwrap();

        assert_eq!(read_log(dir.path()), "A\nB\nC\nD\n");
    }

    fn failing_diamond(db: &Database) -> NodeId {
        let a = logged_command(db, "A");
        let b = logged_command(db, "B");
        let c = db.create_node(0, "false", NodeKind::Command).unwrap();
        db.set_flags(c, Flags::MODIFY).unwrap();
        let d = logged_command(db, "D");
        db.create_link(a, b).unwrap();
        db.create_link(a, c).unwrap();
        db.create_link(b, d).unwrap();
        db.create_link(c, d).unwrap();
        d
    }

    #[test]
    fn test_failure_stops_the_phase() {
        let _cwd = cwd_lock();
        let dir = tempdir().unwrap();
        let db = Database::in_memory(dir.path());
        let d = failing_diamond(&db);

        let err = Updater::new(&db, QUIET)
            .execute_phase(&mut NullTracer::default())
            .unwrap_err();

        // Dispatch stopped at the failing command; its dependent never ran
        // but stays queued for the next run.
        assert_eq!(read_log(dir.path()), "A\nB\n");
        assert!(db.node(d).unwrap().flags.contains(Flags::MODIFY));
        assert!(err.downcast_ref::<DriverError>().is_none());
    }

    #[test]
    fn test_keep_going_skips_dependents_of_failures() {
        let _cwd = cwd_lock();
        let dir = tempdir().unwrap();
        let db = Database::in_memory(dir.path());
        let d = failing_diamond(&db);

        let options = Options {
            keep_going: true,
            show_progress: false,
        };
        let err = Updater::new(&db, options)
            .execute_phase(&mut NullTracer::default())
            .unwrap_err();

        assert_eq!(
            err.downcast_ref::<DriverError>(),
            Some(&DriverError::NodesSkipped)
        );
        // D was never dispatched and remains queued.
        assert_eq!(read_log(dir.path()), "A\nB\n");
        assert!(db.node(d).unwrap().flags.contains(Flags::MODIFY));
    }

    #[test]
    fn test_execute_phase_commits_partial_progress() {
        let _cwd = cwd_lock();
        let dir = tempdir().unwrap();
        let db = Database::in_memory(dir.path());

        let a = logged_command(&db, "A");
        let b = db.create_node(0, "false", NodeKind::Command).unwrap();
        db.set_flags(b, Flags::MODIFY).unwrap();
        db.create_link(a, b).unwrap();

        let _ = Updater::new(&db, QUIET)
            .execute_phase(&mut NullTracer::default())
            .unwrap_err();

        // A's completion survived the failed phase: its dup row is live
        // and unflagged, so the next run starts at the failure.
        let record =
            db.lookup_node(0, "echo A >> log.txt").unwrap().unwrap();
        assert_eq!(record.flags, Flags::empty());
        assert!(db.node(b).unwrap().flags.contains(Flags::MODIFY));
    }

    #[test]
    fn test_parse_phase_rolls_back_on_cycle() {
        let dir = tempdir().unwrap();
        let db = Database::in_memory(dir.path());

        let y = db.create_node(0, "Y", NodeKind::Dir).unwrap();
        let x = db.create_node(0, "X", NodeKind::Dir).unwrap();
        db.set_flags(y, Flags::CREATE).unwrap();
        db.set_flags(x, Flags::CREATE).unwrap();
        db.create_link(x, y).unwrap();
        db.create_link(y, x).unwrap();

        let err = Updater::new(&db, QUIET)
            .parse_phase(&RulesParser::new())
            .unwrap_err();
        assert!(format!("{}", err)
            .starts_with("Circular dependency detected!"));

        // Nothing was committed; the CREATE flags are untouched.
        assert!(db.node(x).unwrap().flags.contains(Flags::CREATE));
        assert!(db.node(y).unwrap().flags.contains(Flags::CREATE));
    }

    #[test]
    fn test_full_build_descends_into_subdirs() {
        let _cwd = cwd_lock();
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(
            dir.path().join("rules.json"),
            r#"{
                "subdirs": ["sub"],
                "rules": [{"command": "echo root > root.txt",
                           "outputs": ["root.txt"]}]
            }"#,
        )
        .unwrap();
        fs::write(
            dir.path().join("sub").join("rules.json"),
            r#"{"rules": [{"command": "echo sub > sub.txt",
                           "outputs": ["sub.txt"]}]}"#,
        )
        .unwrap();

        let db = Database::in_memory(dir.path());
        let root = db.create_node(0, ".", NodeKind::Dir).unwrap();
        db.set_flags(root, Flags::CREATE).unwrap();

        Updater::new(&db, QUIET)
            .run(&RulesParser::new(), &mut NullTracer::default())
            .unwrap();

        // Both descriptions were parsed and both commands ran.
        assert_eq!(
            fs::read_to_string(dir.path().join("root.txt")).unwrap(),
            "root\n"
        );
        assert_eq!(
            fs::read_to_string(dir.path().join("sub/sub.txt")).unwrap(),
            "sub\n"
        );

        // CREATE came off the directories, including the discovered one.
        assert_eq!(db.node(root).unwrap().flags, Flags::empty());
        let sub = db.lookup_node(root, "sub").unwrap().unwrap();
        assert_eq!(sub.flags, Flags::empty());
    }

    #[test]
    fn test_variable_substitution_end_to_end() {
        let _cwd = cwd_lock();
        let dir = tempdir().unwrap();
        let db = Database::in_memory(dir.path());

        fs::write(dir.path().join("config.h.in"), "#define V \"@VER@\"\n")
            .unwrap();
        let ver = db.set_var("VER", "1.2.3").unwrap();

        let cmd = db
            .create_node(0, ", config.h.in > config.h", NodeKind::Command)
            .unwrap();
        db.set_flags(cmd, Flags::MODIFY).unwrap();

        Updater::new(&db, QUIET)
            .execute_phase(&mut NullTracer::default())
            .unwrap();

        assert_eq!(
            fs::read_to_string(dir.path().join("config.h")).unwrap(),
            "#define V \"1.2.3\"\n"
        );
        assert!(db.has_link(ver, cmd));
        assert_eq!(db.node(cmd).unwrap().flags, Flags::empty());
    }

    #[test]
    fn test_nothing_to_do() {
        let dir = tempdir().unwrap();
        let db = Database::in_memory(dir.path());

        Updater::new(&db, QUIET)
            .run(&RulesParser::new(), &mut NullTracer::default())
            .unwrap();
    }
}
