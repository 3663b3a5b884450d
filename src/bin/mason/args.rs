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
use std::env;
use std::io::Write;

use log::LevelFilter;
use structopt::StructOpt;
use termcolor::{self as tc, WriteColor};

use mason::{Database, Error, NullTracer, Options, RulesParser, Updater};

use crate::opts::GlobalOpts;

/// Name of the database file in the project root.
const DB_FILE: &str = ".mason";

/// An incremental build driver over a persistent dependency graph.
#[derive(StructOpt, Debug)]
#[structopt(name = "mason")]
pub struct Args {
    #[structopt(flatten)]
    global: GlobalOpts,

    /// Enable debug logging.
    #[structopt(short = "d")]
    debug: bool,

    /// Draw the progress bar.
    #[structopt(long = "show-progress")]
    show_progress: bool,

    /// Do not draw the progress bar.
    #[structopt(long = "no-show-progress")]
    no_show_progress: bool,

    /// Keep dispatching ready nodes after a failure.
    #[structopt(long = "keep-going", short = "k")]
    keep_going: bool,

    /// Stop at the first failure.
    #[structopt(long = "no-keep-going")]
    no_keep_going: bool,
}

impl Args {
    // Runs the build. If any errors occur, print out the error and its
    // chain of causes.
    pub fn main(self) -> i32 {
        let mut logger = pretty_env_logger::formatted_builder();
        logger.filter_level(if self.debug {
            LevelFilter::Debug
        } else {
            LevelFilter::Error
        });
        logger.init();

        if let Err(error) = self.run() {
            let mut red = tc::ColorSpec::new();
            red.set_fg(Some(tc::Color::Red));
            red.set_bold(true);

            let mut stderr =
                tc::StandardStream::stderr(self.global.color.into());

            let mut causes = error.iter_chain();

            // Primary error.
            if let Some(cause) = causes.next() {
                let _ = stderr.set_color(&red);
                let _ = write!(&mut stderr, "    Error");
                let _ = stderr.reset();
                let _ = writeln!(&mut stderr, ": {}", cause);
            }

            // Rest of the causes.
            for cause in causes {
                let _ = stderr.set_color(&red);
                let _ = write!(&mut stderr, "Caused by");
                let _ = stderr.reset();
                let _ = writeln!(&mut stderr, ": {}", cause);
            }

            return 1;
        }

        0
    }

    fn run(&self) -> Result<(), Error> {
        let root = env::current_dir()?;
        let database = Database::open(&root, root.join(DB_FILE))?;

        // Persisted configuration, overridden by explicit flags.
        let mut options = Options::from_store(&database)?;
        if self.show_progress {
            options.show_progress = true;
        }
        if self.no_show_progress {
            options.show_progress = false;
        }
        if self.keep_going {
            options.keep_going = true;
        }
        if self.no_keep_going {
            options.keep_going = false;
        }

        let updater = Updater::new(&database, options);
        updater.run(&RulesParser::new(), &mut NullTracer::default())
    }
}
