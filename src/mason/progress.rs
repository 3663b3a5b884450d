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

use std::io::{self, Write};

/// A fixed-width console progress bar of up to 40 cells. Totals at or below
/// the width map one completion to one `=` cell; larger totals scale into
/// `#` cells. Nothing is drawn when disabled or when the total is zero; a
/// terminating newline is emitted once the count reaches the total.
pub struct Progress {
    enabled: bool,
    total: usize,
    done: usize,
    open: bool,
}

impl Progress {
    pub fn new(enabled: bool, total: usize) -> Progress {
        Progress {
            enabled,
            total,
            done: 0,
            open: false,
        }
    }

    /// A bar that never draws anything.
    pub fn disabled() -> Progress {
        Progress::new(false, 0)
    }

    /// Adjusts the total. Work discovered mid-drain (directories found
    /// while parsing) grows the bar.
    pub fn resize(&mut self, total: usize) {
        self.total = total;
    }

    /// Redraws the bar in place.
    pub fn draw(&mut self) {
        if !self.enabled || self.total == 0 {
            return;
        }

        let stdout = io::stdout();
        let mut out = stdout.lock();
        let _ = write!(out, "\r{}", self.render());

        if self.done >= self.total {
            let _ = writeln!(out);
            self.open = false;
        } else {
            self.open = true;
        }

        let _ = out.flush();
    }

    /// Counts one completion and redraws.
    pub fn tick(&mut self) {
        self.done += 1;
        self.draw();
    }

    /// Breaks an in-progress bar line so following output starts clean.
    pub fn interrupt(&mut self) {
        if self.open {
            println!();
            self.open = false;
        }
    }

    fn render(&self) -> String {
        const MAX: usize = 40;

        let (fill, width, cell) = if self.total > MAX {
            (self.done * MAX / self.total, MAX, '#')
        } else {
            (self.done, self.total, '=')
        };

        let mut bar = String::with_capacity(width + 24);
        bar.push('[');
        for _ in 0..fill {
            bar.push(cell);
        }
        for _ in fill..width {
            bar.push(' ');
        }
        bar.push(']');

        format!(
            "{} {}/{} ({:3}%) ",
            bar,
            self.done,
            self.total,
            self.done * 100 / self.total
        )
    }
}
