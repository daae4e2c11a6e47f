//! Tabular text rendering and the in-place progress line.

use std::io::Write;

use crate::exec::QueryOutput;

/// A bordered result table whose column widths fit the longest value.
pub struct Table {
    columns: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl Table {
    pub fn new(output: &QueryOutput) -> Self {
        Self {
            columns: output.columns.clone(),
            rows: output
                .rows
                .iter()
                .map(|row| row.iter().map(|v| v.to_string()).collect())
                .collect(),
        }
    }

    /// Render the table plus the `rows in set` footer.
    pub fn render(&self, elapsed_secs: f64) -> String {
        let mut widths: Vec<usize> = self.columns.iter().map(|c| c.len()).collect();
        for row in &self.rows {
            for (width, cell) in widths.iter_mut().zip(row) {
                *width = (*width).max(cell.len());
            }
        }

        let line = |cells: &[String]| {
            let mut out = String::from("|");
            for (cell, width) in cells.iter().zip(&widths) {
                out.push_str(&format!("{:>width$}", cell, width = width));
                out.push('|');
            }
            out
        };

        let header = line(&self.columns);
        let bar = format!("+{}+", "-".repeat(header.len().saturating_sub(2)));

        let mut out = String::new();
        out.push_str(&bar);
        out.push('\n');
        out.push_str(&header);
        out.push('\n');
        out.push_str(&bar);
        out.push('\n');
        for row in &self.rows {
            out.push_str(&line(row));
            out.push('\n');
        }
        out.push_str(&bar);
        out.push('\n');
        out.push_str(&format!(
            "{} rows in set ({:.3} sec)\n",
            self.rows.len(),
            elapsed_secs
        ));
        out
    }
}

/// Rewrite the progress line in place on stderr.
pub fn print_progress(pct: u8) {
    eprint!("\rProcessing data... {}%", pct);
    let _ = std::io::stderr().flush();
}

/// Blank out the progress line.
pub fn clear_progress() {
    eprint!("\r{:width$}\r", "", width = 40);
    let _ = std::io::stderr().flush();
}
