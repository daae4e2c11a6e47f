//! Application module for logrok.
//!
//! Provides the high-level API: ingest log files into a dataset, run
//! one-shot queries, or serve the interactive shell.

use std::fs::File;
use std::path::PathBuf;
use std::time::Instant;

use memmap2::Mmap;
use rustyline::completion::Completer;
use rustyline::config::Config;
use rustyline::highlight::Highlighter;
use rustyline::hint::Hinter;
use rustyline::history::FileHistory;
use rustyline::validate::Validator;
use rustyline::{Context, Editor, Helper, error::ReadlineError};

use crate::error::{Error, Result};
use crate::exec::{self, ExecCtx, QueryOutput, funcs};
use crate::pool::{CancelToken, Pool};
use crate::scanner::Scanner;
use crate::sql;
use crate::table::{self, Table};
use crate::types::Dataset;

const HISTORY_FILE: &str = ".logrok_history";
const HISTORY_SIZE: usize = 1000;

const HELP: &str = "Use sql syntax against your log, `from` clauses are ignored.\n\
Queries can span multiple lines and _must_ end in a semicolon `;`.\n\
 Try: `show fields;` to see available field names. Press TAB at the\n\
 beginning of a new line to see all available completions.";

/// Ingestion options.
#[derive(Debug, Clone)]
pub struct LoadOptions {
    /// Resolved `LogFormat` template.
    pub format: String,
    /// Log file paths; glob patterns are expanded.
    pub paths: Vec<String>,
    /// Read only the first N lines of the concatenated input.
    pub lines: Option<usize>,
    /// Worker count override; `None` sizes from the host.
    pub workers: Option<usize>,
    pub debug: bool,
}

impl LoadOptions {
    pub fn new(format: impl Into<String>) -> Self {
        Self {
            format: format.into(),
            paths: Vec::new(),
            lines: None,
            workers: None,
            debug: false,
        }
    }

    pub fn with_paths(mut self, paths: Vec<String>) -> Self {
        self.paths = paths;
        self
    }

    pub fn with_lines(mut self, lines: Option<usize>) -> Self {
        self.lines = lines;
        self
    }

    pub fn with_workers(mut self, workers: Option<usize>) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }
}

/// Main application struct: the loaded dataset plus the worker pool queries
/// run on.
pub struct LoGrok {
    dataset: Dataset,
    pool: Pool,
    debug: bool,
}

impl LoGrok {
    /// Read every input file fully, then extract records in parallel.
    pub fn load(options: LoadOptions) -> Result<Self> {
        let scanner = Scanner::from_format(&options.format)?;
        let pool = Pool::new()
            .with_workers(options.workers)
            .with_progress(Box::new(table::print_progress));

        let mut lines: Vec<String> = Vec::new();
        for pattern in &options.paths {
            let mut matched = false;
            for entry in glob::glob(pattern)? {
                let path = entry?;
                matched = true;
                eprintln!("Reading lines from {}", path.display());
                read_lines(&path, &mut lines)?;
            }
            if !matched {
                return Err(Error::NoFiles(pattern.clone()));
            }
        }
        if let Some(cap) = options.lines {
            lines.truncate(cap);
        }

        let total = lines.len();
        let started = Instant::now();
        let scanner_ref = &scanner;
        let rows = pool.map(lines, move |chunk| Ok(scanner_ref.scan_chunk(&chunk)))?;
        table::clear_progress();
        eprintln!(
            "{} lines crunched in {:.3} seconds",
            total,
            started.elapsed().as_secs_f64()
        );

        Ok(Self {
            dataset: Dataset::new(scanner.schema(), rows),
            pool,
            debug: options.debug,
        })
    }

    pub fn dataset(&self) -> &Dataset {
        &self.dataset
    }

    /// Token the CLI wires to the SIGINT handler.
    pub fn cancel_token(&self) -> CancelToken {
        self.pool.cancel_token()
    }

    /// Parse and execute one query.
    pub fn run_query(&self, query: &str) -> Result<QueryOutput> {
        self.pool.cancel_token().reset();
        let stmt = sql::parse(query)?;
        let ctx = ExecCtx::new(&self.pool, self.debug);
        exec::execute(&ctx, &stmt, &self.dataset)
    }

    /// Execute one query and print the result table to stdout.
    pub fn query(&self, query: &str) -> Result<()> {
        let started = Instant::now();
        let output = self.run_query(query)?;
        table::clear_progress();
        print!(
            "{}",
            Table::new(&output).render(started.elapsed().as_secs_f64())
        );
        Ok(())
    }

    /// Interactive shell: multi-line queries terminated by `;`, persistent
    /// history, tab completion over keywords, schema fields, and functions.
    pub fn shell(&self) -> Result<()> {
        let config = Config::builder().max_history_size(HISTORY_SIZE)?.build();
        let mut rl: Editor<ShellHelper, FileHistory> = Editor::with_config(config)?;
        rl.set_helper(Some(ShellHelper::new(&self.dataset)));

        let history = dirs::home_dir().map(|home| home.join(HISTORY_FILE));
        if let Some(path) = &history {
            let _ = rl.load_history(path);
        }

        let mut buffer = String::new();
        loop {
            let prompt = if buffer.is_empty() { "logrok> " } else { "> " };
            let line = match rl.readline(prompt) {
                Ok(line) => line,
                Err(ReadlineError::Interrupted) => {
                    println!("^C");
                    buffer.clear();
                    continue;
                }
                Err(ReadlineError::Eof) => break,
                Err(e) => return Err(e.into()),
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if !buffer.is_empty() {
                buffer.push(' ');
            }
            buffer.push_str(line);

            // Commands work with or without the terminating semicolon.
            let command = buffer.trim_end_matches(';').trim().to_lowercase();
            match command.as_str() {
                "quit" | "bye" | "exit" => break,
                "show fields" | "show headers" => {
                    let names: Vec<&str> = self.dataset.schema.names().collect();
                    println!("{}", names.join(", "));
                    buffer.clear();
                    continue;
                }
                _ if command.starts_with("help") || command.starts_with('?') => {
                    println!("{}", HELP);
                    buffer.clear();
                    continue;
                }
                _ => {}
            }

            // A `;` terminates the query; anything after the first one is
            // discarded.
            let semicolon = match buffer.find(';') {
                Some(i) => i,
                None => continue,
            };
            let query = buffer[..semicolon].to_string();
            buffer.clear();
            if query.trim().is_empty() {
                continue;
            }
            let _ = rl.add_history_entry(query.as_str());
            match self.query(&query) {
                Ok(()) => {}
                Err(e) if e.is_recoverable() => eprintln!("ERROR: {}", e),
                Err(e) => return Err(e),
            }
        }

        if let Some(path) = &history {
            let _ = rl.save_history(path);
        }
        Ok(())
    }
}

fn read_lines(path: &PathBuf, lines: &mut Vec<String>) -> Result<()> {
    let file = File::open(path)?;
    if file.metadata()?.len() == 0 {
        return Ok(());
    }
    let mmap = unsafe { Mmap::map(&file)? };
    let text = std::str::from_utf8(&mmap)?;
    lines.extend(text.lines().map(str::to_string));
    Ok(())
}

/// Tab completion over SQL keywords, schema fields, and function names.
struct ShellHelper {
    words: Vec<String>,
}

impl ShellHelper {
    fn new(dataset: &Dataset) -> Self {
        let mut words: Vec<String> = [
            "select", "from log", "where", "between", "group by", "order by", "limit", "asc",
            "desc", "and", "or", "in", "show fields", "quit",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        words.extend(funcs::NAMES.iter().map(|s| s.to_string()));
        words.extend(dataset.schema.names().map(str::to_string));
        words.sort();
        Self { words }
    }
}

impl Completer for ShellHelper {
    type Candidate = String;

    fn complete(
        &self,
        line: &str,
        pos: usize,
        _ctx: &Context<'_>,
    ) -> rustyline::Result<(usize, Vec<String>)> {
        let start = line[..pos]
            .rfind(|c: char| c.is_whitespace() || c == '(' || c == ',')
            .map(|i| i + 1)
            .unwrap_or(0);
        let prefix = line[start..pos].to_lowercase();
        let matches = self
            .words
            .iter()
            .filter(|w| prefix.is_empty() || w.starts_with(&prefix))
            .cloned()
            .collect();
        Ok((start, matches))
    }
}

impl Hinter for ShellHelper {
    type Hint = String;
}

impl Highlighter for ShellHelper {}
impl Validator for ShellHelper {}
impl Helper for ShellHelper {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Value;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn fixture() -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"127.0.0.1 - frank [10/Oct/2000:13:55:36 -0700] "GET /a HTTP/1.0" 200 2326"#
        )
        .unwrap();
        writeln!(
            file,
            r#"127.0.0.1 - joe [10/Oct/2000:13:55:37 -0700] "GET /b HTTP/1.0" 404 12"#
        )
        .unwrap();
        writeln!(
            file,
            r#"10.0.0.1 - mary [10/Oct/2000:13:55:38 -0700] "POST /a HTTP/1.0" 200 40"#
        )
        .unwrap();
        file.flush().unwrap();
        file
    }

    fn load(file: &NamedTempFile) -> LoGrok {
        let options = LoadOptions::new("%h %l %u %t \"%r\" %>s %b")
            .with_paths(vec![file.path().to_string_lossy().into_owned()]);
        LoGrok::load(options).unwrap()
    }

    #[test]
    fn test_load_and_query_end_to_end() {
        let file = fixture();
        let app = load(&file);
        assert_eq!(app.dataset().len(), 3);
        let out = app.run_query("select count(*);").unwrap();
        assert_eq!(out.rows, vec![vec![Value::Int(3)]]);
    }

    #[test]
    fn test_line_cap() {
        let file = fixture();
        let options = LoadOptions::new("%h %l %u %t \"%r\" %>s %b")
            .with_paths(vec![file.path().to_string_lossy().into_owned()])
            .with_lines(Some(2));
        let app = LoGrok::load(options).unwrap();
        assert_eq!(app.dataset().len(), 2);
    }

    #[test]
    fn test_missing_file_reports_no_files() {
        let options = LoadOptions::new("%h")
            .with_paths(vec!["/nonexistent/path/to/file.log".to_string()]);
        assert!(matches!(LoGrok::load(options), Err(Error::NoFiles(_))));
    }

    #[test]
    fn test_multiple_files_concatenate() {
        let a = fixture();
        let b = fixture();
        let options = LoadOptions::new("%h %l %u %t \"%r\" %>s %b").with_paths(vec![
            a.path().to_string_lossy().into_owned(),
            b.path().to_string_lossy().into_owned(),
        ]);
        let app = LoGrok::load(options).unwrap();
        assert_eq!(app.dataset().len(), 6);
    }

    #[test]
    fn test_recoverable_query_errors() {
        let file = fixture();
        let app = load(&file);
        let err = app.run_query("select nope;").unwrap_err();
        assert!(err.is_recoverable());
        let err = app.run_query("select * where").unwrap_err();
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_completer_word_boundaries() {
        let file = fixture();
        let app = load(&file);
        let helper = ShellHelper::new(app.dataset());
        let history = FileHistory::new();
        let ctx = Context::new(&history);
        let (start, matches) = helper.complete("select bo", 9, &ctx).unwrap();
        assert_eq!(start, 7);
        assert!(matches.contains(&"body_size".to_string()));
    }
}
