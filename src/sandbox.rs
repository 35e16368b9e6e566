//! Sandbox: the on-disk diagnostic surface for one cluster build.
//!
//! Every node's stdout/stderr lands here, every control-plane URL is
//! appended to `commands.log`, and `scan_for_errors` sweeps the node logs
//! for fatal signatures. Per-file `doneToLine.*` markers record how far a
//! previous scan got, so consecutive runs against a shared cluster only
//! report lines they have not already seen.

use regex::Regex;
use slog::{debug, info, Logger};
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

const COMMANDS_LOG: &str = "commands.log";
const MARKER_PREFIX: &str = "doneToLine.";

#[derive(Debug)]
pub enum SandboxError {
    /// Fatal-looking lines found in a node log.
    FatalLines { file: String, lines: Vec<String> },
    Io(std::io::Error),
}

impl fmt::Display for SandboxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SandboxError::FatalLines { file, lines } => {
                writeln!(f, "fatal signature in {}:", file)?;
                for line in lines {
                    writeln!(f, "  {}", line)?;
                }
                Ok(())
            }
            SandboxError::Io(e) => write!(f, "sandbox io error: {}", e),
        }
    }
}

impl std::error::Error for SandboxError {}

impl From<std::io::Error> for SandboxError {
    fn from(e: std::io::Error) -> Self {
        SandboxError::Io(e)
    }
}

/// Case-insensitive signatures that mean a node is in trouble.
fn fatal_pattern() -> Regex {
    Regex::new(
        r"(?i)(exception|\bassert(ion)?\b|\berror\b|\bfatal\b|\bkilled\b|stack ?trace|sigsegv|out of memory)",
    )
    .unwrap()
}

/// Lines that match the fatal pattern but are routine output.
fn benign_pattern() -> Regex {
    Regex::new(
        r"(?i)(error rate|errors?[:=] ?0\b|error_count|assertions enabled|-ea\b|mean.?squared.?error|no errors found)",
    )
    .unwrap()
}

#[derive(Clone, Debug)]
pub struct Sandbox {
    dir: PathBuf,
    logger: Logger,
}

impl Sandbox {
    pub fn new(dir: impl Into<PathBuf>, logger: Logger) -> Result<Self, SandboxError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Sandbox { dir, logger })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// stdout/stderr destinations for one node. `mode` is "local" or
    /// "remote"; foreign nodes have no captured output.
    pub fn node_log_paths(&self, mode: &str, node_id: usize) -> (PathBuf, PathBuf) {
        (
            self.dir.join(format!("{}-node-{}.stdout.log", mode, node_id)),
            self.dir.join(format!("{}-node-{}.stderr.log", mode, node_id)),
        )
    }

    /// Append one issued control-plane URL to `commands.log`.
    pub fn log_command(&self, url: &str) -> Result<(), SandboxError> {
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join(COMMANDS_LOG))?;
        writeln!(file, "{}", url)?;
        Ok(())
    }

    /// Wipe the sandbox dir and recreate it empty.
    pub fn clean(&self) -> Result<(), SandboxError> {
        if self.dir.exists() {
            fs::remove_dir_all(&self.dir)?;
        }
        fs::create_dir_all(&self.dir)?;
        Ok(())
    }

    /// Drop only the scan markers, so the next scan starts from line 0.
    pub fn clean_markers(&self) -> Result<(), SandboxError> {
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if entry
                .file_name()
                .to_string_lossy()
                .starts_with(MARKER_PREFIX)
            {
                fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }

    /// Scan every node log for fatal signatures, starting each file at its
    /// marker offset. Advances the markers whether or not anything is
    /// found, so a repeated scan after a reported error is quiet.
    pub fn scan_for_errors(&self) -> Result<(), SandboxError> {
        let fatal = fatal_pattern();
        let benign = benign_pattern();

        let mut log_files: Vec<PathBuf> = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.ends_with(".stdout.log") || name.ends_with(".stderr.log") {
                log_files.push(entry.path());
            }
        }
        log_files.sort();

        for path in log_files {
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            let start = self.read_marker(&file_name);
            let content = fs::read_to_string(&path)?;
            let total = content.lines().count();

            let mut bad: Vec<String> = Vec::new();
            for line in content.lines().skip(start) {
                if fatal.is_match(line) && !benign.is_match(line) {
                    bad.push(line.to_string());
                }
            }

            self.write_marker(&file_name, total)?;

            if !bad.is_empty() {
                info!(self.logger, "fatal lines found in sandbox";
                    "file" => &file_name, "count" => bad.len());
                return Err(SandboxError::FatalLines {
                    file: file_name,
                    lines: bad,
                });
            }
            debug!(self.logger, "sandbox file clean";
                "file" => &file_name, "scanned_from" => start, "lines" => total);
        }
        Ok(())
    }

    fn marker_path(&self, file_name: &str) -> PathBuf {
        self.dir.join(format!("{}{}", MARKER_PREFIX, file_name))
    }

    fn read_marker(&self, file_name: &str) -> usize {
        fs::read_to_string(self.marker_path(file_name))
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(0)
    }

    fn write_marker(&self, file_name: &str, line: usize) -> Result<(), SandboxError> {
        fs::write(self.marker_path(file_name), format!("{}\n", line))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_logger() -> Logger {
        Logger::root(slog::Discard, slog::o!())
    }

    fn temp_sandbox() -> Sandbox {
        let dir = std::env::temp_dir().join(format!("sandbox-test-{}", uuid::Uuid::new_v4()));
        Sandbox::new(dir, test_logger()).unwrap()
    }

    #[test]
    fn test_clean_log_passes() {
        let sb = temp_sandbox();
        let (out, _) = sb.node_log_paths("local", 0);
        fs::write(&out, "listening on 127.0.0.1:20000\ncloud of size 3 formed\n").unwrap();
        sb.scan_for_errors().unwrap();
        fs::remove_dir_all(sb.dir()).unwrap();
    }

    #[test]
    fn test_fatal_line_is_reported_with_content() {
        let sb = temp_sandbox();
        let (out, _) = sb.node_log_paths("local", 0);
        fs::write(&out, "starting up\njava.lang.NullPointerException at Foo.bar\n").unwrap();
        match sb.scan_for_errors() {
            Err(SandboxError::FatalLines { file, lines }) => {
                assert_eq!(file, "local-node-0.stdout.log");
                assert_eq!(lines.len(), 1);
                assert!(lines[0].contains("NullPointerException"));
            }
            other => panic!("expected fatal lines, got {:?}", other.map(|_| ())),
        }
        fs::remove_dir_all(sb.dir()).unwrap();
    }

    #[test]
    fn test_benign_lines_are_allowed() {
        let sb = temp_sandbox();
        let (out, _) = sb.node_log_paths("local", 1);
        fs::write(
            &out,
            "training error rate: 0.02\nparse errors: 0\nassertions enabled\n",
        )
        .unwrap();
        sb.scan_for_errors().unwrap();
        fs::remove_dir_all(sb.dir()).unwrap();
    }

    #[test]
    fn test_second_scan_after_error_is_quiet() {
        let sb = temp_sandbox();
        let (out, _) = sb.node_log_paths("local", 0);
        fs::write(&out, "FATAL: heap exhausted\n").unwrap();
        assert!(sb.scan_for_errors().is_err());
        // marker moved past the bad line
        sb.scan_for_errors().unwrap();
        fs::remove_dir_all(sb.dir()).unwrap();
    }

    #[test]
    fn test_clean_markers_rescans_from_start() {
        let sb = temp_sandbox();
        let (out, _) = sb.node_log_paths("local", 0);
        fs::write(&out, "FATAL: heap exhausted\n").unwrap();
        assert!(sb.scan_for_errors().is_err());
        sb.clean_markers().unwrap();
        assert!(sb.scan_for_errors().is_err());
        fs::remove_dir_all(sb.dir()).unwrap();
    }

    #[test]
    fn test_commands_log_appends() {
        let sb = temp_sandbox();
        sb.log_command("http://127.0.0.1:20000/cloud").unwrap();
        sb.log_command("http://127.0.0.1:20000/jobs").unwrap();
        let content = fs::read_to_string(sb.dir().join(COMMANDS_LOG)).unwrap();
        assert_eq!(
            content,
            "http://127.0.0.1:20000/cloud\nhttp://127.0.0.1:20000/jobs\n"
        );
        fs::remove_dir_all(sb.dir()).unwrap();
    }
}
