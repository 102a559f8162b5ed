//! Memory-safety supervisor wrapping.

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{LazyLock, OnceLock};

use regex::Regex;

use crate::error::{HarnessError, Result};

static SUMMARY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"ERROR SUMMARY: (\d+) errors from (\d+) contexts").expect("summary regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorSummary {
    pub errors: u64,
    pub contexts: u64,
}

/// Finds the last `ERROR SUMMARY` line; valgrind prints one per process.
pub fn parse_error_summary(log: &str) -> Option<ErrorSummary> {
    let caps = SUMMARY.captures_iter(log).last()?;
    Some(ErrorSummary {
        errors: caps[1].parse().ok()?,
        contexts: caps[2].parse().ok()?,
    })
}

#[derive(Debug)]
pub struct Valgrind {
    program: OsString,
    suppressions: Option<PathBuf>,
    resolved: OnceLock<PathBuf>,
}

impl Valgrind {
    pub fn new(suppressions: Option<PathBuf>) -> Self {
        Self::with_program("valgrind", suppressions)
    }

    pub fn with_program(program: impl Into<OsString>, suppressions: Option<PathBuf>) -> Self {
        Self {
            program: program.into(),
            suppressions,
            resolved: OnceLock::new(),
        }
    }

    /// Locates the supervisor. Success is cached; failure is reported every time.
    pub fn supervisor(&self) -> Result<&Path> {
        if let Some(path) = self.resolved.get() {
            return Ok(path);
        }
        let tool = self.program.to_string_lossy().into_owned();
        let found = which::which(&self.program).map_err(|e| {
            HarnessError::InstrumentationUnavailable {
                tool: tool.clone(),
                reason: e.to_string(),
            }
        })?;
        if let Some(supp) = &self.suppressions {
            if !supp.is_file() {
                return Err(HarnessError::InstrumentationUnavailable {
                    tool,
                    reason: format!("suppression file {supp:?} does not exist"),
                });
            }
        }
        Ok(self.resolved.get_or_init(|| found))
    }

    /// Argument vector placed in front of the utility's own argv.
    pub fn prefix(&self, supervisor: &Path, log_file: &Path) -> Vec<OsString> {
        let mut argv: Vec<OsString> = vec![
            supervisor.into(),
            "--leak-check=full".into(),
            "--gen-suppressions=all".into(),
        ];
        if let Some(supp) = &self.suppressions {
            let mut flag = OsString::from("--suppressions=");
            flag.push(supp);
            argv.push(flag);
        }
        let mut flag = OsString::from("--log-file=");
        flag.push(log_file);
        argv.push(flag);
        argv
    }

    /// Fails when the log reports memory errors or carries no summary at all.
    pub fn check_log(&self, command: &str, log_file: &Path) -> Result<ErrorSummary> {
        let log = fs::read_to_string(log_file).map_err(|e| HarnessError::InstrumentationLog {
            command: command.to_string(),
            path: log_file.to_path_buf(),
            reason: e.to_string(),
        })?;
        let summary =
            parse_error_summary(&log).ok_or_else(|| HarnessError::InstrumentationLog {
                command: command.to_string(),
                path: log_file.to_path_buf(),
                reason: "no ERROR SUMMARY line".to_string(),
            })?;
        if summary.errors > 0 {
            return Err(HarnessError::MemoryErrors {
                command: command.to_string(),
                errors: summary.errors,
                contexts: summary.contexts,
                log,
            });
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn summary_is_parsed() {
        let log = "==4242== Memcheck, a memory error detector\n\
                   ==4242== ERROR SUMMARY: 3 errors from 2 contexts (suppressed: 0 from 0)\n";
        assert_eq!(
            parse_error_summary(log),
            Some(ErrorSummary {
                errors: 3,
                contexts: 2
            })
        );
        assert_eq!(parse_error_summary("==1== HEAP SUMMARY:\n"), None);
    }

    #[test]
    fn prefix_carries_suppressions_and_log() {
        let vg = Valgrind::new(Some(PathBuf::from("supp.txt")));
        let argv = vg.prefix(Path::new("/usr/bin/valgrind"), Path::new("/tmp/vg.log"));
        assert_eq!(
            argv,
            vec![
                OsString::from("/usr/bin/valgrind"),
                "--leak-check=full".into(),
                "--gen-suppressions=all".into(),
                "--suppressions=supp.txt".into(),
                "--log-file=/tmp/vg.log".into(),
            ]
        );
    }

    #[test]
    fn missing_supervisor_is_an_error() {
        let vg = Valgrind::with_program("/nonexistent/valgrind-for-tests", None);
        assert!(matches!(
            vg.supervisor(),
            Err(HarnessError::InstrumentationUnavailable { .. })
        ));
    }

    #[test]
    fn dirty_log_raises_memory_errors() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("vg.log");
        fs::write(&log, "==7== ERROR SUMMARY: 1 errors from 1 contexts\n").unwrap();
        let vg = Valgrind::new(None);
        match vg.check_log("bcachefs fsck", &log) {
            Err(HarnessError::MemoryErrors { errors, .. }) => assert_eq!(errors, 1),
            other => panic!("unexpected {other:?}"),
        }

        fs::write(&log, "==7== ERROR SUMMARY: 0 errors from 0 contexts\n").unwrap();
        assert!(vg.check_log("bcachefs fsck", &log).is_ok());

        fs::write(&log, "truncated").unwrap();
        assert!(matches!(
            vg.check_log("bcachefs fsck", &log),
            Err(HarnessError::InstrumentationLog { .. })
        ));
    }
}
