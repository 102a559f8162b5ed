//! Checks over a [`CommandResult`] that fail with the literal mismatch.

use std::sync::LazyLock;

use anyhow::{bail, Context, Result};
use regex::Regex;

use crate::baseline::Baseline;
use crate::runner::CommandResult;

/// `u64s <n> type <kind> ...`: one decoded on-disk key per line.
static RECORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^u64s \d+ type \w+").expect("record regex"));

pub fn expect_exit(result: &CommandResult, code: i32) -> Result<()> {
    if result.code != code {
        bail!(
            "`{}`: expected exit {code}, got {}\n=== stdout ===\n{}\n=== stderr ===\n{}",
            result.command,
            result.code,
            result.stdout,
            result.stderr
        );
    }
    Ok(())
}

pub fn expect_quiet_stderr(result: &CommandResult) -> Result<()> {
    if !result.stderr.is_empty() {
        bail!(
            "`{}`: expected empty stderr, got {}B\n=== stderr ===\n{}",
            result.command,
            result.stderr.len(),
            result.stderr
        );
    }
    Ok(())
}

pub fn expect_stdout(result: &CommandResult) -> Result<()> {
    if result.stdout.is_empty() {
        bail!("`{}`: expected output on stdout, got none", result.command);
    }
    Ok(())
}

pub fn expect_stdout_contains(result: &CommandResult, needle: &str) -> Result<()> {
    if !result.stdout.contains(needle) {
        bail!(
            "`{}`: stdout missing {needle:?}\n=== stdout ===\n{}",
            result.command,
            result.stdout
        );
    }
    Ok(())
}

pub fn expect_line_count(result: &CommandResult, baseline: &Baseline) -> Result<()> {
    let actual = result.stdout_lines().len();
    if actual != baseline.lines {
        bail!(
            "`{}`: expected {} lines ({} @ format {}), got {actual}: {}\n=== stdout ===\n{}",
            result.command,
            baseline.lines,
            baseline.name,
            baseline.format_version,
            baseline.classify(&result.stdout),
            result.stdout
        );
    }
    Ok(())
}

pub fn expect_match(line: &str, pattern: &str) -> Result<()> {
    let re = Regex::new(pattern).with_context(|| format!("invalid regex {pattern:?}"))?;
    if !re.is_match(line) {
        bail!("line {line:?} does not match {pattern:?}");
    }
    Ok(())
}

/// Lines of `list` output that decode an on-disk structure.
pub fn record_lines(result: &CommandResult) -> Vec<&str> {
    result
        .stdout
        .lines()
        .filter(|line| RECORD.is_match(line))
        .collect()
}
