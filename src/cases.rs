//! The conformance cases run by the binary.

use std::path::{Path, PathBuf};

use anyhow::{bail, ensure, Context, Result};
use tempfile::TempDir;
use walkdir::WalkDir;

use crate::assertions::{
    expect_exit, expect_line_count, expect_match, expect_quiet_stderr, expect_stdout,
    expect_stdout_contains, record_lines,
};
use crate::baseline::{LIST_DIRENTS_LINES, LIST_INODES_LINES};
use crate::config::HarnessConfig;
use crate::fixture::{Fixture, FixtureState, Provisioner, GIB};
use crate::runner::{CommandResult, Invocation, Runner};

const LOST_AND_FOUND: &str = r"^.*type dirent.*: lost\+found ->.*type dir$";

pub type TestCase = (&'static str, Box<dyn Fn(&Harness) -> Result<()>>);

pub struct Harness {
    pub runner: Runner,
    pub provisioner: Provisioner,
    /// Every invocation made through [`Harness::run`] asks for valgrind.
    pub instrument: bool,
    session: TempDir,
}

impl Harness {
    pub fn new(config: &HarnessConfig) -> Result<Self> {
        let session = tempfile::Builder::new()
            .prefix("bcachefs-conformance-")
            .tempdir_in(&config.scratch)
            .with_context(|| format!("creating session directory in {:?}", config.scratch))?;
        let runner = Runner::new(config)?.with_scratch(session.path());
        let provisioner = Provisioner::new(session.path());
        Ok(Self {
            runner,
            provisioner,
            instrument: config.valgrind,
            session,
        })
    }

    pub fn session_dir(&self) -> &Path {
        self.session.path()
    }

    /// Anything a case left behind in the session directory.
    pub fn leftovers(&self) -> Vec<PathBuf> {
        WalkDir::new(self.session.path())
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(Result::ok)
            .map(|entry| entry.into_path())
            .collect()
    }

    fn run(&self, invocation: Invocation) -> Result<CommandResult> {
        Ok(self
            .runner
            .run(invocation.instrumented(self.instrument))?)
    }

    fn formatted_1g(&self) -> Result<Fixture> {
        Ok(self.provisioner.create_formatted(&self.runner, GIB)?)
    }
}

pub fn all() -> Vec<TestCase> {
    vec![
        ("help", Box::new(test_help)),
        ("format", Box::new(test_format)),
        ("fsck", Box::new(test_fsck)),
        ("list", Box::new(test_list)),
        ("list inodes", Box::new(test_list_inodes)),
        ("list dirents", Box::new(test_list_dirents)),
        ("fixture cleanup on pass", Box::new(test_cleanup_on_pass)),
        ("fixture cleanup on failure", Box::new(test_cleanup_on_failure)),
    ]
}

// --------------------- Utility behaviour ---------------------------------
fn test_help(h: &Harness) -> Result<()> {
    let ret = h.run(Invocation::bare())?;
    expect_exit(&ret, 1)?;
    expect_stdout_contains(&ret, "missing command")?;
    expect_quiet_stderr(&ret)
}

fn test_format(h: &Harness) -> Result<()> {
    let dev = h.provisioner.create_raw(GIB)?;
    let ret = h.run(Invocation::new("format").arg(dev.path()))?;
    expect_exit(&ret, 0)?;
    expect_stdout(&ret)?;
    expect_quiet_stderr(&ret)?;
    let len = std::fs::metadata(dev.path())?.len();
    ensure!(len == dev.capacity(), "format resized {:?} to {len} bytes", dev.path());
    Ok(())
}

fn test_fsck(h: &Harness) -> Result<()> {
    let dev = h.formatted_1g()?;
    let ret = h.run(Invocation::new("fsck").arg(dev.path()))?;
    expect_exit(&ret, 0)?;
    expect_stdout(&ret)?;
    expect_quiet_stderr(&ret)
}

fn test_list(h: &Harness) -> Result<()> {
    let dev = h.formatted_1g()?;
    let ret = h.run(Invocation::new("list").arg(dev.path()))?;
    expect_exit(&ret, 0)?;
    expect_quiet_stderr(&ret)?;
    expect_stdout_contains(&ret, "recovering from clean shutdown")
}

fn test_list_inodes(h: &Harness) -> Result<()> {
    let dev = h.formatted_1g()?;
    let ret = h.run(Invocation::new("list").args(["-b", "inodes"]).arg(dev.path()))?;
    expect_exit(&ret, 0)?;
    expect_quiet_stderr(&ret)?;
    expect_line_count(&ret, &LIST_INODES_LINES)
}

fn test_list_dirents(h: &Harness) -> Result<()> {
    let dev = h.formatted_1g()?;
    let ret = h.run(Invocation::new("list").args(["-b", "dirents"]).arg(dev.path()))?;
    expect_exit(&ret, 0)?;
    expect_quiet_stderr(&ret)?;
    expect_line_count(&ret, &LIST_DIRENTS_LINES)?;

    let records = record_lines(&ret);
    if records.len() != 1 {
        bail!(
            "`{}`: expected 1 dirent record, got {}: {records:#?}",
            ret.command,
            records.len()
        );
    }
    // Key dumps are line buffered, mount chatter is not, so the record leads.
    let first = ret.stdout_lines()[0];
    ensure!(first == records[0], "first line {first:?} is not the dirent record");
    expect_match(first, LOST_AND_FOUND)
}

// --------------------- Fixture lifecycle ---------------------------------
fn test_cleanup_on_pass(h: &Harness) -> Result<()> {
    let path = {
        let dev = h.provisioner.create_raw(GIB)?;
        ensure!(dev.state() == FixtureState::Raw);
        ensure!(dev.path().exists(), "{:?} missing while in scope", dev.path());
        dev.path().to_path_buf()
    };
    ensure!(!path.exists(), "{path:?} survived its scope");
    Ok(())
}

fn test_cleanup_on_failure(h: &Harness) -> Result<()> {
    let mut seen = None;
    let outcome = (|| -> Result<()> {
        let dev = h.provisioner.create_raw(GIB)?;
        seen = Some(dev.path().to_path_buf());
        bail!("simulated assertion failure");
    })();
    ensure!(outcome.is_err(), "failing scope reported success");
    let path = seen.context("fixture was never provisioned")?;
    ensure!(!path.exists(), "{path:?} survived a failing scope");
    Ok(())
}
