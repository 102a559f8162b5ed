//! Disposable backing storage, one private directory per fixture.

use std::fs::{self, DirBuilder, OpenOptions};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use log::{debug, warn};
use nix::sys::statvfs::statvfs;
use tempfile::TempDir;

use crate::error::{HarnessError, Result};
use crate::runner::{Invocation, Runner};

pub const GIB: u64 = 1 << 30;

const FIXTURE_PREFIX: &str = "bch-fixture-";
const DEVICE_NAME: &str = "dev.img";
const MOUNTPOINT_NAME: &str = "mnt";

static LINGERING: AtomicUsize = AtomicUsize::new(0);

/// Fixtures whose release failed in this process.
pub fn lingering_count() -> usize {
    LINGERING.load(Ordering::Relaxed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixtureState {
    Raw,
    Formatted,
}

/// Backing storage owned by exactly one test. Dropping it removes the
/// backing file and everything else in its private directory.
#[derive(Debug)]
pub struct Fixture {
    dir: Option<TempDir>,
    device: PathBuf,
    capacity: u64,
    state: FixtureState,
}

impl Fixture {
    pub fn path(&self) -> &Path {
        &self.device
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn state(&self) -> FixtureState {
        self.state
    }

    /// Empty 0700 directory next to the backing file, created on first use.
    pub fn mountpoint(&self) -> Result<PathBuf> {
        let path = self.device.with_file_name(MOUNTPOINT_NAME);
        if !path.is_dir() {
            DirBuilder::new()
                .mode(0o700)
                .create(&path)
                .map_err(|e| HarnessError::Provisioning {
                    path: path.clone(),
                    size: self.capacity,
                    reason: format!("cannot create mountpoint: {e}"),
                })?;
        }
        Ok(path)
    }

    fn release(&mut self) {
        let Some(dir) = self.dir.take() else {
            return;
        };
        let path = dir.path().to_path_buf();
        match dir.close() {
            Ok(()) => debug!("released fixture {}", path.display()),
            Err(e) => {
                LINGERING.fetch_add(1, Ordering::Relaxed);
                warn!("failed to remove fixture {}: {e}", path.display());
            }
        }
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        self.release();
    }
}

#[derive(Debug, Clone)]
pub struct Provisioner {
    root: PathBuf,
}

impl Provisioner {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Sparse backing file of exactly `size` bytes in a fresh directory.
    pub fn create_raw(&self, size: u64) -> Result<Fixture> {
        let fail = |path: &Path, reason: String| HarnessError::Provisioning {
            path: path.to_path_buf(),
            size,
            reason,
        };
        if size == 0 {
            return Err(fail(&self.root, "size must be non-zero".to_string()));
        }

        let dir = tempfile::Builder::new()
            .prefix(FIXTURE_PREFIX)
            .tempdir_in(&self.root)
            .map_err(|e| fail(&self.root, format!("cannot create directory: {e}")))?;

        let available = available_bytes(dir.path())
            .map_err(|e| fail(dir.path(), format!("statvfs failed: {e}")))?;
        if available < size {
            return Err(fail(
                dir.path(),
                format!("only {available} bytes available"),
            ));
        }

        let device = dir.path().join(DEVICE_NAME);
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&device)
            .map_err(|e| fail(&device, e.to_string()))?;
        file.set_len(size)
            .map_err(|e| fail(&device, format!("cannot size backing file: {e}")))?;
        let actual = file
            .metadata()
            .map_err(|e| fail(&device, e.to_string()))?
            .len();
        if actual != size {
            return Err(fail(&device, format!("backing file is {actual} bytes")));
        }

        debug!("provisioned {size} byte fixture {}", device.display());
        Ok(Fixture {
            dir: Some(dir),
            device,
            capacity: size,
            state: FixtureState::Raw,
        })
    }

    /// Raw fixture that the utility's own `format` has been applied to.
    pub fn create_formatted(&self, runner: &Runner, size: u64) -> Result<Fixture> {
        let mut fixture = self.create_raw(size)?;
        runner.run_checked(Invocation::new("format").arg(fixture.path()))?;

        let len = fs::metadata(fixture.path())
            .map_err(|e| HarnessError::Provisioning {
                path: fixture.path().to_path_buf(),
                size,
                reason: e.to_string(),
            })?
            .len();
        if len != fixture.capacity {
            return Err(HarnessError::Provisioning {
                path: fixture.path().to_path_buf(),
                size,
                reason: format!("format resized backing file to {len} bytes"),
            });
        }
        fixture.state = FixtureState::Formatted;
        Ok(fixture)
    }
}

fn available_bytes(path: &Path) -> nix::Result<u64> {
    let stat = statvfs(path)?;
    Ok((stat.blocks_available() as u64).saturating_mul(stat.fragment_size() as u64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::script;
    use crate::valgrind::Valgrind;
    use std::collections::HashSet;
    use std::os::unix::fs::PermissionsExt;
    use std::time::Duration;

    const SIZE: u64 = 16 << 20;

    fn entries(dir: &Path) -> usize {
        fs::read_dir(dir).unwrap().count()
    }

    #[test]
    fn raw_fixture_has_exact_capacity() {
        let root = TempDir::new().unwrap();
        let fixture = Provisioner::new(root.path()).create_raw(SIZE).unwrap();
        let meta = fs::metadata(fixture.path()).unwrap();
        assert_eq!(meta.len(), SIZE);
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
        assert_eq!(fixture.capacity(), SIZE);
        assert_eq!(fixture.state(), FixtureState::Raw);
    }

    #[test]
    fn zero_and_oversized_requests_fail() {
        let root = TempDir::new().unwrap();
        let provisioner = Provisioner::new(root.path());
        assert!(matches!(
            provisioner.create_raw(0),
            Err(HarnessError::Provisioning { .. })
        ));
        assert!(matches!(
            provisioner.create_raw(u64::MAX / 2),
            Err(HarnessError::Provisioning { .. })
        ));
        assert_eq!(entries(root.path()), 0);
    }

    #[test]
    fn missing_root_fails() {
        let root = TempDir::new().unwrap();
        let provisioner = Provisioner::new(root.path().join("absent"));
        assert!(matches!(
            provisioner.create_raw(SIZE),
            Err(HarnessError::Provisioning { .. })
        ));
    }

    #[test]
    fn concurrent_fixtures_never_alias() {
        let root = TempDir::new().unwrap();
        let provisioner = Provisioner::new(root.path());
        let paths: Vec<PathBuf> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    s.spawn(|| {
                        let fixture = provisioner.create_raw(SIZE).unwrap();
                        let path = fixture.path().to_path_buf();
                        // Hold the fixture so every thread's copy exists at once.
                        std::thread::sleep(Duration::from_millis(20));
                        path
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        let unique: HashSet<_> = paths.iter().collect();
        assert_eq!(unique.len(), paths.len());
        assert_eq!(entries(root.path()), 0);
    }

    #[test]
    fn released_when_scope_passes() {
        let root = TempDir::new().unwrap();
        let fixture = Provisioner::new(root.path()).create_raw(SIZE).unwrap();
        let path = fixture.path().to_path_buf();
        let mnt = fixture.mountpoint().unwrap();
        assert!(mnt.is_dir());
        assert_eq!(fs::metadata(&mnt).unwrap().permissions().mode() & 0o777, 0o700);
        drop(fixture);
        assert!(!path.exists());
        assert!(!mnt.exists());
    }

    #[test]
    fn released_when_scope_fails() {
        let root = TempDir::new().unwrap();
        let provisioner = Provisioner::new(root.path());
        let mut seen = None;
        let outcome: anyhow::Result<()> = (|| {
            let fixture = provisioner.create_raw(SIZE)?;
            seen = Some(fixture.path().to_path_buf());
            anyhow::bail!("line count 66 != 67");
        })();
        assert!(outcome.is_err());
        assert!(!seen.unwrap().exists());

        let caught = std::panic::catch_unwind(|| {
            let fixture = provisioner.create_raw(SIZE).unwrap();
            panic!("{}", fixture.path().display());
        });
        assert!(caught.is_err());
        assert_eq!(entries(root.path()), 0);
    }

    #[test]
    fn failed_release_is_counted() {
        let root = TempDir::new().unwrap();
        let fixture = Provisioner::new(root.path()).create_raw(SIZE).unwrap();
        fs::remove_dir_all(fixture.path().parent().unwrap()).unwrap();
        let before = lingering_count();
        drop(fixture);
        assert!(lingering_count() > before);
    }

    fn runner_with(dir: &Path, body: &str) -> Runner {
        Runner::with_binary(
            script(dir, "util", body),
            Valgrind::new(None),
            Duration::from_secs(30),
        )
    }

    #[test]
    fn formatted_fixture_keeps_capacity() {
        let tools = TempDir::new().unwrap();
        let root = TempDir::new().unwrap();
        let runner = runner_with(
            tools.path(),
            "[ \"$1\" = format ] || exit 2\necho \"formatting $2\"\n",
        );
        let fixture = Provisioner::new(root.path())
            .create_formatted(&runner, SIZE)
            .unwrap();
        assert_eq!(fixture.state(), FixtureState::Formatted);
        assert_eq!(fs::metadata(fixture.path()).unwrap().len(), SIZE);
    }

    #[test]
    fn failed_format_propagates_and_cleans_up() {
        let tools = TempDir::new().unwrap();
        let root = TempDir::new().unwrap();
        let runner = runner_with(tools.path(), "echo 'device too small' >&2\nexit 1\n");
        let result = Provisioner::new(root.path()).create_formatted(&runner, SIZE);
        match result {
            Err(HarnessError::CommandFailure { code, stderr, .. }) => {
                assert_eq!(code, 1);
                assert_eq!(stderr, "device too small\n");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(entries(root.path()), 0);
    }

    #[test]
    fn resizing_format_is_rejected() {
        let tools = TempDir::new().unwrap();
        let root = TempDir::new().unwrap();
        let runner = runner_with(tools.path(), "truncate -s 4096 \"$2\"\n");
        assert!(matches!(
            Provisioner::new(root.path()).create_formatted(&runner, SIZE),
            Err(HarnessError::Provisioning { .. })
        ));
    }
}
