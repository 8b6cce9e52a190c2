//! Scratch mounts and the in-process mount table
//!
//! The table shadows the kernel's view (`/proc/self/mounts`) and is
//! reconciled from it at construction; mounts we create are tagged so
//! release only ever touches our own scratch mounts. A partition that
//! is already mounted elsewhere is reused and never unmounted by us.

use std::ffi::CString;
use std::fs::{self, File};
use std::io::Read;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use parking_lot::Mutex;

use crate::archive;
use crate::error::{Error, Result};
use crate::fs_driver::{FsDriver, MountCapability};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub source: PathBuf,
    pub mount_point: PathBuf,
    pub fs_name: String,
    pub options: String,
    /// True for mounts this process created under the scratch prefix.
    pub ours: bool,
}

/// Process-global mount bookkeeping. All mount and unmount operations
/// serialize around this table.
pub struct MountTable {
    entries: Mutex<Vec<MountEntry>>,
}

impl MountTable {
    /// Builds the table from the kernel's current view.
    pub fn new() -> Self {
        let content = fs::read_to_string("/proc/self/mounts").unwrap_or_default();
        MountTable {
            entries: Mutex::new(parse_proc_mounts(&content)),
        }
    }

    #[cfg(test)]
    fn from_proc(content: &str) -> Self {
        MountTable {
            entries: Mutex::new(parse_proc_mounts(content)),
        }
    }

    /// Where `dev` is mounted, matching by device path or by its
    /// `/dev/disk/by-uuid/<uuid>` alias.
    pub fn find_mounted(&self, dev: &Path, uuid: &str) -> Option<PathBuf> {
        let by_uuid = if uuid.is_empty() {
            None
        } else {
            Some(Path::new("/dev/disk/by-uuid").join(uuid))
        };
        let entries = self.entries.lock();
        entries
            .iter()
            .find(|e| {
                e.source == dev || by_uuid.as_deref().is_some_and(|alias| e.source == alias)
            })
            .map(|e| e.mount_point.clone())
    }

    pub fn record(&self, entry: MountEntry) {
        self.entries.lock().push(entry);
    }

    pub fn remove(&self, mount_point: &Path) {
        self.entries.lock().retain(|e| e.mount_point != mount_point);
    }

    /// Number of live mounts this process created. Zero after every
    /// materializer finishes.
    pub fn ours_count(&self) -> usize {
        self.entries.lock().iter().filter(|e| e.ours).count()
    }
}

impl Default for MountTable {
    fn default() -> Self {
        Self::new()
    }
}

/// `/proc/self/mounts` lines, with octal escapes decoded.
fn parse_proc_mounts(content: &str) -> Vec<MountEntry> {
    content
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let source = fields.next()?;
            let mount_point = fields.next()?;
            let fs_name = fields.next()?;
            let options = fields.next().unwrap_or("");
            Some(MountEntry {
                source: PathBuf::from(unescape_octal(source)),
                mount_point: PathBuf::from(unescape_octal(mount_point)),
                fs_name: fs_name.to_string(),
                options: options.to_string(),
                ours: false,
            })
        })
        .collect()
}

/// Mount paths with spaces appear as `\040` in /proc/self/mounts.
fn unescape_octal(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let oct = &s[i + 1..i + 4];
            if let Ok(v) = u8::from_str_radix(oct, 8) {
                out.push(v as char);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i] as char);
        i += 1;
    }
    out
}

fn scratch_dir() -> Result<PathBuf> {
    let dir = tempfile::Builder::new()
        .prefix("drivecast-")
        .tempdir_in(std::env::temp_dir())
        .map_err(|e| Error::WriteData(e.to_string()))?;
    // The materializer owns the lifetime; drop the auto-delete handle.
    Ok(dir.keep())
}

/// Mounts one partition at a scratch directory and releases it exactly
/// once on every exit path, including failure and cancellation.
pub struct Materializer<'t> {
    table: &'t MountTable,
    driver: &'static FsDriver,
    dev: PathBuf,
    uuid: String,
    mount_point: Option<PathBuf>,
    pre_mounted: bool,
    read_only: bool,
}

impl<'t> Materializer<'t> {
    pub fn new(
        table: &'t MountTable,
        driver: &'static FsDriver,
        dev: impl Into<PathBuf>,
        uuid: impl Into<String>,
    ) -> Self {
        Materializer {
            table,
            driver,
            dev: dev.into(),
            uuid: uuid.into(),
            mount_point: None,
            pre_mounted: false,
            read_only: false,
        }
    }

    /// Mount point of the partition, reusing an existing mount when the
    /// kernel already has one.
    pub fn mount(&mut self) -> Result<PathBuf> {
        if let Some(mp) = &self.mount_point {
            return Ok(mp.clone());
        }
        if let Some(existing) = self.table.find_mounted(&self.dev, &self.uuid) {
            self.pre_mounted = true;
            self.mount_point = Some(existing.clone());
            return Ok(existing);
        }

        let capability = self
            .driver
            .mount_capability()
            .ok_or_else(|| Error::Mount(self.dev.clone()))?;
        let dir = scratch_dir()?;

        let mounted = match capability {
            MountCapability::Native => self.native_mount(&dir),
            MountCapability::External => self.external_mount(&dir),
        };
        if let Err(e) = mounted {
            let _ = fs::remove_dir(&dir);
            return Err(e);
        }

        self.table.record(MountEntry {
            source: self.dev.clone(),
            mount_point: dir.clone(),
            fs_name: self.driver.mount_name().to_string(),
            options: self.driver.mount_options().to_string(),
            ours: true,
        });
        self.mount_point = Some(dir.clone());
        Ok(dir)
    }

    fn native_mount(&self, dir: &Path) -> Result<()> {
        let src = CString::new(self.dev.as_os_str().as_bytes())
            .map_err(|_| Error::Mount(self.dev.clone()))?;
        let target = CString::new(dir.as_os_str().as_bytes())
            .map_err(|_| Error::Mount(self.dev.clone()))?;
        let fstype = CString::new(self.driver.mount_name())
            .map_err(|_| Error::Mount(self.dev.clone()))?;
        let options = CString::new(self.driver.mount_options())
            .map_err(|_| Error::Mount(self.dev.clone()))?;
        let flags = if self.read_only { libc::MS_RDONLY } else { 0 };
        let rc = unsafe {
            libc::mount(
                src.as_ptr(),
                target.as_ptr(),
                fstype.as_ptr(),
                flags,
                options.as_ptr() as *const libc::c_void,
            )
        };
        if rc < 0 {
            return Err(Error::Mount(self.dev.clone()));
        }
        Ok(())
    }

    fn external_mount(&self, dir: &Path) -> Result<()> {
        let helper = format!("mount.{}", self.driver.mount_name());
        let status = Command::new(&helper)
            .arg(&self.dev)
            .arg(dir)
            .args(["-o", if self.read_only { "ro" } else { "rw" }])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|_| Error::Mount(self.dev.clone()))?;
        if !status.success() {
            return Err(Error::Mount(self.dev.clone()));
        }
        Ok(())
    }

    /// Detach-unmount and remove the scratch directory. Pre-mounted
    /// partitions belong to the user and are left alone.
    pub fn unmount(&mut self) -> Result<()> {
        let Some(dir) = self.mount_point.take() else {
            return Ok(());
        };
        if self.pre_mounted {
            self.pre_mounted = false;
            return Ok(());
        }

        unsafe { libc::sync() };
        let target = CString::new(dir.as_os_str().as_bytes())
            .map_err(|_| Error::Umount(dir.clone()))?;
        let rc = unsafe { libc::umount2(target.as_ptr(), libc::MNT_DETACH) };

        // Bookkeeping is cleared even on failure so a retry cannot
        // double-release.
        let _ = fs::remove_dir(&dir);
        self.table.remove(&dir);

        if rc < 0 {
            return Err(Error::Umount(dir));
        }
        Ok(())
    }

    /// Mount, run `op` on the mount root, unmount on every path.
    pub fn with_mount<T>(&mut self, op: impl FnOnce(&Path) -> Result<T>) -> Result<T> {
        let root = self.mount()?;
        let result = op(&root);
        let released = self.unmount();
        let value = result?;
        released?;
        Ok(value)
    }

    /// Used bytes of the filesystem, over a read-only scratch mount:
    /// `(blocks - free_blocks) × block_size`.
    pub fn used_bytes(&mut self) -> Result<u64> {
        self.read_only = true;
        let result = self.with_mount(|root| statvfs_used(root));
        self.read_only = false;
        result
    }

    /// Archive the partition contents into an exactly-sized spool.
    pub fn read_to_spool(&mut self) -> Result<(File, u64)> {
        self.with_mount(|root| archive::spool_tree(root))
    }

    /// Format, restore label and UUID, then materialize the archive.
    pub fn restore_from<R: Read>(&mut self, source: R, label: &str, uuid: &str) -> Result<()> {
        self.driver.format(&self.dev)?;
        self.driver.write_label(&self.dev, label)?;
        self.driver.write_uuid(&self.dev, uuid)?;
        self.with_mount(|root| archive::read_tree(source, root))
    }
}

impl Drop for Materializer<'_> {
    fn drop(&mut self) {
        let _ = self.unmount();
    }
}

fn statvfs_used(root: &Path) -> Result<u64> {
    let c_root = CString::new(root.as_os_str().as_bytes())
        .map_err(|_| Error::FileNotFound(root.to_path_buf()))?;
    let mut info: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_root.as_ptr(), &mut info) };
    if rc < 0 {
        return Err(Error::FileNotFound(root.to_path_buf()));
    }
    let used_blocks = info.f_blocks.saturating_sub(info.f_bfree);
    Ok(used_blocks as u64 * info.f_bsize as u64)
}
