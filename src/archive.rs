//! Filesystem-tree archive streaming
//!
//! The payload of every data-carrying partition is one tar (ustar/PAX)
//! stream: entries in lexicographic full-path order, symlinks stored by
//! target, hardlinks collapsed by (device, inode) identity, xattrs as
//! PAX extension records. The writer spools to an anonymous temp file
//! when the exact byte count is needed up front for the size prefix.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use filetime::FileTime;
use tar::{Archive, Builder, EntryType, Header, HeaderMode};
use walkdir::WalkDir;

use crate::error::{Error, Result};

/// Write wrapper that counts bytes pushed through it.
struct CountingWriter<W: Write> {
    inner: W,
    written: u64,
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Walks `root` in deterministic lexicographic order and emits the
/// archive to `sink`. Returns the number of archive bytes written.
pub fn write_tree<W: Write>(sink: W, root: &Path) -> Result<u64> {
    let mut counting = CountingWriter {
        inner: sink,
        written: 0,
    };
    {
        let mut builder = Builder::new(&mut counting);
        builder.follow_symlinks(false);
        builder.mode(HeaderMode::Complete);

        // First path seen for each (device, inode); later occurrences
        // become hardlink entries.
        let mut seen_inodes: HashMap<(u64, u64), PathBuf> = HashMap::new();

        for entry in WalkDir::new(root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if entry.depth() == 0 {
                continue;
            }
            let path = entry.path();
            let rel = path.strip_prefix(root).unwrap_or(path).to_path_buf();

            let meta = match entry.metadata() {
                Ok(m) => m,
                Err(_) => continue, // vanished mid-walk
            };

            if meta.is_file() && meta.nlink() > 1 {
                let key = (meta.dev(), meta.ino());
                if let Some(first) = seen_inodes.get(&key) {
                    append_hardlink(&mut builder, &meta, &rel, first)
                        .map_err(|e| Error::ReadData(e.to_string()))?;
                    continue;
                }
                seen_inodes.insert(key, rel.clone());
            }

            if meta.is_file() || meta.is_dir() {
                let xattrs = xattrs_of(path);
                if !xattrs.is_empty() {
                    // One PAX block per entry; it applies to the next
                    // appended header.
                    builder
                        .append_pax_extensions(
                            xattrs.iter().map(|(k, v)| (k.as_str(), v.as_slice())),
                        )
                        .map_err(|e| Error::ReadData(e.to_string()))?;
                }
            }

            builder
                .append_path_with_name(path, &rel)
                .map_err(|e| Error::ReadData(e.to_string()))?;
        }

        builder
            .finish()
            .map_err(|e| Error::WriteData(e.to_string()))?;
    }
    counting
        .flush()
        .map_err(|e| Error::WriteData(e.to_string()))?;
    Ok(counting.written)
}

fn append_hardlink<W: Write>(
    builder: &mut Builder<W>,
    meta: &std::fs::Metadata,
    rel: &Path,
    target: &Path,
) -> io::Result<()> {
    let mut header = Header::new_gnu();
    header.set_metadata_in_mode(meta, HeaderMode::Complete);
    header.set_entry_type(EntryType::Link);
    header.set_size(0);
    builder.append_link(&mut header, rel, target)
}

/// Materializes an archive under `root`. Fails with `InvalidImage` on
/// truncation, corrupt headers, unknown record kinds, or entries that
/// try to escape `root`.
pub fn read_tree<R: Read>(source: R, root: &Path) -> Result<()> {
    let mut archive = Archive::new(source);
    archive.set_preserve_permissions(true);
    archive.set_preserve_mtime(true);
    archive.set_unpack_xattrs(true);

    // Directory mtimes are restored after all content lands, deepest
    // path first, so child writes cannot clobber them.
    let mut dir_times: Vec<(PathBuf, FileTime)> = Vec::new();

    let entries = archive
        .entries()
        .map_err(|_| Error::InvalidImage("unreadable archive stream"))?;
    for entry in entries {
        let mut entry = entry.map_err(|_| Error::InvalidImage("truncated or corrupt archive"))?;
        match entry.header().entry_type() {
            EntryType::Regular
            | EntryType::Directory
            | EntryType::Symlink
            | EntryType::Link
            | EntryType::XHeader
            | EntryType::XGlobalHeader
            | EntryType::GNULongName
            | EntryType::GNULongLink => {}
            _ => return Err(Error::InvalidImage("unknown record kind")),
        }

        if entry.header().entry_type() == EntryType::Directory {
            if let (Ok(path), Ok(mtime)) = (entry.path(), entry.header().mtime()) {
                dir_times.push((root.join(path), FileTime::from_unix_time(mtime as i64, 0)));
            }
        }

        let unpacked = entry
            .unpack_in(root)
            .map_err(|_| Error::InvalidImage("truncated or corrupt archive"))?;
        if !unpacked {
            return Err(Error::InvalidImage("archive entry escapes the target root"));
        }
    }

    dir_times.sort_by(|a, b| b.0.cmp(&a.0));
    for (dir, mtime) in dir_times {
        let _ = filetime::set_file_mtime(&dir, mtime);
    }

    Ok(())
}

/// Archives `root` into an anonymous temp file and rewinds it, so the
/// caller knows the exact byte count before any wire byte is sent.
pub fn spool_tree(root: &Path) -> Result<(File, u64)> {
    let mut spool = tempfile::tempfile().map_err(|e| Error::WriteData(e.to_string()))?;
    let len = write_tree(&mut spool, root)?;
    spool
        .seek(SeekFrom::Start(0))
        .map_err(|e| Error::ReadData(e.to_string()))?;
    Ok((spool, len))
}

/// Extended attributes of a path, as PAX record keys. Unreadable
/// attributes are skipped; xattrs are carried best-effort.
fn xattrs_of(path: &Path) -> Vec<(String, Vec<u8>)> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let mut out = Vec::new();
    let c_path = match CString::new(path.as_os_str().as_bytes()) {
        Ok(p) => p,
        Err(_) => return out,
    };

    let list_len = unsafe { libc::listxattr(c_path.as_ptr(), std::ptr::null_mut(), 0) };
    if list_len <= 0 {
        return out;
    }
    let mut names = vec![0u8; list_len as usize];
    let list_len = unsafe {
        libc::listxattr(
            c_path.as_ptr(),
            names.as_mut_ptr() as *mut libc::c_char,
            names.len(),
        )
    };
    if list_len <= 0 {
        return out;
    }
    names.truncate(list_len as usize);

    for name in names.split(|&b| b == 0).filter(|s| !s.is_empty()) {
        let c_name = match CString::new(name) {
            Ok(n) => n,
            Err(_) => continue,
        };
        let val_len =
            unsafe { libc::getxattr(c_path.as_ptr(), c_name.as_ptr(), std::ptr::null_mut(), 0) };
        if val_len < 0 {
            continue;
        }
        let mut value = vec![0u8; val_len as usize];
        let val_len = unsafe {
            libc::getxattr(
                c_path.as_ptr(),
                c_name.as_ptr(),
                value.as_mut_ptr() as *mut libc::c_void,
                value.len(),
            )
        };
        if val_len < 0 {
            continue;
        }
        value.truncate(val_len as usize);
        let key = format!("SCHILY.xattr.{}", String::from_utf8_lossy(name));
        out.push((key, value));
    }
    out
}
