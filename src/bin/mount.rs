//! Passthrough FUSE mount daemon: mirrors a backing root at a mount point
//! and drives the FS Event Adapter off release/unlink/rename, matching the
//! original `sha1fs.py`/`xmp.py` passthrough filesystem.
//!
//! Linux-only: `fuser` is only pulled in under `cfg(target_os = "linux")`
//! (see `Cargo.toml`), so non-Linux builds of this binary print an error
//! and exit instead of compiling a FUSE backend that doesn't exist there.

use csumfs::digest::Algorithm;
use getopts::Options;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;

fn main() -> ExitCode {
    let mut opts = Options::new();
    opts.reqopt("", "database", "Path to the checksum index database", "PATH");
    opts.optopt("o", "option", "Mount option, e.g. root=PATH (repeatable)", "OPT");
    opts.optflag("", "rescan", "Rescan the whole backing root at mount time");
    opts.optflag("", "use-md5", "Use MD5 instead of SHA-1 (only meaningful when creating a new database)");
    opts.optopt("", "log-file", "Log file path", "PATH");
    opts.optflag("h", "help", "This help text");
    opts.optmulti("", "mount-option", "Mount option, e.g. root=PATH (repeatable)", "OPT");

    let mut args = env::args();
    let program = args.next().unwrap_or_else(|| env!("CARGO_PKG_NAME").to_owned());

    let matches = match opts.parse(args) {
        Ok(m) => m,
        Err(e) => return usage_error(&opts, &program, &e.to_string()),
    };

    if matches.opt_present("help") {
        print_usage(&opts, &program);
        return ExitCode::SUCCESS;
    }

    let database = match matches.opt_str("database") {
        Some(d) => PathBuf::from(d),
        None => return usage_error(&opts, &program, "--database PATH is required"),
    };

    let mut root = PathBuf::from("/");
    for opt in matches.opt_strs("mount-option").iter().chain(matches.opt_strs("option").iter()) {
        if let Some(value) = opt.strip_prefix("root=") {
            root = PathBuf::from(value);
        }
    }

    if matches.free.is_empty() {
        return usage_error(&opts, &program, "a mount point is required");
    }
    let mountpoint = PathBuf::from(&matches.free[0]);

    let log_file = matches.opt_str("log-file").unwrap_or_else(|| "LOG".to_string());
    init_logging(&log_file);

    let algorithm = if matches.opt_present("use-md5") { Algorithm::Md5 } else { Algorithm::Sha1 };
    let rescan = matches.opt_present("rescan");

    match run(database, root, mountpoint, algorithm, rescan) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        },
    }
}

fn usage_error(opts: &Options, program: &str, message: &str) -> ExitCode {
    eprintln!("Error: {message}");
    print_usage(opts, program);
    ExitCode::from(2)
}

fn print_usage(opts: &Options, program: &str) {
    println!("{}", opts.usage(&format!("Usage: {program} --database PATH [-o root=PATH] [--rescan] [--use-md5] MOUNTPOINT")));
}

fn init_logging(log_file: &str) {
    if let Ok(file) = std::fs::OpenOptions::new().create(true).append(true).open(log_file) {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Info)
            .target(env_logger::Target::Pipe(Box::new(file)))
            .init();
    } else {
        env_logger::Builder::from_default_env().filter_level(log::LevelFilter::Info).init();
    }
}

#[cfg(target_os = "linux")]
fn run(database: PathBuf, root: PathBuf, mountpoint: PathBuf, algorithm: Algorithm, rescan: bool) -> anyhow::Result<()> {
    use csumfs::adapter::FsEventAdapter;
    use csumfs::dedup::DedupEngine;
    use csumfs::index::ChecksumIndex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    if !root.is_dir() {
        anyhow::bail!("root {} is not a directory", root.display());
    }
    if !mountpoint.is_dir() {
        anyhow::bail!("mount point {} is not a directory", mountpoint.display());
    }

    let index = ChecksumIndex::open(&database, algorithm)?;
    let mut engine = DedupEngine::new(index);
    if rescan {
        log::info!("rescanning {}", root.display());
        engine.update_all(&root)?;
    }
    let adapter = FsEventAdapter::new(engine, root.clone());

    let unmounted = Arc::new(AtomicBool::new(false));
    let session_mountpoint = mountpoint.clone();
    {
        let unmounted = unmounted.clone();
        ctrlc::set_handler(move || {
            if !unmounted.swap(true, Ordering::SeqCst) {
                log::info!("signal received, unmounting {}", session_mountpoint.display());
                let _ = std::process::Command::new("fusermount").arg("-u").arg(&session_mountpoint).status();
            }
        })?;
    }

    let options = vec![fuser::MountOption::FSName("csumfs".to_string()), fuser::MountOption::DefaultPermissions];
    log::info!("mounting {} at {} (backing root {})", database.display(), mountpoint.display(), root.display());
    fuser::mount2(passthrough::PassthroughFs::new(root, adapter), &mountpoint, &options)?;
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn run(_database: PathBuf, _root: PathBuf, _mountpoint: PathBuf, _algorithm: Algorithm, _rescan: bool) -> anyhow::Result<()> {
    anyhow::bail!("FUSE passthrough mounting is only supported on Linux (current target does not provide fuser)")
}

#[cfg(target_os = "linux")]
mod passthrough {
    use csumfs::adapter::FsEventAdapter;
    use fuser::{FileAttr, FileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyWrite, Request};
    use libc::{c_int, ENOENT, EIO};
    use std::collections::HashMap;
    use std::ffi::OsStr;
    use std::fs::{self, File, OpenOptions};
    use std::os::unix::fs::{FileExt, MetadataExt, PermissionsExt};
    use std::os::unix::ffi::OsStrExt;
    use std::path::{Path, PathBuf};
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    const TTL: Duration = Duration::from_secs(1);
    const ROOT_INO: u64 = 1;

    struct Handle {
        file: File,
    }

    /// Mirrors `backing_root` at the mount point. Inode numbers are our own
    /// (the backing filesystem's real inode numbers aren't stable across a
    /// session the way FUSE wants), assigned the first time a path is seen
    /// via `lookup` or `readdir` and kept for the life of the mount --
    /// mirroring how the original Python passthrough layer used an
    /// in-memory path table rather than the kernel's own inode cache.
    pub struct PassthroughFs {
        backing_root: PathBuf,
        adapter: FsEventAdapter,
        paths: HashMap<u64, PathBuf>,
        inodes: HashMap<PathBuf, u64>,
        next_ino: u64,
        handles: HashMap<u64, Handle>,
        next_fh: u64,
    }

    impl PassthroughFs {
        pub fn new(backing_root: PathBuf, adapter: FsEventAdapter) -> Self {
            let mut paths = HashMap::new();
            let mut inodes = HashMap::new();
            paths.insert(ROOT_INO, PathBuf::new());
            inodes.insert(PathBuf::new(), ROOT_INO);
            PassthroughFs { backing_root, adapter, paths, inodes, next_ino: 2, handles: HashMap::new(), next_fh: 1 }
        }

        fn full_path(&self, relative: &Path) -> PathBuf {
            if relative.as_os_str().is_empty() {
                self.backing_root.clone()
            } else {
                self.backing_root.join(relative)
            }
        }

        fn ino_for(&mut self, relative: PathBuf) -> u64 {
            if let Some(&ino) = self.inodes.get(&relative) {
                return ino;
            }
            let ino = self.next_ino;
            self.next_ino += 1;
            self.inodes.insert(relative.clone(), ino);
            self.paths.insert(ino, relative);
            ino
        }

        fn relative_for(&self, ino: u64) -> Option<PathBuf> {
            self.paths.get(&ino).cloned()
        }

        fn rebind(&mut self, old: &Path, new: PathBuf) {
            if let Some(ino) = self.inodes.remove(old) {
                self.paths.insert(ino, new.clone());
                self.inodes.insert(new, ino);
            }
            let stale: Vec<PathBuf> = self.inodes.keys().filter(|p| p.starts_with(old) && p.as_path() != old).cloned().collect();
            for path in stale {
                if let Some(ino) = self.inodes.remove(&path) {
                    let suffix = path.strip_prefix(old).unwrap();
                    let rebased = new.join(suffix);
                    self.paths.insert(ino, rebased.clone());
                    self.inodes.insert(rebased, ino);
                }
            }
        }

        fn forget_path(&mut self, relative: &Path) {
            if let Some(ino) = self.inodes.remove(relative) {
                self.paths.remove(&ino);
            }
        }

        fn attr(ino: u64, meta: &fs::Metadata) -> FileAttr {
            let kind = if meta.file_type().is_dir() {
                FileType::Directory
            } else if meta.file_type().is_symlink() {
                FileType::Symlink
            } else {
                FileType::RegularFile
            };
            FileAttr {
                ino,
                size: meta.size(),
                blocks: meta.blocks(),
                atime: UNIX_EPOCH + Duration::from_secs(meta.atime().max(0) as u64),
                mtime: UNIX_EPOCH + Duration::from_secs(meta.mtime().max(0) as u64),
                ctime: UNIX_EPOCH + Duration::from_secs(meta.ctime().max(0) as u64),
                crtime: SystemTime::UNIX_EPOCH,
                kind,
                perm: (meta.mode() & 0o7777) as u16,
                nlink: meta.nlink() as u32,
                uid: meta.uid(),
                gid: meta.gid(),
                rdev: meta.rdev() as u32,
                blksize: meta.blksize() as u32,
                flags: 0,
            }
        }
    }

    impl Filesystem for PassthroughFs {
        fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
            let Some(parent_rel) = self.relative_for(parent) else {
                reply.error(ENOENT);
                return;
            };
            let child_rel = parent_rel.join(name);
            let full = self.full_path(&child_rel);
            match fs::symlink_metadata(&full) {
                Ok(meta) => {
                    let ino = self.ino_for(child_rel);
                    reply.entry(&TTL, &Self::attr(ino, &meta), 0);
                },
                Err(_) => reply.error(ENOENT),
            }
        }

        fn getattr(&mut self, _req: &Request, ino: u64, reply: ReplyAttr) {
            let Some(rel) = self.relative_for(ino) else {
                reply.error(ENOENT);
                return;
            };
            match fs::symlink_metadata(self.full_path(&rel)) {
                Ok(meta) => reply.attr(&TTL, &Self::attr(ino, &meta)),
                Err(_) => reply.error(ENOENT),
            }
        }

        fn setattr(
            &mut self,
            _req: &Request,
            ino: u64,
            mode: Option<u32>,
            uid: Option<u32>,
            gid: Option<u32>,
            size: Option<u64>,
            _atime: Option<fuser::TimeOrNow>,
            _mtime: Option<fuser::TimeOrNow>,
            _ctime: Option<SystemTime>,
            _fh: Option<u64>,
            _crtime: Option<SystemTime>,
            _chgtime: Option<SystemTime>,
            _bkuptime: Option<SystemTime>,
            _flags: Option<u32>,
            reply: ReplyAttr,
        ) {
            let Some(rel) = self.relative_for(ino) else {
                reply.error(ENOENT);
                return;
            };
            let full = self.full_path(&rel);

            if let Some(mode) = mode {
                if let Err(e) = fs::set_permissions(&full, fs::Permissions::from_mode(mode)) {
                    reply.error(e.raw_os_error().unwrap_or(EIO));
                    return;
                }
            }
            if uid.is_some() || gid.is_some() {
                let c_path = match std::ffi::CString::new(full.as_os_str().as_bytes()) {
                    Ok(c) => c,
                    Err(_) => {
                        reply.error(EIO);
                        return;
                    },
                };
                let rc = unsafe {
                    libc::chown(c_path.as_ptr(), uid.map(|v| v as libc::uid_t).unwrap_or(u32::MAX as libc::uid_t), gid.map(|v| v as libc::gid_t).unwrap_or(u32::MAX as libc::gid_t))
                };
                if rc != 0 {
                    reply.error(std::io::Error::last_os_error().raw_os_error().unwrap_or(EIO));
                    return;
                }
            }
            if let Some(size) = size {
                if let Err(e) = std::fs::OpenOptions::new().write(true).open(&full).and_then(|f| f.set_len(size)) {
                    reply.error(e.raw_os_error().unwrap_or(EIO));
                    return;
                }
                self.adapter.after_release(&full);
            }

            match fs::symlink_metadata(&full) {
                Ok(meta) => reply.attr(&TTL, &Self::attr(ino, &meta)),
                Err(e) => reply.error(e.raw_os_error().unwrap_or(EIO)),
            }
        }

        fn readlink(&mut self, _req: &Request, ino: u64, reply: ReplyData) {
            let Some(rel) = self.relative_for(ino) else {
                reply.error(ENOENT);
                return;
            };
            match fs::read_link(self.full_path(&rel)) {
                Ok(target) => reply.data(target.as_os_str().as_bytes()),
                Err(e) => reply.error(e.raw_os_error().unwrap_or(EIO)),
            }
        }

        fn mkdir(&mut self, _req: &Request, parent: u64, name: &OsStr, mode: u32, _umask: u32, reply: ReplyEntry) {
            let Some(parent_rel) = self.relative_for(parent) else {
                reply.error(ENOENT);
                return;
            };
            let child_rel = parent_rel.join(name);
            let full = self.full_path(&child_rel);
            if let Err(e) = fs::create_dir(&full) {
                reply.error(e.raw_os_error().unwrap_or(EIO));
                return;
            }
            let _ = fs::set_permissions(&full, fs::Permissions::from_mode(mode));
            match fs::symlink_metadata(&full) {
                Ok(meta) => {
                    let ino = self.ino_for(child_rel);
                    reply.entry(&TTL, &Self::attr(ino, &meta), 0);
                },
                Err(e) => reply.error(e.raw_os_error().unwrap_or(EIO)),
            }
        }

        fn rmdir(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
            let Some(parent_rel) = self.relative_for(parent) else {
                reply.error(ENOENT);
                return;
            };
            let child_rel = parent_rel.join(name);
            match fs::remove_dir(self.full_path(&child_rel)) {
                Ok(()) => {
                    self.forget_path(&child_rel);
                    reply.ok();
                },
                Err(e) => reply.error(e.raw_os_error().unwrap_or(EIO)),
            }
        }

        fn unlink(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
            let Some(parent_rel) = self.relative_for(parent) else {
                reply.error(ENOENT);
                return;
            };
            let child_rel = parent_rel.join(name);
            let full = self.full_path(&child_rel);
            match fs::remove_file(&full) {
                Ok(()) => {
                    if let Err(e) = self.adapter.after_unlink(&full) {
                        log::error!("after_unlink({}) failed: {e}", full.display());
                    }
                    self.forget_path(&child_rel);
                    reply.ok();
                },
                Err(e) => reply.error(e.raw_os_error().unwrap_or(EIO)),
            }
        }

        fn rename(&mut self, _req: &Request, parent: u64, name: &OsStr, newparent: u64, newname: &OsStr, _flags: u32, reply: ReplyEmpty) {
            let (Some(parent_rel), Some(newparent_rel)) = (self.relative_for(parent), self.relative_for(newparent)) else {
                reply.error(ENOENT);
                return;
            };
            let old_rel = parent_rel.join(name);
            let new_rel = newparent_rel.join(newname);
            let old_full = self.full_path(&old_rel);
            let new_full = self.full_path(&new_rel);
            match fs::rename(&old_full, &new_full) {
                Ok(()) => {
                    if let Err(e) = self.adapter.after_rename(&old_full, &new_full) {
                        log::error!("after_rename({} -> {}) failed: {e}", old_full.display(), new_full.display());
                    }
                    self.rebind(&old_rel, new_rel);
                    reply.ok();
                },
                Err(e) => reply.error(e.raw_os_error().unwrap_or(EIO)),
            }
        }

        fn symlink(&mut self, _req: &Request, parent: u64, link_name: &OsStr, target: &Path, reply: ReplyEntry) {
            let Some(parent_rel) = self.relative_for(parent) else {
                reply.error(ENOENT);
                return;
            };
            let child_rel = parent_rel.join(link_name);
            let full = self.full_path(&child_rel);
            if let Err(e) = std::os::unix::fs::symlink(target, &full) {
                reply.error(e.raw_os_error().unwrap_or(EIO));
                return;
            }
            match fs::symlink_metadata(&full) {
                Ok(meta) => {
                    let ino = self.ino_for(child_rel);
                    reply.entry(&TTL, &Self::attr(ino, &meta), 0);
                },
                Err(e) => reply.error(e.raw_os_error().unwrap_or(EIO)),
            }
        }

        fn link(&mut self, _req: &Request, ino: u64, newparent: u64, newname: &OsStr, reply: ReplyEntry) {
            let (Some(rel), Some(newparent_rel)) = (self.relative_for(ino), self.relative_for(newparent)) else {
                reply.error(ENOENT);
                return;
            };
            let full = self.full_path(&rel);
            let new_rel = newparent_rel.join(newname);
            let new_full = self.full_path(&new_rel);
            if let Err(e) = fs::hard_link(&full, &new_full) {
                reply.error(e.raw_os_error().unwrap_or(EIO));
                return;
            }
            match fs::symlink_metadata(&new_full) {
                Ok(meta) => {
                    let new_ino = self.ino_for(new_rel);
                    reply.entry(&TTL, &Self::attr(new_ino, &meta), 0);
                },
                Err(e) => reply.error(e.raw_os_error().unwrap_or(EIO)),
            }
        }

        fn create(&mut self, _req: &Request, parent: u64, name: &OsStr, mode: u32, _umask: u32, flags: i32, reply: ReplyCreate) {
            let Some(parent_rel) = self.relative_for(parent) else {
                reply.error(ENOENT);
                return;
            };
            let child_rel = parent_rel.join(name);
            let full = self.full_path(&child_rel);
            let mut options = OpenOptions::new();
            options.read(true).write(true).create(true).truncate(flags & libc::O_TRUNC != 0);
            match options.open(&full) {
                Ok(file) => {
                    let _ = fs::set_permissions(&full, fs::Permissions::from_mode(mode));
                    let ino = self.ino_for(child_rel);
                    let fh = self.next_fh;
                    self.next_fh += 1;
                    self.handles.insert(fh, Handle { file });
                    match fs::symlink_metadata(&full) {
                        Ok(meta) => reply.created(&TTL, &Self::attr(ino, &meta), 0, fh, 0),
                        Err(e) => reply.error(e.raw_os_error().unwrap_or(EIO)),
                    }
                },
                Err(e) => reply.error(e.raw_os_error().unwrap_or(EIO)),
            }
        }

        fn open(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
            let Some(rel) = self.relative_for(ino) else {
                reply.error(ENOENT);
                return;
            };
            let full = self.full_path(&rel);
            let mut options = OpenOptions::new();
            let access_mode = flags & libc::O_ACCMODE;
            options.read(access_mode == libc::O_RDONLY || access_mode == libc::O_RDWR);
            options.write(access_mode == libc::O_WRONLY || access_mode == libc::O_RDWR);
            match options.open(&full) {
                Ok(file) => {
                    let fh = self.next_fh;
                    self.next_fh += 1;
                    self.handles.insert(fh, Handle { file });
                    reply.opened(fh, 0);
                },
                Err(e) => reply.error(e.raw_os_error().unwrap_or(EIO)),
            }
        }

        fn read(&mut self, _req: &Request, _ino: u64, fh: u64, offset: i64, size: u32, _flags: c_int, _lock_owner: Option<u64>, reply: ReplyData) {
            let Some(handle) = self.handles.get(&fh) else {
                reply.error(libc::EBADF);
                return;
            };
            let mut buf = vec![0u8; size as usize];
            match handle.file.read_at(&mut buf, offset as u64) {
                Ok(n) => reply.data(&buf[..n]),
                Err(e) => reply.error(e.raw_os_error().unwrap_or(EIO)),
            }
        }

        fn write(&mut self, _req: &Request, _ino: u64, fh: u64, offset: i64, data: &[u8], _write_flags: u32, _flags: i32, _lock_owner: Option<u64>, reply: ReplyWrite) {
            let Some(handle) = self.handles.get(&fh) else {
                reply.error(libc::EBADF);
                return;
            };
            match handle.file.write_at(data, offset as u64) {
                Ok(n) => reply.written(n as u32),
                Err(e) => reply.error(e.raw_os_error().unwrap_or(EIO)),
            }
        }

        fn flush(&mut self, _req: &Request, _ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
            reply.ok();
        }

        fn release(&mut self, _req: &Request, ino: u64, fh: u64, _flags: i32, _lock_owner: Option<u64>, _flush: bool, reply: ReplyEmpty) {
            self.handles.remove(&fh);
            if let Some(rel) = self.relative_for(ino) {
                let full = self.full_path(&rel);
                if !full.is_dir() {
                    self.adapter.after_release(&full);
                }
            }
            reply.ok();
        }

        fn opendir(&mut self, _req: &Request, _ino: u64, _flags: i32, reply: ReplyOpen) {
            reply.opened(0, 0);
        }

        fn readdir(&mut self, _req: &Request, ino: u64, _fh: u64, offset: i64, mut reply: ReplyDirectory) {
            let Some(rel) = self.relative_for(ino) else {
                reply.error(ENOENT);
                return;
            };
            let full = self.full_path(&rel);
            let mut entries: Vec<(u64, FileType, String)> = vec![(ino, FileType::Directory, ".".to_string()), (ROOT_INO, FileType::Directory, "..".to_string())];

            let read_dir = match fs::read_dir(&full) {
                Ok(rd) => rd,
                Err(e) => {
                    reply.error(e.raw_os_error().unwrap_or(EIO));
                    return;
                },
            };
            for entry in read_dir.flatten() {
                let name = entry.file_name();
                let child_rel = rel.join(&name);
                let Ok(meta) = entry.metadata() else { continue };
                let kind = if meta.is_dir() { FileType::Directory } else if meta.file_type().is_symlink() { FileType::Symlink } else { FileType::RegularFile };
                let child_ino = self.ino_for(child_rel);
                entries.push((child_ino, kind, name.to_string_lossy().into_owned()));
            }

            for (i, (entry_ino, kind, name)) in entries.into_iter().enumerate().skip(offset as usize) {
                if reply.add(entry_ino, (i + 1) as i64, kind, name) {
                    break;
                }
            }
            reply.ok();
        }

        fn releasedir(&mut self, _req: &Request, _ino: u64, _fh: u64, _flags: i32, reply: ReplyEmpty) {
            reply.ok();
        }
    }
}
