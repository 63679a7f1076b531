//! FUSE wiring for the materializer. Requests are served strictly one at
//! a time: no `tokio::spawn` per request, since the materializer (and the
//! item cache scratch file beneath it) is not thread-safe and the client
//! is single-threaded and cooperative throughout.

use std::ffi::OsStr;
use std::mem;
use std::path::Path;

use anyhow::Error;
use futures::stream::TryStreamExt;

use proxmox_fuse::{EntryParam, Fuse, Request};

use ccache_types::{Key, Repository};

use crate::materializer::{Attr, Materializer};

fn attr_to_stat(inode: u64, attr: &Attr) -> libc::stat {
    let mut stat: libc::stat = unsafe { mem::zeroed() };
    stat.st_ino = inode;
    stat.st_mode = attr.mode;
    stat.st_nlink = attr.nlink as _;
    stat.st_uid = attr.uid;
    stat.st_gid = attr.gid;
    stat.st_rdev = attr.rdev as _;
    stat.st_size = attr.size as i64;
    stat.st_blksize = attr.blksize as _;
    stat.st_blocks = attr.blocks as i64;
    let secs = attr.mtime_ns.div_euclid(1_000_000_000);
    let nanos = attr.mtime_ns.rem_euclid(1_000_000_000);
    stat.st_atime = secs;
    stat.st_atime_nsec = nanos;
    stat.st_mtime = secs;
    stat.st_mtime_nsec = nanos;
    stat.st_ctime = secs;
    stat.st_ctime_nsec = nanos;
    stat
}

/// Runs the FUSE session for `materializer` until the mount is unmounted or
/// an unrecoverable error occurs.
pub async fn run<R: Repository, K: Key>(
    mut materializer: Materializer<R, K>,
    mountpoint: &Path,
    extra_options: &str,
) -> Result<(), Error> {
    let mut options = String::from("fsname=atticfs,ro");
    if !extra_options.is_empty() {
        options.push(',');
        options.push_str(extra_options);
    }

    let fuse = Fuse::builder("ccache-archivefs")?
        .options_os(OsStr::new(&options))?
        .enable_readdirplus()
        .enable_read()
        .enable_readlink()
        .build()?
        .mount(mountpoint)?;

    let mut session = fuse.fuse();

    while let Some(request) = session.try_next().await? {
        let result = handle(&mut materializer, request);
        if let Err(err) = result {
            log::warn!("fuse request failed: {}", err);
        }
    }

    Ok(())
}

fn handle<R: Repository, K: Key>(
    materializer: &mut Materializer<R, K>,
    request: Request,
) -> Result<(), Error> {
    match request {
        Request::Lookup(request) => match materializer.lookup(request.parent, &request.file_name)
        {
            Ok(inode) => match materializer.getattr(inode) {
                Ok(attr) => {
                    let stat = attr_to_stat(inode, &attr);
                    request.reply(&EntryParam::simple(inode, stat))?;
                    Ok(())
                }
                Err(_) => Ok(request.fail(libc::EIO)?),
            },
            Err(_) => Ok(request.fail(libc::ENOENT)?),
        },
        Request::Getattr(request) => match materializer.getattr(request.inode) {
            Ok(attr) => {
                let stat = attr_to_stat(request.inode, &attr);
                request.reply(&stat, f64::MAX)?;
                Ok(())
            }
            Err(_) => Ok(request.fail(libc::ENOENT)?),
        },
        Request::ReaddirPlus(mut request) => {
            match materializer.opendir(request.inode) {
                Ok(children) => {
                    let offset = request.offset as usize;
                    for (gen, (name, inode)) in children.into_iter().enumerate().skip(offset) {
                        let attr = match materializer.getattr(inode) {
                            Ok(attr) => attr,
                            Err(_) => continue,
                        };
                        let stat = attr_to_stat(inode, &attr);
                        if let proxmox_fuse::ReplyBufState::Full =
                            request.add_entry(OsStr::new(&name), &stat, (gen + 1) as i64, 1, f64::MAX, f64::MAX)?
                        {
                            break;
                        }
                    }
                    request.reply()?;
                    Ok(())
                }
                Err(_) => Ok(request.fail(libc::ENOENT)?),
            }
        }
        Request::Read(request) => {
            match materializer.read(request.inode, request.offset, request.size as u64) {
                Ok(data) => {
                    request.reply(&data)?;
                    Ok(())
                }
                Err(_) => Ok(request.fail(libc::EIO)?),
            }
        }
        Request::Readlink(request) => match materializer.readlink(request.inode) {
            Ok(target) => {
                request.reply(OsStr::new(&target))?;
                Ok(())
            }
            Err(_) => Ok(request.fail(libc::EINVAL)?),
        },
        Request::Forget(request) => {
            // The materializer never evicts inodes within a mount session
            // (§4.9): forget is acknowledged without bookkeeping.
            request.reply();
            Ok(())
        }
        other => Ok(other.fail(libc::ENOSYS)?),
    }
}
