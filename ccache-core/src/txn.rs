//! Crash-safe transaction protocol over `config`, `chunks`, `files` (§4.4).
//!
//! Two observable on-disk states: idle (no `txn.*` directory) and active
//! (`txn.active/` exists). `begin` snapshots the three files into
//! `txn.active/` before any of them are touched; `commit_rename` assumes
//! the caller already rewrote all three files in place and only performs
//! the final rename/cleanup; `rollback` restores the pre-transaction
//! snapshot from whichever marker directory is present.

use std::path::Path;

use anyhow::Error;

pub const CONFIG_FILE: &str = "config";
pub const CHUNKS_FILE: &str = "chunks";
pub const FILES_FILE: &str = "files";
const TXN_TMP: &str = "txn.tmp";
const TXN_ACTIVE: &str = "txn.active";

const TRACKED_FILES: [&str; 3] = [CONFIG_FILE, CHUNKS_FILE, FILES_FILE];

pub fn is_active(root: &Path) -> bool {
    root.join(TXN_ACTIVE).exists()
}

/// Snapshots `config`/`chunks`/`files` into `txn.active/`. Idempotent: a
/// no-op if a transaction is already active, since mutators call this on
/// demand before touching persistent state.
pub fn begin(root: &Path) -> Result<(), Error> {
    if is_active(root) {
        return Ok(());
    }

    let tmp = root.join(TXN_TMP);
    if tmp.exists() {
        std::fs::remove_dir_all(&tmp)?;
    }
    std::fs::create_dir(&tmp)?;
    for name in TRACKED_FILES {
        std::fs::copy(root.join(name), tmp.join(name))?;
    }
    std::fs::rename(&tmp, root.join(TXN_ACTIVE))?;
    Ok(())
}

/// The commit point: rename `txn.active` to `txn.tmp`, then remove it.
/// Callers must have already rewritten `config`/`chunks`/`files` in place
/// before calling this.
pub fn commit_rename(root: &Path) -> Result<(), Error> {
    let active = root.join(TXN_ACTIVE);
    let tmp = root.join(TXN_TMP);
    std::fs::rename(&active, &tmp)?;
    std::fs::remove_dir_all(&tmp)?;
    Ok(())
}

/// Restores the last committed snapshot. If `txn.tmp` exists (an
/// interrupted `begin`, or an interrupted commit tail after the rename
/// but before cleanup), it is simply removed: in the first case nothing
/// was touched yet, in the second the rename that mattered already
/// happened. If `txn.active` exists (interrupted mid-transaction), the
/// three tracked files are copied back from it before the same cleanup.
pub fn rollback(root: &Path) -> Result<(), Error> {
    let tmp = root.join(TXN_TMP);
    if tmp.exists() {
        std::fs::remove_dir_all(&tmp)?;
    }

    let active = root.join(TXN_ACTIVE);
    if active.exists() {
        for name in TRACKED_FILES {
            std::fs::copy(active.join(name), root.join(name))?;
        }
        std::fs::rename(&active, &tmp)?;
        if tmp.exists() {
            std::fs::remove_dir_all(&tmp)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(name: &str) -> std::path::PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("ccache-txn-test-{}-{}", std::process::id(), name));
        let _ = std::fs::remove_dir_all(&path);
        std::fs::create_dir_all(&path).unwrap();
        for file in TRACKED_FILES {
            std::fs::write(path.join(file), file.as_bytes()).unwrap();
        }
        path
    }

    #[test]
    fn test_begin_then_rollback_restores_snapshot() {
        let root = scratch_dir("begin-rollback");
        begin(&root).unwrap();
        assert!(is_active(&root));

        std::fs::write(root.join(CHUNKS_FILE), b"mutated").unwrap();
        rollback(&root).unwrap();

        assert!(!is_active(&root));
        assert_eq!(
            std::fs::read(root.join(CHUNKS_FILE)).unwrap(),
            CHUNKS_FILE.as_bytes()
        );

        std::fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn test_begin_is_idempotent() {
        let root = scratch_dir("idempotent");
        begin(&root).unwrap();
        std::fs::write(root.join(CHUNKS_FILE), b"mutated").unwrap();
        begin(&root).unwrap(); // must not re-snapshot over the mutation
        rollback(&root).unwrap();
        // rollback restores whatever txn.active held, which is the
        // pre-mutation snapshot from the first begin()
        assert_eq!(
            std::fs::read(root.join(CHUNKS_FILE)).unwrap(),
            CHUNKS_FILE.as_bytes()
        );
        std::fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn test_commit_rename_clears_active() {
        let root = scratch_dir("commit");
        begin(&root).unwrap();
        commit_rename(&root).unwrap();
        assert!(!is_active(&root));
        assert!(!root.join("txn.tmp").exists());
        std::fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn test_rollback_with_only_tmp_is_a_clean_noop() {
        let root = scratch_dir("tmp-only");
        std::fs::create_dir(root.join("txn.tmp")).unwrap();
        rollback(&root).unwrap();
        assert!(!root.join("txn.tmp").exists());
        assert!(!is_active(&root));
        std::fs::remove_dir_all(&root).unwrap();
    }
}
