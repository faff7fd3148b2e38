use ahash::AHashMap as HashMap;
use fs2::FileExt;
use log::{debug, warn};
use parking_lot::{Mutex, MutexGuard};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use crate::errors::{CollageError, Result};
use crate::source_map::is_plain_file_name;
use crate::types::TxnId;

/// An exclusive lock on one source file, owned by one transaction.
struct HeldLock {
    owner: TxnId,
    /// The open handle carries the OS-level lock; dropping it unlocks.
    file: File,
}

/// The participant's file lock table.
///
/// All checks and changes go through [`LockTable::lock`], which serializes
/// them behind one mutex so that "every file exists, none is locked, lock
/// them all" is atomic across concurrent prepares.
pub struct LockTable {
    root: PathBuf,
    held: Mutex<HashMap<String, HeldLock>>,
}

impl LockTable {
    /// Creates a table for file names relative to `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            held: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Enters the table's critical section.
    pub fn lock(&self) -> LockSet<'_> {
        LockSet {
            root: &self.root,
            held: self.held.lock(),
        }
    }
}

/// Exclusive access to a [`LockTable`].
pub struct LockSet<'a> {
    root: &'a Path,
    held: MutexGuard<'a, HashMap<String, HeldLock>>,
}

impl LockSet<'_> {
    /// Resolves `file` inside the table's root.
    ///
    /// # Errors
    ///
    /// Returns [`CollageError::InvalidSource`] for a name that is not a
    /// plain file name and so could reach outside the root.
    pub fn path_of(&self, file: &str) -> Result<PathBuf> {
        if !is_plain_file_name(file) {
            return Err(CollageError::InvalidSource(format!(
                "{file:?} is not a file of {}",
                self.root.display()
            )));
        }
        Ok(self.root.join(file))
    }

    /// Whether every file is a valid name and exists as a regular file.
    pub fn all_present(&self, files: &[String]) -> bool {
        files
            .iter()
            .all(|file| self.path_of(file).is_ok_and(|path| path.is_file()))
    }

    /// The transaction holding `file`, if any.
    pub fn holder(&self, file: &str) -> Option<&TxnId> {
        self.held.get(file).map(|lock| &lock.owner)
    }

    /// Whether no file is held by a transaction other than `owner`.
    pub fn is_free_for(&self, owner: &TxnId, files: &[String]) -> bool {
        files
            .iter()
            .all(|file| self.holder(file).is_none_or(|holder| holder == owner))
    }

    /// Locks every file for `owner`. Files `owner` already holds are kept.
    ///
    /// All or nothing: if one file cannot be locked, the locks taken by this
    /// call are released again.
    ///
    /// # Errors
    ///
    /// Returns [`CollageError::Lock`] if a file is held by another
    /// transaction, cannot be opened or is locked by another process.
    pub fn acquire(&mut self, owner: &TxnId, files: &[String]) -> Result<()> {
        let mut taken: Vec<String> = Vec::with_capacity(files.len());
        for name in files {
            if let Some(holder) = self.holder(name) {
                if holder == owner {
                    continue;
                }
                let reason = format!("held by transaction {holder}");
                self.release(owner, &taken);
                return Err(CollageError::Lock {
                    file: name.clone(),
                    reason,
                });
            }
            let locked = self.path_of(name).and_then(|path| {
                lock_file(&path).map_err(|reason| CollageError::Lock {
                    file: name.clone(),
                    reason,
                })
            });
            match locked {
                Ok(file) => {
                    self.held.insert(
                        name.clone(),
                        HeldLock {
                            owner: owner.clone(),
                            file,
                        },
                    );
                    taken.push(name.clone());
                }
                Err(e) => {
                    self.release(owner, &taken);
                    return Err(e);
                }
            }
        }
        debug!("Transaction {} locked {:?}", owner, files);
        Ok(())
    }

    /// Releases the files among `files` that `owner` holds. Returns how many
    /// were released.
    pub fn release(&mut self, owner: &TxnId, files: &[String]) -> usize {
        let mut released = 0;
        for name in files {
            if self.holder(name) != Some(owner) {
                continue;
            }
            if let Some(lock) = self.held.remove(name) {
                if let Err(e) = FileExt::unlock(&lock.file) {
                    // Closing the handle below drops the lock anyway.
                    warn!("Failed to unlock {}: {}", name, e);
                }
                released += 1;
            }
        }
        if released > 0 {
            debug!("Transaction {} released {} lock(s)", owner, released);
        }
        released
    }

    /// Number of files currently locked.
    pub fn len(&self) -> usize {
        self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }
}

fn lock_file(path: &Path) -> std::result::Result<File, String> {
    let file = OpenOptions::new()
        .read(true)
        .open(path)
        .map_err(|e| format!("cannot open: {e}"))?;
    file.try_lock_exclusive()
        .map_err(|e| format!("cannot lock: {e}"))?;
    Ok(file)
}
