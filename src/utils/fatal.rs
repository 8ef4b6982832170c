//! Small file-system helpers that log and turn I/O errors into [`Failed`].
//!
//! Pretty much all of the object store and rsync collector touch the file
//! system, and that can go wrong in all kinds of ways at any time. Rather
//! than thread a detailed error type through all of that, we log the
//! concrete reason right where it happens and hand back our generic
//! [`Failed`][crate::error::Failed]. This module collects the handful of
//! operations that come up often enough to be worth a helper.

use std::{fs, io};
use std::path::Path;
use log::error;
use crate::error::Failed;


/// Creates a directory and all its parents, logging on failure.
pub fn create_dir_all(path: &Path) -> Result<(), Failed> {
    fs::create_dir_all(path).map_err(|err| {
        error!(
            "Failed to create directory {}: {}", path.display(), err
        );
        Failed
    })
}

/// Reads a file fully into memory, logging on failure.
///
/// Returns `Ok(None)` if the file does not exist; that is not logged since
/// callers routinely probe for optional files.
pub fn read_file(path: &Path) -> Result<Option<Vec<u8>>, Failed> {
    match fs::read(path) {
        Ok(data) => Ok(Some(data)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => {
            error!("Failed to read file {}: {}", path.display(), err);
            Err(Failed)
        }
    }
}

/// Removes a directory tree, logging on failure.
///
/// A missing directory is not an error.
pub fn remove_dir_all(path: &Path) -> Result<(), Failed> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => {
            error!(
                "Failed to remove directory {}: {}", path.display(), err
            );
            Err(Failed)
        }
    }
}
