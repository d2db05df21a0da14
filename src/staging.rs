use std::fs::{self, DirBuilder, Permissions};
use std::io;
use std::os::unix::fs::{DirBuilderExt, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::Builder;
use tracing::{error, info, warn};

use crate::collection::FileCollection;
use crate::error::ShareError;

/// Group-writable with the sticky bit: members of the group may add files but
/// only a file's owner (or the service) may remove it.
pub const DIR_MODE: u32 = 0o1775;

/// Materializes file collections under the staging root as hard links.
#[derive(Debug, Clone)]
pub struct Stager {
    root: Utf8PathBuf,
    service_uid: u32,
}

impl Stager {
    /// Without an explicit `service_uid` the owner of `root` is taken as the
    /// service account.
    pub fn new(root: &Utf8Path, service_uid: Option<u32>) -> Result<Self, ShareError> {
        let service_uid = match service_uid {
            Some(uid) => uid,
            None => fs::metadata(root.as_std_path())
                .map_err(|err| ShareError::Filesystem(format!("staging root {root}: {err}")))?
                .uid(),
        };
        Ok(Self {
            root: root.to_path_buf(),
            service_uid,
        })
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn service_uid(&self) -> u32 {
        self.service_uid
    }

    pub fn target_dir(&self, dir_path: &Utf8Path) -> Utf8PathBuf {
        self.root.join(dir_path)
    }

    /// Stages `collection`; failures are logged and reported as `false` so the
    /// caller can leave its records untouched.
    pub fn stage(&self, collection: &FileCollection) -> bool {
        match self.try_stage(collection) {
            Ok(linked) => {
                info!(dir = %collection.dir_path, linked, "staged collection");
                true
            }
            Err(err) => {
                error!(dir = %collection.dir_path, "staging failed: {err}");
                false
            }
        }
    }

    /// Links every file of `collection` into its directory and returns how many
    /// links were created. Links that already exist are left alone.
    pub fn try_stage(&self, collection: &FileCollection) -> Result<usize, ShareError> {
        let target = self.target_dir(&collection.dir_path);
        if target.as_std_path().is_dir() {
            return link_files(&collection.files, target.as_std_path());
        }

        let parent = target
            .parent()
            .ok_or_else(|| ShareError::Filesystem(format!("invalid staging path {target}")))?;
        create_dir_tree(parent.as_std_path()).map_err(|err| fs_error(parent.as_std_path(), err))?;

        let temp_dir = Builder::new()
            .prefix(".staging")
            .tempdir_in(parent.as_std_path())
            .map_err(|err| fs_error(parent.as_std_path(), err))?;
        fs::set_permissions(temp_dir.path(), Permissions::from_mode(DIR_MODE))
            .map_err(|err| fs_error(temp_dir.path(), err))?;
        let linked = link_files(&collection.files, temp_dir.path())?;

        match fs::rename(temp_dir.path(), target.as_std_path()) {
            Ok(()) => {
                let _ = temp_dir.keep();
                Ok(linked)
            }
            // Someone else staged the same directory meanwhile; fill it in place.
            Err(_) if target.as_std_path().is_dir() => {
                link_files(&collection.files, target.as_std_path())
            }
            Err(err) => Err(fs_error(target.as_std_path(), err)),
        }
    }

    /// Removes the files the service owns below `dir_path`, then whatever
    /// directories became empty. Files owned by other users stay in place.
    pub fn unstage(&self, dir_path: &Utf8Path) -> UnstageSummary {
        let target = self.target_dir(dir_path);
        let mut summary = UnstageSummary::default();
        if !target.as_std_path().exists() {
            info!(dir = %dir_path, "nothing staged to remove");
            return summary;
        }

        let entries = match walk_dir(target.as_std_path()) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(dir = %dir_path, "unable to list staged files: {err}");
                return summary;
            }
        };

        let mut dirs = Vec::new();
        for path in entries {
            let metadata = match fs::symlink_metadata(&path) {
                Ok(metadata) => metadata,
                Err(err) => {
                    warn!(dir = %dir_path, path = %path.display(), "unable to stat: {err}");
                    continue;
                }
            };
            if metadata.is_dir() {
                dirs.push(path);
            } else if metadata.uid() == self.service_uid {
                match fs::remove_file(&path) {
                    Ok(()) => summary.removed_files += 1,
                    Err(err) => {
                        warn!(dir = %dir_path, path = %path.display(), "unable to remove: {err}");
                        summary.kept_files += 1;
                    }
                }
            } else {
                summary.kept_files += 1;
            }
        }

        // Deepest first so parents are empty by the time they are reached.
        dirs.sort_by_key(|path| std::cmp::Reverse(path.components().count()));
        dirs.push(target.clone().into_std_path_buf());
        for dir in dirs {
            if fs::remove_dir(&dir).is_ok() {
                summary.removed_dirs += 1;
            }
        }

        info!(
            dir = %dir_path,
            removed = summary.removed_files,
            kept = summary.kept_files,
            "unstaged collection"
        );
        summary
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnstageSummary {
    pub removed_files: usize,
    pub kept_files: usize,
    pub removed_dirs: usize,
}

fn link_files(files: &[Utf8PathBuf], dir: &Path) -> Result<usize, ShareError> {
    let mut linked = 0;
    for file in files {
        let name = file
            .file_name()
            .ok_or_else(|| ShareError::Filesystem(format!("not a file path: {file}")))?;
        let dest = dir.join(name);
        match fs::hard_link(file.as_std_path(), &dest) {
            Ok(()) => linked += 1,
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {}
            Err(err) => {
                return Err(ShareError::Filesystem(format!(
                    "link {file} -> {}: {err}",
                    dest.display()
                )));
            }
        }
    }
    Ok(linked)
}

fn create_dir_tree(path: &Path) -> io::Result<()> {
    if path.is_dir() {
        return Ok(());
    }
    DirBuilder::new().recursive(true).mode(DIR_MODE).create(path)?;
    // The process umask strips the sticky and group-write bits from `mode`.
    fs::set_permissions(path, Permissions::from_mode(DIR_MODE))
}

fn walk_dir(root: &Path) -> io::Result<Vec<PathBuf>> {
    let mut items = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(path) = stack.pop() {
        for entry in fs::read_dir(&path)? {
            let path = entry?.path();
            if path.is_dir() && !path.is_symlink() {
                stack.push(path.clone());
            }
            items.push(path);
        }
    }
    Ok(items)
}

fn fs_error(path: &Path, err: io::Error) -> ShareError {
    ShareError::Filesystem(format!("{}: {err}", path.display()))
}
