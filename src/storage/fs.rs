use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use crate::core::{Context, Error, Result};
use crate::storage::Storage;

/// One file per object under a root directory.
///
/// Saves write `<name>.tmp`, fsync, then rename over the target, so readers
/// see either the old or the new object.
#[derive(Debug, Clone)]
pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, name: &str) -> Result<PathBuf> {
        if name.is_empty() || name.contains('/') || name.contains('\\') || name.starts_with('.') {
            return Err(Error::storage(
                "resolve",
                name,
                std::io::Error::new(ErrorKind::InvalidInput, "invalid object name"),
            ));
        }
        Ok(self.root.join(name))
    }
}

impl Storage for FsStorage {
    fn exists(&self, ctx: &Context, name: &str) -> Result<bool> {
        ctx.check_lock()?;
        Ok(self.path(name)?.exists())
    }

    fn get(&self, ctx: &Context, name: &str) -> Result<Vec<u8>> {
        ctx.check_lock()?;
        match fs::read(self.path(name)?) {
            Ok(data) => Ok(data),
            Err(err) if err.kind() == ErrorKind::NotFound => Err(Error::NotFound(name.to_string())),
            Err(err) => Err(Error::storage("get", name, err)),
        }
    }

    fn save(&self, ctx: &Context, name: &str, data: &[u8]) -> Result<()> {
        ctx.check_lock()?;
        let path = self.path(name)?;
        let tmp = self.root.join(format!("{name}.tmp"));
        let write = || -> std::io::Result<()> {
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp)?;
            file.write_all(data)?;
            file.sync_all()?;
            fs::rename(&tmp, &path)
        };
        write().map_err(|err| Error::storage("save", name, err))
    }

    fn delete(&self, ctx: &Context, name: &str) -> Result<()> {
        ctx.check_lock()?;
        match fs::remove_file(self.path(name)?) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(Error::storage("delete", name, err)),
        }
    }

    fn rename(&self, ctx: &Context, old_name: &str, new_name: &str) -> Result<()> {
        ctx.check_lock()?;
        let from = self.path(old_name)?;
        let to = self.path(new_name)?;
        match fs::rename(from, to) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Err(Error::NotFound(old_name.to_string())),
            Err(err) => Err(Error::storage("rename", old_name, err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_save_replaces_atomically() {
        let dir = TempDir::new().expect("tempdir");
        let ctx = Context::background();
        let storage = FsStorage::open(dir.path()).expect("open");
        storage.save(&ctx, "queue.meta", b"v1").expect("save v1");
        storage.save(&ctx, "queue.meta", b"v2").expect("save v2");
        assert_eq!(storage.get(&ctx, "queue.meta").expect("get"), b"v2");
        assert!(!dir.path().join("queue.meta.tmp").exists());
    }

    #[test]
    fn test_missing_objects() {
        let dir = TempDir::new().expect("tempdir");
        let ctx = Context::background();
        let storage = FsStorage::open(dir.path()).expect("open");
        assert!(!storage.exists(&ctx, "nope").expect("exists"));
        assert!(matches!(storage.get(&ctx, "nope"), Err(Error::NotFound(_))));
        storage.delete(&ctx, "nope").expect("delete missing");
        assert!(matches!(storage.rename(&ctx, "nope", "other"), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_rejects_path_like_names() {
        let dir = TempDir::new().expect("tempdir");
        let ctx = Context::background();
        let storage = FsStorage::open(dir.path()).expect("open");
        assert!(storage.save(&ctx, "../escape", b"x").is_err());
        assert!(storage.save(&ctx, ".hidden", b"x").is_err());
    }
}
