use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::core::{Context, Error, Result};
use crate::storage::Storage;

/// Process-local object store.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn objects(&self) -> MutexGuard<'_, HashMap<String, Vec<u8>>> {
        self.objects.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn len(&self) -> usize {
        self.objects().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects().is_empty()
    }

    /// Object names in sorted order.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.objects().keys().cloned().collect();
        names.sort_unstable();
        names
    }
}

impl Storage for MemoryStorage {
    fn exists(&self, ctx: &Context, name: &str) -> Result<bool> {
        ctx.check_lock()?;
        Ok(self.objects().contains_key(name))
    }

    fn get(&self, ctx: &Context, name: &str) -> Result<Vec<u8>> {
        ctx.check_lock()?;
        self.objects()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }

    fn save(&self, ctx: &Context, name: &str, data: &[u8]) -> Result<()> {
        ctx.check_lock()?;
        self.objects().insert(name.to_string(), data.to_vec());
        Ok(())
    }

    fn delete(&self, ctx: &Context, name: &str) -> Result<()> {
        ctx.check_lock()?;
        self.objects().remove(name);
        Ok(())
    }

    fn rename(&self, ctx: &Context, old_name: &str, new_name: &str) -> Result<()> {
        ctx.check_lock()?;
        let mut objects = self.objects();
        let data = objects
            .remove(old_name)
            .ok_or_else(|| Error::NotFound(old_name.to_string()))?;
        objects.insert(new_name.to_string(), data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_get_rename_delete() {
        let ctx = Context::background();
        let storage = MemoryStorage::new();
        storage.save(&ctx, "a", b"one").expect("save");
        assert!(storage.exists(&ctx, "a").expect("exists"));
        storage.rename(&ctx, "a", "b").expect("rename");
        assert!(!storage.exists(&ctx, "a").expect("exists"));
        assert_eq!(storage.get(&ctx, "b").expect("get"), b"one");
        storage.delete(&ctx, "b").expect("delete");
        storage.delete(&ctx, "b").expect("delete twice");
        assert!(matches!(storage.get(&ctx, "b"), Err(Error::NotFound(_))));
        assert!(storage.is_empty());
    }
}
