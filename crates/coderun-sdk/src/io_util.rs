use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use std::path::Path;
use std::{fs, thread, time::Duration};

/// File-system helpers shared by the runner backends and settings loader.
pub struct IOUtil;

impl IOUtil {
    /// Recursively delete a directory with retry logic.
    ///
    /// A missing directory is not an error. Transient failures (a child still
    /// holding a file open right after being killed) are retried up to 3
    /// times with a growing delay.
    pub fn delete_directory(path: &Path) -> Result<()> {
        if !path.exists() {
            return Ok(());
        }

        if path.symlink_metadata()?.file_type().is_symlink() {
            fs::remove_file(path)
                .with_context(|| format!("Failed to remove symlink '{}'", path.display()))?;
            return Ok(());
        }

        let max_retries = 3;
        let mut last_err = None;

        for attempt in 0..max_retries {
            if let Err(e) = Self::remove_readonly_recursive(path) {
                tracing::debug!(
                    "Failed to remove readonly attributes (attempt {}): {}",
                    attempt + 1,
                    e
                );
            }

            match fs::remove_dir_all(path) {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
                Err(e) => {
                    last_err = Some(e);
                    if attempt < max_retries - 1 {
                        thread::sleep(Duration::from_millis(100 * (attempt as u64 + 1)));
                    }
                }
            }
        }

        match last_err {
            Some(e) => Err(e).with_context(|| {
                format!(
                    "Failed to delete directory '{}' after {} retries",
                    path.display(),
                    max_retries
                )
            }),
            None => Ok(()),
        }
    }

    /// Copy the contents of `source` into `dest` recursively. `dest` is
    /// created when missing. Symlinks are followed.
    pub fn copy_directory(source: &Path, dest: &Path) -> Result<u64> {
        fs::create_dir_all(dest)
            .with_context(|| format!("Failed to create directory '{}'", dest.display()))?;

        let mut copied = 0;
        for entry in fs::read_dir(source)
            .with_context(|| format!("Failed to read directory '{}'", source.display()))?
        {
            let entry = entry?;
            let from = entry.path();
            let to = dest.join(entry.file_name());
            if from.is_dir() {
                copied += Self::copy_directory(&from, &to)?;
            } else {
                fs::copy(&from, &to).with_context(|| {
                    format!("Failed to copy '{}' to '{}'", from.display(), to.display())
                })?;
                copied += 1;
            }
        }
        Ok(copied)
    }

    /// Read a file and deserialize it from JSON.
    pub fn load_object<T: DeserializeOwned>(path: &Path) -> Result<T> {
        let json = fs::read_to_string(path)
            .with_context(|| format!("Failed to read file '{}'", path.display()))?;
        let value = serde_json::from_str(&json)
            .with_context(|| format!("Failed to deserialize JSON from '{}'", path.display()))?;
        Ok(value)
    }

    fn remove_readonly_recursive(path: &Path) -> Result<()> {
        if !path.is_dir() {
            return Self::remove_readonly(path);
        }

        for entry in fs::read_dir(path)? {
            let entry_path = entry?.path();
            if entry_path.is_dir() {
                Self::remove_readonly_recursive(&entry_path)?;
            } else {
                Self::remove_readonly(&entry_path)?;
            }
        }
        Self::remove_readonly(path)
    }

    #[allow(clippy::permissions_set_readonly_false)]
    fn remove_readonly(path: &Path) -> Result<()> {
        let meta = match fs::symlink_metadata(path) {
            Ok(m) => m,
            Err(_) => return Ok(()),
        };
        let mut perms = meta.permissions();
        if perms.readonly() {
            perms.set_readonly(false);
            fs::set_permissions(path, perms)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Config {
        name: String,
        count: u32,
    }

    #[test]
    fn load_object_reads_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let original = Config {
            name: "test".into(),
            count: 7,
        };
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, serde_json::to_vec(&original).unwrap()).unwrap();
        let loaded: Config = IOUtil::load_object(&path).unwrap();
        assert_eq!(loaded, original);
    }

    #[test]
    fn load_object_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.json");
        let err = IOUtil::load_object::<Config>(&path).unwrap_err();
        assert!(format!("{err:#}").contains("absent.json"));
    }

    #[test]
    fn delete_directory_missing_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        assert!(IOUtil::delete_directory(&dir.path().join("gone")).is_ok());
    }

    #[test]
    fn delete_directory_removes_readonly_tree() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("tree");
        let inner = root.join("subdir");
        fs::create_dir_all(&inner).unwrap();
        let file = inner.join("file.txt");
        fs::write(&file, b"data").unwrap();
        let mut perms = fs::metadata(&file).unwrap().permissions();
        perms.set_readonly(true);
        fs::set_permissions(&file, perms).unwrap();

        IOUtil::delete_directory(&root).unwrap();
        assert!(!root.exists());
    }

    #[test]
    fn copy_directory_is_recursive() {
        let src = tempfile::tempdir().unwrap();
        fs::create_dir_all(src.path().join("pkg")).unwrap();
        fs::write(src.path().join("main.py"), b"print(1)").unwrap();
        fs::write(src.path().join("pkg").join("util.py"), b"x = 1").unwrap();

        let dst = tempfile::tempdir().unwrap();
        let target = dst.path().join("copy");
        let copied = IOUtil::copy_directory(src.path(), &target).unwrap();
        assert_eq!(copied, 2);
        assert_eq!(fs::read(target.join("pkg").join("util.py")).unwrap(), b"x = 1");
    }
}
