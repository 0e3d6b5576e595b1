//! External storage confined to a root directory.

use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};

/// Storage rooted at a canonical directory.
#[derive(Debug, Clone)]
pub struct StorageRoot {
    root: PathBuf,
}

impl StorageRoot {
    /// Canonicalize `root`; it must already exist.
    pub fn open(root: &Path) -> Result<Self> {
        let root = root
            .canonicalize()
            .with_context(|| format!("resolve storage root {}", root.display()))?;
        if !root.is_dir() {
            bail!("storage root {} is not a directory", root.display());
        }
        Ok(Self { root })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn read(&self, relative: &str) -> Result<String> {
        let target = self.resolve_existing(relative)?;
        fs::read_to_string(&target).with_context(|| format!("read {relative}"))
    }

    /// Write `contents`, creating parent directories inside the root.
    pub fn write(&self, relative: &str, contents: &str) -> Result<usize> {
        let target = self.resolve_new(relative)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create parent of {relative}"))?;
        }
        // Re-check after directories exist so symlinked parents cannot escape.
        let parent = target
            .parent()
            .ok_or_else(|| anyhow!("path {relative:?} has no parent"))?
            .canonicalize()
            .with_context(|| format!("resolve parent of {relative}"))?;
        self.ensure_inside(&parent, relative)?;
        if target.is_symlink() {
            let resolved = target
                .canonicalize()
                .with_context(|| format!("resolve {relative}"))?;
            self.ensure_inside(&resolved, relative)?;
        }
        fs::write(&target, contents).with_context(|| format!("write {relative}"))?;
        Ok(contents.len())
    }

    fn resolve_existing(&self, relative: &str) -> Result<PathBuf> {
        let joined = self.root.join(lexical(relative)?);
        let resolved = joined
            .canonicalize()
            .with_context(|| format!("resolve {relative}"))?;
        self.ensure_inside(&resolved, relative)?;
        Ok(resolved)
    }

    fn resolve_new(&self, relative: &str) -> Result<PathBuf> {
        let normalized = lexical(relative)?;
        if normalized.as_os_str().is_empty() {
            bail!("storage path must name a file");
        }
        // Canonicalize the deepest existing ancestor.
        let joined = self.root.join(&normalized);
        let mut ancestor = joined.as_path();
        while !ancestor.exists() {
            ancestor = ancestor
                .parent()
                .ok_or_else(|| anyhow!("path {relative:?} has no existing ancestor"))?;
        }
        let resolved = ancestor
            .canonicalize()
            .with_context(|| format!("resolve {}", ancestor.display()))?;
        self.ensure_inside(&resolved, relative)?;
        Ok(joined)
    }

    fn ensure_inside(&self, resolved: &Path, relative: &str) -> Result<()> {
        if resolved.starts_with(&self.root) {
            return Ok(());
        }
        Err(anyhow!(
            "path {relative:?} escapes the storage root {}",
            self.root.display()
        ))
    }
}

/// Reject absolute paths and `..` that climbs above the root.
fn lexical(relative: &str) -> Result<PathBuf> {
    let mut normalized = PathBuf::new();
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => normalized.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() {
                    bail!("path {relative:?} escapes the storage root");
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                bail!("path {relative:?} must be relative to the storage root");
            }
        }
    }
    Ok(normalized)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_inside_root() {
        let temp = tempfile::tempdir().expect("tempdir");
        let storage = StorageRoot::open(temp.path()).expect("open");
        assert_eq!(storage.write("notes/a.txt", "hello").expect("write"), 5);
        assert_eq!(storage.read("notes/a.txt").expect("read"), "hello");
        assert_eq!(storage.read("./notes/../notes/a.txt").expect("read"), "hello");
    }

    #[test]
    fn rejects_escaping_paths() {
        let temp = tempfile::tempdir().expect("tempdir");
        let storage = StorageRoot::open(temp.path()).expect("open");
        let err = storage.write("../outside.txt", "x").expect_err("escape");
        assert!(err.to_string().contains("escapes the storage root"));
        let err = storage.write("/etc/passwd", "x").expect_err("absolute");
        assert!(err.to_string().contains("must be relative"));
        assert!(storage.read("../../etc/hostname").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn rejects_symlink_escape() {
        let temp = tempfile::tempdir().expect("tempdir");
        let outside = tempfile::tempdir().expect("outside");
        std::os::unix::fs::symlink(outside.path(), temp.path().join("link")).expect("symlink");
        let storage = StorageRoot::open(temp.path()).expect("open");
        let err = storage.write("link/x.txt", "x").expect_err("symlink escape");
        assert!(err.to_string().contains("escapes the storage root"));
        assert!(!outside.path().join("x.txt").exists());
    }
}
