//! Link-aware directory store.
//!
//! Primitives for replacing a live state root with either a link (junction on
//! Windows, symlink elsewhere) to an identity directory or a full mirror copy
//! of it. Every primitive tolerates leftovers of a crashed earlier run:
//! - links whose target was deleted,
//! - real directories holding locked files,
//! - paths the OS has not released yet after a removal.

use anyhow::{Context, Result, bail};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

/// What currently sits at a live path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkStatus {
    Missing,
    Directory,
    File,
    Link { target: PathBuf },
    BrokenLink { target: PathBuf },
}

impl LinkStatus {
    pub fn detect(path: &Path) -> Self {
        if is_link(path) {
            let target = fs::read_link(path).unwrap_or_else(|_| PathBuf::from("?"));
            // A link is only usable if its target can be listed
            if fs::read_dir(path).is_ok() {
                Self::Link { target }
            } else {
                Self::BrokenLink { target }
            }
        } else {
            match fs::symlink_metadata(path) {
                Ok(meta) if meta.is_dir() => Self::Directory,
                Ok(_) => Self::File,
                Err(_) => Self::Missing,
            }
        }
    }
}

/// True if `path` is a symlink or reparse point rather than a real directory.
/// Never fails: nonexistent paths are simply not links.
pub fn is_link(path: &Path) -> bool {
    match fs::symlink_metadata(path) {
        Ok(meta) => is_reparse(&meta),
        Err(_) => false,
    }
}

#[cfg(windows)]
fn is_reparse(meta: &fs::Metadata) -> bool {
    use std::os::windows::fs::MetadataExt;
    const FILE_ATTRIBUTE_REPARSE_POINT: u32 = 0x400;
    meta.file_type().is_symlink() || meta.file_attributes() & FILE_ATTRIBUTE_REPARSE_POINT != 0
}

#[cfg(not(windows))]
fn is_reparse(meta: &fs::Metadata) -> bool {
    meta.file_type().is_symlink()
}

/// Like `Path::exists` but true for broken links as well
pub fn path_present(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok()
}

#[derive(Debug, Clone)]
pub struct LinkStore {
    settle: Duration,
}

impl LinkStore {
    pub fn new(settle: Duration) -> Self {
        Self { settle }
    }

    /// Delete `path` whatever it is: real directory, file, link or broken link.
    ///
    /// Returns false only if something is still present after every attempt.
    pub fn remove(&self, path: &Path) -> bool {
        if !path_present(path) {
            return true;
        }

        if is_link(path) {
            match remove_link(path) {
                Ok(()) => tracing::debug!(path = %path.display(), "Removed link"),
                Err(e) => tracing::debug!(path = %path.display(), "Link removal failed: {e:#}"),
            }
        }

        if path_present(path) {
            let res = match fs::symlink_metadata(path) {
                Ok(meta) if meta.is_file() => fs::remove_file(path),
                _ => fs::remove_dir_all(path),
            };
            if let Err(e) = res {
                tracing::debug!(path = %path.display(), "Recursive delete failed: {e}");
            }
        }

        if path_present(path) {
            tracing::warn!(path = %path.display(), "Falling back to forced removal");
            if let Err(e) = force_remove(path) {
                tracing::warn!(path = %path.display(), "Forced removal failed: {e:#}");
            }
        }

        let gone = !path_present(path);
        if !gone {
            tracing::error!(path = %path.display(), "Path still present after every removal attempt");
        }
        gone
    }

    /// Replace `link_path` with a link to `target_path`.
    ///
    /// Success is judged by inspecting the result, not by the exit status of
    /// the link command.
    pub fn link(&self, link_path: &Path, target_path: &Path) -> bool {
        if !self.remove(link_path) {
            return false;
        }
        thread::sleep(self.settle);

        if let Some(parent) = link_path.parent()
            && let Err(e) = fs::create_dir_all(parent)
        {
            tracing::warn!(path = %parent.display(), "Failed to create link parent: {e}");
            return false;
        }

        if let Err(e) = create_link(target_path, link_path) {
            tracing::debug!(link = %link_path.display(), "Link command reported failure: {e:#}");
        }

        let ok = is_link(link_path) && link_path.exists();
        if ok {
            tracing::info!(
                link = %link_path.display(),
                target = %target_path.display(),
                "Linked live state"
            );
        } else {
            tracing::warn!(link = %link_path.display(), "Link was not created");
        }
        ok
    }

    /// Make `dst` an exact copy of `src`, skipping top-level entries named in
    /// `exclude`. Anything previously at `dst` (including a link) is removed
    /// first, so nothing from an earlier identity survives.
    pub fn mirror(&self, src: &Path, dst: &Path, exclude: &[String]) -> Result<()> {
        let meta = fs::metadata(src)
            .with_context(|| format!("Source directory is not readable: {:?}", src))?;
        if !meta.is_dir() {
            bail!("Source is not a directory: {:?}", src);
        }

        if path_present(dst) && !is_link(dst) {
            let src_real = fs::canonicalize(src)
                .with_context(|| format!("Failed to resolve source: {:?}", src))?;
            let dst_real = fs::canonicalize(dst)
                .with_context(|| format!("Failed to resolve destination: {:?}", dst))?;
            if src_real.starts_with(&dst_real) || dst_real.starts_with(&src_real) {
                bail!("Source {:?} and destination {:?} overlap", src, dst);
            }
        }

        if !self.remove(dst) {
            bail!("Failed to clear destination: {:?}", dst);
        }

        fs::create_dir_all(dst)
            .with_context(|| format!("Failed to create destination directory: {:?}", dst))?;
        copy_tree(src, dst, exclude)?;

        tracing::debug!(src = %src.display(), dst = %dst.display(), "Mirrored directory");
        Ok(())
    }

    /// Force-remove every path that is a link whose target can no longer be
    /// listed. Returns how many were removed.
    pub fn cleanup_stale_links<P: AsRef<Path>>(&self, paths: &[P]) -> usize {
        let mut removed = 0;
        for path in paths {
            let path = path.as_ref();
            if !is_link(path) || fs::read_dir(path).is_ok() {
                continue;
            }

            tracing::warn!(path = %path.display(), "Removing stale link");
            if remove_link(path).is_err() || path_present(path) {
                let _ = force_remove(path);
            }
            if !path_present(path) {
                removed += 1;
            }
        }
        removed
    }
}

fn copy_tree(src: &Path, dst: &Path, exclude: &[String]) -> Result<()> {
    for entry in
        fs::read_dir(src).with_context(|| format!("Failed to read source directory: {:?}", src))?
    {
        let entry = entry.context("Failed to read directory entry")?;
        let name = entry.file_name();
        if exclude
            .iter()
            .any(|ex| name.to_str().is_some_and(|n| n.eq_ignore_ascii_case(ex)))
        {
            continue;
        }

        let src_path = entry.path();
        let dst_path = dst.join(&name);

        // Nested links are copied by content; broken ones are skipped
        let meta = match fs::metadata(&src_path) {
            Ok(meta) => meta,
            Err(e) => {
                tracing::warn!(path = %src_path.display(), "Skipping unreadable entry: {e}");
                continue;
            }
        };

        if meta.is_dir() {
            fs::create_dir_all(&dst_path)
                .with_context(|| format!("Failed to create directory: {:?}", dst_path))?;
            copy_tree(&src_path, &dst_path, &[])?;
        } else {
            fs::copy(&src_path, &dst_path).with_context(|| {
                format!("Failed to copy file: {:?} -> {:?}", src_path, dst_path)
            })?;
        }
    }

    Ok(())
}

#[cfg(unix)]
fn remove_link(path: &Path) -> Result<()> {
    fs::remove_file(path).with_context(|| format!("Failed to remove link: {:?}", path))
}

#[cfg(windows)]
fn remove_link(path: &Path) -> Result<()> {
    // Junctions and directory symlinks are directories, file symlinks are files
    fs::remove_dir(path)
        .or_else(|_| fs::remove_file(path))
        .with_context(|| format!("Failed to remove link: {:?}", path))
}

#[cfg(unix)]
fn create_link(target: &Path, link: &Path) -> Result<()> {
    let target = std::path::absolute(target)
        .with_context(|| format!("Failed to resolve link target: {:?}", target))?;
    std::os::unix::fs::symlink(&target, link).with_context(|| {
        format!(
            "Failed to create symlink from {} to {}",
            link.display(),
            target.display()
        )
    })
}

#[cfg(windows)]
fn create_link(target: &Path, link: &Path) -> Result<()> {
    let target = std::path::absolute(target)
        .with_context(|| format!("Failed to resolve link target: {:?}", target))?;
    let status = Command::new("cmd")
        .arg("/c")
        .arg("mklink")
        .arg("/J")
        .arg(link)
        .arg(&target)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .context("Failed to run mklink")?;
    if !status.success() {
        bail!("mklink exited with {}", status);
    }
    Ok(())
}

#[cfg(windows)]
fn force_remove(path: &Path) -> Result<()> {
    let flags: &[&str] = if is_link(path) { &[] } else { &["/s", "/q"] };
    run_quiet(Command::new("cmd").arg("/c").arg("rd").args(flags).arg(path))
}

#[cfg(not(windows))]
fn force_remove(path: &Path) -> Result<()> {
    run_quiet(Command::new("rm").arg("-rf").arg(path))
}

fn run_quiet(cmd: &mut Command) -> Result<()> {
    let status = cmd
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .with_context(|| format!("Failed to run {:?}", cmd))?;
    if !status.success() {
        bail!("{:?} exited with {}", cmd, status);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> LinkStore {
        LinkStore::new(Duration::ZERO)
    }

    #[test]
    fn test_is_link_on_plain_paths() {
        let temp = TempDir::new().unwrap();
        assert!(!is_link(&temp.path().join("missing")));
        assert!(!is_link(temp.path()));
        assert_eq!(LinkStatus::detect(&temp.path().join("missing")), LinkStatus::Missing);
        assert_eq!(LinkStatus::detect(temp.path()), LinkStatus::Directory);
    }

    #[test]
    fn test_remove_real_directory() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("live");
        fs::create_dir_all(dir.join("cache")).unwrap();
        fs::write(dir.join("cache/a.bin"), "a").unwrap();

        assert!(store().remove(&dir));
        assert!(!path_present(&dir));
        // Removing again is a no-op success
        assert!(store().remove(&dir));
    }

    #[test]
    fn test_mirror_is_full_replace() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        let dst = temp.path().join("dst");
        fs::create_dir_all(src.join("cache")).unwrap();
        fs::write(src.join("config.json"), "new").unwrap();
        fs::write(src.join("cache/a.bin"), "a").unwrap();

        fs::create_dir_all(dst.join("cache")).unwrap();
        fs::write(dst.join("config.json"), "old").unwrap();
        fs::write(dst.join("cache/b.bin"), "b").unwrap();

        store().mirror(&src, &dst, &[]).unwrap();

        assert_eq!(fs::read_to_string(dst.join("config.json")).unwrap(), "new");
        assert!(dst.join("cache/a.bin").exists());
        assert!(!dst.join("cache/b.bin").exists());
    }

    #[test]
    fn test_mirror_excludes_top_level_only() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        let dst = temp.path().join("dst");
        fs::create_dir_all(src.join("Logs")).unwrap();
        fs::create_dir_all(src.join("data/Logs")).unwrap();
        fs::write(src.join("Logs/today.log"), "x").unwrap();
        fs::write(src.join("data/Logs/keep.log"), "y").unwrap();

        store()
            .mirror(&src, &dst, &["logs".to_string()])
            .unwrap();

        assert!(!dst.join("Logs").exists());
        assert!(dst.join("data/Logs/keep.log").exists());
    }

    #[test]
    fn test_mirror_missing_source_fails() {
        let temp = TempDir::new().unwrap();
        let err = store()
            .mirror(&temp.path().join("nope"), &temp.path().join("dst"), &[])
            .unwrap_err();
        assert!(err.to_string().contains("not readable"));
    }

    #[test]
    fn test_mirror_refuses_overlap() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        fs::create_dir_all(src.join("inner")).unwrap();

        assert!(store().mirror(&src, &src.join("inner"), &[]).is_err());
        assert!(src.join("inner").exists());
    }

    #[cfg(unix)]
    mod links {
        use super::*;
        use std::os::unix::fs::symlink;

        #[test]
        fn test_detect_link_and_broken_link() {
            let temp = TempDir::new().unwrap();
            let target = temp.path().join("target");
            let link = temp.path().join("link");
            fs::create_dir(&target).unwrap();
            symlink(&target, &link).unwrap();

            assert!(is_link(&link));
            assert!(matches!(LinkStatus::detect(&link), LinkStatus::Link { .. }));

            fs::remove_dir(&target).unwrap();
            assert!(is_link(&link));
            assert!(matches!(LinkStatus::detect(&link), LinkStatus::BrokenLink { .. }));
        }

        #[test]
        fn test_remove_link_keeps_target() {
            let temp = TempDir::new().unwrap();
            let target = temp.path().join("target");
            let link = temp.path().join("link");
            fs::create_dir(&target).unwrap();
            fs::write(target.join("keep.txt"), "k").unwrap();
            symlink(&target, &link).unwrap();

            assert!(store().remove(&link));
            assert!(!path_present(&link));
            assert!(target.join("keep.txt").exists());
        }

        #[test]
        fn test_link_replaces_real_directory() {
            let temp = TempDir::new().unwrap();
            let target = temp.path().join("identity");
            let live = temp.path().join("live");
            fs::create_dir(&target).unwrap();
            fs::write(target.join("config.json"), "id").unwrap();
            fs::create_dir(&live).unwrap();
            fs::write(live.join("stale.txt"), "s").unwrap();

            assert!(store().link(&live, &target));
            assert!(is_link(&live));
            assert_eq!(fs::read_to_string(live.join("config.json")).unwrap(), "id");
            assert!(!live.join("stale.txt").exists());
        }

        #[test]
        fn test_link_to_missing_target_fails() {
            let temp = TempDir::new().unwrap();
            let live = temp.path().join("live");
            assert!(!store().link(&live, &temp.path().join("gone")));
        }

        #[test]
        fn test_mirror_into_link_replaces_link_not_target() {
            let temp = TempDir::new().unwrap();
            let src = temp.path().join("src");
            let other = temp.path().join("other_identity");
            let live = temp.path().join("live");
            fs::create_dir(&src).unwrap();
            fs::write(src.join("a.txt"), "a").unwrap();
            fs::create_dir(&other).unwrap();
            fs::write(other.join("b.txt"), "b").unwrap();
            symlink(&other, &live).unwrap();

            store().mirror(&src, &live, &[]).unwrap();

            assert!(!is_link(&live));
            assert!(live.join("a.txt").exists());
            assert!(other.join("b.txt").exists());
        }

        #[test]
        fn test_cleanup_stale_links() {
            let temp = TempDir::new().unwrap();
            let good_target = temp.path().join("good");
            let good = temp.path().join("good_link");
            let stale = temp.path().join("stale_link");
            let plain = temp.path().join("plain");
            fs::create_dir(&good_target).unwrap();
            fs::create_dir(&plain).unwrap();
            symlink(&good_target, &good).unwrap();
            symlink(temp.path().join("deleted"), &stale).unwrap();

            let removed = store().cleanup_stale_links(&[&good, &stale, &plain]);

            assert_eq!(removed, 1);
            assert!(is_link(&good));
            assert!(!path_present(&stale));
            assert!(plain.exists());
        }
    }
}
