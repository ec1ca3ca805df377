//! Extension provisioning.
//!
//! Browser extensions ship as ZIP archives embedded at build time and are
//! unpacked into `extension_root/<id>/...` before launch so the browser
//! can load them from disk. Provisioning is idempotent: an id whose
//! directory already exists is reused as-is.

use crate::error::{EngineError, Result};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fs;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};

static NOPECHA: &[u8] = include_bytes!("../assets/nopecha.zip");
static CAPTCHA_SOLVER: &[u8] = include_bytes!("../assets/captcha-solver.zip");

/// ZIP local-file-header magic plus the version field, as written by a
/// standard deflate archiver. Some upstream packaging steps strip the
/// first 8 bytes of the archive to zeros; we restore them before parsing.
const ZIP_HEADER_MAGIC: [u8; 8] = [0x50, 0x4B, 0x03, 0x04, 0x14, 0x00, 0x00, 0x00];

/// Unpacks embedded extension archives into an on-disk layout usable by
/// the browser's `--load-extension` flag.
pub struct ExtensionProvisioner {
    root: PathBuf,
    archives: HashMap<String, Cow<'static, [u8]>>,
}

impl ExtensionProvisioner {
    /// Provisioner over the archives embedded in the binary.
    pub fn builtin(root: impl Into<PathBuf>) -> Self {
        let mut archives: HashMap<String, Cow<'static, [u8]>> = HashMap::new();
        archives.insert("nopecha".to_string(), Cow::Borrowed(NOPECHA));
        archives.insert("captcha-solver".to_string(), Cow::Borrowed(CAPTCHA_SOLVER));
        Self {
            root: root.into(),
            archives,
        }
    }

    /// Registers an additional archive under `id`.
    pub fn with_archive(mut self, id: impl Into<String>, bytes: Vec<u8>) -> Self {
        self.archives.insert(id.into(), Cow::Owned(bytes));
        self
    }

    /// Materializes the named extensions on disk and returns the absolute
    /// directory path for each one that succeeded. A failure for one id
    /// is logged and that id omitted; the others still provision.
    pub fn provision(&self, ids: &[&str]) -> Result<Vec<PathBuf>> {
        let root = absolutize(&self.root)?;
        fs::create_dir_all(&root)?;

        let mut paths = Vec::with_capacity(ids.len());
        for id in ids {
            match self.provision_one(&root, id) {
                Ok(path) => paths.push(path),
                Err(e) => log::error!("skipping extension {}: {}", id, e),
            }
        }
        Ok(paths)
    }

    fn provision_one(&self, root: &Path, id: &str) -> Result<PathBuf> {
        let target = root.join(id);
        if target.exists() {
            return Ok(target);
        }

        let bytes = self
            .archives
            .get(id)
            .ok_or_else(|| EngineError::Transient(format!("unknown extension id {:?}", id)))?;
        let repaired = repair_header(bytes)?;

        // Extract to a staging directory and rename into place so a
        // crashed run never leaves a half-written directory that a later
        // run would mistake for a complete install.
        let staging = root.join(format!(".staging-{}-{}", id, uuid::Uuid::new_v4()));
        fs::create_dir_all(&staging)?;
        if let Err(e) = unpack_archive(&repaired, &staging) {
            let _ = fs::remove_dir_all(&staging);
            return Err(e);
        }

        match fs::rename(&staging, &target) {
            Ok(()) => Ok(target),
            // Lost a first-install race: another session finished first
            // with identical content.
            Err(_) if target.exists() => {
                let _ = fs::remove_dir_all(&staging);
                Ok(target)
            }
            Err(e) => {
                let _ = fs::remove_dir_all(&staging);
                Err(e.into())
            }
        }
    }
}

/// Restores a stripped ZIP header. Returns an owned copy since the
/// embedded archives are read-only.
pub fn repair_header(bytes: &[u8]) -> Result<Vec<u8>> {
    if bytes.len() <= 8 {
        return Err(EngineError::ArchiveTooShort);
    }
    let mut owned = bytes.to_vec();
    if owned[..8].iter().all(|&b| b == 0) {
        owned[..8].copy_from_slice(&ZIP_HEADER_MAGIC);
    }
    Ok(owned)
}

fn unpack_archive(bytes: &[u8], target: &Path) -> Result<()> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))?;
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;

        // macOS resource forks and the packager's fingerprint file are
        // noise, not content.
        if entry.name().contains("__MACOSX") || entry.name().contains("manifest.fingerprint") {
            continue;
        }

        // Paths escaping the target directory are dropped.
        let Some(relative) = entry.enclosed_name() else {
            log::warn!("skipping unsafe archive entry {:?}", entry.name());
            continue;
        };
        let out = target.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&out)?;
            continue;
        }
        if let Some(parent) = out.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut contents = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut contents)?;
        fs::write(&out, contents)?;
    }
    Ok(())
}

fn absolutize(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repair_rewrites_zeroed_header() {
        let mut bytes = vec![0u8; 16];
        bytes[9] = 0xAB;
        let repaired = repair_header(&bytes).unwrap();
        assert_eq!(&repaired[..8], &ZIP_HEADER_MAGIC);
        assert_eq!(repaired[9], 0xAB);
    }

    #[test]
    fn repair_leaves_intact_header_alone() {
        let repaired = repair_header(NOPECHA).unwrap();
        assert_eq!(repaired, NOPECHA);
    }

    #[test]
    fn repair_rejects_short_buffers() {
        assert!(matches!(
            repair_header(&[0u8; 8]),
            Err(EngineError::ArchiveTooShort)
        ));
        assert!(matches!(
            repair_header(&[]),
            Err(EngineError::ArchiveTooShort)
        ));
    }

    #[test]
    fn builtin_archives_parse_as_zip() {
        for bytes in [NOPECHA, CAPTCHA_SOLVER] {
            let archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
            assert!(archive.len() > 0);
        }
    }
}
