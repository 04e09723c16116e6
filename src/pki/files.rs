//! Certificate pairs on disk.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::IssuedCertificate;

/// `{name}.crt` / `{name}.key` pairs under one directory
#[derive(Debug, Clone)]
pub struct CertFiles {
    dir: PathBuf,
}

impl CertFiles {
    /// Pairs stored under `dir`
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Certificate directory
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the certificate file for `name`
    #[must_use]
    pub fn crt_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.crt"))
    }

    /// Path of the key file for `name`
    #[must_use]
    pub fn key_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.key"))
    }

    /// Both halves of the pair are present
    #[must_use]
    pub fn exists(&self, name: &str) -> bool {
        let exists = self.crt_path(name).is_file() && self.key_path(name).is_file();
        debug!(cert = %name, exists, "certificate pair lookup");
        exists
    }

    /// Write the pair, restricting the key to its owner.
    ///
    /// # Errors
    ///
    /// Returns the underlying IO error if the directory or either file
    /// cannot be written.
    pub fn write(&self, name: &str, issued: &IssuedCertificate) -> std::io::Result<()> {
        fs::create_dir_all(&self.dir)?;

        fs::write(self.crt_path(name), &issued.certificate)?;

        let mut key = open_key(&self.key_path(name))?;
        key.write_all(issued.private_key.as_bytes())?;
        key.sync_all()
    }
}

/// Open the key file for writing without it ever being readable by others.
/// A key left over from an earlier issuance is narrowed before it is
/// truncated.
#[cfg(unix)]
fn open_key(path: &Path) -> std::io::Result<fs::File> {
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

    let file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .mode(0o600)
        .open(path)?;
    file.set_permissions(fs::Permissions::from_mode(0o600))?;
    file.set_len(0)?;
    Ok(file)
}

#[cfg(not(unix))]
fn open_key(path: &Path) -> std::io::Result<fs::File> {
    fs::File::create(path)
}
