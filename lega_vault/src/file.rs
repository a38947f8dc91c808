use crate::{Vault, VaultError};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncRead;
use tracing::debug;

/// The filesystem vault driver.
///
/// Destinations are nested under the vault root by zero-padded file id
/// (`000/000/000/123`), keeping directory fan-out bounded regardless of
/// archive size. Payloads are written to a `.part` sibling first and
/// renamed into place, so a destination path either does not exist or
/// holds a complete payload.
pub struct FileVault {
    root: PathBuf,
}

impl FileVault {
    /// Creates a new filesystem driver rooted at the given directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Reports the vault root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl Vault for FileVault {
    fn location(&self, file_id: i64) -> String {
        // Group the zero-padded id into directories of a thousand entries
        let padded = format!("{:012}", file_id);
        let nested = format!(
            "{}/{}/{}/{}",
            &padded[0..3],
            &padded[3..6],
            &padded[6..9],
            &padded[9..12],
        );

        self.root.join(nested).display().to_string()
    }

    async fn copy(
        &self,
        reader: &mut (dyn AsyncRead + Unpin + Send),
        target: &str,
    ) -> Result<u64, VaultError> {
        let target = Path::new(target);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Stage into a sibling, then rename into place
        let staging = target.with_extension("part");
        debug!(staging = %staging.display(), "Staging a vault payload");

        let mut outfile = fs::File::create(&staging).await?;
        let written = tokio::io::copy(reader, &mut outfile).await?;
        outfile.sync_all().await?;
        drop(outfile);

        fs::rename(&staging, target).await?;

        debug!(target = %target.display(), written, "Vault payload in place");

        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn location_nests_by_padded_id() {
        let vault = FileVault::new("/ega/vault");

        assert_eq!(vault.location(123), "/ega/vault/000/000/000/123");
        assert_eq!(vault.location(1_000_042), "/ega/vault/000/001/000/042");
    }

    #[tokio::test]
    async fn copy_streams_everything_and_reports_size() {
        // Given
        let dir = tempfile::tempdir().unwrap();
        let vault = FileVault::new(dir.path());
        let target = vault.location(7);
        let payload = b"the remainder of the container".to_vec();

        // When
        let written = vault.copy(&mut payload.as_slice(), &target).await.unwrap();

        // Then
        assert_eq!(written, payload.len() as u64);
        assert_eq!(std::fs::read(&target).unwrap(), payload);
    }

    #[tokio::test]
    async fn copy_leaves_no_staging_file_behind() {
        // Given
        let dir = tempfile::tempdir().unwrap();
        let vault = FileVault::new(dir.path());
        let target = vault.location(8);

        // When
        vault.copy(&mut &b"payload"[..], &target).await.unwrap();

        // Then
        let staging = Path::new(&target).with_extension("part");
        assert!(!staging.exists());
        assert!(Path::new(&target).exists());
    }
}
