//! Keeping orchestrator images available in the hypervisor's local store.

use chrono::{DateTime, Utc};
use lxd_common::{Instance, RequestContext};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{info, instrument};

use crate::driver::LxdDriver;
use crate::lock::NamedLocks;
use crate::operation::WaitTimeout;
use crate::session::ImageUpload;
use crate::{DriverError, Result};

#[derive(Debug, Serialize)]
struct ImageProperties {
    description: String,
}

/// `metadata.yaml` at the root of a split image's manifest tarball.
#[derive(Debug, Serialize)]
struct ImageMetadata {
    architecture: String,
    creation_date: i64,
    properties: ImageProperties,
}

/// Manifest tarball for a split image made from `image_ref`.
pub fn build_manifest(image_ref: &str, created: DateTime<Utc>) -> std::io::Result<Vec<u8>> {
    let metadata = ImageMetadata {
        architecture: std::env::consts::ARCH.to_string(),
        creation_date: created.timestamp(),
        properties: ImageProperties {
            description: image_ref.to_string(),
        },
    };
    let yaml = serde_yaml::to_string(&metadata)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

    let mut header = tar::Header::new_gnu();
    header.set_size(yaml.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(created.timestamp().max(0) as u64);
    header.set_cksum();

    let mut builder = tar::Builder::new(Vec::new());
    builder.append_data(&mut header, "metadata.yaml", yaml.as_bytes())?;
    builder.into_inner()
}

/// SHA-256 over the manifest bytes followed by the rootfs bytes, hex encoded.
pub fn fingerprint(manifest: &[u8], rootfs: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(manifest);
    hasher.update(rootfs);
    format!("{:x}", hasher.finalize())
}

impl LxdDriver {
    /// Make sure an alias for the instance's image exists locally, uploading
    /// it once per image reference across concurrent spawns.
    #[instrument(skip(self, ctx, instance), fields(instance = %instance.name, image = %instance.image_ref))]
    pub(crate) async fn ensure_image(&self, ctx: &RequestContext, instance: &Instance) -> Result<()> {
        let name = instance.name.as_str();
        let image_ref = instance.image_ref.as_str();
        let _guard = self
            .locks
            .acquire(&NamedLocks::image_key(image_ref))
            .await
            .map_err(|e| DriverError::io(name, e))?;

        match self.session.image_alias_get(image_ref).await {
            Ok(fingerprint) => {
                info!(%fingerprint, "Image already present");
                return Ok(());
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(DriverError::remote(name, e)),
        }

        info!("Image missing locally, downloading");
        let path = self
            .collaborators
            .image_store
            .download(ctx, image_ref)
            .await
            .map_err(|e| DriverError::collaborator(name, e))?;
        let rootfs = tokio::fs::read(&path)
            .await
            .map_err(|e| DriverError::io(name, e))?;
        let manifest =
            build_manifest(image_ref, Utc::now()).map_err(|e| DriverError::io(name, e))?;
        let fingerprint = fingerprint(&manifest, &rootfs);

        info!(%fingerprint, size = rootfs.len(), "Uploading image");
        let handle = self
            .session
            .image_upload(ImageUpload {
                fingerprint: fingerprint.clone(),
                manifest,
                rootfs,
            })
            .await
            .map_err(|e| DriverError::remote(name, e))?;
        self.tracker
            .wait_for_success(name, &handle, WaitTimeout::Infinite)
            .await?;

        self.session
            .image_alias_create(image_ref, &fingerprint)
            .await
            .map_err(|e| DriverError::remote(name, e))?;
        info!(%fingerprint, "Image alias created");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::io::Read;

    #[test]
    fn test_manifest_contains_metadata_yaml() {
        let created = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let manifest = build_manifest("ubuntu-22.04", created).unwrap();

        let mut archive = tar::Archive::new(manifest.as_slice());
        let mut entries = archive.entries().unwrap();
        let mut entry = entries.next().unwrap().unwrap();
        assert_eq!(entry.path().unwrap().to_str(), Some("metadata.yaml"));

        let mut yaml = String::new();
        entry.read_to_string(&mut yaml).unwrap();
        let parsed: serde_yaml::Value = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed["creation_date"].as_i64(), Some(created.timestamp()));
        assert_eq!(parsed["properties"]["description"].as_str(), Some("ubuntu-22.04"));
        assert!(entries.next().is_none());
    }

    #[test]
    fn test_manifest_is_stable_for_same_input() {
        let created = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(
            build_manifest("img", created).unwrap(),
            build_manifest("img", created).unwrap()
        );
    }

    #[test]
    fn test_fingerprint_covers_manifest_then_rootfs() {
        let whole = Sha256::digest(b"manifestrootfs");
        assert_eq!(fingerprint(b"manifest", b"rootfs"), format!("{whole:x}"));
        assert_ne!(
            fingerprint(b"manifest", b"rootfs"),
            fingerprint(b"rootfs", b"manifest")
        );
        assert_eq!(fingerprint(b"", b"").len(), 64);
    }
}
