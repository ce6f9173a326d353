//! Artifact downloads and tar bundles.
//!
//! Private keys leave the store only with an explicit [`DownloadCapability`];
//! revoked entities have nothing to download.

use std::fs;
use std::io::Write;
use std::path::PathBuf;
use tar::{Builder, Header};
use tracing::{info, warn};

use crate::error::{PkiError, PkiResult};
use crate::models::{Entity, EntityKind};
use crate::paths::{ArtifactKind, ArtifactPaths};

/// What the caller may take out of the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DownloadCapability {
    pub private_key: bool,
}

impl DownloadCapability {
    pub fn with_private_key() -> Self {
        Self { private_key: true }
    }
}

fn ensure_downloadable(entity: &Entity) -> PkiResult<()> {
    if entity.is_active() {
        Ok(())
    } else {
        Err(PkiError::consistency(format!(
            "'{}' is revoked; its artifacts are not available",
            entity.name()
        )))
    }
}

/// Resolve one artifact for download.
pub fn artifact_path(
    entity: &Entity,
    paths: &ArtifactPaths,
    kind: ArtifactKind,
    capability: DownloadCapability,
) -> PkiResult<PathBuf> {
    ensure_downloadable(entity)?;
    if kind == ArtifactKind::Key && !capability.private_key {
        return Err(PkiError::Authorization {
            entity: entity.name().to_string(),
        });
    }
    let path = paths
        .artifact(kind)
        .filter(|path| path.exists())
        .ok_or_else(|| PkiError::not_found(format!("{:?} artifact of", kind), entity.name()))?;
    Ok(path.to_path_buf())
}

/// Archive the entity's artifacts under `PKI_DATA_<name>/` into `out`.
///
/// Returns the archived entry names. The private key is skipped without the
/// capability; artifacts that were never produced are skipped as well.
pub fn write_bundle<W: Write>(
    entity: &Entity,
    paths: &ArtifactPaths,
    capability: DownloadCapability,
    out: W,
) -> PkiResult<Vec<String>> {
    ensure_downloadable(entity)?;
    let mut kinds = vec![
        ArtifactKind::Certificate,
        ArtifactKind::Chain,
        ArtifactKind::Csr,
        ArtifactKind::Der,
        ArtifactKind::Pkcs12,
    ];
    if entity.kind() == EntityKind::Authority {
        kinds.push(ArtifactKind::Crl);
    }
    if capability.private_key {
        kinds.push(ArtifactKind::Key);
    } else {
        info!(entity = %entity.name(), "private key excluded from bundle");
    }

    let prefix = format!("PKI_DATA_{}", entity.name());
    let mut builder = Builder::new(out);
    let mut entries = Vec::new();
    for kind in kinds {
        let Some(path) = paths.artifact(kind).filter(|path| path.exists()) else {
            continue;
        };
        let Some(file_name) = path.file_name() else {
            warn!(path = %path.display(), "artifact without a file name");
            continue;
        };
        let data = fs::read(path)?;
        let entry_name = format!("{}/{}", prefix, file_name.to_string_lossy());
        let mut header = Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(if kind == ArtifactKind::Key { 0o400 } else { 0o644 });
        header.set_cksum();
        builder.append_data(&mut header, &entry_name, &data[..])?;
        entries.push(entry_name);
    }
    builder.into_inner()?.flush()?;
    info!(entity = %entity.name(), files = entries.len(), "bundle written");
    Ok(entries)
}
