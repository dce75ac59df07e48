// Immutable output of a code build, consumed by every runner start.

use crate::constants::artifact::ARCHIVE_BLOB;
use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;

/// A top-level callable discovered in the user's source.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Export {
    pub symbol: String,
    pub file: String,
    pub line: u32,
}

impl Export {
    /// `file:symbol`, the form used to name entry points.
    pub fn entry_point(&self) -> String {
        format!("{}:{}", self.file, self.symbol)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildArtifact {
    #[serde(with = "blob_map")]
    pub blobs: BTreeMap<String, Vec<u8>>,
    pub exports: Vec<Export>,
}

impl BuildArtifact {
    /// The packed source tree.
    pub fn archive(&self) -> Option<&[u8]> {
        self.blobs.get(ARCHIVE_BLOB).map(Vec::as_slice)
    }

    /// Lowercase hex SHA-256 of the archive blob.
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.archive().unwrap_or_default());
        hex::encode(hasher.finalize())
    }

    pub fn has_entry_point(&self, entry_point: &str) -> bool {
        self.exports.iter().any(|e| e.entry_point() == entry_point)
    }

    /// Unpack the archive into `dest`, which must already exist.
    pub fn extract_archive(&self, dest: &Path) -> Result<()> {
        let archive = self
            .archive()
            .with_context(|| format!("build artifact has no '{ARCHIVE_BLOB}' blob"))?;
        let decoder = GzDecoder::new(archive);
        let mut tar = tar::Archive::new(decoder);
        tar.set_preserve_mtime(false);
        tar.unpack(dest)
            .with_context(|| format!("failed to extract build archive into {}", dest.display()))?;
        Ok(())
    }
}

mod blob_map {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<S: Serializer>(
        blobs: &BTreeMap<String, Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        blobs
            .iter()
            .map(|(k, v)| (k.as_str(), STANDARD.encode(v)))
            .collect::<BTreeMap<_, _>>()
            .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<String, Vec<u8>>, D::Error> {
        BTreeMap::<String, String>::deserialize(deserializer)?
            .into_iter()
            .map(|(k, v)| {
                STANDARD
                    .decode(v.as_bytes())
                    .map(|bytes| (k, bytes))
                    .map_err(serde::de::Error::custom)
            })
            .collect()
    }
}
