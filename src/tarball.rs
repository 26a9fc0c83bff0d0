//! Local `docker save` tarballs as an alternative image source. The archive is
//! extracted once into a temporary directory; every image found in its
//! `manifest.json` carries a shared handle back to the extracted layers so the
//! layer processor never refetches anything.

use anyhow::{bail, Context, Result};
use flate2::read::GzDecoder;
use oci_client::Reference;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tar::Archive;
use tempfile::TempDir;

use crate::image::ImageMeta;
use crate::storage::join_under;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// One entry of a `docker save` manifest.json index.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ManifestEntry {
    #[serde(rename = "Config")]
    config: String,
    #[serde(rename = "RepoTags", default)]
    repo_tags: Vec<String>,
    #[serde(rename = "Layers", default)]
    layers: Vec<String>,
}

/// Handle to an extracted `docker save` archive. Layer paths are resolved
/// lazily against the extraction directory, which lives as long as any image
/// from the archive does.
#[derive(Debug)]
pub struct TarballImage {
    extract_dir: PathBuf,
    layers: Vec<String>,
    _extract_guard: Arc<TempDir>,
}

impl TarballImage {
    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    /// Absolute path of the layer tarball at `index` (0-based, manifest order).
    pub fn layer_path(&self, index: usize) -> Option<PathBuf> {
        self.layers
            .get(index)
            .map(|relative| join_under(&self.extract_dir, [relative.as_str()]))
    }
}

/// Opens a tar archive, sniffing the two-byte gzip magic first so plain and
/// gzipped streams are handled uniformly. The file is reopened after the peek
/// so the tar reader sees the stream from the start.
pub(crate) fn open_archive(path: &Path) -> Result<Archive<Box<dyn Read>>> {
    let mut file =
        File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut magic = [0u8; 2];
    let gzipped = file
        .read_exact(&mut magic)
        .map(|_| magic == GZIP_MAGIC)
        .unwrap_or(false);

    let file = File::open(path)?;
    let reader: Box<dyn Read> = if gzipped {
        Box::new(GzDecoder::new(BufReader::new(file)))
    } else {
        Box::new(BufReader::new(file))
    };
    Ok(Archive::new(reader))
}

/// Cheap precondition check before committing to a full extraction: the input
/// must yield at least one readable tar entry.
pub fn validate_tarball(path: &Path) -> Result<()> {
    let mut archive = open_archive(path)?;
    let mut entries = archive
        .entries()
        .with_context(|| format!("{} is not a readable tar archive", path.display()))?;
    match entries.next() {
        Some(Ok(_)) => Ok(()),
        Some(Err(error)) => {
            Err(error).with_context(|| format!("{} is not a tar archive", path.display()))
        }
        None => bail!("{} contains no tar entries", path.display()),
    }
}

/// Reads a `docker save` archive and produces one [`ImageMeta`] per repo tag,
/// with manifest and config taken from the in-archive blobs.
pub fn read_tarball(path: &Path) -> Result<Vec<ImageMeta>> {
    let temp_dir = tempfile::tempdir().context("failed to create extraction directory")?;
    let extract_dir = temp_dir.path().join("extracted");
    std::fs::create_dir_all(&extract_dir)?;

    let mut archive = open_archive(path)?;
    archive
        .unpack(&extract_dir)
        .with_context(|| format!("failed to extract {}", path.display()))?;

    let manifest_path = extract_dir.join("manifest.json");
    if !manifest_path.exists() {
        bail!(
            "manifest.json not found in {}: not a docker save archive",
            path.display()
        );
    }
    let manifest_content =
        std::fs::read_to_string(&manifest_path).context("failed to read manifest.json")?;
    let entries: Vec<ManifestEntry> =
        serde_json::from_str(&manifest_content).context("failed to parse manifest.json")?;

    let extract_guard = Arc::new(temp_dir);
    let mut images = Vec::new();

    for entry in entries {
        let manifest_json = serde_json::to_string_pretty(&entry)
            .context("failed to serialize manifest entry")?;

        let config_path = join_under(&extract_dir, [entry.config.as_str()]);
        let config_json = match std::fs::read_to_string(&config_path) {
            Ok(config) => Some(config),
            Err(error) => {
                log::warn!(
                    "failed to read config {} from archive: {error}",
                    entry.config
                );
                None
            }
        };

        let handle = Arc::new(TarballImage {
            extract_dir: extract_dir.clone(),
            layers: entry.layers.clone(),
            _extract_guard: extract_guard.clone(),
        });

        let repo_tags = if entry.repo_tags.is_empty() {
            // Untagged image: derive a placeholder name from the archive file
            let stem = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .unwrap_or("untagged");
            vec![format!("{stem}:latest")]
        } else {
            entry.repo_tags.clone()
        };

        for repo_tag in repo_tags {
            match Reference::try_from(repo_tag.as_str()) {
                Ok(reference) => {
                    let mut image = ImageMeta::new(
                        reference.registry(),
                        reference.repository(),
                        reference.tag().unwrap_or("latest"),
                    );
                    image.manifest = Some(manifest_json.clone());
                    image.config = config_json.clone();
                    image.layer_handle = Some(handle.clone());
                    images.push(image);
                }
                Err(error) => {
                    log::warn!("skipping unparseable repo tag {repo_tag:?}: {error}");
                }
            }
        }
    }

    Ok(images)
}
