//! Layer replay and whiteout reconstruction. Layers are replayed strictly in
//! manifest order; every file version observed along the way is spilled to a
//! per-image scratch directory, and when a later layer whites a path out, the
//! most recent prior version is written back to the results tree.

use anyhow::{anyhow, Context, Result};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tar::EntryType;
use tokio::io::AsyncWriteExt;
use tokio::task;

use crate::image::{Descriptor, ImageMeta, Manifest};
use crate::notifier::Notifier;
use crate::registry::RegistryClient;
use crate::retry;
use crate::storage::{self, FilterRule, StorageOptions};
use crate::tarball;

/// One observed version of a path during layer replay. Contents live in a
/// scratch file, not in memory, so large images stay bounded.
#[derive(Debug)]
struct FileVersion {
    layer_index: usize,
    content: PathBuf,
    size: u64,
    entry_type: EntryType,
}

type VersionMap = HashMap<String, Vec<FileVersion>>;

pub struct ImageProcessor {
    client: Arc<RegistryClient>,
    notifier: Arc<Notifier>,
    options: StorageOptions,
}

impl ImageProcessor {
    pub fn new(
        client: Arc<RegistryClient>,
        notifier: Arc<Notifier>,
        options: StorageOptions,
    ) -> Self {
        Self {
            client,
            notifier,
            options,
        }
    }

    /// Processes one enumerated image: records enumeration errors, downloads
    /// layers when storage is enabled, and replays them for whiteout
    /// reconstruction. Per-layer failures are logged and skipped; only scratch
    /// setup and manifest parse failures abort the image.
    pub async fn store(&self, image: &ImageMeta) -> Result<()> {
        self.notifier
            .info(&format!("Storing results for image: {}", image.reference));

        let (cache_dir, _cache_guard) = self.options.image_cache_dir(image)?;

        if let Some(error) = &image.error {
            let error_path = cache_dir.join("errors.log");
            fs::write(&error_path, error)
                .with_context(|| format!("failed to write {}", error_path.display()))?;
            log::debug!(
                "recorded enumeration error for {} at {}",
                image.reference,
                error_path.display()
            );
            return Ok(());
        }

        if !self.options.store_images {
            return Ok(());
        }

        let scratch = ScratchDir::create(cache_dir.join(".scratch"))?;
        let scratch_files = scratch.path().join("files");
        fs::create_dir_all(&scratch_files)
            .with_context(|| format!("failed to create {}", scratch_files.display()))?;

        let mut replay = LayerReplay {
            versions: VersionMap::new(),
            scratch_files,
            sequence: 0,
            results_dir: self.options.results_dir(image),
            results_ready: false,
            filters: storage::compile_filters(&self.options.whiteout_filter),
            restored: 0,
        };

        if let Some(handle) = &image.layer_handle {
            // Tarball-backed image: layers are already on disk.
            for index in 1..=handle.layer_count() {
                let Some(layer_path) = handle.layer_path(index - 1) else {
                    continue;
                };
                if self.skip_small_file(&layer_path) {
                    log::debug!("skipping large layer {}", layer_path.display());
                    continue;
                }
                if self.options.store_tarballs {
                    let layer_dir = cache_dir.join(format!("layer-{index}"));
                    let persisted = fs::create_dir_all(&layer_dir)
                        .map_err(anyhow::Error::from)
                        .and_then(|_| {
                            fs::copy(&layer_path, layer_dir.join("filesystem.tar"))
                                .map_err(anyhow::Error::from)
                        });
                    if let Err(error) = persisted {
                        log::warn!(
                            "failed to persist layer {}: {error:#}",
                            layer_path.display()
                        );
                    }
                }
                if self.options.whiteout {
                    replay = self
                        .replay_layer(replay, layer_path, index, &image.reference)
                        .await?;
                }
            }
        } else {
            let Some(manifest_json) = &image.manifest else {
                log::debug!("{} has no manifest, nothing to store", image.reference);
                return Ok(());
            };
            let manifest = Manifest::parse(manifest_json)
                .with_context(|| format!("parsing manifest for {}", image.reference))?;

            for (position, layer) in manifest.layers.iter().enumerate() {
                let index = position + 1;
                if let Some(limit) = self.options.filter_small {
                    if layer.size > limit as i64 {
                        log::debug!(
                            "skipping large layer {} ({} bytes)",
                            layer.digest,
                            layer.size
                        );
                        continue;
                    }
                }

                let destination = if self.options.store_tarballs {
                    let layer_dir = cache_dir.join(layer.digest.replace(':', "_"));
                    if let Err(error) = fs::create_dir_all(&layer_dir) {
                        log::warn!(
                            "failed to create layer dir {}: {error}",
                            layer_dir.display()
                        );
                        continue;
                    }
                    layer_dir.join("filesystem.tar")
                } else {
                    scratch.path().join(format!("layer-{index}.tar"))
                };

                if let Err(error) = self.pull_layer(image, layer, &destination).await {
                    if retry::is_rate_limited(&error) {
                        self.notifier.fatal(&format!(
                            "rate limited while pulling layers for {}: {error:#}",
                            image.reference
                        ));
                    }
                    self.notifier.warn(&format!(
                        "failed to pull layer {} of {}: {error:#}",
                        layer.digest, image.reference
                    ));
                    continue;
                }

                if self.options.whiteout {
                    replay = self
                        .replay_layer(replay, destination.clone(), index, &image.reference)
                        .await?;
                }
                if !self.options.store_tarballs {
                    let _ = fs::remove_file(&destination);
                }
            }
        }

        if replay.restored > 0 {
            self.notifier.info(&format!(
                "{}: restored {} whiteout-deleted file(s)",
                image.reference, replay.restored
            ));
        }
        Ok(())
    }

    async fn pull_layer(
        &self,
        image: &ImageMeta,
        layer: &Descriptor,
        destination: &Path,
    ) -> Result<()> {
        log::debug!("Pulling layer {} for {}", layer.digest, image.reference);
        let mut file = tokio::fs::File::create(destination)
            .await
            .with_context(|| format!("failed to create {}", destination.display()))?;
        self.client
            .pull_layer(
                &image.registry,
                &image.repository,
                &image.tag,
                layer,
                &mut file,
            )
            .await?;
        file.flush().await?;
        Ok(())
    }

    /// The tar walk is synchronous and can be heavy; it runs on the blocking
    /// pool, taking the replay state with it and handing it back.
    async fn replay_layer(
        &self,
        replay: LayerReplay,
        layer_path: PathBuf,
        index: usize,
        reference: &str,
    ) -> Result<LayerReplay> {
        let (replay, outcome) = task::spawn_blocking(move || {
            let mut replay = replay;
            let outcome = replay.process_layer(&layer_path, index);
            (replay, outcome)
        })
        .await
        .map_err(|error| anyhow!("layer replay task failed: {error}"))?;

        if let Err(error) = outcome {
            log::warn!("{reference}: layer {index} failed: {error:#}");
        }
        Ok(replay)
    }

    fn skip_small_file(&self, path: &Path) -> bool {
        match self.options.filter_small {
            Some(limit) => fs::metadata(path)
                .map(|metadata| metadata.len() > limit)
                .unwrap_or(false),
            None => false,
        }
    }
}

/// Replay state for one image: the version map plus everything needed to write
/// reconstructions.
struct LayerReplay {
    versions: VersionMap,
    scratch_files: PathBuf,
    sequence: u64,
    results_dir: PathBuf,
    results_ready: bool,
    filters: Vec<FilterRule>,
    restored: u64,
}

impl LayerReplay {
    /// Walks one layer tarball. Whiteout entries trigger restoration of the
    /// recorded prior versions; every other entry is spilled to scratch and
    /// appended to the version map. Read errors end the layer, entry errors
    /// end the entry.
    fn process_layer(&mut self, layer_path: &Path, layer_index: usize) -> Result<()> {
        let mut archive = tarball::open_archive(layer_path)?;
        let entries = archive.entries().context("reading tar entries")?;

        for entry in entries {
            let mut entry = match entry {
                Ok(entry) => entry,
                Err(error) => {
                    log::warn!("tar read error in layer {layer_index}: {error}");
                    break;
                }
            };

            let raw_name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
            let name = normalize_entry_path(&raw_name);
            if name.is_empty() {
                continue;
            }
            let (dir, base) = split_path(&name);

            if base == ".wh..wh..opq" {
                // Opaque marker: everything previously recorded under this
                // directory is gone in later layers.
                self.restore_tree(dir, layer_index);
            } else if let Some(deleted) = base.strip_prefix(".wh.") {
                let deleted_path = if dir.is_empty() {
                    deleted.to_string()
                } else {
                    format!("{dir}/{deleted}")
                };
                self.restore_whiteout(&deleted_path, layer_index);
            } else if let Err(error) = self.record_entry(&mut entry, &name, layer_index) {
                log::warn!("failed to record {name} from layer {layer_index}: {error:#}");
            }
        }

        Ok(())
    }

    fn record_entry<R: Read>(
        &mut self,
        entry: &mut tar::Entry<'_, R>,
        name: &str,
        layer_index: usize,
    ) -> Result<()> {
        let entry_type = entry.header().entry_type();
        self.sequence += 1;
        let spill = self.scratch_files.join(format!("{:08}", self.sequence));

        let mut out = File::create(&spill)
            .with_context(|| format!("failed to create scratch file {}", spill.display()))?;
        let size = match io::copy(entry, &mut out) {
            Ok(size) => size,
            Err(error) => {
                drop(out);
                let _ = fs::remove_file(&spill);
                return Err(error).context("copying entry to scratch");
            }
        };

        self.versions
            .entry(name.to_string())
            .or_default()
            .push(FileVersion {
                layer_index,
                content: spill,
                size,
                entry_type,
            });
        Ok(())
    }

    fn restore_whiteout(&mut self, deleted_path: &str, layer_index: usize) {
        if self.versions.contains_key(deleted_path) {
            self.restore_latest(deleted_path, layer_index);
        } else {
            log::debug!("whiteout for {deleted_path} has no recorded prior version");
        }
        // Directory whiteouts delete whole subtrees.
        self.restore_tree(deleted_path, layer_index);
    }

    fn restore_tree(&mut self, root: &str, layer_index: usize) {
        let prefix = if root.is_empty() {
            String::new()
        } else {
            format!("{root}/")
        };
        let children: Vec<String> = self
            .versions
            .keys()
            .filter(|path| path.starts_with(&prefix) && path.as_str() != root)
            .cloned()
            .collect();
        for child in children {
            self.restore_latest(&child, layer_index);
        }
    }

    fn restore_latest(&mut self, path: &str, layer_index: usize) {
        let Some(version) = self.versions.get(path).and_then(|versions| versions.last()) else {
            return;
        };

        if storage::is_filtered(path, &self.filters) {
            log::debug!("skipping filtered whiteout path {path}");
            return;
        }
        if version.entry_type.is_file() && version.size == 0 {
            log::debug!("skipping empty restoration for {path}");
            return;
        }

        let content = version.content.clone();
        let observed_at = version.layer_index;
        match self.write_restoration(path, &content, layer_index) {
            Ok(destination) => {
                self.restored += 1;
                log::info!(
                    "Restored {path} (last seen in layer {observed_at}, deleted in layer {layer_index}) to {}",
                    destination.display()
                );
            }
            Err(error) => log::warn!("failed to restore {path}: {error:#}"),
        }
    }

    /// Writes one reconstruction as `<results>/<cleaned path>.<deleting layer>`.
    /// The results directory is created on first use so error-only runs leave
    /// no empty trees behind.
    fn write_restoration(
        &mut self,
        path: &str,
        content: &Path,
        layer_index: usize,
    ) -> Result<PathBuf> {
        if !self.results_ready {
            fs::create_dir_all(&self.results_dir).with_context(|| {
                format!("failed to create results dir {}", self.results_dir.display())
            })?;
            self.results_ready = true;
        }

        let sanitized = storage::join_under(&self.results_dir, [path]);
        let file_name = sanitized
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("file");
        let destination = sanitized.with_file_name(format!("{file_name}.{layer_index}"));

        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        fs::copy(content, &destination)
            .with_context(|| format!("failed to write {}", destination.display()))?;
        Ok(destination)
    }
}

/// Per-image scratch directory, recursively removed on every exit path.
struct ScratchDir {
    path: PathBuf,
}

impl ScratchDir {
    fn create(path: PathBuf) -> Result<Self> {
        fs::create_dir_all(&path)
            .with_context(|| format!("failed to create scratch dir {}", path.display()))?;
        Ok(Self { path })
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.path);
    }
}

/// Slash-separated entry name with leading separators stripped, trailing
/// separators removed so directory entries compare equal to their paths.
fn normalize_entry_path(raw: &str) -> String {
    let mut name = raw.trim_start_matches('/');
    if let Some(stripped) = name.strip_prefix("./") {
        name = stripped;
    }
    name.trim_end_matches('/').to_string()
}

fn split_path(name: &str) -> (&str, &str) {
    match name.rsplit_once('/') {
        Some((dir, base)) => (dir, base),
        None => ("", name),
    }
}
