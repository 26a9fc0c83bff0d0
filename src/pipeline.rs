//! Fan-out enumeration: registries → repositories → tags → images. Every level
//! spawns a task per item and merges results into one channel; failures are
//! surfaced as [`ImageMeta`] records with the error set, so the stream itself
//! never breaks.

use anyhow::anyhow;
use std::sync::Arc;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::task::JoinSet;

use crate::image::{ImageMeta, Manifest};
use crate::notifier::Notifier;
use crate::registry::RegistryClient;
use crate::retry::{self, with_backoff, FETCH_ATTEMPTS, FETCH_BASE_DELAY};
use crate::wordlist::BruteForceConfig;

const CHANNEL_CAPACITY: usize = 32;

/// Enumerates every image reachable from the given registries. Repositories
/// and tags are listed from the registry APIs when the corresponding lists are
/// empty. The returned stream ends once every enumeration task has finished;
/// output order is unspecified.
pub fn enumerate_registries(
    client: Arc<RegistryClient>,
    notifier: Arc<Notifier>,
    registries: Vec<String>,
    repositories: Vec<String>,
    tags: Vec<String>,
) -> Receiver<ImageMeta> {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);

    tokio::spawn(async move {
        if registries.is_empty() {
            let _ = tx
                .send(ImageMeta::from_error(anyhow!("no registries supplied")))
                .await;
            return;
        }

        let mut tasks = JoinSet::new();
        for registry in registries {
            tasks.spawn(enumerate_registry(
                client.clone(),
                notifier.clone(),
                registry,
                repositories.clone(),
                tags.clone(),
                tx.clone(),
            ));
        }
        while tasks.join_next().await.is_some() {}
    });

    rx
}

async fn enumerate_registry(
    client: Arc<RegistryClient>,
    notifier: Arc<Notifier>,
    registry: String,
    mut repositories: Vec<String>,
    tags: Vec<String>,
    tx: Sender<ImageMeta>,
) {
    notifier.info(&format!("Enumerating registry {registry}"));

    if repositories.is_empty() {
        match client.catalog(&registry).await {
            Ok(listed) => repositories = listed,
            Err(error) => {
                if retry::is_fatal_connection_error(&error) {
                    notifier.fatal(&format!("cannot reach registry {registry}: {error:#}"));
                }
                notifier.warn(&format!("catalog listing failed for {registry}: {error:#}"));
                notifier.warn("Catalog API not available, falling back to brute-force enumeration");
                repositories = brute_force_repositories(&client, &registry).await;
            }
        }
    }

    let mut tasks = JoinSet::new();
    for repository in repositories {
        tasks.spawn(enumerate_repository(
            client.clone(),
            notifier.clone(),
            registry.clone(),
            repository,
            tags.clone(),
            tx.clone(),
        ));
    }
    while tasks.join_next().await.is_some() {}
}

async fn enumerate_repository(
    client: Arc<RegistryClient>,
    notifier: Arc<Notifier>,
    registry: String,
    repository: String,
    mut tags: Vec<String>,
    tx: Sender<ImageMeta>,
) {
    log::debug!("Repository {registry}/{repository}");

    if tags.is_empty() {
        match client.list_tags(&registry, &repository).await {
            Ok(listed) => tags = listed,
            Err(error) => {
                if retry::is_fatal_connection_error(&error) {
                    notifier.fatal(&format!(
                        "cannot reach registry for {registry}/{repository}: {error:#}"
                    ));
                }
                notifier.warn(&format!(
                    "listing tags for {registry}/{repository} failed: {error:#}"
                ));
                let mut meta = ImageMeta::new(&registry, &repository, "");
                meta.reference = format!("{registry}/{repository}");
                meta.error = Some(format!("{error:#}"));
                let _ = tx.send(meta).await;
                return;
            }
        }
    }

    let mut tasks = JoinSet::new();
    for tag in tags {
        let client = client.clone();
        let notifier = notifier.clone();
        let registry = registry.clone();
        let repository = repository.clone();
        let tx = tx.clone();
        tasks.spawn(async move {
            let image = fetch_image(&client, &notifier, &registry, &repository, &tag).await;
            let _ = tx.send(image).await;
        });
    }
    while tasks.join_next().await.is_some() {}
}

/// Probes the embedded name list against the manifest endpoint and keeps the
/// repositories that answer.
async fn brute_force_repositories(client: &RegistryClient, registry: &str) -> Vec<String> {
    let config = match BruteForceConfig::embedded() {
        Ok(config) => config,
        Err(error) => {
            log::warn!("brute-force list unavailable: {error:#}");
            return Vec::new();
        }
    };

    let mut found = Vec::new();
    for candidate in config.candidates() {
        if client.probe_manifest(registry, &candidate).await {
            log::info!("brute-force hit: {registry}/{candidate}");
            found.push(candidate);
        }
    }
    found
}

/// Retrieves manifest and config for one `(registry, repository, tag)` triple.
/// Fetches are retried with backoff; rate limiting aborts the process, and any
/// other terminal failure is recorded on the returned record.
pub async fn fetch_image(
    client: &RegistryClient,
    notifier: &Notifier,
    registry: &str,
    repository: &str,
    tag: &str,
) -> ImageMeta {
    let mut image = ImageMeta::new(registry, repository, tag);
    log::debug!("Fetching image {}", image.reference);

    let mut parsed: Option<Manifest> = None;
    let raw = with_backoff(FETCH_ATTEMPTS, FETCH_BASE_DELAY, || {
        client.fetch_manifest(registry, repository, tag)
    })
    .await;

    match raw {
        Ok(raw_manifest) => match Manifest::parse(&raw_manifest) {
            Ok(manifest) => match manifest.canonical_json() {
                Ok(canonical) => {
                    image.manifest = Some(canonical);
                    parsed = Some(manifest);
                }
                Err(error) => image.error = Some(format!("{error:#}")),
            },
            Err(error) => {
                notifier.warn(&format!(
                    "parsing manifest for {} failed: {error:#}",
                    image.reference
                ));
                image.error = Some(format!("{error:#}"));
            }
        },
        Err(error) => {
            if retry::is_rate_limited(&error) {
                notifier.fatal(&format!(
                    "rate limited while fetching {}: {error:#}",
                    image.reference
                ));
            }
            notifier.error(&format!(
                "fetching manifest for {} failed: {error:#}",
                image.reference
            ));
            image.error = Some(format!("{error:#}"));
        }
    }

    if let Some(config) = parsed.as_ref().and_then(|manifest| manifest.config.as_ref()) {
        match with_backoff(FETCH_ATTEMPTS, FETCH_BASE_DELAY, || {
            client.fetch_config(registry, repository, tag, config)
        })
        .await
        {
            Ok(config_json) => image.config = Some(config_json),
            Err(error) => {
                if retry::is_rate_limited(&error) {
                    notifier.fatal(&format!(
                        "rate limited while fetching config for {}: {error:#}",
                        image.reference
                    ));
                }
                log::warn!(
                    "fetching config for {} failed: {error:#} (the config may be embedded in the manifest)",
                    image.reference
                );
            }
        }
    }

    image
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_registry_list_yields_single_error_record() {
        let client = Arc::new(RegistryClient::new(false, false, None).unwrap());
        let notifier = Arc::new(Notifier::new(1));

        let mut stream = enumerate_registries(client, notifier, vec![], vec![], vec![]);

        let image = stream.recv().await.expect("one record expected");
        assert!(image
            .error
            .as_deref()
            .unwrap()
            .contains("no registries supplied"));
        assert!(stream.recv().await.is_none());
    }
}
