use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use oci_pillage::hashindex::HashIndex;
use oci_pillage::image::{image_hash, ImageMeta};
use oci_pillage::notifier::Notifier;
use oci_pillage::pipeline;
use oci_pillage::processor::ImageProcessor;
use oci_pillage::registry::RegistryClient;
use oci_pillage::scanner;
use oci_pillage::storage::{CachePath, StorageOptions, DEFAULT_WHITEOUT_FILTER};
use oci_pillage::tarball;

#[derive(Parser)]
#[command(
    author,
    version,
    about = "Enumerate container registries and recover whiteout-deleted files from image layers",
    long_about = None
)]
struct Cli {
    #[arg(help = "Registries to scan, or a path to a local 'docker save' tarball")]
    registries: Vec<String>,

    #[arg(
        short,
        long,
        value_delimiter = ',',
        help = "Repositories to scan. If blank, uses the registry's catalog API"
    )]
    repos: Vec<String>,

    #[arg(
        short,
        long,
        value_delimiter = ',',
        help = "Tags to scan per repository. If blank, uses the tags API"
    )]
    tags: Vec<String>,

    #[arg(short, long, help = "Path to a local image tarball to scan")]
    local: Option<PathBuf>,

    #[arg(short, long, default_value = ".", help = "Directory to store output")]
    output: PathBuf,

    #[arg(short = 's', long, help = "Download and store image filesystems")]
    store_images: bool,

    #[arg(
        short,
        long,
        default_value = ".",
        help = "Path to cache image layers ('.' selects a temporary directory)"
    )]
    cache: String,

    #[arg(long, help = "Persist raw layer tarballs instead of streaming them")]
    store_tarballs: bool,

    #[arg(short = 'x', long, help = "Scan image contents with TruffleHog")]
    trufflehog: bool,

    #[arg(short, long, help = "Look for deleted/whiteout files in image layers")]
    whiteout: bool,

    #[arg(
        long,
        value_delimiter = ',',
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = DEFAULT_WHITEOUT_FILTER,
        help = "Filter patterns when extracting whiteouts, e.g. --whiteout-filter=tmp,apk (defaults to the built-in noise list)"
    )]
    whiteout_filter: Vec<String>,

    #[arg(long, help = "Skip layers larger than this many bytes")]
    filter_small: Option<u64>,

    #[arg(short, long, help = "Enable all analysis options (very noisy)")]
    all: bool,

    #[arg(short = 'k', long, help = "Disable TLS verification")]
    skip_tls: bool,

    #[arg(short, long, help = "Use HTTP instead of HTTPS")]
    insecure: bool,

    #[arg(long, help = "Registry bearer token or password")]
    token: Option<String>,

    #[arg(long, help = "Username for token auth (default 'pillage' if omitted)")]
    username: Option<String>,

    #[arg(long, default_value_t = 8, help = "Number of concurrent store workers")]
    workers: usize,

    #[arg(
        short = 'v',
        long,
        action = clap::ArgAction::Count,
        help = "Verbose mode (-v for info, -vv for debug, -vvv for trace)"
    )]
    verbose: u8,
}

/// Applies the implicit behavior between flag combinations.
fn normalize(cli: &mut Cli) {
    if cli.all && !cli.trufflehog && !cli.whiteout {
        cli.trufflehog = true;
        cli.whiteout = true;
    }
    if !cli.whiteout_filter.is_empty() {
        cli.whiteout = true;
    }
    if (cli.cache != "." || cli.trufflehog || cli.whiteout) && !cli.store_images {
        cli.store_images = true;
    }

    // repo:tag entries double as tag requests
    let mut extra_tags = Vec::new();
    for repo in &mut cli.repos {
        if let Some((name, tag)) = repo.split_once(':') {
            extra_tags.push(tag.to_string());
            *repo = name.to_string();
        }
    }
    cli.tags.extend(extra_tags);

    if cli.local.is_none()
        && cli
            .registries
            .first()
            .map(|first| is_tarball_path(first))
            .unwrap_or(false)
    {
        cli.local = Some(PathBuf::from(cli.registries.remove(0)));
    }
}

fn is_tarball_path(path: &str) -> bool {
    const TAR_EXTENSIONS: [&str; 7] = [
        ".tar", ".tar.gz", ".tgz", ".tar.bz2", ".tbz2", ".tar.xz", ".txz",
    ];
    let lower = path.to_ascii_lowercase();
    TAR_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut cli = Cli::parse();
    normalize(&mut cli);

    let notifier = Arc::new(Notifier::new(cli.verbose));

    if cli.registries.is_empty() && cli.local.is_none() {
        bail!("no registries or local tarball supplied; run with --help for usage");
    }

    let credentials = cli.token.as_ref().map(|token| {
        let username = cli.username.clone().unwrap_or_else(|| {
            notifier.warn("--token provided without --username; using 'pillage'");
            "pillage".to_string()
        });
        (username, token.clone())
    });

    let client = Arc::new(RegistryClient::new(cli.insecure, cli.skip_tls, credentials)?);

    let options = StorageOptions {
        cache: CachePath::from_flag(&cli.cache),
        output_path: cli.output.clone(),
        store_images: cli.store_images,
        whiteout: cli.whiteout,
        whiteout_filter: cli.whiteout_filter.clone(),
        store_tarballs: cli.store_tarballs,
        filter_small: cli.filter_small,
    };

    std::fs::create_dir_all(&cli.output)
        .with_context(|| format!("failed to create output directory {}", cli.output.display()))?;
    let index = HashIndex::load(&cli.output.join("scanned_shas.log"))
        .context("failed to init hash index")?;

    let processor = Arc::new(ImageProcessor::new(
        client.clone(),
        notifier.clone(),
        options,
    ));

    let mut images = if let Some(local) = &cli.local {
        tarball::validate_tarball(local)
            .with_context(|| format!("invalid tarball {}", local.display()))?;
        let metas = tarball::read_tarball(local)?;
        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(async move {
            for meta in metas {
                if tx.send(meta).await.is_err() {
                    break;
                }
            }
        });
        rx
    } else {
        pipeline::enumerate_registries(
            client.clone(),
            notifier.clone(),
            cli.registries.clone(),
            cli.repos.clone(),
            cli.tags.clone(),
        )
    };

    let scan_secrets = cli.trufflehog && scanner::trufflehog_installed();
    if cli.trufflehog && !scan_secrets {
        notifier.warn("trufflehog not found in PATH; skipping secret scans");
    }

    let store_work = cli.store_images || cli.whiteout;
    let semaphore = Arc::new(Semaphore::new(cli.workers.max(1)));
    let mut workers = JoinSet::new();
    let mut summaries: Vec<ImageMeta> = Vec::new();

    while let Some(image) = images.recv().await {
        if let Some(fingerprint) = image_hash(&image) {
            match index.add_if_missing(&fingerprint) {
                Ok(true) => {
                    notifier.info(&format!("Skipping already scanned image {}", image.reference));
                    continue;
                }
                Ok(false) => {}
                Err(error) => notifier.warn(&format!("failed recording fingerprint: {error:#}")),
            }
        }

        if scan_secrets {
            let reference = image.reference.clone();
            tokio::task::spawn_blocking(move || {
                if let Err(error) = scanner::run_trufflehog(&reference) {
                    log::warn!("trufflehog failed for {reference}: {error:#}");
                }
            });
        }

        if store_work {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .expect("semaphore closed");
            let processor = processor.clone();
            let notifier = notifier.clone();
            workers.spawn(async move {
                let _permit = permit;
                if let Err(error) = processor.store(&image).await {
                    notifier.warn(&format!("failed storing {}: {error:#}", image.reference));
                }
            });
        } else {
            summaries.push(image);
        }
    }

    while workers.join_next().await.is_some() {}
    notifier.finish_spinner();

    if !summaries.is_empty() {
        println!("{}", serde_json::to_string_pretty(&summaries)?);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        let mut cli = Cli::parse_from(args);
        normalize(&mut cli);
        cli
    }

    #[test]
    fn test_is_tarball_path() {
        assert!(is_tarball_path("image.tar"));
        assert!(is_tarball_path("/tmp/Saved.TAR.GZ"));
        assert!(is_tarball_path("bundle.tgz"));
        assert!(!is_tarball_path("registry.example.com"));
        assert!(!is_tarball_path("127.0.0.1:5000"));
    }

    #[test]
    fn test_normalize_splits_repo_tags() {
        let cli = parse(&["oci-pillage", "registry.example.com", "-r", "team/app:v1"]);
        assert_eq!(cli.repos, vec!["team/app"]);
        assert_eq!(cli.tags, vec!["v1"]);
    }

    #[test]
    fn test_normalize_flag_implications() {
        let cli = parse(&[
            "oci-pillage",
            "registry.example.com",
            "--whiteout-filter=tmp,cache",
        ]);
        assert!(cli.whiteout);
        assert!(cli.store_images);

        let cli = parse(&["oci-pillage", "registry.example.com", "-a"]);
        assert!(cli.whiteout);
        assert!(cli.trufflehog);
        assert!(cli.store_images);
    }

    #[test]
    fn test_positional_tarball_becomes_local_source() {
        let cli = parse(&["oci-pillage", "/tmp/saved-image.tar"]);
        assert_eq!(cli.local, Some(PathBuf::from("/tmp/saved-image.tar")));
        assert!(cli.registries.is_empty());
    }

    #[test]
    fn test_default_missing_whiteout_filter_value() {
        let cli = parse(&[
            "oci-pillage",
            "registry.example.com",
            "--whiteout-filter",
        ]);
        assert!(cli.whiteout);
        assert!(cli.whiteout_filter.iter().any(|p| p == "tmp"));
        assert!(cli
            .whiteout_filter
            .iter()
            .any(|p| p == "*/tmp/downloaded_packages/**"));
    }
}
