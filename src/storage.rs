//! Output layout, cache-path policy, and the path handling that keeps
//! registry-supplied names from escaping the output tree.

use anyhow::{Context, Result};
use glob::{MatchOptions, Pattern};
use std::path::{Component, Path, PathBuf};
use tempfile::TempDir;

use crate::image::ImageMeta;

/// Noise suppressed by default when whiteout filtering is requested without an
/// explicit pattern list: package manager staging, pip/apk/apt caches, etc.
pub const DEFAULT_WHITEOUT_FILTER: &str = "tmp,cache,apk,apt,downloaded_packages,dist-info,site-packages,mssql-tools/bin,*/tmp/downloaded_packages/**,*/wheels/**,*/site-packages/**,*/.dist-info/**,*/opt/*-tmp/**,*/usr/share/info/**,*/mssql-tools/bin/**";

/// Where layer blobs and scratch files live while an image is processed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CachePath {
    /// Allocate a temporary directory per image and remove it afterwards.
    Auto,
    /// Use the configured directory; contents are left in place.
    Path(PathBuf),
}

impl CachePath {
    /// `"."` is the historical CLI sentinel for "pick a temp dir for me".
    pub fn from_flag(flag: &str) -> Self {
        if flag.is_empty() || flag == "." {
            CachePath::Auto
        } else {
            CachePath::Path(PathBuf::from(flag))
        }
    }
}

#[derive(Debug, Clone)]
pub struct StorageOptions {
    pub cache: CachePath,
    pub output_path: PathBuf,
    pub store_images: bool,
    pub whiteout: bool,
    pub whiteout_filter: Vec<String>,
    pub store_tarballs: bool,
    /// Legacy toggle: skip layers whose manifest size exceeds this many bytes.
    pub filter_small: Option<u64>,
}

impl StorageOptions {
    /// Cache directory for one image. For [`CachePath::Auto`] the returned
    /// guard owns the directory and removes it on drop; callers must keep it
    /// alive for the duration of processing.
    pub fn image_cache_dir(&self, image: &ImageMeta) -> Result<(PathBuf, Option<TempDir>)> {
        match &self.cache {
            CachePath::Auto => {
                let temp_dir = tempfile::Builder::new()
                    .prefix("pillage-")
                    .tempdir()
                    .context("failed to create temporary cache directory")?;
                let path = temp_dir.path().to_path_buf();
                Ok((path, Some(temp_dir)))
            }
            CachePath::Path(base) => {
                let dir = join_under(
                    base,
                    [
                        image.registry.as_str(),
                        image.repository.as_str(),
                        image.tag.as_str(),
                    ],
                );
                std::fs::create_dir_all(&dir)
                    .with_context(|| format!("failed to create cache directory {}", dir.display()))?;
                Ok((dir, None))
            }
        }
    }

    /// Reconstructions for one image land under
    /// `<output>/results/<registry>/<repository>/<tag>/`.
    pub fn results_dir(&self, image: &ImageMeta) -> PathBuf {
        join_under(
            &self.output_path.join("results"),
            [
                image.registry.as_str(),
                image.repository.as_str(),
                image.tag.as_str(),
            ],
        )
    }
}

/// Joins path components after cleaning each one as if it were rooted at `/`,
/// so `..` segments in registry-supplied names cannot climb out. The result
/// always starts at the root and contains no parent references.
pub fn securejoin<I, S>(parts: I) -> PathBuf
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out = PathBuf::from("/");
    for part in parts {
        let mut cleaned = PathBuf::new();
        for component in Path::new(part.as_ref()).components() {
            match component {
                Component::Normal(segment) => cleaned.push(segment),
                Component::ParentDir => {
                    cleaned.pop();
                }
                Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
            }
        }
        out.push(cleaned);
    }
    out
}

/// `securejoin` relative to a base directory.
pub fn join_under<I, S>(base: &Path, parts: I) -> PathBuf
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let secure = securejoin(parts);
    let relative = secure.strip_prefix("/").unwrap_or(secure.as_path());
    base.join(relative)
}

/// A compiled whiteout-filter pattern. Patterns with glob metacharacters match
/// the whole slash-separated path; bare words match as substrings, which is
/// what makes the short entries in the default list (`tmp`, `cache`) useful.
#[derive(Debug, Clone)]
pub enum FilterRule {
    Glob(Pattern),
    Substring(String),
}

pub fn compile_filters(patterns: &[String]) -> Vec<FilterRule> {
    patterns
        .iter()
        .filter_map(|raw| {
            let pattern = raw.trim();
            if pattern.is_empty() {
                return None;
            }
            if pattern.contains(['*', '?', '[']) {
                match Pattern::new(pattern) {
                    Ok(glob) => Some(FilterRule::Glob(glob)),
                    Err(error) => {
                        log::warn!("ignoring invalid whiteout filter {pattern:?}: {error}");
                        None
                    }
                }
            } else {
                Some(FilterRule::Substring(pattern.to_ascii_lowercase()))
            }
        })
        .collect()
}

pub fn is_filtered(name: &str, rules: &[FilterRule]) -> bool {
    let options = MatchOptions {
        case_sensitive: false,
        require_literal_separator: true,
        require_literal_leading_dot: false,
    };
    rules.iter().any(|rule| match rule {
        FilterRule::Glob(glob) => glob.matches_with(name, options),
        FilterRule::Substring(needle) => name.to_ascii_lowercase().contains(needle.as_str()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_securejoin_basic() {
        assert_eq!(securejoin(["a", "b", "c"]), PathBuf::from("/a/b/c"));
    }

    #[test]
    fn test_securejoin_sanitizes_dotdots() {
        assert_eq!(securejoin(["a/..", "b", "c"]), PathBuf::from("/b/c"));
        assert_eq!(securejoin(["../a", "b", "c"]), PathBuf::from("/a/b/c"));
        assert_eq!(
            securejoin(["../../etc/passwd"]),
            PathBuf::from("/etc/passwd")
        );
    }

    #[test]
    fn test_securejoin_never_contains_parent_segments() {
        let joined = securejoin(["a/../../..", "..", "../../b"]);
        assert!(joined.starts_with("/"));
        assert!(!joined
            .components()
            .any(|c| matches!(c, Component::ParentDir)));
    }

    #[test]
    fn test_join_under_stays_under_base() {
        let base = Path::new("/out");
        assert_eq!(
            join_under(base, ["../../etc/passwd"]),
            PathBuf::from("/out/etc/passwd")
        );
        assert_eq!(
            join_under(base, ["reg.example.com", "team/app", "latest"]),
            PathBuf::from("/out/reg.example.com/team/app/latest")
        );
    }

    #[test]
    fn test_cache_path_sentinel() {
        assert_eq!(CachePath::from_flag("."), CachePath::Auto);
        assert_eq!(CachePath::from_flag(""), CachePath::Auto);
        assert_eq!(
            CachePath::from_flag("/var/cache/pillage"),
            CachePath::Path(PathBuf::from("/var/cache/pillage"))
        );
    }

    #[test]
    fn test_substring_filters_are_case_insensitive() {
        let rules = compile_filters(&["tmp".to_string(), "CACHE".to_string()]);
        assert!(is_filtered("var/tmp/staging/file", &rules));
        assert!(is_filtered("var/Cache/apt/archives/pkg.deb", &rules));
        assert!(!is_filtered("etc/passwd", &rules));
    }

    #[test]
    fn test_glob_filters() {
        let rules = compile_filters(&["**/tmp/downloaded_packages/**".to_string()]);
        assert!(is_filtered("tmp/downloaded_packages/pkg.deb", &rules));
        assert!(is_filtered("opt/tmp/downloaded_packages/deep/pkg.deb", &rules));
        assert!(!is_filtered("root/.aws/credentials", &rules));
    }

    #[test]
    fn test_invalid_globs_are_dropped() {
        let rules = compile_filters(&["[".to_string(), "tmp".to_string()]);
        assert_eq!(rules.len(), 1);
    }

    #[test]
    fn test_default_filter_list_compiles() {
        let patterns: Vec<String> = DEFAULT_WHITEOUT_FILTER
            .split(',')
            .map(str::to_string)
            .collect();
        let rules = compile_filters(&patterns);
        assert_eq!(rules.len(), patterns.len());
        assert!(is_filtered("usr/lib/python3/site-packages/pip/main.py", &rules));
    }
}
