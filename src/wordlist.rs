//! Embedded repository name list used for brute-force enumeration when a
//! registry refuses to serve its catalog.

use anyhow::{Context, Result};
use serde::Deserialize;

const DEFAULT_CONFIG: &str = include_str!("default_config.json");

#[derive(Debug, Clone, Deserialize)]
pub struct BruteForceConfig {
    pub repos: Vec<String>,
    pub names: Vec<String>,
}

impl BruteForceConfig {
    pub fn embedded() -> Result<Self> {
        serde_json::from_str(DEFAULT_CONFIG).context("parsing embedded brute-force name list")
    }

    /// Every `prefix/name` combination to probe, in list order. An empty
    /// prefix yields the bare name.
    pub fn candidates(&self) -> impl Iterator<Item = String> + '_ {
        self.repos.iter().flat_map(move |prefix| {
            self.names.iter().map(move |name| {
                if prefix.is_empty() {
                    name.clone()
                } else {
                    format!("{prefix}/{name}")
                }
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedded_config_parses() {
        let config = BruteForceConfig::embedded().unwrap();
        assert!(!config.repos.is_empty());
        assert!(!config.names.is_empty());
    }

    #[test]
    fn test_candidates_include_bare_and_prefixed_names() {
        let config = BruteForceConfig {
            repos: vec!["".to_string(), "library".to_string()],
            names: vec!["nginx".to_string(), "redis".to_string()],
        };
        let candidates: Vec<String> = config.candidates().collect();
        assert_eq!(
            candidates,
            vec!["nginx", "redis", "library/nginx", "library/redis"]
        );
    }
}
