//! Registry access. Manifest, tag, and blob operations go through the
//! `oci-client` distribution client; the catalog endpoint is not part of that
//! crate's surface, so it is spoken directly over HTTP, including the
//! `WWW-Authenticate` challenge dance.

use anyhow::{anyhow, bail, Context, Result};
use oci_client::client::{ClientConfig, ClientProtocol};
use oci_client::manifest::{self, OciDescriptor};
use oci_client::secrets::RegistryAuth;
use oci_client::{Client, Reference};
use reqwest::StatusCode;
use serde::Deserialize;
use tokio::io::AsyncWrite;

use crate::image::Descriptor;

const MANIFEST_ACCEPT: &[&str] = &[
    manifest::OCI_IMAGE_MEDIA_TYPE,
    manifest::IMAGE_MANIFEST_MEDIA_TYPE,
    manifest::OCI_IMAGE_INDEX_MEDIA_TYPE,
    manifest::IMAGE_MANIFEST_LIST_MEDIA_TYPE,
];

pub struct RegistryClient {
    client: Client,
    http: reqwest::Client,
    auth: RegistryAuth,
    credentials: Option<(String, String)>,
    insecure: bool,
}

impl RegistryClient {
    pub fn new(
        insecure: bool,
        skip_tls: bool,
        credentials: Option<(String, String)>,
    ) -> Result<Self> {
        let protocol = if insecure {
            ClientProtocol::Http
        } else {
            ClientProtocol::Https
        };
        let client = Client::new(ClientConfig {
            protocol,
            accept_invalid_certificates: skip_tls,
            ..Default::default()
        });

        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(skip_tls)
            .build()
            .context("failed to build HTTP client")?;

        let auth = match &credentials {
            Some((username, password)) => RegistryAuth::Basic(username.clone(), password.clone()),
            None => RegistryAuth::Anonymous,
        };

        Ok(Self {
            client,
            http,
            auth,
            credentials,
            insecure,
        })
    }

    fn scheme(&self) -> &'static str {
        if self.insecure {
            "http"
        } else {
            "https"
        }
    }

    fn reference(&self, registry: &str, repository: &str, tag: &str) -> Reference {
        Reference::with_tag(registry.to_string(), repository.to_string(), tag.to_string())
    }

    /// Lists repositories via `/v2/_catalog`. Many registries disable this
    /// endpoint; callers fall back to brute-force enumeration on failure.
    pub async fn catalog(&self, registry: &str) -> Result<Vec<String>> {
        let url = format!("{}://{}/v2/_catalog?n=1000", self.scheme(), registry);
        let mut response = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("catalog request to {registry} failed"))?;

        if response.status() == StatusCode::UNAUTHORIZED {
            let challenge = response
                .headers()
                .get(reqwest::header::WWW_AUTHENTICATE)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string);
            response = self.answer_challenge(&url, challenge.as_deref()).await?;
        }

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("catalog listing for {registry} failed with status {status}: {body}");
        }

        #[derive(Deserialize)]
        struct CatalogResponse {
            #[serde(default)]
            repositories: Vec<String>,
        }

        let parsed: CatalogResponse = response
            .json()
            .await
            .context("parsing catalog response")?;
        Ok(parsed.repositories)
    }

    pub async fn list_tags(&self, registry: &str, repository: &str) -> Result<Vec<String>> {
        let reference = self.reference(registry, repository, "latest");
        let response = self
            .client
            .list_tags(&reference, &self.auth, None, None)
            .await
            .map_err(|error| anyhow!("listing tags for {registry}/{repository}: {error}"))?;
        Ok(response.tags)
    }

    /// Fetches the raw manifest, negotiating both OCI and Docker media types.
    pub async fn fetch_manifest(
        &self,
        registry: &str,
        repository: &str,
        tag: &str,
    ) -> Result<String> {
        let reference = self.reference(registry, repository, tag);
        let (bytes, _digest) = self
            .client
            .pull_manifest_raw(&reference, &self.auth, MANIFEST_ACCEPT)
            .await
            .map_err(|error| anyhow!("fetching manifest for {reference}: {error}"))?;
        String::from_utf8(bytes).context("manifest is not valid UTF-8")
    }

    pub async fn fetch_config(
        &self,
        registry: &str,
        repository: &str,
        tag: &str,
        config: &Descriptor,
    ) -> Result<String> {
        let reference = self.reference(registry, repository, tag);
        let mut buffer = Vec::new();
        self.client
            .pull_blob(&reference, &to_oci_descriptor(config), &mut buffer)
            .await
            .map_err(|error| anyhow!("fetching config {} from {reference}: {error}", config.digest))?;
        String::from_utf8(buffer).context("image config is not valid UTF-8")
    }

    /// Streams one compressed layer blob into `out`.
    pub async fn pull_layer<W>(
        &self,
        registry: &str,
        repository: &str,
        tag: &str,
        layer: &Descriptor,
        out: &mut W,
    ) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let reference = self.reference(registry, repository, tag);
        self.client
            .pull_blob(&reference, &to_oci_descriptor(layer), out)
            .await
            .map_err(|error| anyhow!("pulling layer {} from {reference}: {error}", layer.digest))
    }

    /// Brute-force probe: a repository exists if its manifest endpoint answers.
    pub async fn probe_manifest(&self, registry: &str, repository: &str) -> bool {
        self.fetch_manifest(registry, repository, "latest").await.is_ok()
    }

    async fn answer_challenge(
        &self,
        url: &str,
        challenge: Option<&str>,
    ) -> Result<reqwest::Response> {
        let Some(challenge) = challenge else {
            bail!("UNAUTHORIZED: registry returned 401 without a WWW-Authenticate challenge");
        };

        if let Some(params) = challenge.strip_prefix("Bearer ") {
            let challenge = BearerChallenge::parse(params)?;
            let token = self.request_token(&challenge).await?;
            Ok(self.http.get(url).bearer_auth(token).send().await?)
        } else if challenge.starts_with("Basic") {
            let Some((username, password)) = &self.credentials else {
                bail!("UNAUTHORIZED: registry requires Basic authentication but no credentials were supplied");
            };
            Ok(self
                .http
                .get(url)
                .basic_auth(username, Some(password))
                .send()
                .await?)
        } else {
            bail!("unsupported authentication challenge: {challenge}");
        }
    }

    async fn request_token(&self, challenge: &BearerChallenge) -> Result<String> {
        let mut token_url =
            reqwest::Url::parse(&challenge.realm).context("invalid auth realm URL")?;
        if let Some(service) = &challenge.service {
            token_url.query_pairs_mut().append_pair("service", service);
        }
        token_url
            .query_pairs_mut()
            .append_pair("scope", "registry:catalog:*");

        let mut request = self.http.get(token_url);
        if let Some((username, password)) = &self.credentials {
            request = request.basic_auth(username, Some(password));
        }

        let response = request.send().await.context("token request failed")?;
        if !response.status().is_success() {
            bail!(
                "UNAUTHORIZED: token service rejected the request with status {}",
                response.status()
            );
        }

        #[derive(Deserialize)]
        struct TokenResponse {
            #[serde(default)]
            token: String,
            #[serde(default)]
            access_token: String,
        }

        let body: TokenResponse = response.json().await.context("parsing token response")?;
        let token = if body.token.is_empty() {
            body.access_token
        } else {
            body.token
        };
        if token.is_empty() {
            bail!("token service returned an empty token");
        }
        Ok(token)
    }
}

#[derive(Debug, PartialEq)]
struct BearerChallenge {
    realm: String,
    service: Option<String>,
}

impl BearerChallenge {
    /// Parses the parameter list of a `Bearer` challenge per the Docker
    /// Registry API v2 token specification.
    fn parse(params: &str) -> Result<Self> {
        let mut realm = None;
        let mut service = None;

        for parameter in params.split(',') {
            let Some((key, value)) = parameter.trim().split_once('=') else {
                continue;
            };
            let value = value.trim().trim_matches('"');
            match key.trim() {
                "realm" => realm = Some(value.to_string()),
                "service" => service = Some(value.to_string()),
                _ => {}
            }
        }

        Ok(Self {
            realm: realm.ok_or_else(|| anyhow!("missing realm in WWW-Authenticate header"))?,
            service,
        })
    }
}

fn to_oci_descriptor(descriptor: &Descriptor) -> OciDescriptor {
    OciDescriptor {
        digest: descriptor.digest.clone(),
        size: descriptor.size,
        media_type: descriptor.media_type.clone(),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bearer_challenge() {
        let challenge = BearerChallenge::parse(
            r#"realm="https://auth.example.com/token",service="registry.example.com",scope="registry:catalog:*""#,
        )
        .unwrap();
        assert_eq!(challenge.realm, "https://auth.example.com/token");
        assert_eq!(challenge.service.as_deref(), Some("registry.example.com"));
    }

    #[test]
    fn test_parse_bearer_challenge_without_service() {
        let challenge = BearerChallenge::parse(r#"realm="http://127.0.0.1:5000/auth""#).unwrap();
        assert_eq!(challenge.realm, "http://127.0.0.1:5000/auth");
        assert_eq!(challenge.service, None);
    }

    #[test]
    fn test_parse_bearer_challenge_requires_realm() {
        assert!(BearerChallenge::parse(r#"service="registry.example.com""#).is_err());
    }

    #[test]
    fn test_descriptor_conversion() {
        let descriptor = Descriptor {
            digest: "sha256:abc".to_string(),
            size: 42,
            media_type: "application/vnd.oci.image.layer.v1.tar+gzip".to_string(),
        };
        let oci = to_oci_descriptor(&descriptor);
        assert_eq!(oci.digest, "sha256:abc");
        assert_eq!(oci.size, 42);
        assert_eq!(oci.media_type, "application/vnd.oci.image.layer.v1.tar+gzip");
    }
}
