//! Image metadata lookups against a container registry.
//!
//! Only the manifest and the image configuration blob are read; layers are
//! never pulled. References are given in `transport:reference` form, e.g.
//! `docker://nginx:1.25`.

use async_trait::async_trait;
use oci_spec::image::{Arch, Descriptor, ImageConfiguration, ImageIndex, ImageManifest, Os};
use reqwest::{
    header::{ACCEPT, AUTHORIZATION, WWW_AUTHENTICATE},
    StatusCode,
};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

pub const DEFAULT_TRANSPORT: &str = "docker://";

const DOCKER_HUB_DOMAIN: &str = "docker.io";
const DOCKER_HUB_REGISTRY: &str = "registry-1.docker.io";

const MANIFEST_MEDIA_TYPES: &str = "application/vnd.oci.image.index.v1+json, \
     application/vnd.docker.distribution.manifest.list.v2+json, \
     application/vnd.oci.image.manifest.v1+json, \
     application/vnd.docker.distribution.manifest.v2+json";

/// The runtime defaults baked into an image.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageInfo {
    pub entrypoint: Vec<String>,
    pub cmd: Vec<String>,
    /// Empty when the image does not configure one.
    pub working_dir: String,
}

#[derive(Debug, Error)]
pub enum InspectError {
    #[error("error parsing image source: {0}")]
    ImageSource(String),

    #[error("error parsing manifest for image: {0}")]
    Manifest(String),

    #[error("error inspecting image config: {0}")]
    Config(String),
}

/// Source of image metadata. One call per container, no caching.
#[async_trait]
pub trait ImageInspector: Send + Sync {
    async fn inspect(&self, reference: &str) -> Result<ImageInfo, InspectError>;
}

/// A normalised `docker://` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub domain: String,
    pub repository: String,
    /// A tag or a `algorithm:hex` digest.
    pub reference: String,
}

impl ImageReference {
    /// Parses `transport:reference`. Only the `docker` transport is known.
    pub fn parse(full: &str) -> Result<Self, InspectError> {
        let (transport, rest) = full.split_once(':').ok_or_else(|| {
            InspectError::ImageSource(format!(
                "invalid image name {full:?}, expected colon-separated transport:reference"
            ))
        })?;

        if transport != "docker" {
            return Err(InspectError::ImageSource(format!(
                "unsupported transport {transport:?} in {full:?}"
            )));
        }

        let name = rest.strip_prefix("//").ok_or_else(|| {
            InspectError::ImageSource(format!(
                "docker reference {rest:?} does not start with \"//\""
            ))
        })?;

        Self::parse_docker(name)
    }

    fn parse_docker(name: &str) -> Result<Self, InspectError> {
        let invalid =
            |why: &str| InspectError::ImageSource(format!("invalid reference {name:?}: {why}"));

        let (remainder, digest) = match name.split_once('@') {
            Some((remainder, digest)) => {
                if !digest.contains(':') {
                    return Err(invalid("digest must be algorithm:hex"));
                }
                (remainder, Some(digest))
            }
            None => (name, None),
        };

        let (remainder, tag) = match remainder.rfind(':') {
            Some(idx) if !remainder[idx + 1..].contains('/') => {
                (&remainder[..idx], Some(&remainder[idx + 1..]))
            }
            _ => (remainder, None),
        };

        if tag == Some("") {
            return Err(invalid("empty tag"));
        }

        let (domain, path) = match remainder.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (first, rest)
            }
            _ => (DOCKER_HUB_DOMAIN, remainder),
        };

        let domain = if domain == "index.docker.io" {
            DOCKER_HUB_DOMAIN
        } else {
            domain
        };

        let repository = if domain == DOCKER_HUB_DOMAIN && !path.contains('/') {
            format!("library/{path}")
        } else {
            path.to_string()
        };

        let valid_path = !repository.is_empty()
            && repository.split('/').all(|component| {
                !component.is_empty()
                    && component
                        .chars()
                        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "._-".contains(c))
            });
        if !valid_path {
            return Err(invalid("repository must be lowercase alphanumeric path components"));
        }

        Ok(ImageReference {
            domain: domain.to_string(),
            repository,
            reference: digest.or(tag).unwrap_or("latest").to_string(),
        })
    }

    /// Base URL of the registry's HTTP API.
    pub fn registry_url(&self) -> String {
        let host = if self.domain == DOCKER_HUB_DOMAIN {
            DOCKER_HUB_REGISTRY
        } else {
            &self.domain
        };

        let scheme = if host.starts_with("localhost") || host.starts_with("127.0.0.1") {
            "http"
        } else {
            "https"
        };

        format!("{scheme}://{host}")
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let separator = if self.reference.contains(':') { '@' } else { ':' };
        write!(
            f,
            "{}/{}{separator}{}",
            self.domain, self.repository, self.reference
        )
    }
}

/// Reads image metadata over the registry HTTP API.
#[derive(Debug, Clone, Default)]
pub struct RegistryInspector {
    client: reqwest::Client,
}

#[async_trait]
impl ImageInspector for RegistryInspector {
    async fn inspect(&self, reference: &str) -> Result<ImageInfo, InspectError> {
        let image = ImageReference::parse(reference)?;
        info!("inspecting image {image}");

        let mut session = Session {
            client: &self.client,
            base: image.registry_url(),
            repository: &image.repository,
            token: None,
        };

        let manifest = match session.manifest(&image.reference).await? {
            ManifestDocument::Image(manifest) => manifest,
            ManifestDocument::Index(index) => {
                let entry = select_platform(index.manifests()).ok_or_else(|| {
                    InspectError::Manifest(format!("image index for {image} lists no manifests"))
                })?;
                debug!("resolved {image} index to manifest {}", entry.digest());

                match session.manifest(&entry.digest().to_string()).await? {
                    ManifestDocument::Image(manifest) => manifest,
                    ManifestDocument::Index(_) => {
                        return Err(InspectError::Manifest(format!(
                            "image index for {image} points at another index"
                        )))
                    }
                }
            }
        };

        let configuration: ImageConfiguration = session
            .fetch_json(
                &format!("blobs/{}", manifest.config().digest()),
                "application/json",
            )
            .await
            .map_err(InspectError::Config)?;

        Ok(ImageInfo::from(&configuration))
    }
}

/// Per-inspection state. Holds the anonymous pull token once one was issued.
struct Session<'a> {
    client: &'a reqwest::Client,
    base: String,
    repository: &'a str,
    token: Option<String>,
}

impl Session<'_> {
    async fn manifest(&mut self, reference: &str) -> Result<ManifestDocument, InspectError> {
        self.fetch_json(&format!("manifests/{reference}"), MANIFEST_MEDIA_TYPES)
            .await
            .map_err(InspectError::Manifest)
    }

    async fn fetch_json<T: for<'de> Deserialize<'de>>(
        &mut self,
        path: &str,
        accept: &str,
    ) -> Result<T, String> {
        let url = format!("{}/v2/{}/{path}", self.base, self.repository);

        let mut response = self.send(&url, accept).await?;

        if response.status() == StatusCode::UNAUTHORIZED && self.token.is_none() {
            let challenge = response
                .headers()
                .get(WWW_AUTHENTICATE)
                .and_then(|value| value.to_str().ok())
                .and_then(BearerChallenge::parse)
                .ok_or_else(|| format!("{url}: unauthorized and no bearer challenge offered"))?;

            self.token = Some(self.anonymous_token(&challenge).await?);
            response = self.send(&url, accept).await?;
        }

        response
            .error_for_status()
            .map_err(|e| e.to_string())?
            .json()
            .await
            .map_err(|e| format!("{url}: {e}"))
    }

    async fn send(&self, url: &str, accept: &str) -> Result<reqwest::Response, String> {
        let mut request = self.client.get(url).header(ACCEPT, accept);
        if let Some(token) = &self.token {
            request = request.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        request.send().await.map_err(|e| e.to_string())
    }

    async fn anonymous_token(&self, challenge: &BearerChallenge) -> Result<String, String> {
        let scope = challenge
            .scope
            .clone()
            .unwrap_or_else(|| format!("repository:{}:pull", self.repository));

        let mut query = vec![("scope", scope)];
        if let Some(service) = &challenge.service {
            query.push(("service", service.clone()));
        }

        debug!("requesting anonymous token from {}", challenge.realm);
        let token: TokenResponse = self
            .client
            .get(&challenge.realm)
            .query(&query)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| format!("token request failed: {e}"))?
            .json()
            .await
            .map_err(|e| format!("token response: {e}"))?;

        token
            .token
            .or(token.access_token)
            .ok_or_else(|| format!("{} returned no token", challenge.realm))
    }
}

/// `WWW-Authenticate: Bearer realm="...",service="...",scope="..."`
#[derive(Debug, PartialEq, Eq)]
struct BearerChallenge {
    realm: String,
    service: Option<String>,
    scope: Option<String>,
}

impl BearerChallenge {
    fn parse(header: &str) -> Option<Self> {
        let (scheme, params) = header.trim().split_once(' ')?;
        if !scheme.eq_ignore_ascii_case("bearer") {
            return None;
        }

        let mut realm = None;
        let mut service = None;
        let mut scope = None;

        let mut rest = params.trim();
        while !rest.is_empty() {
            let (key, after) = rest.split_once('=')?;
            let (value, after) = match after.strip_prefix('"') {
                Some(quoted) => {
                    let end = quoted.find('"')?;
                    (&quoted[..end], &quoted[end + 1..])
                }
                None => after.split_once(',').unwrap_or((after, "")),
            };

            match key.trim() {
                "realm" => realm = Some(value.to_string()),
                "service" => service = Some(value.to_string()),
                "scope" => scope = Some(value.to_string()),
                _ => {}
            }

            rest = after.trim_start_matches([',', ' ']);
        }

        Some(BearerChallenge {
            realm: realm?,
            service,
            scope,
        })
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

/// What a `manifests/` endpoint returns. Schema 1 manifests match neither
/// shape and are rejected.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ManifestDocument {
    Image(ImageManifest),
    Index(ImageIndex),
}

/// Picks `linux/amd64` from an index, falling back to the first entry.
fn select_platform(entries: &[Descriptor]) -> Option<&Descriptor> {
    entries
        .iter()
        .find(|entry| {
            entry
                .platform()
                .as_ref()
                .is_some_and(|p| *p.os() == Os::Linux && *p.architecture() == Arch::Amd64)
        })
        .or_else(|| entries.first())
}

impl From<&ImageConfiguration> for ImageInfo {
    fn from(image: &ImageConfiguration) -> Self {
        let Some(config) = image.config() else {
            return ImageInfo::default();
        };

        ImageInfo {
            entrypoint: config.entrypoint().clone().unwrap_or_default(),
            cmd: config.cmd().clone().unwrap_or_default(),
            working_dir: config.working_dir().clone().unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::{
        matchers::{header, method, path, path_regex, query_param},
        Mock, MockServer, ResponseTemplate,
    };

    use super::*;

    fn parse(reference: &str) -> ImageReference {
        ImageReference::parse(reference).unwrap()
    }

    #[test]
    fn docker_hub_references_are_normalised() {
        let image = parse("docker://nginx");
        assert_eq!(image.domain, "docker.io");
        assert_eq!(image.repository, "library/nginx");
        assert_eq!(image.reference, "latest");
        assert_eq!(image.registry_url(), "https://registry-1.docker.io");

        let image = parse("docker://bitnami/redis:7.2");
        assert_eq!(image.repository, "bitnami/redis");
        assert_eq!(image.reference, "7.2");
    }

    #[test]
    fn registry_qualified_references_keep_their_domain() {
        let image = parse("docker://quay.io/prometheus/node-exporter:v1.7.0");
        assert_eq!(image.domain, "quay.io");
        assert_eq!(image.repository, "prometheus/node-exporter");
        assert_eq!(image.reference, "v1.7.0");
        assert_eq!(image.to_string(), "quay.io/prometheus/node-exporter:v1.7.0");

        let image = parse("docker://localhost:5000/app:dev");
        assert_eq!(image.domain, "localhost:5000");
        assert_eq!(image.repository, "app");
        assert_eq!(image.registry_url(), "http://localhost:5000");
    }

    #[test]
    fn digests_take_precedence_over_tags() {
        let image = parse("docker://ghcr.io/org/tool:1.0@sha256:abcdef");
        assert_eq!(image.repository, "org/tool");
        assert_eq!(image.reference, "sha256:abcdef");
        assert_eq!(image.to_string(), "ghcr.io/org/tool@sha256:abcdef");
    }

    #[test]
    fn bad_references_are_image_source_errors() {
        for reference in [
            "nginx",
            "oci:/tmp/layout",
            "docker:nginx",
            "docker://Nginx",
            "docker://nginx:",
            "docker://nginx@abc",
            "docker://registry.example.com//app",
        ] {
            assert!(
                matches!(
                    ImageReference::parse(reference),
                    Err(InspectError::ImageSource(_))
                ),
                "{reference} should not parse"
            );
        }
    }

    #[test]
    fn bearer_challenge_parsing() {
        let challenge = BearerChallenge::parse(concat!(
            r#"Bearer realm="https://auth.docker.io/token","#,
            r#"service="registry.docker.io","#,
            r#"scope="repository:library/nginx:pull""#,
        ))
        .unwrap();

        assert_eq!(
            challenge,
            BearerChallenge {
                realm: "https://auth.docker.io/token".to_string(),
                service: Some("registry.docker.io".to_string()),
                scope: Some("repository:library/nginx:pull".to_string()),
            }
        );

        assert_eq!(BearerChallenge::parse(r#"Basic realm="x""#), None);
        assert_eq!(BearerChallenge::parse(r#"Bearer service="x""#), None);
    }

    const ARM_DIGEST: &str =
        "sha256:1111111111111111111111111111111111111111111111111111111111111111";
    const AMD_DIGEST: &str =
        "sha256:2222222222222222222222222222222222222222222222222222222222222222";
    const CONFIG_DIGEST: &str =
        "sha256:3333333333333333333333333333333333333333333333333333333333333333";

    fn two_platform_index() -> serde_json::Value {
        json!({
            "schemaVersion": 2,
            "mediaType": "application/vnd.oci.image.index.v1+json",
            "manifests": [
                {
                    "mediaType": "application/vnd.oci.image.manifest.v1+json",
                    "digest": ARM_DIGEST,
                    "size": 500,
                    "platform": {"architecture": "arm64", "os": "linux"}
                },
                {
                    "mediaType": "application/vnd.oci.image.manifest.v1+json",
                    "digest": AMD_DIGEST,
                    "size": 500,
                    "platform": {"architecture": "amd64", "os": "linux"}
                }
            ]
        })
    }

    fn image_manifest() -> serde_json::Value {
        json!({
            "schemaVersion": 2,
            "mediaType": "application/vnd.oci.image.manifest.v1+json",
            "config": {
                "mediaType": "application/vnd.oci.image.config.v1+json",
                "digest": CONFIG_DIGEST,
                "size": 100
            },
            "layers": []
        })
    }

    fn image_configuration(config: serde_json::Value) -> serde_json::Value {
        json!({
            "architecture": "amd64",
            "os": "linux",
            "rootfs": {"type": "layers", "diff_ids": []},
            "config": config
        })
    }

    #[test]
    fn index_resolves_to_linux_amd64() {
        let index: ImageIndex = serde_json::from_value(two_platform_index()).unwrap();

        let entries = index.manifests();
        let digest = |entry: Option<&Descriptor>| entry.unwrap().digest().to_string();
        assert_eq!(digest(select_platform(entries)), AMD_DIGEST);
        assert_eq!(digest(select_platform(&entries[..1])), ARM_DIGEST);
        assert!(select_platform(&[]).is_none());
    }

    #[test]
    fn manifest_documents_are_told_apart() {
        let document: ManifestDocument = serde_json::from_value(image_manifest()).unwrap();
        let ManifestDocument::Image(manifest) = document else {
            panic!("expected an image manifest");
        };
        assert_eq!(manifest.config().digest().to_string(), CONFIG_DIGEST);

        let document: ManifestDocument = serde_json::from_value(two_platform_index()).unwrap();
        assert!(matches!(document, ManifestDocument::Index(_)));

        let legacy =
            serde_json::from_str::<ManifestDocument>(r#"{"schemaVersion": 1, "fsLayers": []}"#);
        assert!(legacy.is_err());
    }

    #[test]
    fn image_config_decoding() {
        let configuration: ImageConfiguration =
            serde_json::from_value(image_configuration(json!({
                "Env": ["PATH=/usr/bin"],
                "Entrypoint": ["/docker-entrypoint.sh"],
                "Cmd": ["nginx", "-g", "daemon off;"],
                "WorkingDir": "/srv"
            })))
            .unwrap();

        assert_eq!(
            ImageInfo::from(&configuration),
            ImageInfo {
                entrypoint: vec!["/docker-entrypoint.sh".to_string()],
                cmd: vec!["nginx".to_string(), "-g".to_string(), "daemon off;".to_string()],
                working_dir: "/srv".to_string(),
            }
        );

        let sparse: ImageConfiguration =
            serde_json::from_value(image_configuration(json!({"Entrypoint": null}))).unwrap();
        assert_eq!(ImageInfo::from(&sparse), ImageInfo::default());

        let bare: ImageConfiguration =
            serde_json::from_value(image_configuration(json!(null))).unwrap();
        assert_eq!(ImageInfo::from(&bare), ImageInfo::default());
    }

    /// Serves `team/app:v1` as a two-platform index behind a bearer challenge.
    async fn token_protected_registry() -> MockServer {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/token"))
            .and(query_param("service", "test-registry"))
            .and(query_param("scope", "repository:team/app:pull"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"token": "t0k"})))
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/v2/team/app/manifests/v1"))
            .and(header("authorization", "Bearer t0k"))
            .respond_with(ResponseTemplate::new(200).set_body_json(two_platform_index()))
            .with_priority(1)
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path(format!("/v2/team/app/manifests/{AMD_DIGEST}")))
            .and(header("authorization", "Bearer t0k"))
            .respond_with(ResponseTemplate::new(200).set_body_json(image_manifest()))
            .with_priority(1)
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path_regex("^/v2/"))
            .respond_with(ResponseTemplate::new(401).insert_header(
                "www-authenticate",
                format!(r#"Bearer realm="{}/token",service="test-registry""#, server.uri()),
            ))
            .mount(&server)
            .await;

        server
    }

    #[tokio::test]
    async fn inspects_through_index_with_anonymous_token() {
        let server = token_protected_registry().await;

        Mock::given(method("GET"))
            .and(path(format!("/v2/team/app/blobs/{CONFIG_DIGEST}")))
            .and(header("authorization", "Bearer t0k"))
            .respond_with(ResponseTemplate::new(200).set_body_json(image_configuration(json!({
                "Entrypoint": ["/app"],
                "Cmd": ["serve"],
                "WorkingDir": "/srv"
            }))))
            .with_priority(1)
            .mount(&server)
            .await;

        let info = RegistryInspector::default()
            .inspect(&format!("docker://{}/team/app:v1", server.address()))
            .await
            .unwrap();

        assert_eq!(
            info,
            ImageInfo {
                entrypoint: vec!["/app".to_string()],
                cmd: vec!["serve".to_string()],
                working_dir: "/srv".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn unreadable_config_is_a_config_error() {
        let server = token_protected_registry().await;

        Mock::given(method("GET"))
            .and(path(format!("/v2/team/app/blobs/{CONFIG_DIGEST}")))
            .respond_with(ResponseTemplate::new(500))
            .with_priority(1)
            .mount(&server)
            .await;

        let result = RegistryInspector::default()
            .inspect(&format!("docker://{}/team/app:v1", server.address()))
            .await;

        assert!(matches!(result, Err(InspectError::Config(_))), "{result:?}");
    }

    #[tokio::test]
    async fn missing_manifest_is_a_manifest_error() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let result = RegistryInspector::default()
            .inspect(&format!("docker://{}/team/app:v1", server.address()))
            .await;

        assert!(matches!(result, Err(InspectError::Manifest(_))), "{result:?}");
    }
}
