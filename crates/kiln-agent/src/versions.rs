//! Remote version indices: Mojang piston-meta for official releases, the PaperMC v2 API for
//! community builds.

use anyhow::Context;
use kiln_process::UpdateChannel;

use crate::{
    config::IndexConfig,
    error::{Result, SupervisorError},
    fetch::{Checksum, http_client},
};

#[derive(Debug, Clone, serde::Deserialize)]
struct VersionManifestV2 {
    latest: Latest,
    versions: Vec<VersionRef>,
}

#[derive(Debug, Clone, serde::Deserialize)]
struct Latest {
    release: String,
}

#[derive(Debug, Clone, serde::Deserialize)]
struct VersionRef {
    id: String,
    url: String,
}

#[derive(Debug, Clone, serde::Deserialize)]
struct VersionJson {
    downloads: Downloads,
}

#[derive(Debug, Clone, serde::Deserialize)]
struct Downloads {
    server: Option<ServerDownload>,
}

#[derive(Debug, Clone, serde::Deserialize)]
struct ServerDownload {
    sha1: String,
    size: u64,
    url: String,
}

#[derive(Debug, Clone, serde::Deserialize)]
struct PaperProject {
    versions: Vec<String>,
}

#[derive(Debug, Clone, serde::Deserialize)]
struct PaperBuilds {
    builds: Vec<PaperBuild>,
}

#[derive(Debug, Clone, serde::Deserialize)]
struct PaperBuild {
    build: u32,
    downloads: std::collections::HashMap<String, PaperDownload>,
}

#[derive(Debug, Clone, serde::Deserialize)]
struct PaperDownload {
    name: String,
    sha256: String,
}

/// A concrete downloadable artifact for one version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedArtifact {
    pub version: String,
    pub url: String,
    pub checksum: Option<Checksum>,
    pub size: Option<u64>,
}

fn wants_latest(requested: Option<&str>) -> bool {
    requested
        .map(str::trim)
        .is_none_or(|v| v.is_empty() || v == "latest" || v == "latest_release")
}

async fn get_json<T: serde::de::DeserializeOwned>(url: &str, what: &str) -> Result<T> {
    let body = http_client()
        .get(url)
        .send()
        .await
        .with_context(|| format!("fetch {what}"))
        .and_then(|r| r.error_for_status().with_context(|| format!("fetch {what} (status)")))
        .map_err(|e| SupervisorError::DownloadFailure(format!("{e:#}")))?
        .json::<T>()
        .await
        .with_context(|| format!("parse {what}"))?;
    Ok(body)
}

/// Resolves `requested` (`None`/`latest` for the newest release) against `channel`.
pub async fn resolve(
    channel: UpdateChannel,
    requested: Option<&str>,
    indices: &IndexConfig,
) -> Result<ResolvedArtifact> {
    match channel {
        UpdateChannel::Official => resolve_official(requested, indices).await,
        UpdateChannel::Community => resolve_community(requested, indices).await,
    }
}

async fn resolve_official(requested: Option<&str>, indices: &IndexConfig) -> Result<ResolvedArtifact> {
    let manifest: VersionManifestV2 =
        get_json(&indices.mojang_manifest_url, "version manifest").await?;

    let version_id = if wants_latest(requested) {
        manifest.latest.release
    } else {
        requested.unwrap_or_default().trim().to_string()
    };

    let vref = manifest
        .versions
        .into_iter()
        .find(|v| v.id == version_id)
        .ok_or_else(|| SupervisorError::UnknownVersion(version_id.clone()))?;

    let vjson: VersionJson = get_json(&vref.url, "version json").await?;
    let server = vjson.downloads.server.ok_or_else(|| {
        SupervisorError::UnknownVersion(format!("{} has no dedicated server download", vref.id))
    })?;

    Ok(ResolvedArtifact {
        version: vref.id,
        url: server.url,
        checksum: Some(Checksum::Sha1(server.sha1)),
        size: Some(server.size),
    })
}

async fn resolve_community(requested: Option<&str>, indices: &IndexConfig) -> Result<ResolvedArtifact> {
    let base = format!(
        "{}/v2/projects/{}",
        indices.paper_api_url.trim_end_matches('/'),
        indices.paper_project
    );
    let project: PaperProject = get_json(&base, "paper project").await?;

    let version = if wants_latest(requested) {
        project
            .versions
            .last()
            .cloned()
            .ok_or_else(|| SupervisorError::UnknownVersion("no versions published".to_string()))?
    } else {
        let want = requested.unwrap_or_default().trim();
        project
            .versions
            .iter()
            .find(|v| v.as_str() == want)
            .cloned()
            .ok_or_else(|| SupervisorError::UnknownVersion(want.to_string()))?
    };

    let builds: PaperBuilds =
        get_json(&format!("{base}/versions/{version}/builds"), "paper builds").await?;
    let build = builds
        .builds
        .into_iter()
        .max_by_key(|b| b.build)
        .ok_or_else(|| SupervisorError::UnknownVersion(format!("{version} has no builds")))?;
    let download = build.downloads.get("application").ok_or_else(|| {
        SupervisorError::UnknownVersion(format!("{version} build {} has no application jar", build.build))
    })?;

    Ok(ResolvedArtifact {
        version: format!("{version}-{}", build.build),
        url: format!(
            "{base}/versions/{version}/builds/{}/downloads/{}",
            build.build, download.name
        ),
        checksum: Some(Checksum::Sha256(download.sha256.clone())),
        size: None,
    })
}

#[cfg(test)]
mod tests {
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{method, path},
    };

    use super::*;

    fn indices(server: &MockServer) -> IndexConfig {
        IndexConfig {
            mojang_manifest_url: format!("{}/mc/game/version_manifest_v2.json", server.uri()),
            paper_api_url: server.uri(),
            paper_project: "paper".to_string(),
        }
    }

    async fn mount_mojang(server: &MockServer) {
        let manifest = serde_json::json!({
            "latest": { "release": "1.21.4", "snapshot": "25w02a" },
            "versions": [
                { "id": "1.21.4", "url": format!("{}/v/1.21.4.json", server.uri()) },
                { "id": "1.20.1", "url": format!("{}/v/1.20.1.json", server.uri()) },
            ]
        });
        Mock::given(method("GET"))
            .and(path("/mc/game/version_manifest_v2.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(manifest))
            .mount(server)
            .await;
        for (id, sha) in [("1.21.4", "aa"), ("1.20.1", "bb")] {
            let body = serde_json::json!({
                "downloads": { "server": {
                    "sha1": sha, "size": 42,
                    "url": format!("{}/jars/{id}/server.jar", server.uri())
                } }
            });
            Mock::given(method("GET"))
                .and(path(format!("/v/{id}.json")))
                .respond_with(ResponseTemplate::new(200).set_body_json(body))
                .mount(server)
                .await;
        }
    }

    #[tokio::test]
    async fn official_latest_follows_the_release_pointer() {
        let server = MockServer::start().await;
        mount_mojang(&server).await;

        let got = resolve(UpdateChannel::Official, None, &indices(&server)).await.unwrap();
        assert_eq!(got.version, "1.21.4");
        assert_eq!(got.checksum, Some(Checksum::Sha1("aa".to_string())));
        assert!(got.url.ends_with("/jars/1.21.4/server.jar"));
    }

    #[tokio::test]
    async fn official_pinned_and_unknown_versions() {
        let server = MockServer::start().await;
        mount_mojang(&server).await;

        let got = resolve(UpdateChannel::Official, Some("1.20.1"), &indices(&server))
            .await
            .unwrap();
        assert_eq!(got.version, "1.20.1");

        let err = resolve(UpdateChannel::Official, Some("0.0.1"), &indices(&server))
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::UnknownVersion(v) if v == "0.0.1"));
    }

    #[tokio::test]
    async fn community_picks_newest_build() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/projects/paper"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "versions": ["1.20.6", "1.21.1"] })),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v2/projects/paper/versions/1.21.1/builds"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "builds": [
                    { "build": 7, "downloads": { "application": { "name": "paper-1.21.1-7.jar", "sha256": "07" } } },
                    { "build": 12, "downloads": { "application": { "name": "paper-1.21.1-12.jar", "sha256": "12" } } },
                ]
            })))
            .mount(&server)
            .await;

        let got = resolve(UpdateChannel::Community, Some("latest"), &indices(&server))
            .await
            .unwrap();
        assert_eq!(got.version, "1.21.1-12");
        assert_eq!(got.checksum, Some(Checksum::Sha256("12".to_string())));
        assert!(got
            .url
            .ends_with("/v2/projects/paper/versions/1.21.1/builds/12/downloads/paper-1.21.1-12.jar"));

        let err = resolve(UpdateChannel::Community, Some("1.8.8"), &indices(&server))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "invalid_param");
    }

    #[tokio::test]
    async fn index_outage_is_a_download_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        let err = resolve(UpdateChannel::Official, None, &indices(&server)).await.unwrap_err();
        assert_eq!(err.code(), "download_failed");
    }
}
