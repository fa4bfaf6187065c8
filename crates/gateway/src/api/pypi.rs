//! PyPI adapter (PEP 503 simple API).
//!
//! The simple index is streamed through untouched; per-project pages are
//! fetched, their package hrefs rewritten onto `/pypi/packages/`, and
//! served; package files are the pull-through path. Project names are
//! normalised per PEP 503 before touching the upstream so `Django` and
//! `django` resolve to the same page.

use std::collections::HashMap;
use std::sync::OnceLock;

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::Response;
use regex::Regex;

use amargo_domain::model::RepoFormat;
use amargo_domain::{Error, Result};

use crate::api::{client_meta, headers, passthrough_buffered, route_target};
use crate::cache::{ServeOptions, ServeOutcome};
use crate::state::AppState;

const PACKAGE_CONTENT_TYPE: &str = "application/octet-stream";

/// PEP 503: lowercase and collapse runs of `-`, `_`, `.` to a single `-`.
pub fn normalise(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut in_run = false;
    for c in name.chars() {
        if matches!(c, '-' | '_' | '.') {
            if !in_run {
                out.push('-');
                in_run = true;
            }
        } else {
            out.extend(c.to_lowercase());
            in_run = false;
        }
    }
    out
}

/// Rewrite relative `../../packages/...` and absolute
/// `https://files.pythonhosted.org/packages/...` hrefs onto this proxy.
fn rewrite_hrefs(page: &str) -> String {
    static HREF: OnceLock<Regex> = OnceLock::new();
    let re = HREF.get_or_init(|| {
        Regex::new(r#"href="(?:(?:\.\./)+packages/|https://files\.pythonhosted\.org/packages/)"#)
            .expect("href rewrite pattern is valid")
    });
    re.replace_all(page, r#"href="/pypi/packages/"#).into_owned()
}

/// `(project, version)` from a package filename, per the format rules:
/// wheels take the segment after the first `-`; sdists and eggs take the
/// suffix starting at the first digit that follows a `-`.
fn parse_filename(filename: &str) -> Result<(String, String)> {
    if let Some(stem) = filename.strip_suffix(".whl") {
        let mut parts = stem.splitn(3, '-');
        let name = parts.next().filter(|n| !n.is_empty());
        let version = parts.next().filter(|v| !v.is_empty());
        return match (name, version) {
            (Some(name), Some(version)) => Ok((normalise(name), version.to_owned())),
            _ => Err(Error::InvalidRequest(format!("bad wheel filename '{filename}'"))),
        };
    }

    let stem = filename
        .strip_suffix(".tar.gz")
        .or_else(|| filename.strip_suffix(".tar.bz2"))
        .or_else(|| filename.strip_suffix(".zip"))
        .or_else(|| filename.strip_suffix(".egg"))
        .ok_or_else(|| {
            Error::InvalidRequest(format!("unrecognised package filename '{filename}'"))
        })?;

    // First `-` that is followed by a digit starts the version.
    let bytes = stem.as_bytes();
    for (i, window) in bytes.windows(2).enumerate() {
        if window[0] == b'-' && window[1].is_ascii_digit() {
            let name = &stem[..i];
            let version = &stem[i + 1..];
            if !name.is_empty() {
                return Ok((normalise(name), version.to_owned()));
            }
        }
    }
    Err(Error::InvalidRequest(format!("no version in filename '{filename}'")))
}

pub async fn serve_index(State(state): State<AppState>) -> Response {
    match index(&state).await {
        Ok(resp) => resp,
        Err(e) => headers::error_response(e),
    }
}

async fn index(state: &AppState) -> Result<Response> {
    let target = route_target(state, RepoFormat::Pypi)?;
    for repo in state.cache.proxy_candidates(&target).await? {
        match state.upstream.fetch(&repo, "/simple/", &[]).await? {
            Some(found) => {
                let content_type = found.content_type.clone();
                return Ok(headers::passthrough_stream(
                    found.stream,
                    content_type.as_deref().unwrap_or("text/html"),
                    headers::CC_MUTABLE,
                    Some(&repo.name),
                ));
            }
            None => continue,
        }
    }
    Err(Error::NotFound)
}

pub async fn serve_project(State(state): State<AppState>, Path(pkg): Path<String>) -> Response {
    match project(&state, &pkg).await {
        Ok(resp) => resp,
        Err(e) => headers::error_response(e),
    }
}

async fn project(state: &AppState, pkg: &str) -> Result<Response> {
    let target = route_target(state, RepoFormat::Pypi)?;
    let norm = normalise(pkg);
    let fetched =
        passthrough_buffered(state, &target, |_repo| format!("/simple/{norm}/"), &[]).await?;
    let Some((body, content_type, repo_name)) = fetched else {
        return Err(Error::NotFound);
    };

    let page = String::from_utf8_lossy(&body);
    let rewritten = rewrite_hrefs(&page);
    Ok(headers::passthrough_bytes(
        rewritten.into_bytes().into(),
        content_type.as_deref().unwrap_or("text/html"),
        headers::CC_MUTABLE,
        Some(&repo_name),
    ))
}

pub async fn serve_package(
    State(state): State<AppState>,
    Path(path): Path<String>,
    request_headers: HeaderMap,
) -> Response {
    match package(&state, &path, &request_headers).await {
        Ok(resp) => resp,
        Err(e) => headers::error_response(e),
    }
}

async fn package(state: &AppState, path: &str, request_headers: &HeaderMap) -> Result<Response> {
    let target = route_target(state, RepoFormat::Pypi)?;
    let path = path.trim_matches('/');
    let filename = path
        .rsplit('/')
        .next()
        .filter(|f| !f.is_empty())
        .ok_or_else(|| Error::InvalidRequest(format!("bad package path '{path}'")))?;
    let (project, version) = parse_filename(filename)?;

    // One cached artifact per file: wheels and sdists of the same release
    // must not overwrite each other, so the file name joins the identity
    // the same way docker's composite keys do.
    let artifact_name = format!("{project}:{filename}");

    let upstream = state.upstream.clone();
    let package_path = path.to_owned();
    let outcome = state
        .cache
        .serve(
            &target,
            &artifact_name,
            &version,
            |repo| {
                let upstream = upstream.clone();
                let package_path = package_path.clone();
                async move {
                    // pypi.org serves files from a separate host; generic
                    // mirrors serve them under their own /packages/ tree.
                    if repo.upstream_base().is_some_and(|u| u.contains("pypi.org")) {
                        let url = format!("https://files.pythonhosted.org/packages/{package_path}");
                        upstream.fetch_url(&repo, &url, &[]).await
                    } else {
                        upstream
                            .fetch(&repo, &format!("/packages/{package_path}"), &[])
                            .await
                    }
                }
            },
            ServeOptions {
                content_type: PACKAGE_CONTENT_TYPE.into(),
                metadata: HashMap::from([
                    ("filename".to_owned(), filename.to_owned()),
                    ("path".to_owned(), package_path.clone()),
                ]),
                ttl_secs: None,
            },
        )
        .await?;

    let (ip, ua) = client_meta(request_headers);
    match outcome {
        ServeOutcome::Hit(hit) => {
            state
                .artifacts
                .record_download(hit.repo_id, &artifact_name, &version, ip, ua);
            Ok(headers::hit_response(hit, headers::CC_IMMUTABLE))
        }
        ServeOutcome::Miss(miss) => {
            state
                .artifacts
                .record_download(miss.repo_id, &artifact_name, &version, ip, ua);
            Ok(headers::miss_response(miss, PACKAGE_CONTENT_TYPE, headers::CC_IMMUTABLE))
        }
        ServeOutcome::NotFound => Err(Error::NotFound),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalise_follows_pep_503() {
        assert_eq!(normalise("Django"), "django");
        assert_eq!(normalise("zope.interface"), "zope-interface");
        assert_eq!(normalise("ruamel.yaml.clib"), "ruamel-yaml-clib");
        assert_eq!(normalise("typing_extensions"), "typing-extensions");
        assert_eq!(normalise("a--b__c..d"), "a-b-c-d");
    }

    #[test]
    fn normalise_is_idempotent() {
        for name in ["Django", "zope.interface", "A__weird..Name", "plain"] {
            assert_eq!(normalise(&normalise(name)), normalise(name));
        }
    }

    #[test]
    fn wheel_filenames_parse() {
        assert_eq!(
            parse_filename("requests-2.31.0-py3-none-any.whl").unwrap(),
            ("requests".to_owned(), "2.31.0".to_owned())
        );
        assert_eq!(
            parse_filename("Django-5.0.1-py3-none-any.whl").unwrap(),
            ("django".to_owned(), "5.0.1".to_owned())
        );
    }

    #[test]
    fn sdist_filenames_parse() {
        assert_eq!(
            parse_filename("requests-2.31.0.tar.gz").unwrap(),
            ("requests".to_owned(), "2.31.0".to_owned())
        );
        // Name containing a dash followed by a letter: the version starts
        // at the first dash-digit boundary.
        assert_eq!(
            parse_filename("zope-interface-6.1.tar.gz").unwrap(),
            ("zope-interface".to_owned(), "6.1".to_owned())
        );
        assert_eq!(
            parse_filename("pkg-1.0.0b1.zip").unwrap(),
            ("pkg".to_owned(), "1.0.0b1".to_owned())
        );
    }

    #[test]
    fn unrecognised_filenames_are_invalid() {
        assert!(parse_filename("README.rst").is_err());
        assert!(parse_filename("noversion.tar.gz").is_err());
    }

    #[test]
    fn hrefs_are_rewritten() {
        let page = r#"<a href="https://files.pythonhosted.org/packages/aa/bb/cc/requests-2.31.0.tar.gz#sha256=abc">requests-2.31.0.tar.gz</a>
<a href="../../packages/dd/ee/ff/requests-2.31.0-py3-none-any.whl#sha256=def">wheel</a>"#;
        let rewritten = rewrite_hrefs(page);
        assert!(!rewritten.contains("files.pythonhosted.org"));
        assert!(rewritten.contains(r#"href="/pypi/packages/aa/bb/cc/requests-2.31.0.tar.gz#sha256=abc""#));
        assert!(rewritten.contains(r#"href="/pypi/packages/dd/ee/ff/requests-2.31.0-py3-none-any.whl#sha256=def""#));
    }
}
