use crate::prelude::*;

use crate::net::{lazy_remote_file::LazyRemoteFile, retry::call_with_retry};
use ring::digest;
use std::io::{Read, Write};

pub static DEFAULT_INDEX_URL: Lazy<Url> =
    Lazy::new(|| "https://pypi.org/simple/".parse().unwrap());

// PEP 691. We don't speak the old HTML flavor at all.
const ACCEPT_JSON: &str = "application/vnd.pypi.simple.v1+json";

/// The index root to walk against: `$PIP_INDEX_URL` unless the caller asked
/// to ignore the environment.
pub fn index_url(isolate_env: bool) -> Result<Url> {
    if !isolate_env {
        if let Ok(url) = std::env::var("PIP_INDEX_URL") {
            return url
                .parse()
                .wrap_err_with(|| format!("invalid PIP_INDEX_URL {:?}", url));
        }
    }
    Ok(DEFAULT_INDEX_URL.clone())
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RawCoreMetadata {
    Available(bool),
    // the hashes of the metadata file itself; we only care that it exists
    WithHashes(HashMap<String, String>),
}

/// Whether the index exposes a PEP 658 `.metadata` sidecar for a file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(from = "Option<RawCoreMetadata>")]
pub struct CoreMetadataFlag {
    pub available: bool,
}

impl From<Option<RawCoreMetadata>> for CoreMetadataFlag {
    fn from(raw: Option<RawCoreMetadata>) -> Self {
        match raw {
            None => Default::default(),
            Some(RawCoreMetadata::Available(available)) => Self { available },
            Some(RawCoreMetadata::WithHashes(_)) => Self { available: true },
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RawYanked {
    NoReason(bool),
    WithReason(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(from = "Option<RawYanked>")]
pub struct Yanked {
    pub yanked: bool,
    pub reason: Option<String>,
}

impl From<Option<RawYanked>> for Yanked {
    fn from(raw: Option<RawYanked>) -> Self {
        match raw {
            None => Default::default(),
            Some(RawYanked::NoReason(yanked)) => Self {
                yanked,
                reason: None,
            },
            Some(RawYanked::WithReason(reason)) => Self {
                yanked: true,
                reason: Some(reason),
            },
        }
    }
}

/// One file listed under a project on the index.
#[derive(Debug, Clone, Deserialize)]
pub struct Distribution {
    pub filename: String,
    pub url: Url,
    #[serde(default)]
    pub hashes: HashMap<String, String>,
    #[serde(default, rename = "requires-python")]
    pub requires_python: Option<String>,
    #[serde(default, rename = "core-metadata")]
    pub core_metadata: CoreMetadataFlag,
    #[serde(default)]
    pub yanked: Yanked,
}

impl Distribution {
    pub fn package_type(&self) -> PackageType {
        PackageType::classify(&self.filename)
    }

    pub fn sha256(&self) -> Option<&str> {
        self.hashes.get("sha256").map(|s| s.as_str())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PageMeta {
    #[serde(rename = "api-version")]
    pub api_version: String,
}

/// A project's parsed "simple" page.
#[derive(Debug, Clone, Deserialize)]
pub struct ProjectPage {
    pub meta: PageMeta,
    pub name: String,
    pub files: Vec<Distribution>,
}

/// What the walker needs from an index, and nothing more. The real client
/// talks to PyPI; tests substitute an in-memory fixture.
pub trait SimpleIndex: Send + Sync {
    fn get_project_page(&self, name: &PackageName) -> Result<ProjectPage>;

    /// Fetch a distribution's PEP 658 `.metadata` sidecar.
    fn get_distribution_metadata(&self, dist: &Distribution) -> Result<Vec<u8>>;

    /// Open a distribution for random access, backed by ranged requests.
    fn open_ranged(&self, url: &Url) -> Result<Box<dyn ReadPlusSeek + Send>>;

    /// Download a whole distribution, verifying its published sha256 when
    /// there is one.
    fn download(&self, dist: &Distribution, dest: &mut dyn Write) -> Result<()>;
}

pub struct PyPiIndex {
    agent: ureq::Agent,
    base_url: Url,
}

impl PyPiIndex {
    pub fn new(agent: ureq::Agent, base_url: Url) -> PyPiIndex {
        PyPiIndex { agent, base_url }
    }
}

impl SimpleIndex for PyPiIndex {
    fn get_project_page(&self, name: &PackageName) -> Result<ProjectPage> {
        let url = self
            .base_url
            .join(&format!("{}/", name.normalized()))
            .wrap_err("forming project page url")?;
        context!("fetching {}", url);
        let response = call_with_retry(
            self.agent
                .request_url("GET", &url)
                .set("Accept", ACCEPT_JSON)
                // pick up fresh uploads even through caching proxies
                .set("Cache-Control", "max-age=0"),
        )
        .wrap_err_with(|| format!("fetching project page {}", url))?;
        let page: ProjectPage = serde_json::from_reader(response.into_reader())
            .wrap_err_with(|| format!("parsing project page {}", url))?;
        if !page.meta.api_version.starts_with("1.") {
            bail!(
                "unknown package index api version {} from {}",
                page.meta.api_version,
                url
            );
        }
        Ok(page)
    }

    fn get_distribution_metadata(&self, dist: &Distribution) -> Result<Vec<u8>> {
        let url: Url = format!("{}.metadata", dist.url)
            .parse()
            .wrap_err("forming metadata sidecar url")?;
        context!("fetching {}", url);
        let response = call_with_retry(self.agent.request_url("GET", &url))
            .wrap_err_with(|| format!("fetching metadata sidecar {}", url))?;
        slurp(&mut response.into_reader())
    }

    fn open_ranged(&self, url: &Url) -> Result<Box<dyn ReadPlusSeek + Send>> {
        Ok(Box::new(LazyRemoteFile::new(&self.agent, url)?))
    }

    fn download(&self, dist: &Distribution, dest: &mut dyn Write) -> Result<()> {
        context!("downloading {}", dist.url);
        let response = call_with_retry(self.agent.request_url("GET", &dist.url))
            .wrap_err_with(|| format!("downloading {}", dist.url))?;
        let mut reader = response.into_reader();
        let mut hasher = digest::Context::new(&digest::SHA256);
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            dest.write_all(&buf[..n])?;
        }
        if let Some(expected) = dist.sha256() {
            let got = data_encoding::HEXLOWER.encode(hasher.finish().as_ref());
            if !got.eq_ignore_ascii_case(expected) {
                bail!(
                    "sha256 mismatch for {}: expected {}, got {}",
                    dist.filename,
                    expected,
                    got
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use indoc::indoc;

    #[test]
    fn test_project_page_parsing() {
        let raw = indoc! {r#"
            {
              "meta": {"api-version": "1.1"},
              "name": "example",
              "files": [
                {
                  "filename": "example-1.0-py3-none-any.whl",
                  "url": "https://files.example/example-1.0-py3-none-any.whl",
                  "hashes": {"sha256": "00aa"},
                  "requires-python": ">=3.7",
                  "core-metadata": {"sha256": "11bb"}
                },
                {
                  "filename": "example-1.0.tar.gz",
                  "url": "https://files.example/example-1.0.tar.gz",
                  "hashes": {},
                  "yanked": "broken metadata"
                },
                {
                  "filename": "example-0.9.tar.gz",
                  "url": "https://files.example/example-0.9.tar.gz",
                  "hashes": {},
                  "core-metadata": false,
                  "yanked": false
                }
              ]
            }
        "#};
        let page: ProjectPage = serde_json::from_str(raw).unwrap();
        assert_eq!(page.name, "example");
        assert_eq!(page.files.len(), 3);

        let wheel = &page.files[0];
        assert_eq!(wheel.package_type(), PackageType::Wheel);
        assert!(wheel.core_metadata.available);
        assert_eq!(wheel.sha256(), Some("00aa"));
        assert_eq!(wheel.requires_python.as_deref(), Some(">=3.7"));
        assert!(!wheel.yanked.yanked);

        let yanked = &page.files[1];
        assert!(!yanked.core_metadata.available);
        assert!(yanked.yanked.yanked);
        assert_eq!(yanked.yanked.reason.as_deref(), Some("broken metadata"));

        let plain = &page.files[2];
        assert!(!plain.core_metadata.available);
        assert!(!plain.yanked.yanked);
    }

    #[test]
    fn test_index_url_default() {
        assert_eq!(index_url(true).unwrap(), *DEFAULT_INDEX_URL);
    }
}
