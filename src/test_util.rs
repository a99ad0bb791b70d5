use crate::prelude::*;

use crate::index::{Distribution, ProjectPage, SimpleIndex};
use std::io::{Cursor, Write};
use std::sync::Mutex;

/// A minimal simple-page JSON value: one project, the given filenames, each
/// served from https://files.example/.
pub fn page_json(name: &str, filenames: &[&str]) -> serde_json::Value {
    let files: Vec<serde_json::Value> = filenames
        .iter()
        .map(|filename| {
            serde_json::json!({
                "filename": filename,
                "url": format!("https://files.example/{filename}"),
            })
        })
        .collect();
    serde_json::json!({
        "meta": {"api-version": "1.0"},
        "name": name,
        "files": files,
    })
}

/// An in-memory index. Counts fetches so tests can assert on memoization.
pub struct FakeIndex {
    pages: HashMap<String, serde_json::Value>,
    blobs: HashMap<String, Vec<u8>>,
    page_fetches: Mutex<HashMap<String, usize>>,
    sidecar_fetches: Mutex<HashMap<String, usize>>,
}

impl FakeIndex {
    pub fn new() -> FakeIndex {
        FakeIndex {
            pages: HashMap::new(),
            blobs: HashMap::new(),
            page_fetches: Mutex::new(HashMap::new()),
            sidecar_fetches: Mutex::new(HashMap::new()),
        }
    }

    /// The fixture universe the scenario tests walk:
    ///
    /// - batman 1.0 needs robin==1.0; batman 2.0 needs robin>1.0
    /// - robin 1.0 / 2.0, no deps
    /// - wayne 1.0 needs alfred>=1.0 only under the "butler" extra, and a
    ///   python-2-only dep that never activates
    /// - alfred 1.0, no deps
    /// - chicken 1.0 and egg 1.0 need each other
    pub fn standard_universe() -> FakeIndex {
        let mut index = FakeIndex::new();
        index.add_sidecar_project(
            "batman",
            &[
                ("1.0", "Metadata-Version: 2.1\nRequires-Dist: robin==1.0\n"),
                ("2.0", "Metadata-Version: 2.1\nRequires-Dist: robin>1.0\n"),
            ],
        );
        index.add_sidecar_project(
            "robin",
            &[
                ("1.0", "Metadata-Version: 2.1\n"),
                ("2.0", "Metadata-Version: 2.1\n"),
            ],
        );
        index.add_sidecar_project(
            "wayne",
            &[(
                "1.0",
                "Metadata-Version: 2.1\n\
                 Requires-Dist: alfred>=1.0; extra == \"butler\"\n\
                 Requires-Dist: legacy; python_version < \"3.0\"\n\
                 Provides-Extra: butler\n",
            )],
        );
        index.add_sidecar_project(
            "alfred",
            &[("1.0", "Metadata-Version: 2.1\n")],
        );
        index.add_sidecar_project(
            "chicken",
            &[("1.0", "Metadata-Version: 2.1\nRequires-Dist: egg\n")],
        );
        index.add_sidecar_project(
            "egg",
            &[("1.0", "Metadata-Version: 2.1\nRequires-Dist: chicken\n")],
        );
        index
    }

    pub fn add_project(&mut self, name: &str, page: serde_json::Value) {
        self.pages.insert(name.to_string(), page);
    }

    pub fn add_blob(&mut self, url: &str, data: Vec<u8>) {
        self.blobs.insert(url.to_string(), data);
    }

    /// Register a project where every version has a wheel (with a PEP 658
    /// sidecar carrying the given metadata) and a tar.gz sdist.
    pub fn add_sidecar_project(&mut self, name: &str, versions: &[(&str, &str)]) {
        let mut filenames: Vec<String> = Vec::new();
        for (version, metadata) in versions {
            let wheel = format!("{name}-{version}-py3-none-any.whl");
            let wheel_url = format!("https://files.example/{wheel}");
            self.add_blob(
                &format!("{wheel_url}.metadata"),
                metadata.as_bytes().to_vec(),
            );
            filenames.push(wheel);
            filenames.push(format!("{name}-{version}.tar.gz"));
        }
        let files: Vec<serde_json::Value> = filenames
            .iter()
            .map(|filename| {
                serde_json::json!({
                    "filename": filename,
                    "url": format!("https://files.example/{filename}"),
                    "core-metadata": filename.ends_with(".whl"),
                })
            })
            .collect();
        self.add_project(
            name,
            serde_json::json!({
                "meta": {"api-version": "1.0"},
                "name": name,
                "files": files,
            }),
        );
    }

    pub fn page_fetch_count(&self, name: &str) -> usize {
        *self.page_fetches.lock().unwrap().get(name).unwrap_or(&0)
    }

    pub fn sidecar_fetch_count(&self) -> usize {
        self.sidecar_fetches.lock().unwrap().values().sum()
    }
}

impl SimpleIndex for FakeIndex {
    fn get_project_page(&self, name: &PackageName) -> Result<ProjectPage> {
        *self
            .page_fetches
            .lock()
            .unwrap()
            .entry(name.normalized().to_string())
            .or_insert(0) += 1;
        let page = self
            .pages
            .get(name.normalized())
            .ok_or_else(|| eyre!("404 not found: {}", name.normalized()))?;
        Ok(serde_json::from_value(page.clone())?)
    }

    fn get_distribution_metadata(&self, dist: &Distribution) -> Result<Vec<u8>> {
        let key = format!("{}.metadata", dist.url);
        *self
            .sidecar_fetches
            .lock()
            .unwrap()
            .entry(key.clone())
            .or_insert(0) += 1;
        self.blobs
            .get(&key)
            .cloned()
            .ok_or_else(|| eyre!("404 not found: {key}"))
    }

    fn open_ranged(&self, url: &Url) -> Result<Box<dyn ReadPlusSeek + Send>> {
        let blob = self
            .blobs
            .get(url.as_str())
            .cloned()
            .ok_or_else(|| eyre!("404 not found: {url}"))?;
        Ok(Box::new(Cursor::new(blob)))
    }

    fn download(&self, dist: &Distribution, dest: &mut dyn Write) -> Result<()> {
        let blob = self
            .blobs
            .get(dist.url.as_str())
            .ok_or_else(|| eyre!("404 not found: {}", dist.url))?;
        dest.write_all(blob)?;
        Ok(())
    }
}
