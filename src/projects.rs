use crate::prelude::*;

use crate::cache::Cache;
use crate::index::{Distribution, ProjectPage, SimpleIndex};
use indexmap::{IndexMap, IndexSet};
use std::io::{Read, Seek};

/// Everything the index knows about one project, keyed by parsed version,
/// in ascending version order. Immutable after construction.
#[derive(Debug, Clone)]
pub struct Project {
    name: PackageName,
    versions: IndexMap<Version, ProjectVersion>,
}

impl Project {
    pub fn from_project_page(page: &ProjectPage) -> Result<Project> {
        let name: PackageName = page.name.as_str().try_into()?;
        let mut grouped: IndexMap<Version, Vec<Distribution>> = IndexMap::new();
        for dist in &page.files {
            match version_from_filename(&dist.filename) {
                Some(version) => grouped
                    .entry(version)
                    .or_insert_with(Vec::new)
                    .push(dist.clone()),
                None => debug!(
                    "ignoring {:?}: missing or unparseable version",
                    dist.filename
                ),
            }
        }
        grouped.sort_keys();
        let versions = grouped
            .into_iter()
            .map(|(version, dists)| {
                (version.clone(), ProjectVersion { version, dists })
            })
            .collect();
        Ok(Project { name, versions })
    }

    pub fn name(&self) -> &PackageName {
        &self.name
    }

    pub fn versions(&self) -> &IndexMap<Version, ProjectVersion> {
        &self.versions
    }

    pub fn latest(&self) -> Option<&ProjectVersion> {
        self.versions.last().map(|(_, pv)| pv)
    }
}

/// One released version of a project: the set of files uploaded for it,
/// plus a deps-extraction operation.
#[derive(Debug, Clone)]
pub struct ProjectVersion {
    version: Version,
    dists: Vec<Distribution>,
}

impl ProjectVersion {
    pub fn version(&self) -> &Version {
        &self.version
    }

    /// The first non-empty Requires-Python across this version's files.
    pub fn requires_python(&self) -> Option<&str> {
        self.dists
            .iter()
            .filter_map(|d| d.requires_python.as_deref())
            .find(|rp| !rp.is_empty())
    }

    pub fn yanked(&self) -> bool {
        self.dists.iter().any(|d| d.yanked.yanked)
    }

    pub fn yank_reason(&self) -> Option<&str> {
        self.dists.iter().find_map(|d| d.yanked.reason.as_deref())
    }

    pub fn has_sdist(&self) -> bool {
        self.dists
            .iter()
            .any(|d| d.package_type() == PackageType::Sdist)
    }

    pub fn has_wheel(&self) -> bool {
        self.dists
            .iter()
            .any(|d| d.package_type() == PackageType::Wheel)
    }

    /// Extract this version's declared dependencies, consulting (and
    /// filling) the blob cache keyed by the chosen file's url.
    pub fn get_deps(
        &self,
        index: &dyn SimpleIndex,
        cache: &Cache,
    ) -> Result<BasicMetadata> {
        let empty = || BasicMetadata {
            has_sdist: self.has_sdist(),
            has_wheel: self.has_wheel(),
            ..Default::default()
        };

        let Some(best) = self.pick_metadata_source() else {
            warn!(
                "cannot load metadata for version {}, no usable files in {:?}",
                self.version,
                self.dists.iter().map(|d| &d.filename).collect::<Vec<_>>()
            );
            return Ok(empty());
        };

        // sdist extraction produces a synthesized document, not the real
        // thing, so it gets its own key next to the file's url
        let via_sdist =
            !best.core_metadata.available && best.package_type() == PackageType::Sdist;
        let cache_key = if via_sdist {
            format!("{}#requires.txt", best.url)
        } else {
            best.url.to_string()
        };

        let blob = match cache.get(&cache_key) {
            Some(blob) => blob,
            None => {
                let blob = self.extract_metadata(index, best)?;
                cache.set(&cache_key, &blob)?;
                blob
            }
        };

        let mut metadata = parse_metadata(&blob)?;
        metadata.has_sdist = self.has_sdist();
        metadata.has_wheel = self.has_wheel();
        Ok(metadata)
    }

    /// Rank this version's files by how cheap and trustworthy their
    /// metadata is; ties break toward the lexicographically-first filename
    /// to keep cache keys stable.
    fn pick_metadata_source(&self) -> Option<&Distribution> {
        let mut best: Option<(&Distribution, u32)> = None;
        for dist in &self.dists {
            let score = if dist.core_metadata.available {
                100
            } else {
                match dist.package_type() {
                    PackageType::Wheel => 90,
                    PackageType::Sdist if dist.filename.ends_with(".zip") => 50,
                    PackageType::Sdist => 30,
                    PackageType::Other => {
                        debug!("cannot load metadata from {:?}", dist.filename);
                        continue;
                    }
                }
            };
            best = match best {
                None => Some((dist, score)),
                Some((cur, cur_score)) => {
                    if score > cur_score
                        || (score == cur_score && dist.filename < cur.filename)
                    {
                        Some((dist, score))
                    } else {
                        Some((cur, cur_score))
                    }
                }
            };
        }
        best.map(|(dist, _)| dist)
    }

    fn extract_metadata(
        &self,
        index: &dyn SimpleIndex,
        best: &Distribution,
    ) -> Result<Vec<u8>> {
        if best.core_metadata.available {
            return index.get_distribution_metadata(best);
        }
        match best.package_type() {
            PackageType::Wheel => extract_wheel_metadata(index, best),
            PackageType::Sdist if best.filename.ends_with(".zip") => {
                context!("reading metadata from {}", best.filename);
                let f = index.open_ranged(&best.url)?;
                let mut z = zip::ZipArchive::new(f)?;
                extract_zip_sdist_metadata(&mut z)
            }
            PackageType::Sdist => extract_tar_sdist_metadata(index, best),
            // pick_metadata_source never selects these
            PackageType::Other => bail!("no metadata in {:?}", best.filename),
        }
    }
}

/// The slice of core metadata the walker consumes.
#[derive(Debug, Clone, Default)]
pub struct BasicMetadata {
    pub reqs: Vec<Requirement>,
    pub extras: Vec<Extra>,
    pub has_sdist: bool,
    pub has_wheel: bool,
}

fn parse_metadata(blob: &[u8]) -> Result<BasicMetadata> {
    let text = String::from_utf8_lossy(blob);
    let mut parsed = RFC822ish::parse(&text)?;

    if let Some(version) = parsed.maybe_take_the("Metadata-Version")? {
        if !version.starts_with("1.") && !version.starts_with("2.") {
            warn!("unrecognized Metadata-Version {:?}; reading it anyway", version);
        }
    }

    let mut reqs = Vec::new();
    for line in parsed.take_all("Requires-Dist") {
        match Requirement::parse(&line, ParseExtra::Allowed) {
            Ok(req) => reqs.push(req),
            Err(err) => warn!("skipping invalid requirement {:?}: {err}", line),
        }
    }

    let mut extras = Vec::new();
    for value in parsed.take_all("Provides-Extra") {
        match value.parse::<Extra>() {
            Ok(extra) => extras.push(extra),
            Err(err) => warn!("skipping invalid extra {:?}: {err}", value),
        }
    }

    Ok(BasicMetadata {
        reqs,
        extras,
        ..Default::default()
    })
}

fn extract_wheel_metadata(
    index: &dyn SimpleIndex,
    dist: &Distribution,
) -> Result<Vec<u8>> {
    context!("reading metadata from {}", dist.filename);
    let f = index.open_ranged(&dist.url)?;
    let mut z = zip::ZipArchive::new(f)?;
    // The .dist-info directory is named by the first two dash-separated
    // segments of the filename, verbatim -- same rule warehouse uses.
    let mut segments = dist.filename.splitn(3, '-');
    let (name, version) = match (segments.next(), segments.next()) {
        (Some(name), Some(version)) => (name, version),
        _ => bail!(
            "can't find name and version in wheel filename {:?}",
            dist.filename
        ),
    };
    let member = format!("{name}-{version}.dist-info/METADATA");
    let mut entry = z
        .by_name(&member)
        .wrap_err_with(|| format!("no {} in {}", member, dist.filename))?;
    slurp(&mut entry)
}

fn is_pkg_info(path: &str) -> bool {
    path == "PKG-INFO" || (path.ends_with("/PKG-INFO") && path.matches('/').count() <= 1)
}

// No formal spec for where requires.txt lives; "at most two slashes" covers
// what setuptools actually produces (name-version/name.egg-info/requires.txt).
fn is_requires_txt(path: &str) -> bool {
    path.ends_with("/requires.txt") && path.matches('/').count() <= 2
}

fn extract_zip_sdist_metadata<R: Read + Seek>(
    z: &mut zip::ZipArchive<R>,
) -> Result<Vec<u8>> {
    let names: Vec<String> = z.file_names().map(String::from).collect();
    let pick = |pred: fn(&str) -> bool| -> Option<String> {
        let mut candidates: Vec<&String> =
            names.iter().filter(|n| pred(n)).collect();
        candidates.sort_unstable();
        candidates.first().map(|s| s.to_string())
    };

    if let Some(member) = pick(is_pkg_info) {
        return slurp(&mut z.by_name(&member)?);
    }
    if let Some(member) = pick(is_requires_txt) {
        let data = slurp(&mut z.by_name(&member)?)?;
        let (reqs, extras) = convert_sdist_requires(&String::from_utf8_lossy(&data));
        return Ok(synthesize_requires_metadata(&reqs, &extras));
    }
    warn!("no PKG-INFO or requires.txt in sdist; treating as dependency-free");
    Ok(Vec::new())
}

fn extract_tar_sdist_metadata(
    index: &dyn SimpleIndex,
    dist: &Distribution,
) -> Result<Vec<u8>> {
    context!("reading metadata from {}", dist.filename);
    let mut tmp = tempfile::tempfile()?;
    index.download(dist, &mut tmp)?;
    tmp.rewind()?;

    let reader: Box<dyn Read> = if dist.filename.ends_with(".tar.gz")
        || dist.filename.ends_with(".tgz")
    {
        Box::new(flate2::read::MultiGzDecoder::new(tmp))
    } else if dist.filename.ends_with(".tar") {
        Box::new(tmp)
    } else {
        bail!("unsupported sdist archive format: {:?}", dist.filename);
    };

    // tar has no central index, so collect both interesting members in one
    // pass and decide afterwards
    let mut archive = tar::Archive::new(reader);
    let mut pkg_info: Option<(String, Vec<u8>)> = None;
    let mut requires_txt: Option<(String, Vec<u8>)> = None;
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.to_string_lossy().into_owned();
        if is_pkg_info(&path)
            && pkg_info.as_ref().map_or(true, |(seen, _)| path < *seen)
        {
            pkg_info = Some((path.clone(), slurp(&mut entry)?));
        } else if is_requires_txt(&path)
            && requires_txt.as_ref().map_or(true, |(seen, _)| path < *seen)
        {
            requires_txt = Some((path.clone(), slurp(&mut entry)?));
        }
    }

    if let Some((_, data)) = pkg_info {
        return Ok(data);
    }
    if let Some((_, data)) = requires_txt {
        let (reqs, extras) = convert_sdist_requires(&String::from_utf8_lossy(&data));
        return Ok(synthesize_requires_metadata(&reqs, &extras));
    }
    warn!(
        "no PKG-INFO or requires.txt in {}; treating as dependency-free",
        dist.filename
    );
    Ok(Vec::new())
}

/// Translate a setuptools requires.txt into Requires-Dist lines. Reverse
/// engineered from examples; there does not appear to be a formal spec.
/// Mentioned at
/// https://setuptools.readthedocs.io/en/latest/formats.html#requires-txt
///
/// Lines before the first `[section]` are unconditional. `[name]` guards the
/// following lines with `extra == 'name'`, `[name:marker]` with
/// `(marker) and extra == 'name'`, and `[:marker]` with the bare marker.
pub fn convert_sdist_requires(data: &str) -> (Vec<String>, IndexSet<String>) {
    let mut current_markers: Option<String> = None;
    let mut extras: IndexSet<String> = IndexSet::new();
    let mut lines: Vec<String> = Vec::new();
    for line in data.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line.starts_with('[') && line.ends_with(']') {
            let section = &line[1..line.len() - 1];
            current_markers = Some(match section.split_once(':') {
                // absl-py==0.9.0 and requests==2.22.0 are good examples of
                // the extra:marker form
                Some((extra, markers)) if !extra.is_empty() => {
                    extras.insert(extra.to_string());
                    format!("({}) and extra == '{}'", markers, extra)
                }
                Some((_, markers)) => markers.to_string(),
                None => {
                    extras.insert(section.to_string());
                    format!("extra == '{}'", section)
                }
            });
        } else {
            match &current_markers {
                Some(markers) => lines.push(format!("{}; {}", line, markers)),
                None => lines.push(line.to_string()),
            }
        }
    }
    (lines, extras)
}

fn synthesize_requires_metadata(
    reqs: &[String],
    extras: &IndexSet<String>,
) -> Vec<u8> {
    let mut out = String::from("Metadata-Version: 2.1\n");
    for req in reqs {
        out.push_str(&format!("Requires-Dist: {}\n", req));
    }
    for extra in extras {
        out.push_str(&format!("Provides-Extra: {}\n", extra));
    }
    out.into_bytes()
}
