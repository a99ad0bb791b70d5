use crate::prelude::*;

/// What kind of distribution a filename describes. Indexes list plenty of
/// legacy formats (.egg, .exe, ...); those all land in Other and are never
/// used for anything.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PackageType {
    Wheel,
    Sdist,
    Other,
}

const SDIST_SUFFIXES: &[&str] = &[".tar.gz", ".tgz", ".zip", ".tar.bz2", ".tar"];

impl PackageType {
    pub fn classify(filename: &str) -> PackageType {
        if filename.ends_with(".whl") {
            PackageType::Wheel
        } else if SDIST_SUFFIXES.iter().any(|s| filename.ends_with(s)) {
            PackageType::Sdist
        } else {
            PackageType::Other
        }
    }
}

fn strip_sdist_suffix(filename: &str) -> Option<&str> {
    SDIST_SUFFIXES
        .iter()
        .find_map(|s| filename.strip_suffix(s))
}

/// The version encoded in a distribution filename: the second dash-separated
/// segment for wheels (`name-version-pytag-abitag-archtag.whl`), the part
/// after the last dash of the stem for sdists (`name-version.tar.gz`).
/// Returns None when there is no version or it doesn't parse.
pub fn version_from_filename(filename: &str) -> Option<Version> {
    match PackageType::classify(filename) {
        PackageType::Wheel => filename.split('-').nth(1)?.parse().ok(),
        PackageType::Sdist => {
            let stem = strip_sdist_suffix(filename)?;
            let (_, version) = stem.rsplit_once('-')?;
            version.parse().ok()
        }
        PackageType::Other => None,
    }
}
