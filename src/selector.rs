use crate::prelude::*;

use crate::markers::EnvironmentMarkers;
use crate::projects::Project;

/// Caller-supplied hint naming versions that should be reused when
/// admissible (an installed environment, a lockfile, `--have` flags...).
pub type CurrentVersionFn<'a> = &'a dyn Fn(&PackageName) -> Option<String>;

/// Pick the version of `project` that `req` should resolve to under `env`.
///
/// The candidate set is deliberately tiny: the most recent release the
/// specifier and interpreter both admit, the callback's current version (a
/// published current version must also pass the interpreter check; an
/// unpublished one is taken on faith), and whatever an earlier step of this
/// walk already chose. The requirement's specifier then gets the final say,
/// including over prerelease admission.
///
/// `admits_python` memoizes the Requires-Python check per raw string --
/// the same handful of strings ("`>=3.7`", ...) shows up on almost every
/// file on the index.
pub fn find_best_compatible(
    project: &Project,
    req: &Requirement,
    env: &EnvironmentMarkers,
    already_chosen: Option<&Version>,
    current_version_of: CurrentVersionFn,
    admits_python: &mut HashMap<String, bool>,
) -> Result<Version> {
    let python_version: Version = env.python_full_version().parse()?;

    // The admission filter owns prerelease gating, so it has to drive the
    // descending scan too; checking clauses one version at a time here would
    // re-implement its rules badly.
    let admitted_releases = req.specifiers.filter(project.versions().keys().rev())?;
    let specifier_admitted_any = !admitted_releases.is_empty();
    let mut newest_compatible: Option<&Version> = None;
    for &version in &admitted_releases {
        // unwrap safe because: admitted_releases came out of this same map
        let pv = project.versions().get(version).unwrap();
        if python_ok(pv.requires_python(), &python_version, admits_python) {
            newest_compatible = Some(version);
            break;
        }
    }

    let mut candidates: Vec<Version> = Vec::new();
    if let Some(version) = newest_compatible {
        candidates.push(version.clone());
    }

    let current: Option<Version> = match current_version_of(project.name()) {
        Some(raw) => Some(raw.parse().wrap_err_with(|| {
            format!("invalid current version {:?} for {}", raw, project.name().normalized())
        })?),
        None => None,
    };
    if let Some(cur) = &current {
        match project.versions().get(cur) {
            // A published release: only reusable if the interpreter could
            // actually run it.
            Some(pv) => {
                if python_ok(pv.requires_python(), &python_version, admits_python)
                    && !candidates.contains(cur)
                {
                    candidates.push(cur.clone());
                }
            }
            // A private/internal build the index has never heard of: reuse
            // it on faith.
            None => {
                if !candidates.contains(cur) {
                    candidates.push(cur.clone());
                }
            }
        }
    }

    if let Some(chosen) = already_chosen {
        if !candidates.contains(chosen) {
            candidates.push(chosen.clone());
        }
    }

    let no_match = || -> eyre::Report {
        if specifier_admitted_any {
            DepwalkError::NoCompatibleRelease {
                name: project.name().normalized().into(),
                python_version: python_version.to_string(),
            }
            .into()
        } else {
            DepwalkError::NoMatchingRelease {
                name: project.name().normalized().into(),
                python_version: python_version.to_string(),
                specifiers: req.specifiers.to_string(),
            }
            .into()
        }
    };

    if candidates.is_empty() {
        return Err(no_match());
    }

    // The specifier gets the final say over the whole candidate set (this is
    // also where prerelease gating lives).
    let admitted = req.specifiers.filter(candidates.iter())?;
    if admitted.is_empty() {
        return Err(no_match());
    }

    // Tie-break: prior walk decisions dominate, then current-version hints,
    // then insertion order (which already prefers the more recent), then the
    // version itself. Sort ascending, take the last.
    let mut keyed: Vec<(bool, bool, usize, &Version)> = admitted
        .into_iter()
        .enumerate()
        .map(|(index, version)| {
            (
                Some(version) == already_chosen,
                Some(version) == current.as_ref(),
                index,
                version,
            )
        })
        .collect();
    keyed.sort();
    // unwrap safe because: admitted was checked non-empty above
    Ok(keyed.last().unwrap().3.clone())
}

fn python_ok(
    requires_python: Option<&str>,
    python_version: &Version,
    admits_python: &mut HashMap<String, bool>,
) -> bool {
    let Some(raw) = requires_python else { return true };
    if let Some(&ok) = admits_python.get(raw) {
        return ok;
    }
    let ok = match raw.parse::<Specifiers>() {
        Ok(specs) => match specs.satisfied_by(python_version) {
            Ok(ok) => ok,
            Err(err) => {
                debug!("treating unusable Requires-Python {:?} as unconstrained: {err}", raw);
                true
            }
        },
        Err(err) => {
            debug!("treating invalid Requires-Python {:?} as unconstrained: {err}", raw);
            true
        }
    };
    admits_python.insert(raw.to_string(), ok);
    ok
}
