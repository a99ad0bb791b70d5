use crate::prelude::*;

use crate::walker::Walker;
use std::io::Write;

/// What one conflict-resolution pass concluded.
#[derive(Debug)]
pub struct ConflictReport {
    /// Pins that, when prepended to the seeds, made their project's
    /// conflict go away.
    pub resolutions: Vec<(PackageName, Version)>,
    /// Projects no candidate pin could fix, sorted by name.
    pub unresolved: Vec<PackageName>,
}

/// Try to resolve each conflict the previous drain found, by replaying the
/// walk with `name==version` pinned ahead of the original seeds, one
/// observed version at a time. First pin that makes the project's conflict
/// disappear wins; the walker is left in the state of the last replay.
pub fn resolve_conflicts(
    walker: &mut Walker,
    seeds: &[(Requirement, String)],
    out: &mut dyn Write,
) -> Result<ConflictReport> {
    // snapshot: the replays below rewrite the live conflict table
    let snapshot: Vec<(PackageName, Vec<Version>)> = walker
        .known_conflicts()
        .iter()
        .map(|(name, versions)| (name.clone(), versions.iter().cloned().collect()))
        .collect();

    let mut resolutions = Vec::new();
    let mut unresolved = Vec::new();

    for (name, versions) in snapshot {
        let mut fixed = None;
        for version in versions {
            info!(
                "replaying with pin {}=={}",
                name.normalized(),
                version
            );
            walker.clear();
            walker.feed(Requirement::pinned(name.clone(), &version), "pin")?;
            for (req, source) in seeds {
                walker.feed(req.clone(), source)?;
            }
            if let Err(err) = walker.drain() {
                warn!(
                    "pin {}=={} failed outright: {err:#}",
                    name.normalized(),
                    version
                );
                continue;
            }
            if !walker.known_conflicts().contains_key(&name) {
                fixed = Some(version);
                break;
            }
        }
        match fixed {
            Some(version) => resolutions.push((name, version)),
            None => unresolved.push(name),
        }
    }
    unresolved.sort();

    for (name, version) in &resolutions {
        writeln!(
            out,
            "pin {}=={} resolves its conflict",
            name.normalized(),
            version
        )?;
    }
    if !unresolved.is_empty() {
        let names: Vec<&str> = unresolved.iter().map(|n| n.normalized()).collect();
        writeln!(out, "still conflicting: {}", names.join(", "))?;
    }

    Ok(ConflictReport {
        resolutions,
        unresolved,
    })
}
