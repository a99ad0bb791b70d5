use crate::prelude::*;
use std::path::Path;

// This is an especially simple version of requirements-file parsing; one
// requirement per line, comments, and nothing else. Option lines (-r,
// --index-url, --hash, ...) are skipped rather than interpreted, at the
// expense of missing some deps.

/// Parse a requirements file, warning (through `warned_about_ignored_lines`,
/// at most once per walker) about option lines we skip. Unparseable
/// requirement lines are dropped individually, never fatal.
pub fn read_simple_requirements(
    path: &Path,
    warned_about_ignored_lines: &mut bool,
) -> Result<Vec<Requirement>> {
    let text = std::fs::read_to_string(path)
        .wrap_err_with(|| format!("reading requirements file {}", path.display()))?;

    let mut reqs = Vec::new();
    for line in text.lines() {
        // unwrap safe because: split always yields at least one piece
        let line = line.split('#').next().unwrap().trim();
        if line.is_empty() {
            continue;
        }
        if line.starts_with('-') {
            if !*warned_about_ignored_lines {
                warn!(
                    "non-simple requirement lines are ignored \
                     (this message only prints once)"
                );
                *warned_about_ignored_lines = true;
            }
            info!("ignoring line {:?}", line);
            continue;
        }
        match Requirement::parse(line, ParseExtra::Allowed) {
            Ok(req) => reqs.push(req),
            Err(err) => warn!("skipping invalid requirement {:?}: {err}", line),
        }
    }
    Ok(reqs)
}
