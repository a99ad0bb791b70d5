use crate::prelude::*;
use std::path::Path;

/// Read the static dependency list out of a local checkout's
/// pyproject.toml. Only PEP 621 `[project].dependencies` counts as static;
/// anything dynamic needs a requirements file instead.
pub fn read_checkout_requirements(dir: &Path) -> Result<(String, Vec<Requirement>)> {
    let manifest = dir.join("pyproject.toml");
    let text = std::fs::read_to_string(&manifest)
        .wrap_err_with(|| format!("reading {}", manifest.display()))?;
    let doc: toml_edit::Document = text
        .parse()
        .wrap_err_with(|| format!("parsing {}", manifest.display()))?;

    let deps = doc
        .as_table()
        .get("project")
        .and_then(|item| item.as_table())
        .and_then(|project| project.get("dependencies"))
        .and_then(|item| item.as_array());

    let mut reqs = Vec::new();
    if let Some(deps) = deps {
        for item in deps.iter() {
            let Some(raw) = item.as_str() else {
                warn!("skipping non-string dependency entry {item} in {}", manifest.display());
                continue;
            };
            match Requirement::parse(raw, ParseExtra::NotAllowed) {
                Ok(req) => reqs.push(req),
                Err(err) => warn!("skipping invalid requirement {:?}: {err}", raw),
            }
        }
    }

    if reqs.is_empty() {
        bail!(
            "{} does not declare any static [project] dependencies; \
             try -r requirements.txt instead",
            manifest.display()
        );
    }
    Ok((manifest.display().to_string(), reqs))
}

#[cfg(test)]
mod test {
    use super::*;
    use indoc::indoc;

    #[test]
    fn test_reads_pep621_dependencies() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("pyproject.toml"),
            indoc! {r#"
                [project]
                name = "example"
                version = "1.0"
                dependencies = [
                    "requests>=2.0",
                    "click",
                    "not !! parseable",
                ]
            "#},
        )
        .unwrap();

        let (source, reqs) = read_checkout_requirements(dir.path()).unwrap();
        assert!(source.ends_with("pyproject.toml"));
        let names: Vec<&str> = reqs.iter().map(|r| r.name.normalized()).collect();
        assert_eq!(names, vec!["requests", "click"]);
    }

    #[test]
    fn test_no_static_metadata() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("pyproject.toml"),
            indoc! {r#"
                [project]
                name = "example"
                dynamic = ["dependencies"]
            "#},
        )
        .unwrap();
        assert!(read_checkout_requirements(dir.path()).is_err());

        // and a missing file is an error too
        let empty = tempfile::tempdir().unwrap();
        assert!(read_checkout_requirements(empty.path()).is_err());
    }
}
