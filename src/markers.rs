use crate::prelude::*;

/// The PEP 508 environment marker variables describing the target
/// environment. Immutable once constructed; one instance is shared by a
/// whole walk.
///
/// `platform_release` and `platform_version` describe a concrete running
/// kernel, which a target triple doesn't pin down, so they stay unset and
/// markers that compare against them fail loudly instead of guessing.
#[derive(Debug, Clone)]
pub struct EnvironmentMarkers {
    os_name: String,
    sys_platform: String,
    platform_machine: String,
    platform_python_implementation: String,
    platform_release: Option<String>,
    platform_system: String,
    platform_version: Option<String>,
    python_version: String,
    python_full_version: String,
    implementation_name: String,
}

pub const FALLBACK_PYTHON_VERSION: &str = "3.12.0";

impl EnvironmentMarkers {
    /// `python_version` is "major.minor" or "major.minor.patch" ("3.11" is
    /// read as "3.11.0"); `sys_platform` is linux, win32, or darwin.
    pub fn new(python_version: &str, sys_platform: &str) -> Result<EnvironmentMarkers> {
        let mut full_version = python_version.to_string();
        if full_version.matches('.').count() == 1 {
            full_version.push_str(".0");
        }
        let short_version = match full_version.rsplit_once('.') {
            Some((prefix, _)) => prefix.to_string(),
            None => full_version.clone(),
        };

        let mut env = EnvironmentMarkers {
            os_name: "posix".into(),
            sys_platform: sys_platform.into(),
            platform_machine: "x86_64".into(),
            platform_python_implementation: "CPython".into(),
            platform_release: None,
            platform_system: "Linux".into(),
            platform_version: None,
            python_version: short_version,
            python_full_version: full_version,
            implementation_name: "cpython".into(),
        };

        if env.sys_platform == "linux" {
            if env.python_version.starts_with('2') {
                env.sys_platform = "linux2".into();
            }
        } else if env.sys_platform == "win32" {
            env.platform_system = "Windows".into();
            env.os_name = "nt".into();
        } else if env.sys_platform == "darwin" {
            env.platform_system = "Darwin".into();
        } else {
            return Err(
                DepwalkError::InvalidEnvironmentKind(env.sys_platform.clone()).into()
            );
        }

        Ok(env)
    }

    pub fn python_full_version(&self) -> &str {
        &self.python_full_version
    }

    /// True when `marker` is absent, when it evaluates true against this
    /// environment, or -- given a non-empty `extras` -- when it evaluates
    /// true with some extra bound. This is how `extra == "..."` conditionals
    /// in dependency lists get resolved against the parent's activated
    /// extras.
    pub fn matches(
        &self,
        expr: Option<&marker::Expr>,
        extras: &[Extra],
    ) -> Result<bool> {
        let Some(expr) = expr else { return Ok(true) };
        if extras.is_empty() {
            expr.eval(self)
        } else {
            for extra in extras {
                let overlay = WithExtra {
                    base: self,
                    extra: extra.normalized(),
                };
                if expr.eval(&overlay)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
    }
}

impl marker::Env for EnvironmentMarkers {
    fn get_marker_var(&self, var: &str) -> Option<&str> {
        match var {
            "os_name" => Some(&self.os_name),
            "sys_platform" => Some(&self.sys_platform),
            "platform_machine" => Some(&self.platform_machine),
            "platform_python_implementation" => {
                Some(&self.platform_python_implementation)
            }
            "platform_release" => self.platform_release.as_deref(),
            "platform_system" => Some(&self.platform_system),
            "platform_version" => self.platform_version.as_deref(),
            "python_version" => Some(&self.python_version),
            "python_full_version" => Some(&self.python_full_version),
            "implementation_name" => Some(&self.implementation_name),
            // An unbound 'extra' compares as the empty string, which is what
            // current packaging does and what makes extra-guarded deps drop
            // out when no extra is active.
            "extra" => Some(""),
            _ => None,
        }
    }
}

struct WithExtra<'a> {
    base: &'a EnvironmentMarkers,
    extra: &'a str,
}

impl<'a> marker::Env for WithExtra<'a> {
    fn get_marker_var(&self, var: &str) -> Option<&str> {
        if var == "extra" {
            Some(self.extra)
        } else {
            self.base.get_marker_var(var)
        }
    }
}

/// What `--python-version` defaults to: whatever interpreter is on PATH,
/// else a recent stable.
pub fn host_python_version() -> String {
    for exe in ["python3", "python"] {
        let output = match std::process::Command::new(exe).arg("--version").output() {
            Ok(output) if output.status.success() => output,
            _ => continue,
        };
        // "Python 3.11.2" on stdout (or stderr, for ancient interpreters)
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        if let Some(version) = text.split_whitespace().nth(1) {
            if version.parse::<Version>().is_ok() {
                return version.to_string();
            }
        }
    }
    debug!(
        "no python interpreter found on PATH; assuming {}",
        FALLBACK_PYTHON_VERSION
    );
    FALLBACK_PYTHON_VERSION.to_string()
}

#[cfg(test)]
mod test {
    use super::*;

    fn expr(text: &str) -> marker::Expr {
        Requirement::parse(&format!("x; {text}"), ParseExtra::Allowed)
            .unwrap()
            .env_marker_expr
            .unwrap()
    }

    #[test]
    fn test_version_normalization() {
        let env = EnvironmentMarkers::new("3.11.2", "linux").unwrap();
        assert_eq!(env.python_version, "3.11");
        assert_eq!(env.python_full_version(), "3.11.2");

        let env = EnvironmentMarkers::new("3.11", "linux").unwrap();
        assert_eq!(env.python_version, "3.11");
        assert_eq!(env.python_full_version(), "3.11.0");
    }

    #[test]
    fn test_platform_coherence() {
        let env = EnvironmentMarkers::new("3.7.5", "win32").unwrap();
        assert_eq!(env.os_name, "nt");
        assert_eq!(env.platform_system, "Windows");

        let env = EnvironmentMarkers::new("3.7.5", "darwin").unwrap();
        assert_eq!(env.platform_system, "Darwin");
        assert_eq!(env.os_name, "posix");

        let env = EnvironmentMarkers::new("2.7", "linux").unwrap();
        assert_eq!(env.sys_platform, "linux2");

        let env = EnvironmentMarkers::new("3.7.5", "linux").unwrap();
        assert_eq!(env.sys_platform, "linux");

        assert!(EnvironmentMarkers::new("3.7.5", "beos").is_err());
    }

    #[test]
    fn test_matches() {
        let env = EnvironmentMarkers::new("3.7.5", "linux").unwrap();

        assert!(env.matches(None, &[]).unwrap());
        assert!(env
            .matches(Some(&expr("python_version >= '3'")), &[])
            .unwrap());
        assert!(!env
            .matches(Some(&expr("sys_platform == 'win32'")), &[])
            .unwrap());
        assert!(env
            .matches(Some(&expr("python_full_version == '3.7.5'")), &[])
            .unwrap());
    }

    #[test]
    fn test_matches_with_extras() {
        let env = EnvironmentMarkers::new("3.7.5", "linux").unwrap();
        let socks: Extra = "socks".parse().unwrap();
        let dev: Extra = "dev".parse().unwrap();

        let guard = expr("extra == 'socks'");
        // no extras active: the unbound extra compares as ""
        assert!(!env.matches(Some(&guard), &[]).unwrap());
        // some element of extras satisfies the marker
        assert!(env.matches(Some(&guard), &[dev.clone(), socks]).unwrap());
        assert!(!env.matches(Some(&guard), &[dev]).unwrap());

        // extras also get threaded through compound markers
        let compound = expr("python_version >= '3' and extra == 'dev'");
        assert!(env
            .matches(Some(&compound), &["dev".parse().unwrap()])
            .unwrap());
    }
}
