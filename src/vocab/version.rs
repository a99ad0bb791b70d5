use crate::prelude::*;

// We lean on the 'pep440' crate for the heavy lifting part of representing
// versions, but wrap it in our own type so we can hang extra methods and
// trait impls off of it.

#[derive(
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Debug,
    Hash,
    SerializeDisplay,
    DeserializeFromStr,
)]
pub struct Version(pub pep440::Version);

pub static VERSION_ZERO: Lazy<Version> = Lazy::new(|| "0a0.dev0".try_into().unwrap());

pub static VERSION_INFINITY: Lazy<Version> = Lazy::new(|| {
    // Technically there is no largest PEP 440 version. But this should be good
    // enough that no-one will notice the difference...
    Version(pep440::Version {
        epoch: u32::MAX,
        release: vec![u32::MAX, u32::MAX, u32::MAX],
        pre: None,
        post: Some(u32::MAX),
        dev: None,
        local: vec![],
    })
});

impl Version {
    pub fn is_prerelease(&self) -> bool {
        self.0.pre.is_some() || self.0.dev.is_some()
    }

    /// Returns the smallest PEP 440 version that is larger than self.
    pub fn next(&self) -> Version {
        let mut new = self.clone();
        // The ordering rules are in
        //   https://www.python.org/dev/peps/pep-0440/#summary-of-permitted-suffixes-and-relative-ordering
        //
        // - You can't attach a .postN after a .devN, so if we have a .devN
        //   the next possible version is .dev(N+1).
        // - You can't attach a second .postN, so after a .postN the next
        //   possible value is .post(N+1).
        // - You *can* attach a .postN after anything else, and a .devN after
        //   that, so the next possible value is .post0.dev0.
        if let Some(dev) = &mut new.0.dev {
            *dev += 1;
        } else if let Some(post) = &mut new.0.post {
            *post += 1;
        } else {
            new.0.post = Some(0);
            new.0.dev = Some(0);
        }
        new
    }
}

impl TryFrom<&str> for Version {
    type Error = eyre::Report;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        pep440::Version::parse(value)
            .map(Version)
            .ok_or_else(|| eyre!("failed to parse PEP 440 version {:?}", value))
    }
}

try_from_str_boilerplate!(Version);

impl Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_version_ordering() {
        let v1: Version = "1.0".parse().unwrap();
        let v1rc: Version = "1.0rc1".parse().unwrap();
        let v2: Version = "2.0".parse().unwrap();
        assert!(v1rc < v1);
        assert!(v1 < v2);
        assert!(*VERSION_ZERO < v1rc);
        assert!(v2 < *VERSION_INFINITY);
    }

    #[test]
    fn test_version_next() {
        let v: Version = "1.0".parse().unwrap();
        let next = v.next();
        assert!(v < next);
        assert!(next < "1.0.1".parse().unwrap());
        assert_eq!("1.0.dev1".parse::<Version>().unwrap(), "1.0.dev0".parse::<Version>().unwrap().next());
    }

    #[test]
    fn test_is_prerelease() {
        for (version, expected) in [
            ("1.0", false),
            ("1.0a1", true),
            ("1.0rc2", true),
            ("1.0.dev3", true),
            ("1.0.post1", false),
        ] {
            let v: Version = version.parse().unwrap();
            assert_eq!(v.is_prerelease(), expected, "{version}");
        }
    }
}
