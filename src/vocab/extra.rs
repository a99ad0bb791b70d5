// 'Extra' string format is not well specified. PEP 508's grammar says extras
// are "identifiers" (first char [A-Za-z0-9], then also -_.), while pip runs
// them through pkg_resources.safe_extra. Pretending they act like package
// names has worked out so far.

use crate::prelude::*;

#[derive(Debug, Clone, DeserializeFromStr, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct Extra(PackageName);

impl Extra {
    pub fn as_given(&self) -> &str {
        self.0.as_given()
    }

    pub fn normalized(&self) -> &str {
        self.0.normalized()
    }
}

impl TryFrom<&str> for Extra {
    type Error = eyre::Report;

    fn try_from(s: &str) -> Result<Self> {
        let p: PackageName = s.try_into()?;
        Ok(Extra(p))
    }
}

try_from_str_boilerplate!(Extra);
