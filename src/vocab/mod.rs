mod dist_filename;
mod extra;
mod package_name;
mod requirement;
mod rfc822ish;
mod specifier;
mod version;

// All this stuff is also re-exported from crate::prelude::*

pub use self::dist_filename::{version_from_filename, PackageType};
pub use self::extra::Extra;
pub use self::package_name::PackageName;
pub use self::requirement::{marker, ParseExtra, Requirement};
pub use self::rfc822ish::RFC822ish;
pub use self::specifier::{CompareOp, Specifier, Specifiers};
pub use self::version::{Version, VERSION_INFINITY, VERSION_ZERO};
