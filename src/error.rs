use thiserror::Error;

#[derive(Error, Debug)]
pub enum DepwalkError {
    #[error("{name} has no {python_version}-compatible release")]
    NoCompatibleRelease { name: String, python_version: String },
    #[error("{name} has no release matching '{specifiers}' for python {python_version}")]
    NoMatchingRelease {
        name: String,
        python_version: String,
        specifiers: String,
    },
    #[error("unknown sys_platform {0:?} (expected linux, win32, or darwin)")]
    InvalidEnvironmentKind(String),
}
