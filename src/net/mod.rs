pub mod lazy_remote_file;
pub mod retry;

use std::time::Duration;
use ureq::{Agent, AgentBuilder};

pub fn user_agent() -> String {
    format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
}

/// The one HTTP agent shared by a whole walk. ureq agents are cheap to
/// clone and thread-safe, so the worker pool just clones it around.
pub fn build_agent() -> Agent {
    AgentBuilder::new()
        .timeout_read(Duration::from_secs(15))
        .timeout_write(Duration::from_secs(15))
        .user_agent(&user_agent())
        .build()
}
