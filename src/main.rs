#![forbid(unsafe_code)]

mod cache;
mod checkout;
mod conflicts;
mod error;
mod graph;
mod index;
mod markers;
mod net;
mod output;
mod pool;
mod prelude;
mod projects;
mod render;
mod requirements_file;
mod selector;
mod trace;
mod util;
mod vocab;
mod walker;

#[cfg(test)]
mod test_util;

use crate::prelude::*;

use crate::cache::Cache;
use crate::output::ColorChoice;
use crate::walker::Walker;
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    version,
    about = "Walk and render PyPI dependency trees without installing anything"
)]
struct Opt {
    /// Write a chrome-tracing log of timed regions to this file.
    #[arg(long, value_name = "FILE")]
    trace: Option<PathBuf>,

    /// Sample process cpu usage into the trace every 100ms.
    #[arg(long, requires = "trace")]
    stats: bool,

    #[command(flatten)]
    output: output::OutputArgs,

    /// Use the default index url, ignoring environment overrides.
    #[arg(short = 'I', long)]
    isolate_env: bool,

    /// Disable the extracted-metadata cache.
    #[arg(long)]
    no_cache: bool,

    /// Parallelism factor for network i/o.
    #[arg(short, long, default_value_t = walker::DEFAULT_PARALLELISM)]
    parallelism: usize,

    /// Target platform: linux, win32, or darwin.
    #[arg(long, value_name = "PLAT", default_value = "linux")]
    platform: String,

    /// Target python version, e.g. 3.11.2. Defaults to the interpreter
    /// found on PATH.
    #[arg(long, value_name = "VERSION")]
    python_version: Option<String>,

    /// Print the post-order install list instead of the tree.
    #[arg(long)]
    install_order: bool,

    /// Print a color legend before the tree.
    #[arg(long)]
    print_legend: bool,

    /// Force colorized output.
    #[arg(long, conflicts_with = "no_color")]
    color: bool,

    /// Force uncolorized output (tags like [conflict] are spelled out
    /// instead).
    #[arg(long)]
    no_color: bool,

    /// Treat NAME==VERSION as currently installed and prefer to keep it.
    /// (Can be repeated.)
    #[arg(long, value_name = "NAME==VERSION")]
    have: Vec<String>,

    /// Requirements file to feed. (Can be repeated.)
    #[arg(short = 'r', long = "requirements-file", value_name = "FILE")]
    requirements_file: Vec<PathBuf>,

    /// Read seed requirements from a local checkout's pyproject.toml.
    #[arg(long, value_name = "DIR")]
    checkout: Option<PathBuf>,

    /// Requirements to walk, e.g. 'requests[socks]>=2'.
    #[arg(value_name = "DEPS")]
    deps: Vec<String>,
}

fn parse_have(entries: &[String]) -> Result<HashMap<PackageName, String>> {
    let mut have = HashMap::new();
    for entry in entries {
        let (name, version) = entry
            .split_once("==")
            .ok_or_else(|| eyre!("expected NAME==VERSION in --have {:?}", entry))?;
        have.insert(name.trim().parse()?, version.trim().to_string());
    }
    Ok(have)
}

fn main() -> Result<()> {
    let opt = Opt::parse();
    let color = ColorChoice::from_flags(opt.color, opt.no_color);
    output::init(&opt.output, color);

    if let Some(path) = &opt.trace {
        trace::init(path)?;
        if opt.stats {
            trace::start_cpu_stats();
        }
    }

    let python_version = opt
        .python_version
        .clone()
        .unwrap_or_else(markers::host_python_version);
    let env = markers::EnvironmentMarkers::new(&python_version, &opt.platform)?;

    let cache = if opt.no_cache {
        Cache::noop()
    } else {
        Cache::disk(&PROJECT_DIRS.cache_dir().join("metadata"))
    };
    let index_url = index::index_url(opt.isolate_env)?;
    info!("walking against {}", index_url);
    let index: Arc<dyn index::SimpleIndex> =
        Arc::new(index::PyPiIndex::new(net::build_agent(), index_url));

    let have = parse_have(&opt.have)?;
    let callback: walker::VersionCallback = if have.is_empty() {
        walker::no_current_versions()
    } else {
        Box::new(move |name| have.get(name).cloned())
    };

    let mut walker = Walker::new(opt.parallelism, env, index, cache, callback);

    // Keep our own copy of the seeds: the conflict driver replays them.
    let mut seeds: Vec<(Requirement, String)> = Vec::new();
    for dep in &opt.deps {
        let req = Requirement::parse(dep, ParseExtra::Allowed)?;
        walker.feed(req.clone(), "arg")?;
        seeds.push((req, "arg".into()));
    }
    for path in &opt.requirements_file {
        let source = path.display().to_string();
        for req in walker.feed_file(path)? {
            seeds.push((req, source.clone()));
        }
    }
    if let Some(dir) = &opt.checkout {
        let (source, reqs) = checkout::read_checkout_requirements(dir)?;
        for req in reqs {
            walker.feed(req.clone(), &source)?;
            seeds.push((req, source.clone()));
        }
    }

    walker.drain()?;

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    if opt.install_order {
        walker.print_flat(&mut out)?;
    } else {
        if opt.print_legend {
            walker.print_legend(&mut out, color)?;
        }
        walker.print_tree(&mut out, color)?;
    }

    // Unresolved conflicts are reported, not fatal: the exit code stays 0
    // for any walk that ran to completion.
    if !walker.known_conflicts().is_empty() {
        let report = conflicts::resolve_conflicts(&mut walker, &seeds, &mut out)?;
        info!(
            "{} conflicts resolved, {} unresolved",
            report.resolutions.len(),
            report.unresolved.len()
        );
    }

    let stats = walker.cache_stats();
    debug!(
        "metadata cache: {} hits, {} misses, {} writes",
        stats.hits, stats.pass, stats.sets
    );

    trace::flush()?;
    Ok(())
}
