use crate::prelude::*;

use crate::cache::Cache;
use crate::graph::{ChoiceKey, DepGraph, Edge};
use crate::index::SimpleIndex;
use crate::markers::EnvironmentMarkers;
use crate::pool::{Pool, Task};
use crate::projects::{BasicMetadata, Project};
use crate::selector::find_best_compatible;
use crate::trace;
use indexmap::{IndexMap, IndexSet};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Mutex;

pub const DEFAULT_PARALLELISM: usize = 24;

pub type VersionCallback = Box<dyn Fn(&PackageName) -> Option<String>>;

/// Default for when no already-installed versions should be reused.
pub fn no_current_versions() -> VersionCallback {
    Box::new(|_| None)
}

struct QueueEntry {
    parent: crate::graph::ChoiceIdx,
    name: PackageName,
    req: Requirement,
    source: String,
    /// Keys of every choice on the path from the root to `parent`; the
    /// cycle guard.
    ancestors: HashSet<ChoiceKey>,
}

/// The concurrent dependency walker. Seeds go in through `feed`, one
/// `drain` consumes the queue and grows the output graph, and the
/// renderers then read the graph back out.
///
/// Concurrency shape: the drain loop runs on the calling thread and is the
/// only thing touching the queue and the graph. Workers run the fetch
/// closures in `Fetcher`, which touch only the memo maps (each behind a
/// mutex) and the blob cache (safe via atomic rename).
pub struct Walker {
    fetcher: Arc<Fetcher>,
    graph: DepGraph,
    queue: VecDeque<QueueEntry>,
    known_conflicts: IndexMap<PackageName, IndexSet<Version>>,
    current_version_of: VersionCallback,
    admits_python: HashMap<String, bool>,
    warned_about_ignored_lines: bool,
}

/// The shared, thread-safe half of the walker: everything a worker needs
/// to fetch pages and metadata and to schedule speculative follow-ups.
struct Fetcher {
    pool: Pool,
    index: Arc<dyn SimpleIndex>,
    cache: Cache,
    env: EnvironmentMarkers,
    /// At most one in-flight page fetch per project name, ever.
    memo_fetch: Mutex<HashMap<PackageName, Task<Arc<Project>>>>,
    /// At most one metadata fetch per (name, version).
    memo_version_metadata: Mutex<HashMap<(PackageName, Version), Task<Arc<BasicMetadata>>>>,
}

// These are associated functions over &Arc<Fetcher> rather than methods:
// scheduling a fetch means cloning the Arc into the job closure so the job
// can schedule more fetches of its own.
impl Fetcher {
    /// Memoized page fetch. The memo map doubles as the insertion lock:
    /// whoever gets the entry in first wins, everyone else reuses their
    /// task.
    fn schedule_project_fetch(
        fetcher: &Arc<Fetcher>,
        name: &PackageName,
        proactive: bool,
    ) -> Task<Arc<Project>> {
        let mut memo = fetcher.memo_fetch.lock().unwrap();
        if let Some(task) = memo.get(name) {
            return task.clone();
        }
        let job_fetcher = Arc::clone(fetcher);
        let job_name = name.clone();
        let task = fetcher
            .pool
            .submit(move || Fetcher::fetch_project(&job_fetcher, &job_name, proactive));
        memo.insert(name.clone(), task.clone());
        task
    }

    fn fetch_project(
        fetcher: &Arc<Fetcher>,
        name: &PackageName,
        proactive: bool,
    ) -> Result<Arc<Project>> {
        let _region = trace::region("fetch_project", name.normalized());
        context!("fetching releases of {}", name.normalized());
        let page = fetcher.index.get_project_page(name)?;
        let project = Arc::new(Project::from_project_page(&page)?);
        debug!(
            "fetched {} ({} versions, proactive={})",
            name.normalized(),
            project.versions().len(),
            proactive,
        );
        // It's extremely likely that we will subsequently look up the deps
        // of the most recent version, so go ahead and schedule that fetch.
        if let Some(latest) = project.latest() {
            let version = latest.version().clone();
            Fetcher::schedule_metadata_fetch(fetcher, &project, &version);
        }
        Ok(project)
    }

    fn schedule_metadata_fetch(
        fetcher: &Arc<Fetcher>,
        project: &Arc<Project>,
        version: &Version,
    ) -> Task<Arc<BasicMetadata>> {
        let key = (project.name().clone(), version.clone());
        let mut memo = fetcher.memo_version_metadata.lock().unwrap();
        if let Some(task) = memo.get(&key) {
            return task.clone();
        }
        let job_fetcher = Arc::clone(fetcher);
        let job_project = Arc::clone(project);
        let job_version = version.clone();
        let task = fetcher.pool.submit(move || {
            Fetcher::fetch_version_metadata(&job_fetcher, &job_project, &job_version)
        });
        memo.insert(key, task.clone());
        task
    }

    fn fetch_version_metadata(
        fetcher: &Arc<Fetcher>,
        project: &Arc<Project>,
        version: &Version,
    ) -> Result<Arc<BasicMetadata>> {
        let _region = trace::region(
            "fetch_version_metadata",
            format!("{}=={}", project.name().normalized(), version),
        );
        context!(
            "fetching metadata for {}=={}",
            project.name().normalized(),
            version
        );
        let pv = project.versions().get(version).ok_or_else(|| {
            eyre!(
                "{} has no release {}",
                project.name().normalized(),
                version
            )
        })?;
        let metadata = Arc::new(pv.get_deps(&*fetcher.index, &fetcher.cache)?);

        // The drain loop will almost certainly want the index pages of these
        // deps next (without any extras), so warm them up. Marker failures
        // here are swallowed: a prefetch must never kill the walk, and the
        // drain loop re-evaluates for real.
        for req in &metadata.reqs {
            if fetcher
                .memo_fetch
                .lock()
                .unwrap()
                .contains_key(&req.name)
            {
                continue;
            }
            // marker evaluation is relatively expensive, hence the
            // contains_key check above before doing it
            if fetcher
                .env
                .matches(req.env_marker_expr.as_ref(), &[])
                .unwrap_or(false)
            {
                Fetcher::schedule_project_fetch(fetcher, &req.name, true);
            }
        }

        debug!(
            "fetched metadata for {}=={} ({} requirements)",
            project.name().normalized(),
            version,
            metadata.reqs.len()
        );
        Ok(metadata)
    }
}

impl Walker {
    pub fn new(
        parallelism: usize,
        env: EnvironmentMarkers,
        index: Arc<dyn SimpleIndex>,
        cache: Cache,
        current_version_of: VersionCallback,
    ) -> Walker {
        Walker {
            fetcher: Arc::new(Fetcher {
                pool: Pool::new(parallelism),
                index,
                cache,
                env,
                memo_fetch: Mutex::new(HashMap::new()),
                memo_version_metadata: Mutex::new(HashMap::new()),
            }),
            graph: DepGraph::new(),
            queue: VecDeque::new(),
            known_conflicts: IndexMap::new(),
            current_version_of,
            admits_python: HashMap::new(),
            warned_about_ignored_lines: false,
        }
    }

    pub fn graph(&self) -> &DepGraph {
        &self.graph
    }

    pub fn known_conflicts(&self) -> &IndexMap<PackageName, IndexSet<Version>> {
        &self.known_conflicts
    }

    pub fn current_version(&self, name: &PackageName) -> Option<String> {
        (self.current_version_of)(name)
    }

    pub fn cache_stats(&self) -> crate::cache::CacheStats {
        self.fetcher.cache.stats()
    }

    /// Accept one seed requirement. Requirements whose marker rejects the
    /// target environment are dropped here, before any network traffic.
    pub fn feed(&mut self, req: Requirement, source: &str) -> Result<()> {
        debug!("feed {} ({}) from {}", req.name.normalized(), req, source);
        if !self
            .fetcher
            .env
            .matches(req.env_marker_expr.as_ref(), &[])?
        {
            return Ok(());
        }
        let name = req.name.clone();
        Fetcher::schedule_project_fetch(&self.fetcher, &name, false);
        self.queue.push_back(QueueEntry {
            parent: self.graph.root(),
            name,
            req,
            source: source.into(),
            ancestors: HashSet::new(),
        });
        Ok(())
    }

    /// Feed every requirement from a (simplified) requirements file.
    /// Returns what was fed, so callers can replay the same seeds later.
    pub fn feed_file(&mut self, path: &Path) -> Result<Vec<Requirement>> {
        let source = path.display().to_string();
        let reqs = crate::requirements_file::read_simple_requirements(
            path,
            &mut self.warned_about_ignored_lines,
        )?;
        for req in &reqs {
            self.feed(req.clone(), &source)?;
        }
        Ok(reqs)
    }

    /// Wait out any speculative fetches still sitting in the pool queue, so
    /// tests can take stable fetch counts. Only exact for a single worker.
    #[cfg(test)]
    pub(crate) fn quiesce(&self) {
        self.fetcher.pool.submit(|| Ok(())).wait().unwrap();
    }

    /// Reset the output graph and the conflict table for a replay. The memo
    /// maps deliberately survive, so a replay never re-fetches anything the
    /// previous walk already pulled.
    pub fn clear(&mut self) {
        self.graph = DepGraph::new();
        // entries left over from an aborted drain refer into the old graph
        self.queue.clear();
        self.known_conflicts.clear();
    }

    /// Consume the queue. First-seen-wins per name within one drain;
    /// disagreements land in the conflict table instead of triggering any
    /// backtracking.
    pub fn drain(&mut self) -> Result<()> {
        let _region = trace::region("drain", "");
        let mut chosen: HashMap<PackageName, Version> = HashMap::new();

        while let Some(entry) = self.queue.pop_front() {
            let QueueEntry {
                parent,
                name,
                req,
                source,
                ancestors,
            } = entry;
            info!(
                "process {} ({}) from {} with extras {:?}",
                name.normalized(),
                req,
                source,
                req.extras.iter().map(|e| e.normalized()).collect::<Vec<_>>(),
            );

            let project = {
                let _region = trace::region("await project", name.normalized());
                let task = Fetcher::schedule_project_fetch(&self.fetcher, &name, false);
                self.fetcher.pool.bump(&task);
                task.wait().wrap_err_with(|| {
                    format!("fetching releases of {}", name.normalized())
                })?
            };

            let version = find_best_compatible(
                &project,
                &req,
                &self.fetcher.env,
                chosen.get(&name),
                &*self.current_version_of,
                &mut self.admits_python,
            )?;

            let child = self
                .graph
                .add_choice(name.clone(), version.clone(), req.extras.clone());
            self.graph.add_edge(
                parent,
                Edge {
                    target: child,
                    specifiers: req.specifiers.clone(),
                    marker: req.env_marker_expr.clone(),
                    note: source,
                },
            );
            let child_key = self.graph.choice(child).key();

            if ancestors.contains(&child_key) {
                info!(
                    "not descending into {} again (dependency cycle)",
                    name.normalized()
                );
                continue;
            }

            if let Some(previous) = chosen.get(&name) {
                if previous != &version {
                    info!(
                        "multiple versions for {}: {} and {}",
                        name.normalized(),
                        previous,
                        version
                    );
                    let set = self
                        .known_conflicts
                        .entry(name.clone())
                        .or_insert_with(IndexSet::new);
                    set.insert(previous.clone());
                    set.insert(version.clone());
                }
            }
            chosen.insert(name.clone(), version.clone());

            // A version the index has never heard of (a --have pin of a
            // private build) has no metadata to consult; its subtree simply
            // ends here.
            let Some(pv) = project.versions().get(&version) else {
                continue;
            };
            // TODO: give yanked releases an actual policy instead of just
            // noting them
            if pv.yanked() {
                debug!(
                    "{}=={} is yanked{}",
                    name.normalized(),
                    version,
                    pv.yank_reason()
                        .map(|reason| format!(" ({reason})"))
                        .unwrap_or_default()
                );
            }

            let metadata = {
                let _region = trace::region(
                    "await metadata",
                    format!("{}=={}", name.normalized(), version),
                );
                let task =
                    Fetcher::schedule_metadata_fetch(&self.fetcher, &project, &version);
                self.fetcher.pool.bump(&task);
                task.wait().wrap_err_with(|| {
                    format!("fetching metadata for {}=={}", name.normalized(), version)
                })?
            };

            {
                let choice = self.graph.choice_mut(child);
                choice.has_sdist = metadata.has_sdist;
                choice.has_wheel = metadata.has_wheel;
            }

            // Dependency markers are evaluated with the *parent's* activated
            // extras: that's what turns `extra == "..."` guards on.
            let mut active_extras = req.extras.clone();
            active_extras.sort();
            for dep in &metadata.reqs {
                if self
                    .fetcher
                    .env
                    .matches(dep.env_marker_expr.as_ref(), &active_extras)?
                {
                    trace!("  keep {} -> {}", name.normalized(), dep);
                    Fetcher::schedule_project_fetch(&self.fetcher, &dep.name, false);
                    let mut dep_ancestors = ancestors.clone();
                    dep_ancestors.insert(child_key.clone());
                    self.queue.push_back(QueueEntry {
                        parent: child,
                        name: dep.name.clone(),
                        req: dep.clone(),
                        source: "dep".into(),
                        ancestors: dep_ancestors,
                    });
                } else {
                    trace!("  omit {} -> {}", name.normalized(), dep);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::render::render_to_string;
    use crate::test_util::FakeIndex;

    fn walker_over(index: &Arc<FakeIndex>) -> Walker {
        let shared: Arc<dyn SimpleIndex> = index.clone();
        Walker::new(
            1,
            EnvironmentMarkers::new("3.7.5", "linux").unwrap(),
            shared,
            Cache::noop(),
            no_current_versions(),
        )
    }

    fn feed_and_drain(walker: &mut Walker, seeds: &[&str]) -> Result<()> {
        for seed in seeds {
            walker.feed(Requirement::parse(seed, ParseExtra::Allowed)?, "arg")?;
        }
        walker.drain()
    }

    #[test]
    fn test_each_page_and_metadata_fetched_once() {
        let index = Arc::new(FakeIndex::standard_universe());
        let mut walker = walker_over(&index);
        feed_and_drain(&mut walker, &["batman", "batman==1"]).unwrap();

        // one page fetch per distinct project name reached
        assert_eq!(index.page_fetch_count("batman"), 1);
        assert_eq!(index.page_fetch_count("robin"), 1);
        // one metadata fetch per distinct (name, version) consulted:
        // batman 2.0 + 1.0, robin 2.0 + 1.0
        assert_eq!(index.sidecar_fetch_count(), 4);
    }

    #[test]
    fn test_clear_preserves_memoized_fetches() {
        let index = Arc::new(FakeIndex::standard_universe());
        let mut walker = walker_over(&index);
        feed_and_drain(&mut walker, &["batman==1"]).unwrap();
        walker.quiesce();
        let pages_before = index.page_fetch_count("batman");
        let metadata_before = index.sidecar_fetch_count();

        walker.clear();
        assert!(walker.known_conflicts().is_empty());
        feed_and_drain(&mut walker, &["batman==1"]).unwrap();

        // the replay reused every completed fetch
        assert_eq!(index.page_fetch_count("batman"), pages_before);
        assert_eq!(index.sidecar_fetch_count(), metadata_before);
        // and still produced a fresh graph
        let flat = render_to_string(|out| walker.print_flat(out)).unwrap();
        assert_eq!(flat, "robin==1.0\nbatman==1.0\n");
    }

    #[test]
    fn test_cycle_terminates() {
        let index = Arc::new(FakeIndex::standard_universe());
        let mut walker = walker_over(&index);
        feed_and_drain(&mut walker, &["chicken"]).unwrap();

        let tree = render_to_string(|out| {
            walker.print_tree(out, crate::output::ColorChoice::Never)
        })
        .unwrap();
        assert_eq!(
            tree,
            "chicken (==1.0) via * [good]\n\
             . egg (==1.0) via * [good]\n\
             . . chicken (==1.0) (already listed) via *\n"
        );
    }

    #[test]
    fn test_marker_rejected_seed_is_dropped() {
        let index = Arc::new(FakeIndex::standard_universe());
        let mut walker = walker_over(&index);
        feed_and_drain(
            &mut walker,
            &["batman==1; python_version < '3'", "robin"],
        )
        .unwrap();

        // batman never hit the network at all
        assert_eq!(index.page_fetch_count("batman"), 0);
        let flat = render_to_string(|out| walker.print_flat(out)).unwrap();
        assert_eq!(flat, "robin==2.0\n");
    }

    #[test]
    fn test_unknown_project_fails_the_walk() {
        let index = Arc::new(FakeIndex::standard_universe());
        let mut walker = walker_over(&index);
        let err = feed_and_drain(&mut walker, &["gotham"]).unwrap_err();
        assert!(err.to_string().contains("gotham"));
    }

    #[test]
    fn test_no_matching_release_propagates() {
        let index = Arc::new(FakeIndex::standard_universe());
        let mut walker = walker_over(&index);
        let err = feed_and_drain(&mut walker, &["batman==3"]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DepwalkError>(),
            Some(DepwalkError::NoMatchingRelease { .. })
        ));
    }

    #[test]
    fn test_conflicts_accumulate_across_drains_until_clear() {
        let index = Arc::new(FakeIndex::standard_universe());
        let mut walker = walker_over(&index);
        feed_and_drain(&mut walker, &["robin", "robin==1.0"]).unwrap();
        assert_eq!(walker.known_conflicts().len(), 1);

        // chosen is per-drain: a second drain with an agreeing seed doesn't
        // conflict with the first drain's choice...
        feed_and_drain(&mut walker, &["robin==1.0"]).unwrap();
        // ...but the conflict table still remembers until clear()
        assert_eq!(walker.known_conflicts().len(), 1);
        walker.clear();
        assert!(walker.known_conflicts().is_empty());
    }
}
