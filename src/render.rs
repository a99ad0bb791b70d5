use crate::prelude::*;

use crate::graph::{ChoiceIdx, ChoiceKey};
use crate::output::ColorChoice;
use crate::walker::Walker;
use console::Style;
use std::io::Write;

// Output layer: the flat install-order listing and the annotated tree.
// Everything writes into a caller-supplied writer so the scenario tests can
// capture it.

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Tag {
    Conflict,
    Good,
    HaveReuse,
    NoSdist,
}

impl Tag {
    fn name(self) -> &'static str {
        match self {
            Tag::Conflict => "conflict",
            Tag::Good => "good",
            Tag::HaveReuse => "have_reuse",
            Tag::NoSdist => "no_sdist",
        }
    }

    fn style(self) -> Style {
        match self {
            Tag::Conflict => Style::new().magenta(),
            Tag::Good => Style::new().green(),
            Tag::HaveReuse => Style::new().cyan(),
            Tag::NoSdist => Style::new().red(),
        }
    }
}

struct Painter {
    color: ColorChoice,
}

impl Painter {
    fn enabled(&self) -> bool {
        match self.color {
            ColorChoice::Always => true,
            ColorChoice::Never => false,
            ColorChoice::Auto => console::colors_enabled(),
        }
    }

    fn paint(&self, style: Style, text: &str) -> String {
        if self.enabled() {
            style.force_styling(true).apply_to(text).to_string()
        } else {
            text.to_string()
        }
    }

    /// With color explicitly off the semantics still need to be visible, so
    /// lines get a textual ` [tag]` instead. (Auto counts as on here even
    /// when stdout isn't a tty -- matching what you'd see with color.)
    fn annotation(&self, tag: Option<Tag>) -> String {
        match (tag, self.color) {
            (Some(tag), ColorChoice::Never) => format!(" [{}]", tag.name()),
            _ => String::new(),
        }
    }
}

fn extras_suffix(extras: &[Extra], sorted: bool) -> String {
    if extras.is_empty() {
        return String::new();
    }
    let mut names: Vec<&str> = extras.iter().map(|e| e.normalized()).collect();
    if sorted {
        names.sort_unstable();
    }
    format!("[{}]", names.join(", "))
}

impl Walker {
    /// Post-order dependency listing: each (name, version, extras) triple
    /// exactly once, dependencies before their dependents, so installing
    /// top to bottom never breaks.
    pub fn print_flat(&self, out: &mut dyn Write) -> Result<()> {
        let mut seen: HashSet<ChoiceKey> = HashSet::new();
        self.flat_visit(out, self.graph().root(), &mut seen)
    }

    fn flat_visit(
        &self,
        out: &mut dyn Write,
        idx: ChoiceIdx,
        seen: &mut HashSet<ChoiceKey>,
    ) -> Result<()> {
        let graph = self.graph();
        for edge in &graph.choice(idx).deps {
            let target = graph.choice(edge.target);
            let key = target.key();
            let already_listed = seen.contains(&key);
            seen.insert(key);

            if !target.deps.is_empty() {
                self.flat_visit(out, edge.target, seen)?;
            }
            if !already_listed {
                writeln!(
                    out,
                    "{}{}=={}",
                    target.name.normalized(),
                    extras_suffix(&target.extras, false),
                    target.version
                )?;
            }
        }
        Ok(())
    }

    pub fn print_legend(&self, out: &mut dyn Write, color: ColorChoice) -> Result<()> {
        let painter = Painter { color };
        writeln!(
            out,
            "{} is what you hope to see.",
            painter.paint(Tag::Good.style(), "[good]")
        )?;
        writeln!(
            out,
            "{} means two different versions were found during this walk.",
            painter.paint(Tag::Conflict.style(), "[conflict]")
        )?;
        writeln!(
            out,
            "{} means this project does not have an sdist.  (This is something \
             to watch out for if you want to build from source.)",
            painter.paint(Tag::NoSdist.style(), "[no_sdist]")
        )?;
        writeln!(
            out,
            "{} means that a version specified in --have was kept.",
            painter.paint(Tag::HaveReuse.style(), "[have_reuse]")
        )?;
        writeln!(out)?;
        Ok(())
    }

    /// Pre-order tree with one line per edge. Repeat visits of a triple are
    /// marked "(already listed)" and not descended into.
    pub fn print_tree(&self, out: &mut dyn Write, color: ColorChoice) -> Result<()> {
        let painter = Painter { color };
        let mut seen: HashSet<ChoiceKey> = HashSet::new();
        self.tree_visit(out, &painter, self.graph().root(), &mut seen, 0)
    }

    fn tree_visit(
        &self,
        out: &mut dyn Write,
        painter: &Painter,
        idx: ChoiceIdx,
        seen: &mut HashSet<ChoiceKey>,
        depth: usize,
    ) -> Result<()> {
        let graph = self.graph();
        let prefix = ". ".repeat(depth);
        let yellow = Style::new().yellow();
        let blue = Style::new().blue();

        for edge in &graph.choice(idx).deps {
            let target = graph.choice(edge.target);
            let key = target.key();
            let dep_extras = extras_suffix(&target.extras, true);
            let via = if edge.specifiers.is_empty() {
                "*".to_string()
            } else {
                edge.specifiers.to_string()
            };
            let markers_part = match &edge.marker {
                Some(expr) => format!(" ; {}", expr),
                None => String::new(),
            };

            if seen.contains(&key) {
                let tag = if self.known_conflicts().contains_key(&target.name)
                    && !edge.specifiers.is_empty()
                {
                    Some(Tag::Conflict)
                } else {
                    None
                };
                let styled_name = match tag {
                    Some(tag) => painter.paint(tag.style(), target.name.normalized()),
                    None => target.name.normalized().to_string(),
                };
                writeln!(
                    out,
                    "{}{}{} (=={}) (already listed){} via {}{}",
                    prefix,
                    styled_name,
                    dep_extras,
                    target.version,
                    markers_part,
                    painter.paint(yellow.clone(), &via),
                    painter.annotation(tag),
                )?;
            } else {
                let tag = if self.known_conflicts().contains_key(&target.name) {
                    Tag::Conflict
                } else if self
                    .current_version(&target.name)
                    .and_then(|v| v.parse::<Version>().ok())
                    .map_or(false, |v| v == target.version)
                {
                    Tag::HaveReuse
                } else if !target.has_sdist {
                    Tag::NoSdist
                } else {
                    Tag::Good
                };
                seen.insert(key);

                let no_whl = if target.has_wheel {
                    String::new()
                } else {
                    painter.paint(blue.clone(), " no whl")
                };
                writeln!(
                    out,
                    "{}{}{} (=={}){} via {}{}{}",
                    prefix,
                    painter.paint(tag.style(), target.name.normalized()),
                    dep_extras,
                    target.version,
                    markers_part,
                    painter.paint(yellow.clone(), &via),
                    no_whl,
                    painter.annotation(Some(tag)),
                )?;
                if !target.deps.is_empty() {
                    self.tree_visit(out, painter, edge.target, seen, depth + 1)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
pub fn render_to_string(
    f: impl FnOnce(&mut dyn Write) -> Result<()>,
) -> Result<String> {
    let mut buf: Vec<u8> = Vec::new();
    f(&mut buf)?;
    Ok(String::from_utf8(buf)?)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cache::Cache;
    use crate::markers::EnvironmentMarkers;
    use crate::test_util::FakeIndex;
    use crate::walker::{no_current_versions, Walker};

    fn scenario_walker() -> Walker {
        Walker::new(
            1,
            EnvironmentMarkers::new("3.7.5", "linux").unwrap(),
            Arc::new(FakeIndex::standard_universe()),
            Cache::noop(),
            no_current_versions(),
        )
    }

    fn feed_and_drain(walker: &mut Walker, seeds: &[&str]) {
        for seed in seeds {
            walker
                .feed(
                    Requirement::parse(seed, ParseExtra::Allowed).unwrap(),
                    "arg",
                )
                .unwrap();
        }
        walker.drain().unwrap();
    }

    fn flat(walker: &Walker) -> String {
        render_to_string(|out| walker.print_flat(out)).unwrap()
    }

    fn tree(walker: &Walker) -> String {
        render_to_string(|out| walker.print_tree(out, ColorChoice::Auto)).unwrap()
    }

    #[test]
    fn test_simple_tree_and_flat() {
        let mut walker = scenario_walker();
        feed_and_drain(&mut walker, &["batman==1"]);

        assert_eq!(flat(&walker), "robin==1.0\nbatman==1.0\n");
        assert_eq!(
            tree(&walker),
            "batman (==1.0) via ==1\n\
             . robin (==1.0) via ==1.0\n"
        );
    }

    #[test]
    fn test_already_listed() {
        let mut walker = scenario_walker();
        feed_and_drain(&mut walker, &["batman==1", "batman"]);

        assert_eq!(
            tree(&walker),
            "batman (==1.0) via ==1\n\
             . robin (==1.0) via ==1.0\n\
             batman (==1.0) (already listed) via *\n"
        );
        // flat output still lists each triple once
        assert_eq!(flat(&walker), "robin==1.0\nbatman==1.0\n");
    }

    #[test]
    fn test_no_color_annotations() {
        let mut walker = scenario_walker();
        feed_and_drain(&mut walker, &["batman==1"]);

        let text =
            render_to_string(|out| walker.print_tree(out, ColorChoice::Never))
                .unwrap();
        assert_eq!(
            text,
            "batman (==1.0) via ==1 [good]\n\
             . robin (==1.0) via ==1.0 [good]\n"
        );
    }

    #[test]
    fn test_forced_color_styles_names() {
        let mut walker = scenario_walker();
        feed_and_drain(&mut walker, &["batman==1"]);

        let text =
            render_to_string(|out| walker.print_tree(out, ColorChoice::Always))
                .unwrap();
        // green for the node, yellow for the specifier
        assert!(text.contains("\u{1b}[32mbatman\u{1b}[0m"));
        assert!(text.contains("\u{1b}[33m==1\u{1b}[0m"));
    }

    #[test]
    fn test_conflict_coloring_and_table() {
        let mut walker = scenario_walker();
        feed_and_drain(&mut walker, &["batman", "batman==1"]);

        let conflicts = walker.known_conflicts();
        let batman: PackageName = "batman".parse().unwrap();
        let robin: PackageName = "robin".parse().unwrap();
        let versions =
            |name: &PackageName| -> Vec<String> {
                conflicts[name].iter().map(|v| v.to_string()).collect()
            };
        assert_eq!(versions(&batman), vec!["2.0", "1.0"]);
        assert_eq!(versions(&robin), vec!["2.0", "1.0"]);

        let text =
            render_to_string(|out| walker.print_tree(out, ColorChoice::Never))
                .unwrap();
        assert_eq!(
            text,
            "batman (==2.0) via * [conflict]\n\
             . robin (==2.0) via >1.0 [conflict]\n\
             batman (==1.0) via ==1 [conflict]\n\
             . robin (==1.0) via ==1.0 [conflict]\n"
        );
    }

    #[test]
    fn test_have_reuse_and_private_version() {
        let mut walker = Walker::new(
            1,
            EnvironmentMarkers::new("3.7.5", "linux").unwrap(),
            Arc::new(FakeIndex::standard_universe()),
            Cache::noop(),
            Box::new(|name| {
                (name.normalized() == "robin").then(|| "1.5".to_string())
            }),
        );
        feed_and_drain(&mut walker, &["batman"]);

        assert_eq!(
            tree(&walker),
            "batman (==2.0) via *\n\
             . robin (==1.5) via >1.0 no whl\n"
        );
        let text =
            render_to_string(|out| walker.print_tree(out, ColorChoice::Never))
                .unwrap();
        assert!(text.contains("robin (==1.5) via >1.0 no whl [have_reuse]"));
    }

    #[test]
    fn test_private_version_has_no_deps_rendered() {
        let mut walker = Walker::new(
            1,
            EnvironmentMarkers::new("3.7.5", "linux").unwrap(),
            Arc::new(FakeIndex::standard_universe()),
            Cache::noop(),
            Box::new(|name| {
                (name.normalized() == "batman").then(|| "1.5".to_string())
            }),
        );
        feed_and_drain(&mut walker, &["batman"]);

        // the private 1.5 dominates, and its metadata is never consulted
        assert_eq!(
            tree(&walker),
            "batman (==1.5) via * no whl\n"
        );
        assert_eq!(flat(&walker), "batman==1.5\n");
    }

    #[test]
    fn test_extras_render_and_marker_lines() {
        let mut walker = scenario_walker();
        feed_and_drain(&mut walker, &["wayne[butler]"]);

        assert_eq!(
            tree(&walker),
            "wayne[butler] (==1.0) via *\n\
             . alfred (==1.0) ; extra == \"butler\" via >=1.0\n"
        );
        assert_eq!(flat(&walker), "alfred==1.0\nwayne[butler]==1.0\n");

        // without the extra, the guarded dep is omitted entirely
        let mut walker = scenario_walker();
        feed_and_drain(&mut walker, &["wayne"]);
        assert_eq!(tree(&walker), "wayne (==1.0) via *\n");
    }

    #[test]
    fn test_legend() {
        let walker = scenario_walker();
        let text =
            render_to_string(|out| walker.print_legend(out, ColorChoice::Never))
                .unwrap();
        assert!(text.starts_with("[good] is what you hope to see.\n"));
        assert!(text.contains("[conflict] means two different versions"));
        assert!(text.ends_with("\n\n"));
    }
}
