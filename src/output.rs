use crate::prelude::*;
use std::fmt::Debug;

use console::{Style, StyledObject};
use tracing::{
    field::{Field, Visit},
    metadata::LevelFilter,
    span::Attributes,
    Event, Id, Subscriber,
};
use tracing_subscriber::{
    filter::{EnvFilter, Targets},
    layer::{Context, Layer},
    prelude::*,
    registry::{LookupSpan, SpanRef},
};

use clap::Args;

/// Whether output gets styled. Auto is console's own detection, seeded from
/// FORCE_COLOR / NO_COLOR.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColorChoice {
    Auto,
    Always,
    Never,
}

impl ColorChoice {
    pub fn from_flags(force_color: bool, force_no_color: bool) -> ColorChoice {
        if force_color {
            ColorChoice::Always
        } else if force_no_color {
            ColorChoice::Never
        } else if std::env::var_os("FORCE_COLOR").map_or(false, |v| !v.is_empty()) {
            ColorChoice::Always
        } else if std::env::var_os("NO_COLOR").is_some() {
            ColorChoice::Never
        } else {
            ColorChoice::Auto
        }
    }
}

#[derive(Args)]
pub struct OutputArgs {
    /// Increase verbosity. (Can be repeated.)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Reduce verbosity. (Can be repeated.)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    quiet: u8,
    /// Narrow verbose logging to specific targets, e.g.
    /// "depwalk::walker=trace,depwalk::index=debug".
    #[arg(long, value_name = "SPEC", global = true)]
    vmodule: Option<Targets>,
}

struct UILayer;

struct WithMessage<'a, F>(&'a F)
where
    F: Fn(&dyn Debug);

impl<'a, F> Visit for WithMessage<'a, F>
where
    F: Fn(&dyn Debug),
{
    fn record_debug(&mut self, field: &Field, value: &dyn Debug) {
        if field.name() == "message" {
            (self.0)(value);
        }
    }
}

struct MessageAsString(String);

const WARNING: Lazy<StyledObject<&'static str>> =
    Lazy::new(|| Style::new().yellow().bold().for_stderr().apply_to("Warning:"));

const ERROR: Lazy<StyledObject<&'static str>> =
    Lazy::new(|| Style::new().red().bold().for_stderr().apply_to("Error:"));

fn collect_context<S>(leaf: Option<SpanRef<S>>) -> Vec<String>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    if let Some(leaf) = leaf {
        leaf.scope()
            .from_root()
            .filter_map(|span| {
                span.extensions()
                    .get::<MessageAsString>()
                    .map(|m| m.0.clone())
            })
            .collect()
    } else {
        vec![]
    }
}

pub fn current_context() -> Vec<String> {
    tracing::dispatcher::get_default(|dispatch| {
        if let Some(registry) = dispatch.downcast_ref::<tracing_subscriber::Registry>()
        {
            // NB: can't use Span::current_span() here, because that has to re-fetch the
            // current dispatcher, and while we're inside a dispatcher::get_default call
            // we temporarily *own* that dispatcher and the current dispatcher gets set
            // to None instead.
            if let Some(leaf_id) = registry.current_span().id() {
                return collect_context(registry.span(leaf_id));
            }
        }
        vec![]
    })
}

impl<S: Subscriber + for<'a> LookupSpan<'a>> Layer<S> for UILayer {
    /// For every context!(...) span, render the message into a String and stash it
    /// inside the tracing_subscriber registry entry for this Span.
    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        let span = ctx.span(id).expect("span should already exist!");
        if span.metadata().target() == CONTEXT_TARGET {
            attrs.record(&mut WithMessage(&|msg| {
                let as_string = MessageAsString(format!("{:?}", msg));
                span.extensions_mut().insert(as_string);
            }));
        }
    }

    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        event.record(&mut WithMessage(&|msg| match *event.metadata().level() {
            tracing::Level::ERROR => eprintln!("{} {:?}", &*ERROR, msg),
            tracing::Level::WARN => eprintln!("{} {:?}", &*WARNING, msg),
            _ => eprintln!("{:?}", msg),
        }));
    }
}

pub const CONTEXT_TARGET: &str = "depwalk::context";
#[macro_export]
macro_rules! context {
    ($($arg:tt)*) => {
        let _guard = tracing::span!(target: "depwalk::context", tracing::Level::ERROR, "context", $($arg)*).entered();
    }
}

struct DepwalkEyreHandler {
    context: Vec<String>,
    backtrace: backtrace::Backtrace,
}

impl DepwalkEyreHandler {
    fn new() -> DepwalkEyreHandler {
        DepwalkEyreHandler {
            context: current_context(),
            backtrace: backtrace::Backtrace::new_unresolved(),
        }
    }
}

impl eyre::EyreHandler for DepwalkEyreHandler {
    fn debug(
        &self,
        error: &(dyn std::error::Error + 'static),
        f: &mut core::fmt::Formatter<'_>,
    ) -> core::fmt::Result {
        write!(f, "{}", error)?;
        let mut causes = error.source();
        while let Some(cause) = causes {
            write!(f, "\n  caused by: {}", cause)?;
            causes = cause.source();
        }
        if !self.context.is_empty() {
            write!(f, "\n  while: {}", self.context.join(" -> "))?;
        }
        if std::env::var_os("RUST_BACKTRACE").is_some() {
            // clone to make it mutable so we can resolve symbols
            let mut backtrace = self.backtrace.clone();
            backtrace.resolve();
            write!(f, "\nBacktrace:\n{backtrace:?}")?;
        }
        Ok(())
    }
}

pub fn init(args: &OutputArgs, color: ColorChoice) {
    eyre::set_hook(Box::new(|_| Box::new(DepwalkEyreHandler::new())))
        .expect("eyre handler already installed?");

    match color {
        ColorChoice::Auto => (),
        ColorChoice::Always => {
            console::set_colors_enabled(true);
            console::set_colors_enabled_stderr(true);
        }
        ColorChoice::Never => {
            console::set_colors_enabled(false);
            console::set_colors_enabled_stderr(false);
        }
    }

    let verbosity: i8 = args
        .verbose
        .try_into()
        .unwrap_or(i8::MAX)
        .saturating_sub(args.quiet.try_into().unwrap_or(i8::MAX));

    let global_level = match verbosity {
        3.. => LevelFilter::TRACE,
        2 => LevelFilter::DEBUG,
        1 => LevelFilter::INFO,
        0 => LevelFilter::WARN,
        i8::MIN..=-1 => LevelFilter::ERROR,
    };

    // Two layers: the UI layer renders our own warnings/errors (and -v
    // chatter) for humans; the fmt layer is the firehose, off unless
    // --vmodule or DEPWALK_LOG turns targets on.
    let registry = tracing_subscriber::registry()
        .with(UILayer.with_filter(Targets::new().with_target("depwalk", global_level)));
    match &args.vmodule {
        Some(targets) => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(targets.clone()),
            )
            .init(),
        None => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(
                        EnvFilter::builder()
                            .with_default_directive(LevelFilter::OFF.into())
                            .with_env_var("DEPWALK_LOG")
                            .from_env_lossy(),
                    ),
            )
            .init(),
    }
}
