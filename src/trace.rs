use crate::prelude::*;

use once_cell::sync::OnceCell;
use serde_json::json;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

// Minimal Chrome-tracing ("chrome://tracing", or Perfetto) event log:
// complete events for timed regions, counter events for sampled values.
// One global collector, flushed once on the way out.

static TRACE: OnceCell<TraceOutput> = OnceCell::new();

struct TraceOutput {
    path: PathBuf,
    start: Instant,
    events: Mutex<Vec<serde_json::Value>>,
}

pub fn init(path: &Path) -> Result<()> {
    // fail now, not at flush time, if the location is unwritable
    File::create(path)
        .wrap_err_with(|| format!("can't write trace file {}", path.display()))?;
    let _ = TRACE.set(TraceOutput {
        path: path.to_path_buf(),
        start: Instant::now(),
        events: Mutex::new(Vec::new()),
    });
    Ok(())
}

pub fn enabled() -> bool {
    TRACE.get().is_some()
}

fn tid() -> u64 {
    static NEXT_TID: AtomicU64 = AtomicU64::new(1);
    thread_local! {
        static TID: u64 = NEXT_TID.fetch_add(1, Ordering::Relaxed);
    }
    TID.with(|t| *t)
}

fn push(event: serde_json::Value) {
    if let Some(trace) = TRACE.get() {
        trace.events.lock().unwrap().push(event);
    }
}

/// RAII guard producing one complete ("ph":"X") event.
pub struct Region {
    name: &'static str,
    detail: String,
    started: Option<Instant>,
}

pub fn region(name: &'static str, detail: impl Into<String>) -> Region {
    Region {
        name,
        detail: detail.into(),
        started: enabled().then(Instant::now),
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        let (Some(started), Some(trace)) = (self.started, TRACE.get()) else {
            return;
        };
        let ts = trace.start.elapsed().as_micros() as u64;
        let dur = started.elapsed().as_micros() as u64;
        push(json!({
            "ph": "X",
            "name": self.name,
            "cat": "depwalk",
            "ts": ts.saturating_sub(dur),
            "dur": dur,
            "pid": std::process::id(),
            "tid": tid(),
            "args": {"detail": self.detail},
        }));
    }
}

pub fn counter(name: &str, value: f64) {
    let Some(trace) = TRACE.get() else { return };
    let mut args = serde_json::Map::new();
    args.insert(name.to_string(), json!(value));
    push(json!({
        "ph": "C",
        "name": name,
        "cat": "depwalk",
        "ts": trace.start.elapsed().as_micros() as u64,
        "pid": std::process::id(),
        "tid": tid(),
        "args": args,
    }));
}

pub fn flush() -> Result<()> {
    let Some(trace) = TRACE.get() else {
        return Ok(());
    };
    let events = trace.events.lock().unwrap();
    let file = File::create(&trace.path)
        .wrap_err_with(|| format!("can't write trace file {}", trace.path.display()))?;
    serde_json::to_writer(BufWriter::new(file), &*events)?;
    Ok(())
}

/// Sample process cpu percent into the trace every 100ms (linux only; a
/// no-op elsewhere). Runs on a daemon thread for the life of the process.
pub fn start_cpu_stats() {
    std::thread::Builder::new()
        .name("depwalk-stats".into())
        .spawn(cpu_stats_loop)
        .expect("failed to spawn stats thread");
}

fn cpu_stats_loop() {
    let mut prev: Option<(Instant, f64)> = None;
    loop {
        if let Some(cpu_seconds) = process_cpu_seconds() {
            let now = Instant::now();
            if let Some((prev_ts, prev_cpu)) = prev {
                let wall = now.duration_since(prev_ts).as_secs_f64();
                if wall > 0.0 {
                    counter("proc_cpu_pct", 100.0 * (cpu_seconds - prev_cpu) / wall);
                }
            }
            prev = Some((now, cpu_seconds));
        }
        std::thread::sleep(Duration::from_millis(100));
    }
}

#[cfg(target_os = "linux")]
fn process_cpu_seconds() -> Option<f64> {
    // /proc/<pid>/stat: utime and stime are fields 14 and 15 (1-based),
    // counted after the parenthesized comm field, in clock ticks. USER_HZ is
    // 100 on every linux configuration we care about.
    const TICKS_PER_SECOND: f64 = 100.0;
    let stat = std::fs::read_to_string("/proc/self/stat").ok()?;
    let rest = &stat[stat.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    Some((utime + stime) as f64 / TICKS_PER_SECOND)
}

#[cfg(not(target_os = "linux"))]
fn process_cpu_seconds() -> Option<f64> {
    None
}

#[cfg(test)]
mod test {
    use super::*;

    // TRACE is process-global, so everything lives in one test.
    #[test]
    fn test_trace_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.json");

        // regions are no-ops before init
        drop(region("early", "nothing"));

        init(&path).unwrap();
        assert!(enabled());
        {
            let _guard = region("fetch", "example");
        }
        counter("proc_cpu_pct", 12.5);
        flush().unwrap();

        let events: Vec<serde_json::Value> =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["ph"], "X");
        assert_eq!(events[0]["name"], "fetch");
        assert_eq!(events[1]["ph"], "C");
        assert_eq!(events[1]["args"]["proc_cpu_pct"], 12.5);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_process_cpu_seconds() {
        assert!(process_cpu_seconds().unwrap() >= 0.0);
    }
}
