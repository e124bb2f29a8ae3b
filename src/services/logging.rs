//! Log sinks and tracing integration
//!
//! Besides the JSON stdout log, the refresher keeps a handful of plain append-only files in
//! the log directory (`main.log`, `failed.log`, `dead.log`, ...). Lines are buffered per
//! sink in a [`BoundedBuffer`] and written out at chunk boundaries, when a buffer fills up,
//! and at the end of a run. [`SinkLayer`] copies tracing events into the `main` sink.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Local;
use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::Context;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use super::bounded_buffer::BoundedBuffer;

/// Lines buffered per sink before a forced write
pub const DEFAULT_SINK_CAPACITY: usize = 256;

/// Timestamp format used at the start of each sink line
const LINE_TIMESTAMP: &str = "%d.%m.%Y %H:%M:%S";

/// One append-only log file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Sink {
    Main,
    Failed,
    Dead,
    Recovered,
    ProviderHits,
    ResourceLive,
    ResourceSummary,
    Warnings,
    Profiler,
}

impl Sink {
    pub const ALL: [Sink; 9] = [
        Sink::Main,
        Sink::Failed,
        Sink::Dead,
        Sink::Recovered,
        Sink::ProviderHits,
        Sink::ResourceLive,
        Sink::ResourceSummary,
        Sink::Warnings,
        Sink::Profiler,
    ];

    /// Sinks that only describe the current run and are truncated when one starts
    pub const RUN_SCOPED: [Sink; 3] = [Sink::Failed, Sink::Dead, Sink::Recovered];

    pub fn file_name(&self) -> &'static str {
        match self {
            Sink::Main => "main.log",
            Sink::Failed => "failed.log",
            Sink::Dead => "dead.log",
            Sink::Recovered => "recovered.log",
            Sink::ProviderHits => "provider_hits.log",
            Sink::ResourceLive => "resource_live.log",
            Sink::ResourceSummary => "resource_summary.log",
            Sink::Warnings => "warnings.log",
            Sink::Profiler => "profiler.log",
        }
    }
}

/// Storage behind the sinks
pub trait SinkWriter: Send + Sync {
    fn append(&self, sink: Sink, lines: &[String]) -> io::Result<()>;
    fn truncate(&self, sink: Sink) -> io::Result<()>;
}

/// Writes each sink to `<dir>/<file_name>`
pub struct FileSinkWriter {
    dir: PathBuf,
}

impl FileSinkWriter {
    pub fn new(dir: impl AsRef<Path>) -> io::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn path(&self, sink: Sink) -> PathBuf {
        self.dir.join(sink.file_name())
    }
}

impl SinkWriter for FileSinkWriter {
    fn append(&self, sink: Sink, lines: &[String]) -> io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path(sink))?;
        let mut out = String::new();
        for line in lines {
            out.push_str(line);
            out.push('\n');
        }
        file.write_all(out.as_bytes())
    }

    fn truncate(&self, sink: Sink) -> io::Result<()> {
        fs::write(self.path(sink), b"")
    }
}

/// Keeps sink contents in memory
#[derive(Default)]
pub struct MemorySinkWriter {
    lines: Mutex<HashMap<Sink, Vec<String>>>,
    writes: Mutex<HashMap<Sink, usize>>,
}

impl MemorySinkWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self, sink: Sink) -> Vec<String> {
        self.lines.lock().get(&sink).cloned().unwrap_or_default()
    }

    /// Number of `append` calls for a sink
    pub fn writes(&self, sink: Sink) -> usize {
        self.writes.lock().get(&sink).copied().unwrap_or(0)
    }
}

impl SinkWriter for MemorySinkWriter {
    fn append(&self, sink: Sink, lines: &[String]) -> io::Result<()> {
        self.lines
            .lock()
            .entry(sink)
            .or_default()
            .extend_from_slice(lines);
        *self.writes.lock().entry(sink).or_default() += 1;
        Ok(())
    }

    fn truncate(&self, sink: Sink) -> io::Result<()> {
        self.lines.lock().remove(&sink);
        Ok(())
    }
}

/// Buffered front end for all sinks
pub struct LogSinks {
    writer: Arc<dyn SinkWriter>,
    buffers: Mutex<HashMap<Sink, BoundedBuffer<String>>>,
    capacity: usize,
}

impl LogSinks {
    pub fn new(writer: Arc<dyn SinkWriter>, capacity: usize) -> Self {
        Self {
            writer,
            buffers: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Sinks that go nowhere
    pub fn discard() -> Self {
        struct Discard;
        impl SinkWriter for Discard {
            fn append(&self, _: Sink, _: &[String]) -> io::Result<()> {
                Ok(())
            }
            fn truncate(&self, _: Sink) -> io::Result<()> {
                Ok(())
            }
        }
        Self::new(Arc::new(Discard), DEFAULT_SINK_CAPACITY)
    }

    /// Queue a line, prefixed with the local time
    pub fn record(&self, sink: Sink, line: impl AsRef<str>) {
        let line = format!("[{}] {}", Local::now().format(LINE_TIMESTAMP), line.as_ref());
        let full = {
            let mut buffers = self.buffers.lock();
            let buffer = buffers
                .entry(sink)
                .or_insert_with(|| BoundedBuffer::new(self.capacity));
            // Write out before the buffer would start evicting
            let full = if buffer.is_full() {
                Some(buffer.drain())
            } else {
                None
            };
            buffer.push(line);
            full
        };

        if let Some(lines) = full {
            self.write(sink, &lines);
        }
    }

    /// Write out every buffered line
    pub fn flush(&self) {
        let pending: Vec<(Sink, Vec<String>)> = {
            let mut buffers = self.buffers.lock();
            buffers
                .iter_mut()
                .filter(|(_, b)| !b.is_empty())
                .map(|(sink, b)| (*sink, b.drain()))
                .collect()
        };

        for (sink, lines) in pending {
            self.write(sink, &lines);
        }
    }

    /// Drop buffered lines and empty the files of the given sinks
    pub fn reset(&self, sinks: &[Sink]) {
        {
            let mut buffers = self.buffers.lock();
            for sink in sinks {
                if let Some(buffer) = buffers.get_mut(sink) {
                    buffer.clear();
                }
            }
        }
        for sink in sinks {
            if let Err(e) = self.writer.truncate(*sink) {
                eprintln!("Failed to truncate {}: {}", sink.file_name(), e);
            }
        }
    }

    pub fn buffered(&self, sink: Sink) -> usize {
        self.buffers.lock().get(&sink).map_or(0, BoundedBuffer::len)
    }

    fn write(&self, sink: Sink, lines: &[String]) {
        // Not traced: the main sink is itself fed from tracing
        if let Err(e) = self.writer.append(sink, lines) {
            eprintln!(
                "Failed to write {} lines to {}: {}",
                lines.len(),
                sink.file_name(),
                e
            );
        }
    }
}

/// Collects event fields for a log line
struct FieldVisitor {
    fields: BTreeMap<String, JsonValue>,
    message: Option<String>,
}

impl FieldVisitor {
    fn new() -> Self {
        Self {
            fields: BTreeMap::new(),
            message: None,
        }
    }
}

impl Visit for FieldVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let value_str = format!("{:?}", value);
        if field.name() == "message" {
            self.message = Some(value_str);
        } else {
            self.fields
                .insert(field.name().to_string(), JsonValue::String(value_str));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        } else {
            self.fields.insert(
                field.name().to_string(),
                JsonValue::String(value.to_string()),
            );
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.fields
            .insert(field.name().to_string(), JsonValue::Number(value.into()));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.fields
            .insert(field.name().to_string(), JsonValue::Number(value.into()));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.fields
            .insert(field.name().to_string(), JsonValue::Bool(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        if let Some(n) = serde_json::Number::from_f64(value) {
            self.fields
                .insert(field.name().to_string(), JsonValue::Number(n));
        }
    }
}

/// Tracing layer that mirrors events into the `main` sink
pub struct SinkLayer {
    sinks: Arc<LogSinks>,
    min_level: Level,
}

impl SinkLayer {
    pub fn new(sinks: Arc<LogSinks>, min_level: Level) -> Self {
        Self { sinks, min_level }
    }
}

impl<S> Layer<S> for SinkLayer
where
    S: Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let level = *event.metadata().level();
        if level > self.min_level {
            return;
        }

        let mut visitor = FieldVisitor::new();
        event.record(&mut visitor);

        let mut line = format!(
            "{} {}: {}",
            level.as_str(),
            event.metadata().target(),
            visitor.message.unwrap_or_default()
        );
        for (key, value) in &visitor.fields {
            match value {
                JsonValue::String(s) => line.push_str(&format!(" {key}={s}")),
                other => line.push_str(&format!(" {key}={other}")),
            }
        }

        self.sinks.record(Sink::Main, line);
    }
}

/// Install the global subscriber: env filter, JSON to stdout, and the main sink
pub fn init_tracing(sinks: Arc<LogSinks>) -> Result<(), tracing_subscriber::util::TryInitError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().with_target(true))
        .with(SinkLayer::new(sinks, Level::INFO))
        .try_init()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sinks(capacity: usize) -> (Arc<MemorySinkWriter>, LogSinks) {
        let writer = Arc::new(MemorySinkWriter::new());
        let sinks = LogSinks::new(writer.clone(), capacity);
        (writer, sinks)
    }

    #[test]
    fn test_lines_stay_buffered_until_flush() {
        let (writer, sinks) = sinks(8);
        sinks.record(Sink::Failed, "FAILED | key=1");
        assert!(writer.lines(Sink::Failed).is_empty());
        assert_eq!(sinks.buffered(Sink::Failed), 1);

        sinks.flush();
        let lines = writer.lines(Sink::Failed);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].ends_with("] FAILED | key=1"));
        assert_eq!(sinks.buffered(Sink::Failed), 0);
    }

    #[test]
    fn test_full_buffer_is_written_not_evicted() {
        let (writer, sinks) = sinks(2);
        for i in 0..5 {
            sinks.record(Sink::ProviderHits, format!("line {i}"));
        }
        // Two forced writes of two lines each, one line still buffered
        assert_eq!(writer.writes(Sink::ProviderHits), 2);
        assert_eq!(writer.lines(Sink::ProviderHits).len(), 4);

        sinks.flush();
        let lines = writer.lines(Sink::ProviderHits);
        assert_eq!(lines.len(), 5);
        assert!(lines[4].ends_with("line 4"));
    }

    #[test]
    fn test_reset_truncates_run_scoped_sinks() {
        let (writer, sinks) = sinks(8);
        sinks.record(Sink::Dead, "old");
        sinks.record(Sink::Profiler, "kept");
        sinks.flush();
        sinks.record(Sink::Dead, "pending");

        sinks.reset(&Sink::RUN_SCOPED);
        sinks.flush();

        assert!(writer.lines(Sink::Dead).is_empty());
        assert_eq!(writer.lines(Sink::Profiler).len(), 1);
    }

    #[test]
    fn test_file_writer_appends() {
        let dir = tempfile::tempdir().unwrap();
        let writer = FileSinkWriter::new(dir.path().join("logs")).unwrap();
        writer.append(Sink::Main, &["a".to_string()]).unwrap();
        writer
            .append(Sink::Main, &["b".to_string(), "c".to_string()])
            .unwrap();

        let content = fs::read_to_string(writer.path(Sink::Main)).unwrap();
        assert_eq!(content, "a\nb\nc\n");

        writer.truncate(Sink::Main).unwrap();
        assert_eq!(fs::read_to_string(writer.path(Sink::Main)).unwrap(), "");
    }
}
