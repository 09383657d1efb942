//! Offline decoding and aggregation of the binary event stream.
//!
//! Replays a MOJ stream into samples, then renders them as collapsed
//! ("folded") stacks for flamegraph tooling or as a JSON summary. Readers
//! tolerate truncation at any event boundary: a cut stream yields the
//! clean prefix plus a truncation flag.

use std::collections::HashMap;
use std::io::{BufRead, Write};

use serde::Serialize;

use crate::domain::DecodeError;
use crate::mojo::{Event, MojoReader};

/// A frame definition collected from the stream.
#[derive(Debug, Clone)]
pub struct FrameDesc {
    pub filename: String,
    pub name: String,
    pub line: i64,
}

/// The measurement closing one sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    Time(i64),
    Memory(i64),
    Idle,
}

/// One decoded sample: a stack and its metric.
#[derive(Debug, Clone)]
pub struct Sample {
    pub pid: i64,
    pub iid: i64,
    pub thread: String,
    /// Frame keys, root first (stream order).
    pub frames: Vec<u64>,
    pub metric: Metric,
}

/// A fully decoded stream.
#[derive(Debug, Default)]
pub struct Trace {
    pub metadata: Vec<(String, String)>,
    pub frames: HashMap<u64, FrameDesc>,
    pub samples: Vec<Sample>,
    /// The stream ended inside an event; everything before it is intact.
    pub truncated: bool,
}

struct OpenSample {
    pid: i64,
    iid: i64,
    thread: String,
    frames: Vec<u64>,
}

/// Decode a whole stream.
///
/// # Errors
/// Header and structural errors; mid-event truncation is reported through
/// [`Trace::truncated`] instead.
pub fn decode<R: BufRead>(input: R) -> Result<Trace, DecodeError> {
    let mut reader = MojoReader::new(input);
    reader.read_header()?;

    let mut trace = Trace::default();
    let mut strings: HashMap<u64, String> = HashMap::new();
    let mut open: Option<OpenSample> = None;
    // Kernel frames carry no key; mint local ones above the ref range.
    let mut synthetic_key = 1u64 << 32;

    loop {
        let event = match reader.next_event() {
            Ok(Some(event)) => event,
            Ok(None) => break,
            Err(DecodeError::Truncated) => {
                trace.truncated = true;
                break;
            }
            Err(e) => return Err(e),
        };

        match event {
            Event::Metadata { label, value } => trace.metadata.push((label, value)),
            Event::String { key, value } => {
                strings.entry(key).or_insert(value);
            }
            Event::StringRef { .. } => {}
            Event::Stack { pid, iid, thread } => {
                if let Some(done) = open.take() {
                    // A stack header without a closing metric; keep the
                    // frames, mark the sample idle.
                    trace.samples.push(seal(done, Metric::Idle));
                }
                open = Some(OpenSample { pid, iid, thread, frames: Vec::new() });
            }
            Event::Frame { key, filename, name, line, .. } => {
                let desc = FrameDesc {
                    filename: lookup(&strings, filename),
                    name: lookup(&strings, name),
                    line,
                };
                trace.frames.insert(key, desc);
                if let Some(sample) = open.as_mut() {
                    sample.frames.push(key);
                }
            }
            Event::FrameRef { key } => {
                if let Some(sample) = open.as_mut() {
                    sample.frames.push(key);
                }
            }
            Event::FrameInvalid => {
                trace.frames.entry(0).or_insert_with(|| FrameDesc {
                    filename: "<invalid>".into(),
                    name: "<invalid>".into(),
                    line: 0,
                });
                if let Some(sample) = open.as_mut() {
                    sample.frames.push(0);
                }
            }
            Event::FrameKernel { scope } => {
                let key = synthetic_key;
                synthetic_key += 1;
                trace.frames.insert(
                    key,
                    FrameDesc { filename: "kernel".into(), name: scope, line: 0 },
                );
                if let Some(sample) = open.as_mut() {
                    sample.frames.push(key);
                }
            }
            Event::MetricTime { value } => {
                if let Some(done) = open.take() {
                    trace.samples.push(seal(done, Metric::Time(value)));
                }
            }
            Event::MetricMemory { value } => {
                if let Some(done) = open.take() {
                    trace.samples.push(seal(done, Metric::Memory(value)));
                }
            }
            Event::Idle => {
                if let Some(done) = open.take() {
                    trace.samples.push(seal(done, Metric::Idle));
                }
            }
            Event::Gc { .. } => {}
        }
    }

    if let Some(done) = open.take() {
        trace.samples.push(seal(done, Metric::Idle));
        trace.truncated = true;
    }
    Ok(trace)
}

fn seal(open: OpenSample, metric: Metric) -> Sample {
    Sample { pid: open.pid, iid: open.iid, thread: open.thread, frames: open.frames, metric }
}

fn lookup(strings: &HashMap<u64, String>, key: u64) -> String {
    strings.get(&key).cloned().unwrap_or_else(|| "<unknown>".into())
}

/// Write collapsed stacks: `thread;root;...;leaf weight`, weights summed
/// over identical stacks. Idle samples are skipped.
///
/// # Errors
/// I/O failure on the sink.
pub fn write_folded<W: Write>(trace: &Trace, mut out: W) -> std::io::Result<()> {
    let mut totals: HashMap<String, i64> = HashMap::new();
    let mut order: Vec<String> = Vec::new();

    for sample in &trace.samples {
        let weight = match sample.metric {
            Metric::Time(v) | Metric::Memory(v) => v,
            Metric::Idle => continue,
        };
        let mut line = sample.thread.clone();
        for key in &sample.frames {
            let name = trace
                .frames
                .get(key)
                .map_or_else(|| "<unknown>".into(), |f| f.name.clone());
            line.push(';');
            line.push_str(&name);
        }
        if !totals.contains_key(&line) {
            order.push(line.clone());
        }
        *totals.entry(line).or_insert(0) += weight;
    }

    for line in order {
        let total = totals[&line];
        writeln!(out, "{line} {total}")?;
    }
    Ok(())
}

/// Aggregate view serialised by the JSON output mode.
#[derive(Debug, Serialize)]
pub struct Summary {
    pub metadata: Vec<(String, String)>,
    pub sample_count: usize,
    pub thread_count: usize,
    pub frame_count: usize,
    pub truncated: bool,
    pub top_stacks: Vec<StackTotal>,
}

#[derive(Debug, Serialize)]
pub struct StackTotal {
    pub thread: String,
    pub leaf: String,
    pub samples: usize,
    pub total: i64,
}

#[must_use]
pub fn summarize(trace: &Trace) -> Summary {
    let mut threads: Vec<&str> = trace.samples.iter().map(|s| s.thread.as_str()).collect();
    threads.sort_unstable();
    threads.dedup();

    let mut by_leaf: HashMap<(String, String), (usize, i64)> = HashMap::new();
    for sample in &trace.samples {
        let weight = match sample.metric {
            Metric::Time(v) | Metric::Memory(v) => v,
            Metric::Idle => 0,
        };
        let leaf = sample
            .frames
            .last()
            .and_then(|key| trace.frames.get(key))
            .map_or_else(|| "<empty>".into(), |f| f.name.clone());
        let entry = by_leaf.entry((sample.thread.clone(), leaf)).or_insert((0, 0));
        entry.0 += 1;
        entry.1 += weight;
    }

    let mut top_stacks: Vec<StackTotal> = by_leaf
        .into_iter()
        .map(|((thread, leaf), (samples, total))| StackTotal { thread, leaf, samples, total })
        .collect();
    top_stacks.sort_by(|a, b| b.total.cmp(&a.total).then(b.samples.cmp(&a.samples)));
    top_stacks.truncate(50);

    Summary {
        metadata: trace.metadata.clone(),
        sample_count: trace.samples.len(),
        thread_count: threads.len(),
        frame_count: trace.frames.len(),
        truncated: trace.truncated,
        top_stacks,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::FrameKey;
    use crate::frame::{Frame, Location};
    use crate::mojo::MojoWriter;
    use crate::strings::StringTable;

    fn sample_stream() -> Vec<u8> {
        let strings = StringTable::new();
        let make = |name: &str, key: u64| Frame {
            key: FrameKey(key),
            filename: strings.key_for_content("app.py"),
            name: strings.key_for_content(name),
            location: Location { line: 1, line_end: 1, column: 0, column_end: 0 },
            is_shim: false,
        };

        let mut writer = MojoWriter::new(Vec::new());
        writer.header().unwrap();
        writer.metadata("mode", "wall").unwrap();
        for _ in 0..3 {
            writer.stack(7, 0, "MainThread").unwrap();
            // Root to leaf: a, b, c.
            writer.frame(&make("a", 1), &strings).unwrap();
            writer.frame(&make("b", 2), &strings).unwrap();
            writer.frame(&make("c", 3), &strings).unwrap();
            writer.metric_time(1000).unwrap();
        }
        writer.into_inner()
    }

    #[test]
    fn test_decode_samples() {
        let bytes = sample_stream();
        let trace = decode(std::io::BufReader::new(bytes.as_slice())).unwrap();
        assert!(!trace.truncated);
        assert_eq!(trace.samples.len(), 3);
        assert_eq!(trace.metadata[0], ("mode".into(), "wall".into()));
        let sample = &trace.samples[0];
        assert_eq!(sample.thread, "MainThread");
        assert_eq!(sample.frames.len(), 3);
        assert_eq!(sample.metric, Metric::Time(1000));
    }

    #[test]
    fn test_folded_output_aggregates() {
        let bytes = sample_stream();
        let trace = decode(std::io::BufReader::new(bytes.as_slice())).unwrap();
        let mut out = Vec::new();
        write_folded(&trace, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text.trim(), "MainThread;a;b;c 3000");
    }

    #[test]
    fn test_truncated_stream_keeps_prefix() {
        let bytes = sample_stream();
        // Cut in the middle of the final sample.
        let cut = bytes.len() - 3;
        let trace = decode(std::io::BufReader::new(&bytes[..cut])).unwrap();
        assert!(trace.truncated);
        assert!(trace.samples.len() >= 2);
    }

    #[test]
    fn test_summary_counts() {
        let bytes = sample_stream();
        let trace = decode(std::io::BufReader::new(bytes.as_slice())).unwrap();
        let summary = summarize(&trace);
        assert_eq!(summary.sample_count, 3);
        assert_eq!(summary.thread_count, 1);
        assert_eq!(summary.top_stacks[0].leaf, "c");
        assert_eq!(summary.top_stacks[0].total, 3000);
        // The summary serialises cleanly.
        let json = serde_json::to_string(&summary).unwrap();
        assert!(json.contains("\"sample_count\":3"));
    }
}
