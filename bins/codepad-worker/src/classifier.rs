/// Outcome Classifier - Raw Signals to Stable Taxonomy
///
/// **Core Responsibility:**
/// Turn what the sandbox observed (exit codes, timeout flags, captured
/// streams, measurements) into an `ExecutionOutcome`.
///
/// **Critical Properties:**
/// - Knows nothing about Docker
/// - Knows nothing about Redis
/// - Pure function: (raw execution, output cap) → outcome
///
/// **Mapping Rules (first match wins):**
/// - compiler exit ≠ 0, compiler timeout, or non-empty diagnostics → CompilationError (6)
/// - run killed by the wall-clock limit → TimeLimitExceeded (5)
/// - run exit ≠ 0 → RuntimeError (4)
/// - run exit = 0 → Accepted (3)
///
/// **Stream Bounding:**
/// stdout, stderr and compile_output are capped independently. A stream over
/// the cap is cut on a UTF-8 boundary and ends with `TRUNCATION_MARKER`; the
/// result never exceeds the cap.

use codepad_common::types::{ExecutionOutcome, Status};
use std::time::Duration;

pub const TRUNCATION_MARKER: &str = "\n[output truncated]";

/// Reported when the memory measurement is missing or zero. Known approximation.
pub const MEMORY_FLOOR_KB: u64 = 1024;

/// Smallest reported elapsed time, in milliseconds
const TIME_FLOOR_MS: u128 = 1;

/// Byte sink that keeps at most `limit` bytes and counts the rest.
///
/// The engine sizes it one byte past the output cap, which is enough for the
/// classifier to know a stream overflowed without holding all of it.
#[derive(Debug, Clone, Default)]
pub struct CappedBuffer {
    bytes: Vec<u8>,
    limit: usize,
    dropped: usize,
}

impl CappedBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            bytes: Vec::new(),
            limit,
            dropped: 0,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        let room = self.limit.saturating_sub(self.bytes.len());
        let take = room.min(chunk.len());
        self.bytes.extend_from_slice(&chunk[..take]);
        self.dropped += chunk.len() - take;
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Bytes received but not kept
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty() && self.dropped == 0
    }
}

impl From<&str> for CappedBuffer {
    fn from(text: &str) -> Self {
        let mut buf = CappedBuffer::new(usize::MAX);
        buf.push(text.as_bytes());
        buf
    }
}

/// What the compile step produced
#[derive(Debug, Clone)]
pub struct CompileCapture {
    pub exit_code: Option<i64>,
    pub timed_out: bool,
    pub diagnostics: CappedBuffer,
    pub elapsed: Duration,
}

impl CompileCapture {
    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0) && self.diagnostics.is_empty()
    }
}

/// What the run step produced
#[derive(Debug, Clone)]
pub struct RunCapture {
    pub exit_code: Option<i64>,
    pub timed_out: bool,
    pub stdout: CappedBuffer,
    pub stderr: CappedBuffer,
    pub elapsed: Duration,
    pub peak_memory_kb: Option<u64>,
}

/// Raw record of one execution, before classification
#[derive(Debug, Clone)]
pub enum RawExecution {
    CompileFailed {
        compile: CompileCapture,
        compile_timeout: Duration,
    },
    Ran {
        run: RunCapture,
    },
}

/// Map a raw execution to the stable outcome contract.
pub fn classify(raw: &RawExecution, cap: usize) -> ExecutionOutcome {
    match raw {
        RawExecution::CompileFailed {
            compile,
            compile_timeout,
        } => {
            let mut diagnostics = String::from_utf8_lossy(compile.diagnostics.as_bytes()).into_owned();
            if compile.timed_out {
                if !diagnostics.is_empty() && !diagnostics.ends_with('\n') {
                    diagnostics.push('\n');
                }
                diagnostics.push_str(&format!(
                    "Compilation timed out after {}s",
                    format_elapsed(*compile_timeout)
                ));
            } else if diagnostics.trim().is_empty() {
                diagnostics = match compile.exit_code {
                    Some(code) => format!("Compiler exited with code {}", code),
                    None => "Compiler exited without a status".to_string(),
                };
            }

            ExecutionOutcome {
                stdout: String::new(),
                stderr: String::new(),
                compile_output: bound_text(diagnostics, compile.diagnostics.dropped(), cap),
                status: Status::CompilationError,
                time: None,
                memory: None,
            }
        }
        RawExecution::Ran { run } => {
            ExecutionOutcome {
                stdout: bound_stream(&run.stdout, cap),
                stderr: bound_stream(&run.stderr, cap),
                compile_output: String::new(),
                status: run_status(run),
                time: Some(format_elapsed(run.elapsed)),
                memory: Some(memory_kb(run.peak_memory_kb)),
            }
        }
    }
}

fn run_status(run: &RunCapture) -> Status {
    if run.timed_out {
        Status::TimeLimitExceeded
    } else if run.exit_code == Some(0) {
        Status::Accepted
    } else {
        Status::RuntimeError
    }
}

/// Operator-facing reading of a runtime-error exit code. Never added to the
/// program's own streams.
pub fn exit_hint(exit_code: Option<i64>) -> Option<&'static str> {
    match exit_code {
        Some(137) => Some("killed, likely exceeded memory limit"),
        Some(139) => Some("segmentation fault"),
        None => Some("exited without a status"),
        _ => None,
    }
}

/// Decode a captured stream and bound it to `cap` bytes.
pub fn bound_stream(buf: &CappedBuffer, cap: usize) -> String {
    bound_text(
        String::from_utf8_lossy(buf.as_bytes()).into_owned(),
        buf.dropped(),
        cap,
    )
}

fn bound_text(text: String, dropped: usize, cap: usize) -> String {
    if dropped == 0 && text.len() <= cap {
        return text;
    }
    truncate(&text, cap)
}

/// Cut `text` so that it plus the marker fits in `cap` bytes, never
/// splitting a character, then append the marker.
pub fn truncate(text: &str, cap: usize) -> String {
    let mut end = cap.saturating_sub(TRUNCATION_MARKER.len()).min(text.len());
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    let mut out = String::with_capacity(end + TRUNCATION_MARKER.len());
    out.push_str(&text[..end]);
    out.push_str(TRUNCATION_MARKER);
    out
}

/// Seconds with millisecond precision: `"0.003"`, `"1.250"`
pub fn format_elapsed(elapsed: Duration) -> String {
    let ms = elapsed.as_millis().max(TIME_FLOOR_MS);
    format!("{}.{:03}", ms / 1000, ms % 1000)
}

pub fn memory_kb(peak: Option<u64>) -> u64 {
    match peak {
        Some(kb) if kb > 0 => kb,
        _ => MEMORY_FLOOR_KB,
    }
}
