use std::io::{self, Write};
use tracing_subscriber::fmt::MakeWriter;

/// `log_fmt` values recognized by [`init`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
#[clap(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

/// A [`Write`] wrapper that truncates any single write to at most `max_len` bytes,
/// appending `…` when truncation occurs. `tracing-subscriber`'s fmt layer issues one
/// `write_all` call per formatted record, so this caps one log line at a time.
pub struct TruncatingWriter<W> {
    inner: W,
    max_len: usize,
}

impl<W: Write> Write for TruncatingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.len() <= self.max_len {
            return self.inner.write(buf);
        }
        let keep = self.max_len.saturating_sub(3);
        let mut truncated = Vec::with_capacity(self.max_len);
        truncated.extend_from_slice(&buf[..keep.min(buf.len())]);
        truncated.extend_from_slice("…".as_bytes());
        // Preserve a trailing newline so line-oriented log shippers don't merge records.
        if buf.ends_with(b"\n") && !truncated.ends_with(b"\n") {
            truncated.push(b'\n');
        }
        self.inner.write_all(&truncated)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[derive(Clone, Copy)]
pub struct TruncatingMakeWriter {
    max_len: usize,
}

impl TruncatingMakeWriter {
    pub fn new(max_len: usize) -> Self {
        Self { max_len }
    }
}

impl<'a> MakeWriter<'a> for TruncatingMakeWriter {
    type Writer = TruncatingWriter<io::Stdout>;

    fn make_writer(&'a self) -> Self::Writer {
        TruncatingWriter {
            inner: io::stdout(),
            max_len: self.max_len,
        }
    }
}

/// Initializes the process-wide subscriber per `log_level`/`log_fmt`/`log_record_max_len`.
/// Must be called exactly once at process start.
pub fn init(log_level: &str, log_fmt: LogFormat, log_record_max_len: usize) {
    let filter = tracing_subscriber::EnvFilter::try_new(log_level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let writer = TruncatingMakeWriter::new(log_record_max_len);

    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_writer(writer);

    match log_fmt {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Worker-process children must never write to stdout: it carries the C8
/// job/result line protocol. This variant logs to stderr instead, untruncated
/// (worker-process records are not task-scoped request logs).
pub fn init_stderr_only(log_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_new(log_level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
