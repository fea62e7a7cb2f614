//! Append-only JSONL writer for raw quote records, optionally gzipped.
//!
//! The handle is scoped: `close()` flushes and (for gzip) finishes the
//! stream; `Drop` is a best-effort backstop so a deadline or error path
//! never leaves an unterminated gzip member behind.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::Value;

pub fn raw_bookticker_name(gzip_enabled: bool) -> &'static str {
    if gzip_enabled {
        "raw_bookticker.jsonl.gz"
    } else {
        "raw_bookticker.jsonl"
    }
}

enum RawSink {
    Plain(BufWriter<File>),
    Gzip(GzEncoder<BufWriter<File>>),
    Closed,
}

pub struct RawJsonlWriter {
    path: PathBuf,
    sink: RawSink,
}

impl RawJsonlWriter {
    pub fn create(out_dir: &Path, gzip_enabled: bool) -> std::io::Result<Self> {
        std::fs::create_dir_all(out_dir)?;
        let path = out_dir.join(raw_bookticker_name(gzip_enabled));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let buffered = BufWriter::new(file);
        let sink = if gzip_enabled {
            RawSink::Gzip(GzEncoder::new(buffered, Compression::default()))
        } else {
            RawSink::Plain(buffered)
        };
        Ok(Self { path, sink })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write_record(&mut self, record: &Value) -> std::io::Result<()> {
        let line = serde_json::to_string(record)?;
        match &mut self.sink {
            RawSink::Plain(writer) => writeln!(writer, "{line}"),
            RawSink::Gzip(writer) => writeln!(writer, "{line}"),
            RawSink::Closed => Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                "raw writer already closed",
            )),
        }
    }

    pub fn close(&mut self) -> std::io::Result<()> {
        match std::mem::replace(&mut self.sink, RawSink::Closed) {
            RawSink::Plain(mut writer) => writer.flush(),
            RawSink::Gzip(writer) => writer.finish()?.flush(),
            RawSink::Closed => Ok(()),
        }
    }
}

impl Drop for RawJsonlWriter {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
