use flate2::read::GzDecoder;
use serde_json::{Map, Value};
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use crate::error::{InsertError, Result};
use crate::metrics::Metrics;

/// A wrapper reader that tracks bytes consumed for metrics.
pub struct TrackedReader<R> {
    inner: R,
    metrics: Metrics,
}

impl<R> TrackedReader<R> {
    pub fn new(inner: R, metrics: Metrics) -> Self {
        Self { inner, metrics }
    }
}

impl<R: Read> Read for TrackedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let bytes = self.inner.read(buf)?;
        self.metrics.add_bytes_read(bytes as u64);
        Ok(bytes)
    }
}

impl<R: BufRead> BufRead for TrackedReader<R> {
    fn fill_buf(&mut self) -> std::io::Result<&[u8]> {
        self.inner.fill_buf()
    }

    fn consume(&mut self, amt: usize) {
        self.metrics.add_bytes_read(amt as u64);
        self.inner.consume(amt);
    }
}

/// Iterates newline-delimited JSON objects, skipping blank lines.
pub struct RowReader<R> {
    reader: R,
    line: usize,
    buf: String,
}

impl<R: BufRead> RowReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line: 0,
            buf: String::new(),
        }
    }

    /// 1-based line of the row most recently returned.
    pub fn line(&self) -> usize {
        self.line
    }
}

impl<R: BufRead> Iterator for RowReader<R> {
    type Item = Result<Map<String, Value>>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            self.buf.clear();
            match self.reader.read_line(&mut self.buf) {
                Ok(0) => return None,
                Ok(_) => {}
                Err(e) => return Some(Err(e.into())),
            }
            self.line += 1;

            let text = self.buf.trim();
            if text.is_empty() {
                continue;
            }
            let line = self.line;
            return Some(
                serde_json::from_str::<Value>(text)
                    .map_err(|source| InsertError::MalformedLine { line, source })
                    .and_then(|value| match value {
                        Value::Object(map) => Ok(map),
                        _ => Err(InsertError::NotAnObject),
                    }),
            );
        }
    }
}

/// Opens an NDJSON file of rows, gunzipping `.gz` files.
pub fn open_rows(
    path: &Path,
    buffer_size: usize,
    metrics: &Metrics,
) -> Result<RowReader<TrackedReader<Box<dyn BufRead + Send>>>> {
    let file = File::open(path)?;

    let reader: Box<dyn BufRead + Send> = if path.extension().is_some_and(|ext| ext == "gz") {
        let decoder = GzDecoder::new(file);
        Box::new(BufReader::with_capacity(buffer_size, decoder))
    } else {
        Box::new(BufReader::with_capacity(buffer_size, file))
    };

    Ok(RowReader::new(TrackedReader::new(reader, metrics.clone())))
}
