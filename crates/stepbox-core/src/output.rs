//! Output sinks shared between a process's stream pumps and the supervisor.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::io::{self, Write};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

/// A cloneable writer that serializes every write behind one lock.
///
/// Each `write`/`write_all` call holds the lock for its whole buffer, so
/// writers that hand over complete lines never interleave.
#[derive(Debug, Default)]
pub struct LockingWriter<W> {
    inner: Arc<Mutex<W>>,
}

impl<W> Clone for LockingWriter<W> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<W> LockingWriter<W> {
    /// Wrap `writer`.
    pub fn new(writer: W) -> Self {
        Self {
            inner: Arc::new(Mutex::new(writer)),
        }
    }
}

impl LockingWriter<Vec<u8>> {
    /// Copy of everything written so far.
    pub fn contents(&self) -> Vec<u8> {
        self.inner.lock().clone()
    }

    /// Everything written so far, lossily decoded.
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.inner.lock()).into_owned()
    }
}

impl<W: Write> Write for LockingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.lock().write(buf)
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.inner.lock().write_all(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.lock().flush()
    }
}

/// In-memory sink for one output stream.
pub type OutputBuffer = LockingWriter<Vec<u8>>;

/// Captured output of supervised commands, keyed by stream and command.
///
/// Keys look like `stdout: "make" "-j4"` and `stderr: "make" "-j4"`.
#[derive(Debug, Default, Clone)]
pub struct OutputLogs {
    streams: BTreeMap<String, OutputBuffer>,
}

impl OutputLogs {
    /// Create an empty log set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register stdout/stderr buffers for `command`.
    pub(crate) fn attach(&mut self, command: &str) -> (OutputBuffer, OutputBuffer) {
        let stdout = OutputBuffer::default();
        let stderr = OutputBuffer::default();
        self.streams
            .insert(format!("stdout: {command}"), stdout.clone());
        self.streams
            .insert(format!("stderr: {command}"), stderr.clone());
        (stdout, stderr)
    }

    /// Buffer registered under `key`.
    pub fn get(&self, key: &str) -> Option<&OutputBuffer> {
        self.streams.get(key)
    }

    /// Captured stdout of `command`, if it was attached.
    pub fn stdout(&self, command: &str) -> Option<String> {
        self.get(&format!("stdout: {command}"))
            .map(OutputBuffer::to_string_lossy)
    }

    /// Captured stderr of `command`, if it was attached.
    pub fn stderr(&self, command: &str) -> Option<String> {
        self.get(&format!("stderr: {command}"))
            .map(OutputBuffer::to_string_lossy)
    }

    /// Iterate over all registered streams.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &OutputBuffer)> {
        self.streams.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of registered streams.
    pub fn len(&self) -> usize {
        self.streams.len()
    }

    /// True when nothing has been attached.
    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}

/// Copy `reader` into `sink` one line at a time until EOF.
pub(crate) async fn pump<R>(reader: R, mut sink: OutputBuffer) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();
    let mut total = 0u64;
    loop {
        line.clear();
        let n = reader.read_until(b'\n', &mut line).await?;
        if n == 0 {
            return Ok(total);
        }
        sink.write_all(&line)?;
        total += n as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_concurrent_writers_never_interleave() {
        const WRITERS: usize = 8;
        const LINES: usize = 200;

        let sink = OutputBuffer::default();
        let handles: Vec<_> = (0..WRITERS)
            .map(|w| {
                let mut sink = sink.clone();
                thread::spawn(move || {
                    let mut written = 0usize;
                    for i in 0..LINES {
                        let line = format!("writer-{w} line-{i} {}\n", "x".repeat(64));
                        sink.write_all(line.as_bytes()).unwrap();
                        written += line.len();
                    }
                    written
                })
            })
            .collect();
        let expected: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();

        let out = sink.to_string_lossy();
        assert_eq!(out.len(), expected);
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), WRITERS * LINES);
        for line in lines {
            let mut parts = line.split(' ');
            assert!(parts.next().unwrap().starts_with("writer-"));
            assert!(parts.next().unwrap().starts_with("line-"));
            assert_eq!(parts.next().unwrap(), "x".repeat(64));
            assert!(parts.next().is_none());
        }
    }

    #[test]
    fn test_attach_registers_both_streams() {
        let mut logs = OutputLogs::new();
        let (mut out, _err) = logs.attach("\"echo\" \"hi\"");
        out.write_all(b"hi\n").unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs.stdout("\"echo\" \"hi\"").as_deref(), Some("hi\n"));
        assert_eq!(logs.stderr("\"echo\" \"hi\"").as_deref(), Some(""));
    }

    #[tokio::test]
    async fn test_pump_copies_all_lines() {
        let input: &[u8] = b"one\ntwo\nthree";
        let sink = OutputBuffer::default();
        let n = pump(input, sink.clone()).await.unwrap();
        assert_eq!(n, 13);
        assert_eq!(sink.contents(), input);
    }
}
