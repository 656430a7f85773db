//! The log-forwarding task: reads newline-delimited structured log records
//! from a service's log pipe read-end and hands each to a publisher
//! callback, terminating on EOF (which fires once the native side has
//! dropped every reference to the write-end).

use ops::decode::Decoder;
use std::io::BufRead;

/// A background task draining one service's log pipe. Spawned by
/// [`crate::service::Service::create`]; joined by `Service::destroy` (or,
/// best-effort, by `Drop`).
pub struct LogForwarder {
    thread: std::thread::JoinHandle<()>,
}

impl LogForwarder {
    /// Spawn a forwarder reading `read_end` until EOF, decoding each line
    /// (or run of unstructured lines) with [`ops::decode::Decoder`] and
    /// passing the result to `handler`.
    pub fn spawn(
        read_end: std::fs::File,
        handler: impl Fn(ops::Log) + Send + Sync + 'static,
    ) -> Self {
        let thread = std::thread::spawn(move || Self::run(read_end, handler));
        Self { thread }
    }

    fn run(read_end: std::fs::File, handler: impl Fn(ops::Log)) {
        let decoder = Decoder::new(std::time::SystemTime::now);
        let mut reader = std::io::BufReader::new(read_end);
        let mut line = String::new();

        loop {
            line.clear();
            match reader.read_line(&mut line) {
                Ok(0) => break, // EOF: native side closed its write-end.
                Ok(_) => {
                    let (log, consumed) = decoder.line_to_log(&line, reader.buffer());
                    handler(log);
                    reader.consume(consumed);
                }
                Err(err) => {
                    tracing::warn!(error = %err, "log forwarder read error");
                    break;
                }
            }
        }
    }

    /// Block the calling thread until the forwarder has observed EOF.
    pub fn join_blocking(self) {
        let _ = self.thread.join();
    }
}
