use crossbeam_channel::{Receiver, SendError, Sender};
use std::fmt;
use std::io::{self, BufWriter, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

/// Output channel selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    /// Result lines meant for machine consumption.
    Out,
    /// Human-oriented progress and error messages.
    Diag,
}

/// An error signalled by a worker or by the orchestrator itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelegateError {
    pub user_error: bool,
    pub breaking: bool,
    message: String,
}

impl DelegateError {
    pub fn new(user_error: bool, breaking: bool, message: impl Into<String>) -> Self {
        Self {
            user_error,
            breaking,
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for DelegateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for DelegateError {}

#[derive(Debug, Error)]
pub enum RegisterError {
    #[error("an error consumer is already registered")]
    AlreadyRegistered,
    #[error("failed to start error consumer thread: {0}")]
    Spawn(#[from] io::Error),
}

struct Envelope {
    error: DelegateError,
    done: Sender<()>,
}

type Sink = Mutex<BufWriter<Box<dyn Write + Send>>>;

/// Shared sink for everything a build prints.
///
/// Each `emit` call holds the stream lock for the whole write, so text from
/// concurrent callers never interleaves within a call. Errors go through a
/// rendezvous channel to the single registered consumer; `report_error`
/// returns only after the consumer has counted and handled the error.
pub struct Reporter {
    out: Sink,
    diag: Sink,
    errors_tx: Sender<Envelope>,
    errors_rx: Mutex<Option<Receiver<Envelope>>>,
    error_count: Arc<AtomicUsize>,
}

impl Reporter {
    pub const DEFAULT_BUFFER_LEN: usize = 8 * 1024;

    /// Reporter over the process's standard output and standard error.
    pub fn stdio() -> Self {
        Self::with_writers(
            Box::new(io::stdout()),
            Box::new(io::stderr()),
            Self::DEFAULT_BUFFER_LEN,
        )
    }

    pub fn with_writers(
        out: Box<dyn Write + Send>,
        diag: Box<dyn Write + Send>,
        buffer_len: usize,
    ) -> Self {
        let (errors_tx, errors_rx) = crossbeam_channel::bounded(0);
        Self {
            out: Mutex::new(BufWriter::with_capacity(buffer_len, out)),
            diag: Mutex::new(BufWriter::with_capacity(buffer_len, diag)),
            errors_tx,
            errors_rx: Mutex::new(Some(errors_rx)),
            error_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Write `text` to `stream` as one unit. Write failures are dropped.
    pub fn emit(&self, stream: Stream, text: &str) {
        let sink = match stream {
            Stream::Out => &self.out,
            Stream::Diag => &self.diag,
        };
        let mut w = sink.lock().unwrap_or_else(PoisonError::into_inner);
        let _ = w.write_all(text.as_bytes());
        let _ = w.flush();
    }

    /// One result line on the output stream.
    pub fn result_line(&self, line: &str) {
        self.emit(Stream::Out, &format!("{line}\n"));
    }

    pub fn info(&self, message: &str) {
        self.emit(Stream::Diag, &format!("[INFO] {message}\n"));
    }

    pub fn warn(&self, message: &str) {
        self.emit(Stream::Diag, &format!("[WARN] {message}\n"));
    }

    pub fn error(&self, message: &str) {
        self.emit(Stream::Diag, &format!("[ERROR] {message}\n"));
    }

    /// Number of errors reported so far.
    pub fn error_count(&self) -> usize {
        self.error_count.load(Ordering::SeqCst)
    }

    /// Hand an error to the consumer and wait until it has been handled.
    ///
    /// Before a consumer is registered this blocks. If the consumer has gone
    /// away, the error is counted and written to the diagnostic stream here.
    pub fn report_error(&self, user_error: bool, breaking: bool, message: impl Into<String>) {
        let (done, handled) = crossbeam_channel::bounded(1);
        let envelope = Envelope {
            error: DelegateError::new(user_error, breaking, message),
            done,
        };
        match self.errors_tx.send(envelope) {
            Ok(()) => {
                let _ = handled.recv();
            }
            Err(SendError(envelope)) => {
                self.error_count.fetch_add(1, Ordering::SeqCst);
                self.error(envelope.error.message());
            }
        }
    }

    /// Start the single consumer of reported errors.
    ///
    /// The handler runs on a dedicated thread, one error at a time, after the
    /// error has been added to [`error_count`](Self::error_count).
    pub fn register_error_consumer<F>(&self, mut handler: F) -> Result<(), RegisterError>
    where
        F: FnMut(&DelegateError) + Send + 'static,
    {
        let rx = self
            .errors_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(RegisterError::AlreadyRegistered)?;
        let count = Arc::clone(&self.error_count);

        std::thread::Builder::new()
            .name("bale-errors".to_owned())
            .spawn(move || {
                for envelope in rx {
                    count.fetch_add(1, Ordering::SeqCst);
                    handler(&envelope.error);
                    let _ = envelope.done.send(());
                }
            })?;
        Ok(())
    }
}

impl fmt::Debug for Reporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reporter")
            .field("error_count", &self.error_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::Reporter;
    use std::io::{self, Write};
    use std::sync::{Arc, Mutex};

    /// Cloneable in-memory writer for capturing reporter output.
    #[derive(Clone, Default)]
    pub struct SharedBuf(pub Arc<Mutex<Vec<u8>>>);

    impl SharedBuf {
        pub fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    pub fn captured() -> (Arc<Reporter>, SharedBuf, SharedBuf) {
        let out = SharedBuf::default();
        let diag = SharedBuf::default();
        let reporter = Reporter::with_writers(
            Box::new(out.clone()),
            Box::new(diag.clone()),
            Reporter::DEFAULT_BUFFER_LEN,
        );
        (Arc::new(reporter), out, diag)
    }
}
