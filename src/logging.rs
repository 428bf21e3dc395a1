use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::MakeWriter;

/// Tees formatted log output to a broadcast channel so live followers (the
/// CLI's event view, tests) can watch the run, optionally suppressing
/// stdout when another surface owns the screen. Broadcast receivers get one
/// message per complete log line; partial fmt chunks are buffered until
/// their newline arrives.
#[derive(Clone)]
pub(crate) struct TeeMakeWriter {
    pub sender: tokio::sync::broadcast::Sender<String>,
    pub suppress_stdout: bool,
}

impl<'a> MakeWriter<'a> for TeeMakeWriter {
    type Writer = TeeWriter;

    fn make_writer(&'a self) -> Self::Writer {
        TeeWriter {
            sender: self.sender.clone(),
            suppress_stdout: self.suppress_stdout,
            buf: Vec::new(),
        }
    }
}

pub(crate) struct TeeWriter {
    sender: tokio::sync::broadcast::Sender<String>,
    suppress_stdout: bool,
    buf: Vec<u8>,
}

impl TeeWriter {
    fn drain_lines(&mut self) {
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line[..line.len() - 1]).to_string();
            if !text.is_empty() {
                let _ = self.sender.send(text); // Ignored if no receivers
            }
        }
    }
}

impl std::io::Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if !self.suppress_stdout {
            std::io::stdout().write_all(buf)?;
        }
        self.buf.extend_from_slice(buf);
        self.drain_lines();
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        if !self.suppress_stdout {
            std::io::stdout().flush()?;
        }
        Ok(())
    }
}

impl Drop for TeeWriter {
    fn drop(&mut self) {
        // A final line without a trailing newline still reaches followers.
        if !self.buf.is_empty() {
            let text = String::from_utf8_lossy(&self.buf).to_string();
            let _ = self.sender.send(text);
        }
    }
}

/// Install the global subscriber. `RUST_LOG` overrides the default `info`
/// level. Returns the log line broadcast sender.
pub(crate) fn init(suppress_stdout: bool) -> tokio::sync::broadcast::Sender<String> {
    let (log_tx, _) = tokio::sync::broadcast::channel::<String>(500);
    let make_writer = TeeMakeWriter {
        sender: log_tx.clone(),
        suppress_stdout,
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok(); // Ignore err on re-init

    log_tx
}
