use std::io::{self, Write};

use serde::Serialize;
use tracing::debug;

/// Progress events consumed by whatever drives the stage process.
/// Written to stdout as `NC_EVT {json}` lines.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    Phase { value: String },
    Warn { message: String },
    Error { code: String, message: String },
    Tokens { prompt: Option<u64>, completion: Option<u64> },
    Metrics { latency_sec: f64, provider: String, model: String },
    OutputPath { value: String },
    Done,
}

impl Event {
    pub fn phase(value: &str) -> Self {
        Event::Phase { value: value.to_string() }
    }

    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Event::Error { code: code.to_string(), message: message.into() }
    }

    pub fn to_line(&self) -> String {
        let body = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
        format!("NC_EVT {body}")
    }
}

fn write_line(out: &mut impl Write, line: &str) -> io::Result<()> {
    writeln!(out, "{line}")?;
    out.flush()
}

/// A closed stdout only loses progress lines; the stage keeps running.
pub fn emit(event: Event) {
    let line = event.to_line();
    debug!("{}", line);
    if let Err(e) = write_line(&mut io::stdout().lock(), &line) {
        debug!("could not write event to stdout: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lines_are_prefixed_and_tagged() {
        assert_eq!(Event::phase("calling_llm").to_line(), r#"NC_EVT {"type":"phase","value":"calling_llm"}"#);
        assert_eq!(Event::Done.to_line(), r#"NC_EVT {"type":"done"}"#);
    }

    struct Closed;

    impl Write for Closed {
        fn write(&mut self, _: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn write_failures_are_reported() {
        let mut buf = Vec::new();
        write_line(&mut buf, "NC_EVT {}").unwrap();
        assert_eq!(buf, b"NC_EVT {}\n");
        let err = write_line(&mut Closed, "NC_EVT {}").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn error_event_carries_code() {
        let line = Event::error("invalid-input", "no segments").to_line();
        assert!(line.contains(r#""code":"invalid-input""#));
        assert!(line.contains(r#""type":"error""#));
    }
}
