//! Instrument error-queue monitor.
//!
//! The generator does not answer commands with an acknowledgement; a bad
//! command only shows up later as an entry in its `SYST:ERR?` queue. Every
//! mutating session operation therefore drains that queue once after its
//! command lines are sent, so errors are attributed to the operation that
//! caused them and never leak into the next one.

use crate::error::AppResult;
use crate::logging::DIAGNOSTICS_TARGET;
use crate::transport::Transport;
use regex::Regex;
use std::fmt;
use std::sync::LazyLock;

/// Error-queue query
pub const ERROR_QUERY: &str = "SYST:ERR?";

/// Matches `-113,"Undefined header"` style error-queue entries.
static ERROR_LINE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^\s*([+-]?\d+)\s*,\s*"?(.*?)"?\s*$"#).expect("Invalid error-line regex")
});

/// One entry from the instrument's error queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorRecord {
    /// Numeric code, if the line carried one
    pub code: Option<i32>,
    /// Message text, or the raw line when it could not be parsed
    pub message: String,
}

impl ErrorRecord {
    /// Parse one `SYST:ERR?` response line.
    pub fn parse(line: &str) -> Self {
        match ERROR_LINE_REGEX.captures(line) {
            Some(caps) => Self {
                code: caps[1].parse().ok(),
                message: caps[2].to_string(),
            },
            None => Self {
                code: None,
                message: line.trim().to_string(),
            },
        }
    }

    /// Whether this is the queue-empty sentinel (`+0,"No error"`).
    pub fn is_no_error(&self) -> bool {
        self.code == Some(0)
    }
}

impl fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "{}: {}", code, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

/// Errors drained after one operation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorReport {
    /// Drained entries, oldest first
    pub errors: Vec<ErrorRecord>,
}

impl ErrorReport {
    /// True when the instrument reported at least one error.
    pub fn had_error(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Merge another report into this one, keeping queue order.
    pub fn extend(&mut self, other: ErrorReport) {
        self.errors.extend(other.errors);
    }
}

impl fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.errors.is_empty() {
            return write!(f, "no instrument errors");
        }
        let joined = self
            .errors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        write!(f, "{}", joined)
    }
}

/// Drain the instrument's error queue.
///
/// Queries `SYST:ERR?` until the no-error sentinel is read, recording each
/// entry on the diagnostics target. The instrument's queue is finite, so the
/// loop ends once it is empty; `max_reads` caps it in case the link keeps
/// returning lines that are not the sentinel.
///
/// # Errors
/// Only transport failures are returned as `Err`. Instrument errors come back
/// in the [`ErrorReport`].
pub async fn check_errors<T: Transport + ?Sized>(
    transport: &mut T,
    max_reads: usize,
) -> AppResult<ErrorReport> {
    let mut report = ErrorReport::default();

    for _ in 0..max_reads {
        let line = transport.query(ERROR_QUERY).await?;
        let record = ErrorRecord::parse(&line);
        if record.is_no_error() {
            return Ok(report);
        }
        tracing::warn!(target: DIAGNOSTICS_TARGET, error = %record, "Instrument reported error");
        report.errors.push(record);
    }

    tracing::warn!(
        max_reads,
        "Error queue not empty after {} reads; remaining entries stay queued",
        max_reads
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockFunctionGenerator;
    use tracing_test::traced_test;

    #[test]
    fn parses_queue_entries() {
        let record = ErrorRecord::parse("-113,\"Undefined header\"");
        assert_eq!(record.code, Some(-113));
        assert_eq!(record.message, "Undefined header");
        assert!(!record.is_no_error());

        let sentinel = ErrorRecord::parse("+0,\"No error\"");
        assert!(sentinel.is_no_error());

        let bare = ErrorRecord::parse("0,No error");
        assert!(bare.is_no_error());
    }

    #[test]
    fn unparseable_line_is_kept_as_message() {
        let record = ErrorRecord::parse("garbage");
        assert_eq!(record.code, None);
        assert_eq!(record.message, "garbage");
        assert!(!record.is_no_error());
    }

    #[tokio::test]
    async fn empty_queue_reads_once() {
        let mut mock = MockFunctionGenerator::new();
        let report = check_errors(&mut mock, 16).await.unwrap();
        assert!(!report.had_error());
        assert_eq!(mock.handle().error_reads(), 1);
    }

    #[tokio::test]
    #[traced_test]
    async fn drains_every_queued_error() {
        let mut mock = MockFunctionGenerator::new();
        let handle = mock.handle();
        for code in [-113, -222, -224] {
            handle.push_error(code, "queued");
        }

        let report = check_errors(&mut mock, 16).await.unwrap();
        assert!(report.had_error());
        assert_eq!(report.errors.len(), 3);
        assert_eq!(report.errors[0].code, Some(-113));
        assert_eq!(report.errors[2].code, Some(-224));

        // N errors plus the sentinel
        assert_eq!(handle.error_reads(), 4);
        assert_eq!(handle.pending_errors(), 0);
        assert!(logs_contain("Instrument reported error"));
    }

    #[tokio::test]
    async fn read_bound_stops_the_loop() {
        let mut mock = MockFunctionGenerator::new();
        let handle = mock.handle();
        for _ in 0..5 {
            handle.push_error(-350, "Queue overflow");
        }

        let report = check_errors(&mut mock, 2).await.unwrap();
        assert_eq!(report.errors.len(), 2);
        assert_eq!(handle.pending_errors(), 3);
    }

    #[tokio::test]
    async fn transport_failure_propagates() {
        let mut mock = MockFunctionGenerator::new();
        mock.handle().trigger_failure();
        assert!(check_errors(&mut mock, 4).await.is_err());
    }

    #[test]
    fn report_display() {
        let mut report = ErrorReport::default();
        assert_eq!(report.to_string(), "no instrument errors");
        report.extend(ErrorReport {
            errors: vec![ErrorRecord::parse("-113,\"Undefined header\"")],
        });
        assert_eq!(report.to_string(), "-113: Undefined header");
    }
}
