//! Canonical application log filenames.
//!
//! Logs written through the task I/O surface follow the grammar
//! `<taskName>-<stage>-<event>.<ext>`: three hyphen-free tokens, an event
//! from a closed enumeration, an extension from a closed enumeration.
//! Non-conforming names are rejected on write; parsing returns `None` on any
//! mismatch.

use regex::Regex;
use std::sync::OnceLock;

use crate::{Error, Result};

/// Closed enumeration of log events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum LogEvent {
    #[display("request")]
    Request,
    #[display("response")]
    Response,
    #[display("prompt")]
    Prompt,
    #[display("output")]
    Output,
    #[display("error")]
    Error,
    #[display("metrics")]
    Metrics,
    #[display("debug")]
    Debug,
}

impl LogEvent {
    pub const ALL: [LogEvent; 7] = [
        LogEvent::Request,
        LogEvent::Response,
        LogEvent::Prompt,
        LogEvent::Output,
        LogEvent::Error,
        LogEvent::Metrics,
        LogEvent::Debug,
    ];

    fn parse(s: &str) -> Option<LogEvent> {
        Self::ALL.into_iter().find(|e| e.to_string() == s)
    }
}

/// Closed enumeration of log file extensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum LogExt {
    #[display("log")]
    Log,
    #[display("txt")]
    Txt,
    #[display("json")]
    Json,
    #[display("md")]
    Md,
}

impl LogExt {
    pub const ALL: [LogExt; 4] = [LogExt::Log, LogExt::Txt, LogExt::Json, LogExt::Md];

    fn parse(s: &str) -> Option<LogExt> {
        Self::ALL.into_iter().find(|e| e.to_string() == s)
    }
}

/// A parsed canonical log name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogName {
    pub task: String,
    pub stage: String,
    pub event: LogEvent,
    pub ext: LogExt,
}

fn grammar() -> &'static Regex {
    static GRAMMAR: OnceLock<Regex> = OnceLock::new();
    GRAMMAR.get_or_init(|| Regex::new(r"^([^-]+)-([^-]+)-([^-]+)\.([^.]+)$").unwrap())
}

/// Build a canonical log name. Fails when `task` or `stage` contain hyphens
/// or are empty.
pub fn generate_log_name(task: &str, stage: &str, event: LogEvent, ext: LogExt) -> Result<String> {
    for (label, token) in [("task", task), ("stage", stage)] {
        if token.is_empty() || token.contains('-') {
            return Err(Error::InvalidLogName(format!(
                "{label} component {token:?} must be non-empty and hyphen-free"
            )));
        }
    }
    Ok(format!("{task}-{stage}-{event}.{ext}"))
}

/// Parse a canonical log name; `None` on any grammar mismatch.
pub fn parse_log_name(name: &str) -> Option<LogName> {
    let caps = grammar().captures(name)?;
    Some(LogName {
        task: caps[1].to_string(),
        stage: caps[2].to_string(),
        event: LogEvent::parse(&caps[3])?,
        ext: LogExt::parse(&caps[4])?,
    })
}

/// Validate a name supplied by user code on a log write.
pub fn validate_log_name(name: &str) -> Result<()> {
    parse_log_name(name)
        .map(|_| ())
        .ok_or_else(|| Error::InvalidLogName(name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_generated_names() {
        for event in LogEvent::ALL {
            for ext in LogExt::ALL {
                let name = generate_log_name("draft", "inference", event, ext).unwrap();
                let parsed = parse_log_name(&name).unwrap();
                assert_eq!(parsed.task, "draft");
                assert_eq!(parsed.stage, "inference");
                assert_eq!(parsed.event, event);
                assert_eq!(parsed.ext, ext);
            }
        }
    }

    #[test]
    fn rejects_hyphenated_components() {
        assert!(generate_log_name("my-task", "inference", LogEvent::Output, LogExt::Log).is_err());
        assert!(generate_log_name("task", "pre-proc", LogEvent::Output, LogExt::Log).is_err());
    }

    #[test]
    fn parse_returns_none_on_mismatch() {
        assert!(parse_log_name("no-dots-here").is_none());
        assert!(parse_log_name("a-b-notanevent.log").is_none());
        assert!(parse_log_name("a-b-output.exe").is_none());
        assert!(parse_log_name("too-many-parts-output.log").is_none());
        assert!(parse_log_name("a-b-output.log.bak").is_none());
    }

    #[test]
    fn validates_on_write() {
        assert!(validate_log_name("draft-inference-response.json").is_ok());
        assert!(validate_log_name("stage-inference.log").is_err());
    }
}
