//! Error types for script passes and their rendering as exception payloads.

use std::any::Any;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::panic::Location;

use serde::{Deserialize, Serialize};

use crate::config::ErrorDetails;
use crate::identity::{CallSite, WidgetIdentity};

pub(crate) const GENERIC_UNCAUGHT_ERROR_TEXT: &str = "This app has encountered an error. \
The original error message is redacted to prevent data leaks. \
Full error details have been recorded in the logs.";

/// Result alias for anything the author's script calls.
pub type ScriptResult<T = ()> = Result<T, PassError>;

/// Why a pass stopped before completing normally.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PassError {
    /// A newer interaction superseded the pass. Not an error for the author.
    #[error("pass superseded by a newer interaction")]
    Interrupted,
    /// Two calls in the same pass resolved to one identity.
    #[error("duplicate widget identity `{identity}` ({first} and {second})")]
    DuplicateIdentity {
        identity: WidgetIdentity,
        first: CallSite,
        second: CallSite,
    },
    /// The author's code failed.
    #[error(transparent)]
    Script(#[from] ScriptError),
}

impl PassError {
    pub fn is_interrupted(&self) -> bool {
        matches!(self, PassError::Interrupted)
    }

    /// Formats the error as the terminal exception delta of a pass.
    ///
    /// Returns `None` for interruptions and for script errors whose delta was
    /// already written (a failed stream).
    pub fn to_exception(&self, details: ErrorDetails, user_frame_prefix: &str) -> Option<ExceptionPayload> {
        match self {
            PassError::Interrupted => None,
            PassError::DuplicateIdentity { identity, .. } => Some(ExceptionPayload {
                type_name: "DuplicateWidgetIdentity".to_string(),
                message: duplicate_identity_message(identity),
                message_is_markdown: true,
                stack_trace: Vec::new(),
            }),
            PassError::Script(err) if err.reported => None,
            PassError::Script(err) => Some(ExceptionPayload::uncaught(err, details, user_frame_prefix)),
        }
    }
}

impl From<Box<dyn std::error::Error + Send + Sync>> for PassError {
    #[track_caller]
    fn from(err: Box<dyn std::error::Error + Send + Sync>) -> Self {
        PassError::Script(ScriptError::from_dyn(&*err))
    }
}

fn duplicate_identity_message(identity: &WidgetIdentity) -> String {
    match identity.user_key() {
        Some(key) => format!(
            "There are multiple widgets with the same `key='{key}'`.\n\n\
             To fix this, please make sure that the `key` argument is unique for each widget you create."
        ),
        None => format!(
            "There are multiple identical widgets with the same generated identity `{identity}`.\n\n\
             To fix this, please pass a unique `key` argument to the widget."
        ),
    }
}

/// An error raised by author code, captured with enough context to render it.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{type_name}: {message}")]
pub struct ScriptError {
    type_name: String,
    message: String,
    stack_trace: Vec<String>,
    message_is_markdown: bool,
    reported: bool,
}

impl ScriptError {
    #[track_caller]
    pub fn new(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            message: message.into(),
            stack_trace: capture_stack(Location::caller(), Vec::new()),
            message_is_markdown: false,
            reported: false,
        }
    }

    /// An error about misuse of the framework API; its message is markdown.
    #[track_caller]
    pub fn api(message: impl Into<String>) -> Self {
        let mut err = Self::new("ApiError", message);
        err.message_is_markdown = true;
        err
    }

    /// Captures any error, recording its `source()` chain in the stack trace.
    #[track_caller]
    pub fn from_error<E: std::error::Error + 'static>(err: &E) -> Self {
        let mut captured = Self::from_dyn(err);
        captured.type_name = short_type_name(std::any::type_name::<E>()).to_string();
        captured
    }

    #[track_caller]
    pub(crate) fn from_dyn(err: &(dyn std::error::Error + 'static)) -> Self {
        let mut causes = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            causes.push(format!("caused by: {cause}"));
            source = cause.source();
        }
        Self {
            type_name: "Error".to_string(),
            message: err.to_string(),
            stack_trace: capture_stack(Location::caller(), causes),
            message_is_markdown: false,
            reported: false,
        }
    }

    /// Captures the payload of a panic raised by author code.
    #[track_caller]
    pub fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "Box<dyn Any>".to_string()
        };
        Self::new("Panic", message)
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn stack_trace(&self) -> &[String] {
        &self.stack_trace
    }

    pub fn message_is_markdown(&self) -> bool {
        self.message_is_markdown
    }

    /// Whether an exception delta for this error has already been written.
    pub fn is_reported(&self) -> bool {
        self.reported
    }

    pub(crate) fn into_reported(mut self) -> Self {
        self.reported = true;
        self
    }
}

fn capture_stack(location: &Location<'_>, mut causes: Vec<String>) -> Vec<String> {
    let mut frames = vec![format!(
        "at {}:{}:{}",
        location.file(),
        location.line(),
        location.column()
    )];
    frames.append(&mut causes);
    let backtrace = Backtrace::capture();
    if backtrace.status() == BacktraceStatus::Captured {
        frames.extend(
            backtrace
                .to_string()
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string),
        );
    }
    frames
}

fn short_type_name(full: &str) -> &str {
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

/// Exception element sent to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExceptionPayload {
    pub type_name: String,
    pub message: String,
    pub message_is_markdown: bool,
    pub stack_trace: Vec<String>,
}

impl ExceptionPayload {
    /// Payload for an error the author displays explicitly.
    ///
    /// Never gated by [`ErrorDetails`] and never carries a stack trace.
    pub fn explicit(err: &ScriptError) -> Self {
        Self {
            type_name: err.type_name.clone(),
            message: err.message.clone(),
            message_is_markdown: err.message_is_markdown,
            stack_trace: Vec::new(),
        }
    }

    /// Payload for an error that escaped the script, redacted per `details`.
    pub fn uncaught(err: &ScriptError, details: ErrorDetails, user_frame_prefix: &str) -> Self {
        let stack_trace = trim_to_user_frames(&err.stack_trace, user_frame_prefix);
        match details {
            ErrorDetails::Full => Self {
                type_name: err.type_name.clone(),
                message: err.message.clone(),
                message_is_markdown: err.message_is_markdown,
                stack_trace,
            },
            ErrorDetails::StackTrace => Self {
                type_name: err.type_name.clone(),
                message: GENERIC_UNCAUGHT_ERROR_TEXT.to_string(),
                message_is_markdown: false,
                stack_trace,
            },
            ErrorDetails::Type => Self {
                type_name: err.type_name.clone(),
                message: GENERIC_UNCAUGHT_ERROR_TEXT.to_string(),
                message_is_markdown: false,
                stack_trace: Vec::new(),
            },
            ErrorDetails::None => Self {
                type_name: String::new(),
                message: GENERIC_UNCAUGHT_ERROR_TEXT.to_string(),
                message_is_markdown: false,
                stack_trace: Vec::new(),
            },
        }
    }
}

/// Splits `items` before the first element matching `split_point`.
pub fn split_list<T: Clone>(items: &[T], split_point: impl Fn(&T) -> bool) -> (Vec<T>, Vec<T>) {
    let index = items.iter().position(split_point).unwrap_or(items.len());
    (items[..index].to_vec(), items[index..].to_vec())
}

/// Drops runtime frames preceding the first frame from user code.
///
/// Keeps the whole trace when no prefix is configured or no frame matches.
fn trim_to_user_frames(stack: &[String], prefix: &str) -> Vec<String> {
    if prefix.is_empty() {
        return stack.to_vec();
    }
    let (runtime_frames, user_frames) = split_list(stack, |frame| frame.contains(prefix));
    if user_frames.is_empty() {
        runtime_frames
    } else {
        user_frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("outer failure")]
    struct Outer {
        #[source]
        inner: std::io::Error,
    }

    fn sample_error() -> ScriptError {
        ScriptError::new("RuntimeError", "This exception message is awesome!")
    }

    #[test]
    fn split_list_matches_first_split_point() {
        let cases: [(&[&str], usize); 6] = [
            (&["a", "b", "c", "-", "d", "e"], 3),
            (&["-", "a", "b", "c", "d", "e"], 0),
            (&["a", "b", "c", "d", "e", "-"], 5),
            (&["a", "b", "c", "d", "e", "f"], 6),
            (&["a", "-", "c", "d", "-", "f"], 1),
            (&[], 0),
        ];
        for (input, index) in cases {
            let (before, after) = split_list(input, |item| *item == "-");
            assert_eq!(before, input[..index].to_vec());
            assert_eq!(after, input[index..].to_vec());
        }
    }

    #[test]
    fn full_details_keep_message_and_stack() {
        let payload = ExceptionPayload::uncaught(&sample_error(), ErrorDetails::Full, "");
        assert_eq!(payload.message, "This exception message is awesome!");
        assert_eq!(payload.type_name, "RuntimeError");
        assert!(!payload.stack_trace.is_empty());
    }

    #[test]
    fn stacktrace_details_redact_message() {
        let payload = ExceptionPayload::uncaught(&sample_error(), ErrorDetails::StackTrace, "");
        assert_eq!(payload.message, GENERIC_UNCAUGHT_ERROR_TEXT);
        assert_eq!(payload.type_name, "RuntimeError");
        assert!(!payload.stack_trace.is_empty());
    }

    #[test]
    fn type_details_keep_only_type() {
        let payload = ExceptionPayload::uncaught(&sample_error(), ErrorDetails::Type, "");
        assert_eq!(payload.message, GENERIC_UNCAUGHT_ERROR_TEXT);
        assert!(payload.stack_trace.is_empty());
        assert_eq!(payload.type_name, "RuntimeError");
    }

    #[test]
    fn none_details_hide_everything() {
        let payload = ExceptionPayload::uncaught(&sample_error(), ErrorDetails::None, "");
        assert_eq!(payload.message, GENERIC_UNCAUGHT_ERROR_TEXT);
        assert!(payload.stack_trace.is_empty());
        assert_eq!(payload.type_name, "");
    }

    #[test]
    fn explicit_exception_ignores_details_and_stack() {
        let payload = ExceptionPayload::explicit(&sample_error());
        assert_eq!(payload.message, "This exception message is awesome!");
        assert!(payload.stack_trace.is_empty());
    }

    #[test]
    fn api_errors_are_markdown() {
        assert!(ScriptError::api("use a **unique** key").message_is_markdown());
        assert!(!sample_error().message_is_markdown());
    }

    #[test]
    fn from_error_records_source_chain_and_type() {
        let err = Outer {
            inner: std::io::Error::new(std::io::ErrorKind::Other, "disk on fire"),
        };
        let captured = ScriptError::from_error(&err);
        assert_eq!(captured.type_name(), "Outer");
        assert_eq!(captured.message(), "outer failure");
        assert!(captured
            .stack_trace()
            .iter()
            .any(|frame| frame == "caused by: disk on fire"));
    }

    #[test]
    fn stack_is_trimmed_to_user_frames() {
        let stack = vec![
            "at runtime/src/pass.rs:1:1".to_string(),
            "at app/src/main.rs:4:2".to_string(),
            "at app/src/widgets.rs:9:9".to_string(),
        ];
        assert_eq!(trim_to_user_frames(&stack, "app/src"), stack[1..].to_vec());
        assert_eq!(trim_to_user_frames(&stack, "nowhere"), stack);
        assert_eq!(trim_to_user_frames(&stack, ""), stack);
    }

    #[test]
    fn panic_payloads_become_script_errors() {
        let literal: Box<dyn Any + Send> = Box::new("index out of bounds");
        let formatted: Box<dyn Any + Send> = Box::new(format!("bad value {}", 3));
        let opaque: Box<dyn Any + Send> = Box::new(17u8);

        assert_eq!(ScriptError::from_panic(&*literal).message(), "index out of bounds");
        assert_eq!(ScriptError::from_panic(&*formatted).message(), "bad value 3");
        assert_eq!(ScriptError::from_panic(&*opaque).message(), "Box<dyn Any>");
        assert_eq!(ScriptError::from_panic(&*literal).type_name(), "Panic");
    }

    #[test]
    fn reported_script_errors_produce_no_second_delta() {
        let err = PassError::Script(sample_error().into_reported());
        assert!(err.to_exception(ErrorDetails::Full, "").is_none());
        assert!(PassError::Interrupted.to_exception(ErrorDetails::Full, "").is_none());
    }
}
