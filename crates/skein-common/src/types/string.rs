//! Validation errors shared by the atproto string types

use miette::SourceSpan;
use smol_str::SmolStr;

/// Error validating one of the atproto string formats (DID, TID, ...)
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, miette::Diagnostic)]
#[error("error in `{source}`: {kind}")]
#[diagnostic(url("https://atproto.com/specs/{spec}"))]
pub struct StrError {
    /// Which format was being parsed
    pub spec: SmolStr,
    /// The offending input
    #[source_code]
    pub source: String,
    /// What went wrong
    #[source]
    #[diagnostic_source]
    pub kind: StrParseKind,
}

/// Kinds of string validation failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, miette::Diagnostic)]
pub enum StrParseKind {
    /// Did not match the format's pattern
    #[error("regex failure - {message}")]
    #[diagnostic(code(skein::types::string::regex_fail))]
    RegexFail {
        /// Where in the input, if known
        #[label]
        span: Option<SourceSpan>,
        /// Description of the failure
        #[help]
        message: SmolStr,
    },

    /// Longer than allowed
    #[error("string too long (allowed: {max}, actual: {actual})")]
    #[diagnostic(code(skein::types::string::wrong_length))]
    TooLong {
        /// Maximum length
        max: usize,
        /// Actual length
        actual: usize,
    },

    /// Shorter than allowed
    #[error("string too short (allowed: {min}, actual: {actual})")]
    #[diagnostic(code(skein::types::string::wrong_length))]
    TooShort {
        /// Minimum length
        min: usize,
        /// Actual length
        actual: usize,
    },
}

impl StrError {
    /// Create a new error
    pub fn new(spec: &'static str, source: impl Into<String>, kind: StrParseKind) -> Self {
        Self {
            spec: SmolStr::new_static(spec),
            source: source.into(),
            kind,
        }
    }

    /// Input failed the format's pattern
    pub fn regex(spec: &'static str, source: impl Into<String>, message: SmolStr) -> Self {
        Self::new(
            spec,
            source,
            StrParseKind::RegexFail {
                span: None,
                message,
            },
        )
    }

    /// Input longer than `max`
    pub fn too_long(spec: &'static str, source: impl Into<String>, max: usize, actual: usize) -> Self {
        Self::new(spec, source, StrParseKind::TooLong { max, actual })
    }

    /// Input shorter than `min`
    pub fn too_short(spec: &'static str, source: impl Into<String>, min: usize, actual: usize) -> Self {
        Self::new(spec, source, StrParseKind::TooShort { min, actual })
    }
}
