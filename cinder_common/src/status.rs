//! Numeric status codes.
//!
//! Every diagnostic the parser or a motion primitive can produce is one of
//! these codes; the CLI reports them as `error:<n>`. The numeric values are
//! part of the wire protocol and must stay stable.

use thiserror::Error;

/// Closed set of reportable diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
#[repr(u8)]
pub enum Status {
    #[error("expected command letter")]
    ExpectedCommandLetter = 1,
    #[error("bad number format")]
    BadNumberFormat = 2,
    #[error("invalid statement")]
    InvalidStatement = 3,
    #[error("value cannot be negative")]
    NegativeValue = 4,
    #[error("command requires idle state")]
    IdleError = 8,
    #[error("target exceeds soft limits")]
    SoftLimitError = 10,
    #[error("value overflow")]
    Overflow = 11,
    #[error("maximum step rate exceeded")]
    MaxStepRateExceeded = 12,
    #[error("line length exceeded")]
    LineLengthExceeded = 14,
    #[error("target exceeds machine travel")]
    TravelExceeded = 15,
    #[error("unsupported command")]
    UnsupportedCommand = 20,
    #[error("modal group violation")]
    ModalGroupViolation = 21,
    #[error("undefined feed rate")]
    UndefinedFeedRate = 22,
    #[error("command value not integer")]
    CommandValueNotInteger = 23,
    #[error("axis command conflict")]
    AxisCommandConflict = 24,
    #[error("word repeated")]
    WordRepeated = 25,
    #[error("no axis words")]
    NoAxisWords = 26,
    #[error("invalid line number")]
    InvalidLineNumber = 27,
    #[error("value word missing")]
    ValueWordMissing = 28,
    #[error("axis words not allowed")]
    AxisWordsExist = 31,
    #[error("no axis words in plane")]
    NoAxisWordsInPlane = 32,
    #[error("invalid target")]
    InvalidTarget = 33,
    #[error("arc radius error")]
    ArcRadiusError = 34,
    #[error("no offsets in plane")]
    NoOffsetsInPlane = 35,
    #[error("unused value words")]
    UnusedWords = 36,
    #[error("maximum value exceeded")]
    MaxValueExceeded = 38,
}

impl Status {
    /// Numeric code reported over the CLI.
    #[inline]
    pub const fn code(self) -> u8 {
        self as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(Status::ExpectedCommandLetter.code(), 1);
        assert_eq!(Status::IdleError.code(), 8);
        assert_eq!(Status::UnsupportedCommand.code(), 20);
        assert_eq!(Status::ModalGroupViolation.code(), 21);
        assert_eq!(Status::ArcRadiusError.code(), 34);
        assert_eq!(Status::MaxValueExceeded.code(), 38);
    }

    #[test]
    fn display_is_lowercase_diagnostic() {
        assert_eq!(
            Status::UndefinedFeedRate.to_string(),
            "undefined feed rate"
        );
    }
}
