//! Association control module
//!
//! This module gathers everything related to the lifecycle of an
//! association between two application entities:
//! application entity title validation,
//! the presentation context negotiation algorithm ([`negotiation`]),
//! and the ACSE operation surface ([`acse`]).

use snafu::{ensure, Backtrace, Snafu};

pub mod acse;
pub mod negotiation;

/// The UID of the DICOM application context,
/// the only application context in use.
pub const APPLICATION_CONTEXT_NAME: &str = "1.2.840.10008.3.1.1.1";

/// The lifecycle status of an association.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum AssociationStatus {
    /// no association activity yet
    Idle,
    /// an association request was issued and awaits an answer
    Requested,
    /// the association is established and ready for data transfer
    Established,
    /// the association ended with an orderly release
    Released,
    /// the association ended with an abort from either side
    Aborted,
    /// the association request was rejected by the peer
    Rejected,
}

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum InvalidAeTitle {
    /// AE title is empty or made of spaces only
    EmptyAeTitle { backtrace: Backtrace },

    #[snafu(display("AE title contains forbidden character {:?}", character))]
    ForbiddenCharacter { character: char, backtrace: Backtrace },
}

/// Validate and normalize an application entity title.
///
/// The outcome is the title with insignificant leading and trailing
/// spaces removed and truncated to 16 characters.
/// Titles containing a backslash or any control character are refused,
/// as is a title with no significant characters at all.
/// The operation is idempotent:
/// validating an already validated title returns it unchanged.
pub fn validate_ae_title(ae_title: &str) -> Result<String, InvalidAeTitle> {
    let trimmed = ae_title.trim_matches(' ');
    ensure!(!trimmed.is_empty(), EmptyAeTitleSnafu);

    for character in trimmed.chars() {
        ensure!(
            character != '\\' && !character.is_control() && character.is_ascii(),
            ForbiddenCharacterSnafu { character }
        );
    }

    let mut title = trimmed.to_string();
    title.truncate(16);
    // truncation may expose trailing padding
    Ok(title.trim_end_matches(' ').to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use matches::assert_matches;

    #[test]
    fn ae_title_is_trimmed_and_capped() {
        assert_eq!(validate_ae_title("  STORE-SCP  ").unwrap(), "STORE-SCP");
        assert_eq!(
            validate_ae_title("A-VERY-LONG-AE-TITLE-INDEED").unwrap(),
            "A-VERY-LONG-AE-T"
        );
    }

    #[test]
    fn ae_title_validation_is_idempotent() {
        for input in ["ECHO-SCU", " padded ", "A-VERY-LONG-AE-TITLE-INDEED"] {
            let once = validate_ae_title(input).unwrap();
            let twice = validate_ae_title(&once).unwrap();
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn empty_ae_title_is_refused() {
        assert_matches!(validate_ae_title(""), Err(InvalidAeTitle::EmptyAeTitle { .. }));
        assert_matches!(
            validate_ae_title("                "),
            Err(InvalidAeTitle::EmptyAeTitle { .. })
        );
    }

    #[test]
    fn forbidden_characters_are_refused() {
        assert_matches!(
            validate_ae_title("BAD\\TITLE"),
            Err(InvalidAeTitle::ForbiddenCharacter { character: '\\', .. })
        );
        assert_matches!(
            validate_ae_title("BAD\u{9}TITLE"),
            Err(InvalidAeTitle::ForbiddenCharacter { .. })
        );
        assert_matches!(
            validate_ae_title("BAD\u{7f}TITLE"),
            Err(InvalidAeTitle::ForbiddenCharacter { .. })
        );
    }
}
