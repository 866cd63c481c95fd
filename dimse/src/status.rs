//! DIMSE status codes and their classification.
//!
//! Status values live in (0000,0900) of response command sets.
//! The standard carves the 16-bit space into classes;
//! the exact set of codes a service may answer with is fixed
//! per service, and responses built through this crate
//! are checked against it.

use snafu::{ensure, Backtrace, Snafu};

use crate::commands::CommandField;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display(
        "status {:#06X} ({:?}) is not valid for {:?}",
        code,
        class,
        field
    ))]
    InvalidStatusForService {
        code: u16,
        class: StatusClass,
        field: CommandField,
        backtrace: Backtrace,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The class of a status code.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum StatusClass {
    /// 0x0000
    Success,
    /// 0xFF00 and 0xFF01
    Pending,
    /// 0xFE00
    Cancel,
    /// 0x0001, 0x0107, 0x0116 and 0xB000-0xBFFF
    Warning,
    /// everything else defined by the standard
    Failure,
}

/// A DIMSE status code.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct Status(u16);

impl Status {
    /// 0x0000 - operation completed
    pub const SUCCESS: Status = Status(0x0000);
    /// 0xFF00 - matches or sub-operations are continuing
    pub const PENDING: Status = Status(0xFF00);
    /// 0xFF01 - matches are continuing, with warning
    /// that one or more optional keys were not supported
    pub const PENDING_WARNING: Status = Status(0xFF01);
    /// 0xFE00 - the operation was terminated by a C-CANCEL
    pub const CANCEL: Status = Status(0xFE00);
    /// 0x0110 - processing failure
    pub const PROCESSING_FAILURE: Status = Status(0x0110);
    /// 0x0122 - SOP class not supported
    pub const SOP_CLASS_NOT_SUPPORTED: Status = Status(0x0122);
    /// 0x0210 - duplicate invocation
    pub const DUPLICATE_INVOCATION: Status = Status(0x0210);
    /// 0x0211 - unrecognized operation
    pub const UNRECOGNIZED_OPERATION: Status = Status(0x0211);
    /// 0xA700 - refused: out of resources
    pub const OUT_OF_RESOURCES: Status = Status(0xA700);
    /// 0xA801 - refused: move destination unknown
    pub const MOVE_DESTINATION_UNKNOWN: Status = Status(0xA801);
    /// 0xB000 - sub-operations completed, one or more failures
    pub const WARNING_SUB_OPERATIONS_FAILED: Status = Status(0xB000);
    /// 0xC000 - unable to process
    pub const UNABLE_TO_PROCESS: Status = Status(0xC000);

    pub fn new(code: u16) -> Self {
        Status(code)
    }

    pub fn code(self) -> u16 {
        self.0
    }

    /// The class of this code.
    pub fn class(self) -> StatusClass {
        match self.0 {
            0x0000 => StatusClass::Success,
            0xFF00 | 0xFF01 => StatusClass::Pending,
            0xFE00 => StatusClass::Cancel,
            0x0001 | 0x0107 | 0x0116 => StatusClass::Warning,
            0xB000..=0xBFFF => StatusClass::Warning,
            _ => StatusClass::Failure,
        }
    }

    pub fn is_success(self) -> bool {
        self.class() == StatusClass::Success
    }

    pub fn is_pending(self) -> bool {
        self.class() == StatusClass::Pending
    }

    pub fn is_cancel(self) -> bool {
        self.class() == StatusClass::Cancel
    }

    /// Whether a response with this status terminates the operation.
    pub fn is_final(self) -> bool {
        !self.is_pending()
    }

    /// Check this status against the classes the given response
    /// message is allowed to carry.
    pub fn validate_for(self, field: CommandField) -> Result<Status> {
        let class = self.class();
        let allowed = match field {
            // C-ECHO and C-STORE answers never carry pending or cancel
            CommandField::CEchoRsp | CommandField::CStoreRsp => {
                !matches!(class, StatusClass::Pending | StatusClass::Cancel)
            }
            // query/retrieve answers span the whole taxonomy
            CommandField::CFindRsp
            | CommandField::CGetRsp
            | CommandField::CMoveRsp => true,
            // normalized services know no pending or cancel either
            CommandField::NEventReportRsp
            | CommandField::NGetRsp
            | CommandField::NSetRsp
            | CommandField::NActionRsp
            | CommandField::NCreateRsp
            | CommandField::NDeleteRsp => {
                !matches!(class, StatusClass::Pending | StatusClass::Cancel)
            }
            // requests carry no status at all
            _ => false,
        };
        ensure!(
            allowed,
            InvalidStatusForServiceSnafu {
                code: self.0,
                class,
                field
            }
        );
        Ok(self)
    }
}

impl From<u16> for Status {
    fn from(code: u16) -> Self {
        Status(code)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#06X}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use matches::assert_matches;

    #[test]
    fn classifies_the_well_known_codes() {
        assert_eq!(Status::SUCCESS.class(), StatusClass::Success);
        assert_eq!(Status::PENDING.class(), StatusClass::Pending);
        assert_eq!(Status::PENDING_WARNING.class(), StatusClass::Pending);
        assert_eq!(Status::CANCEL.class(), StatusClass::Cancel);
        assert_eq!(Status::new(0xB007).class(), StatusClass::Warning);
        assert_eq!(Status::SOP_CLASS_NOT_SUPPORTED.class(), StatusClass::Failure);
        assert_eq!(Status::MOVE_DESTINATION_UNKNOWN.class(), StatusClass::Failure);
        assert_eq!(Status::new(0xC123).class(), StatusClass::Failure);
    }

    #[test]
    fn pending_is_not_final() {
        assert!(!Status::PENDING.is_final());
        assert!(Status::SUCCESS.is_final());
        assert!(Status::CANCEL.is_final());
        assert!(Status::new(0xA700).is_final());
    }

    #[test]
    fn echo_response_rejects_pending() {
        assert!(Status::SUCCESS.validate_for(CommandField::CEchoRsp).is_ok());
        assert_matches!(
            Status::PENDING.validate_for(CommandField::CEchoRsp),
            Err(Error::InvalidStatusForService { .. })
        );
    }

    #[test]
    fn find_response_admits_pending_and_cancel() {
        assert!(Status::PENDING.validate_for(CommandField::CFindRsp).is_ok());
        assert!(Status::CANCEL.validate_for(CommandField::CFindRsp).is_ok());
        assert!(Status::SUCCESS.validate_for(CommandField::CFindRsp).is_ok());
    }

    #[test]
    fn requests_carry_no_status() {
        assert_matches!(
            Status::SUCCESS.validate_for(CommandField::CEchoRq),
            Err(Error::InvalidStatusForService { .. })
        );
    }
}
