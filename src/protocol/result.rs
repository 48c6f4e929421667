//! Result notification sent by the lamp after a credential write

use crate::core::error::ProtocolError;

/// Status byte meaning the lamp accepted the credentials
pub const STATUS_ACCEPTED: u8 = 0x01;

/// Decoded result notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultStatus {
    Accepted,
    Rejected(u8),
}

/// Interpret a result notification.
///
/// Only the first byte is significant; an empty payload is malformed.
pub fn parse_result(payload: &[u8]) -> Result<ResultStatus, ProtocolError> {
    match payload.first() {
        None => Err(ProtocolError::MalformedResponse),
        Some(&STATUS_ACCEPTED) => Ok(ResultStatus::Accepted),
        Some(&code) => Ok(ResultStatus::Rejected(code)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_result() {
        assert_eq!(parse_result(&[1]), Ok(ResultStatus::Accepted));
        assert_eq!(parse_result(&[0]), Ok(ResultStatus::Rejected(0)));
        assert_eq!(parse_result(&[7]), Ok(ResultStatus::Rejected(7)));
        assert_eq!(parse_result(&[]), Err(ProtocolError::MalformedResponse));
    }

    #[test]
    fn test_parse_result_ignores_trailing_bytes() {
        assert_eq!(parse_result(&[1, 0, 0]), Ok(ResultStatus::Accepted));
        assert_eq!(parse_result(&[0, 1]), Ok(ResultStatus::Rejected(0)));
    }
}
