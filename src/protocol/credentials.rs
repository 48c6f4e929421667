//! Credential frame written to the lamp
//!
//! Three length-prefixed UTF-8 fields in fixed order:
//!
//! ```text
//! [len:u8][group name][len:u8][ssid][len:u8][password]
//! ```
//!
//! Fields are encoded as given; trimming is the caller's job
//! (see [`ProvisioningContext::new`](crate::core::types::ProvisioningContext::new)).

use crate::core::{
    error::CredentialError,
    types::{CredentialField, ProvisioningContext},
};

/// Encode group name, SSID and password into the credential frame
///
/// Fields longer than 255 bytes are rejected, never truncated.
pub fn encode_credentials(
    group_name: &str,
    ssid: &str,
    password: &str,
) -> Result<Vec<u8>, CredentialError> {
    let fields = [
        (CredentialField::GroupName, group_name),
        (CredentialField::Ssid, ssid),
        (CredentialField::Password, password),
    ];

    let mut frame = Vec::with_capacity(3 + group_name.len() + ssid.len() + password.len());
    for (field, value) in fields {
        let len = u8::try_from(value.len()).map_err(|_| CredentialError::FieldTooLong {
            field,
            len: value.len(),
        })?;
        frame.push(len);
        frame.extend_from_slice(value.as_bytes());
    }

    Ok(frame)
}

/// Encode a validated provisioning context
pub fn encode_context(context: &ProvisioningContext) -> Result<Vec<u8>, CredentialError> {
    encode_credentials(context.group_name(), context.ssid(), context.password())
}

/// Decoded credential frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub group_name: String,
    pub ssid: String,
    pub password: String,
}

/// Parse a credential frame back into its fields
pub fn decode_credentials(frame: &[u8]) -> Result<Credentials, CredentialError> {
    let mut rest = frame;

    let group_name = take_field(&mut rest, CredentialField::GroupName)?;
    let ssid = take_field(&mut rest, CredentialField::Ssid)?;
    let password = take_field(&mut rest, CredentialField::Password)?;

    if !rest.is_empty() {
        return Err(CredentialError::TrailingBytes(rest.len()));
    }

    Ok(Credentials {
        group_name,
        ssid,
        password,
    })
}

fn take_field(rest: &mut &[u8], field: CredentialField) -> Result<String, CredentialError> {
    let (&len, tail) = rest
        .split_first()
        .ok_or(CredentialError::Truncated { field })?;
    let len = usize::from(len);

    if tail.len() < len {
        return Err(CredentialError::Truncated { field });
    }

    let (value, tail) = tail.split_at(len);
    *rest = tail;

    String::from_utf8(value.to_vec()).map_err(|_| CredentialError::InvalidUtf8 { field })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_encode_reference_frame() {
        let frame = encode_credentials("home", "MyWifi", "secret123").unwrap();
        assert_eq!(
            frame,
            vec![
                0x04, 0x68, 0x6F, 0x6D, 0x65, 0x06, 0x4D, 0x79, 0x57, 0x69, 0x66, 0x69, 0x09, 0x73,
                0x65, 0x63, 0x72, 0x65, 0x74, 0x31, 0x32, 0x33,
            ]
        );
    }

    #[test]
    fn test_encode_empty_fields() {
        let frame = encode_credentials("", "net", "").unwrap();
        assert_eq!(frame, vec![0x00, 0x03, b'n', b'e', b't', 0x00]);
    }

    #[test]
    fn test_encode_counts_utf8_bytes() {
        let frame = encode_credentials("café", "Wi-Fi ☕", "pässwörd").unwrap();
        assert_eq!(frame[0], 5);
        assert_eq!(frame[6], 9);
        assert_eq!(frame[16], 10);
        assert_eq!(frame.len(), 3 + 5 + 9 + 10);
    }

    #[test]
    fn test_encode_does_not_trim() {
        let frame = encode_credentials(" g ", "s", "p").unwrap();
        assert_eq!(&frame[..4], &[3, b' ', b'g', b' ']);
    }

    #[test]
    fn test_encode_field_limit() {
        let max = "a".repeat(255);
        let frame = encode_credentials(&max, "ssid", "").unwrap();
        assert_eq!(frame[0], 255);

        let too_long = "a".repeat(256);
        assert_eq!(
            encode_credentials("home", &too_long, "pw").unwrap_err(),
            CredentialError::FieldTooLong {
                field: CredentialField::Ssid,
                len: 256
            }
        );
    }

    #[test]
    fn test_round_trip() {
        let cases = [
            ("home", "MyWifi", "secret123"),
            ("", "x", ""),
            ("Living_Room-2", "Freebox-7A3C2F", "p@ss w0rd with spaces"),
            ("日本", "ネットワーク", "パスワード"),
        ];

        for (group_name, ssid, password) in cases {
            let frame = encode_credentials(group_name, ssid, password).unwrap();
            let decoded = decode_credentials(&frame).unwrap();
            assert_eq!(
                decoded,
                Credentials {
                    group_name: group_name.into(),
                    ssid: ssid.into(),
                    password: password.into(),
                }
            );
        }
    }

    #[test]
    fn test_round_trip_max_length_fields() {
        let long = "é".repeat(127); // 254 bytes
        let frame = encode_credentials(&long, &long, &long).unwrap();
        let decoded = decode_credentials(&frame).unwrap();
        assert_eq!(decoded.password, long);
    }

    #[test]
    fn test_encode_context() {
        let ctx = ProvisioningContext::new("home", " MyWifi ", "secret123").unwrap();
        assert_eq!(
            encode_context(&ctx).unwrap(),
            encode_credentials("home", "MyWifi", "secret123").unwrap()
        );
    }

    #[test]
    fn test_decode_truncated() {
        assert_eq!(
            decode_credentials(&[]).unwrap_err(),
            CredentialError::Truncated {
                field: CredentialField::GroupName
            }
        );
        assert_eq!(
            decode_credentials(&[0x04, b'h', b'o']).unwrap_err(),
            CredentialError::Truncated {
                field: CredentialField::GroupName
            }
        );
        assert_eq!(
            decode_credentials(&[0x00, 0x01, b's']).unwrap_err(),
            CredentialError::Truncated {
                field: CredentialField::Password
            }
        );
    }

    #[test]
    fn test_decode_trailing_bytes() {
        assert_eq!(
            decode_credentials(&[0x00, 0x01, b's', 0x00, 0xAA, 0xBB]).unwrap_err(),
            CredentialError::TrailingBytes(2)
        );
    }

    #[test]
    fn test_decode_invalid_utf8() {
        assert_eq!(
            decode_credentials(&[0x00, 0x02, 0xFF, 0xFE, 0x00]).unwrap_err(),
            CredentialError::InvalidUtf8 {
                field: CredentialField::Ssid
            }
        );
    }
}
