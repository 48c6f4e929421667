//! LinkedLamp provisioning wire protocol

pub mod credentials;
pub mod result;
pub mod uuids;

pub use {
    credentials::{Credentials, decode_credentials, encode_context, encode_credentials},
    result::{ResultStatus, parse_result},
    uuids::*,
};
