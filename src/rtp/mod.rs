//! RTP-level concerns: the payload-type registry and the stream validator.

mod format;
mod validator;

pub use self::{
    format::{encode_l16, Decoder, Format, FormatMap},
    validator::{Breaker, Validator, ValidatorConfig},
};
