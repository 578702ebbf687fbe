//! Data Transfer Objects for the HTTP API

pub mod sms;

pub use sms::{BalanceResponse, MessageStatusResponse, SendSmsRequest, SendSmsResponse};
