//! API layer for smsgate
//!
//! Thin actix-web intake surface over the [`smsgate_services::Gateway`].
//! Handlers validate input, call the gateway and map outcomes to status
//! codes; errors are rendered by `AppError`'s `ResponseError` impl.

#![forbid(unsafe_code)]

pub mod dto;
pub mod handlers;

pub use dto::{BalanceResponse, MessageStatusResponse, SendSmsRequest, SendSmsResponse};
pub use handlers::{configure_routes, json_config};
