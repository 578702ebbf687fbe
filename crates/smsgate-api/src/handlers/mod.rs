//! HTTP request handlers

pub mod balance;
pub mod health;
pub mod sms;

use actix_web::{web, HttpResponse};

pub use balance::configure as configure_balance;
pub use health::configure as configure_health;
pub use sms::configure as configure_sms;

/// Register every intake route
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.configure(configure_health)
        .configure(configure_sms)
        .configure(configure_balance);
}

/// JSON extractor config answering malformed bodies with the API error shape
pub fn json_config() -> web::JsonConfig {
    web::JsonConfig::default()
        .limit(16 * 1024)
        .error_handler(|err, _req| {
            let error_message = err.to_string();
            actix_web::error::InternalError::from_response(
                err,
                HttpResponse::BadRequest().json(serde_json::json!({
                    "error": "invalid_payload",
                    "message": error_message,
                    "status": 400,
                })),
            )
            .into()
        })
}
