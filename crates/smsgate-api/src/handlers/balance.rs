//! Balance handlers

use super::sms::parse_uuid;
use crate::dto::BalanceResponse;
use actix_web::{web, HttpResponse};
use smsgate_core::AppError;
use smsgate_services::Gateway;
use tracing::instrument;

/// Get a user's spendable balance
///
/// GET /balance/{user_id}
#[instrument(skip(gateway))]
pub async fn get_balance(
    gateway: web::Data<Gateway>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let user_id = parse_uuid("user_id", &path)?;
    let balance = gateway.balance(user_id).await?;

    Ok(HttpResponse::Ok().json(BalanceResponse { user_id, balance }))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/balance/{user_id}", web::get().to(get_balance));
}
