//! Carrier delivery channels

use async_trait::async_trait;
use rand::Rng;
use serde::Serialize;
use smsgate_core::{
    config::{DeliveryConfig, DeliveryMode},
    models::Submission,
    traits::DeliveryChannel,
    AppError, AppResult,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

/// Carrier stand-in: waits a fixed latency, then succeeds unless a random
/// draw falls under `failure_rate`. A NaN rate never fails.
pub struct SimulatedCarrier {
    latency: Duration,
    failure_rate: f64,
}

impl SimulatedCarrier {
    pub fn new(latency: Duration, failure_rate: f64) -> Self {
        Self {
            latency,
            failure_rate: if failure_rate.is_nan() {
                0.0
            } else {
                failure_rate.clamp(0.0, 1.0)
            },
        }
    }
}

#[async_trait]
impl DeliveryChannel for SimulatedCarrier {
    async fn deliver(&self, submission: &Submission) -> AppResult<()> {
        let fail = rand::thread_rng().gen_bool(self.failure_rate);
        tokio::time::sleep(self.latency).await;

        if fail {
            return Err(AppError::DeliveryFailure(format!(
                "simulated carrier rejected message {}",
                submission.message_id
            )));
        }
        debug!("Simulated delivery of {} to {}", submission.message_id, submission.phone);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "simulated"
    }
}

#[derive(Serialize)]
struct CarrierRequest<'a> {
    phone: &'a str,
    body: &'a str,
}

/// Posts `{phone, body}` as JSON to a carrier endpoint; any non-2xx answer is
/// a failed delivery.
pub struct HttpCarrier {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpCarrier {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Config(format!("Failed to build carrier client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl DeliveryChannel for HttpCarrier {
    #[instrument(skip(self, submission), fields(message_id = %submission.message_id))]
    async fn deliver(&self, submission: &Submission) -> AppResult<()> {
        let request = CarrierRequest {
            phone: &submission.phone,
            body: &submission.body,
        };

        self.client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|e| AppError::DeliveryFailure(e.to_string()))?;

        Ok(())
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

/// Build the configured carrier
pub fn build_delivery_channel(
    config: &DeliveryConfig,
    timeout: Duration,
) -> AppResult<Arc<dyn DeliveryChannel>> {
    match config.mode {
        DeliveryMode::Simulated => {
            let rate = config.simulated_failure_rate;
            if !(0.0..=1.0).contains(&rate) {
                return Err(AppError::Config(format!(
                    "delivery.simulated_failure_rate must be within 0..=1, got {}",
                    rate
                )));
            }
            Ok(Arc::new(SimulatedCarrier::new(
                Duration::from_millis(config.simulated_latency_ms),
                rate,
            )))
        }
        DeliveryMode::Http => {
            let endpoint = config.endpoint.clone().ok_or_else(|| {
                AppError::Config("delivery.endpoint is required in http mode".to_string())
            })?;
            Ok(Arc::new(HttpCarrier::new(endpoint, timeout)?))
        }
    }
}
