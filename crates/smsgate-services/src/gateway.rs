//! Intake facade: admission followed by dispatch

use crate::admission::AdmissionService;
use crate::router::DispatchRouter;
use serde::Serialize;
use smsgate_core::{
    models::{AdmissionDecision, Lane, MessageStatus, Submission, UserId},
    traits::LedgerStore,
    AppError, AppResult,
};
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

/// What the intake caller is told about a submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SubmitOutcome {
    Queued { message_id: Uuid, lane: Lane },
    Rejected { message_id: Uuid, reason: String },
    Duplicate { message_id: Uuid, status: MessageStatus },
}

pub struct Gateway {
    admission: AdmissionService,
    router: DispatchRouter,
    ledger: Arc<dyn LedgerStore>,
}

impl Gateway {
    pub fn new(
        admission: AdmissionService,
        router: DispatchRouter,
        ledger: Arc<dyn LedgerStore>,
    ) -> Self {
        Self {
            admission,
            router,
            ledger,
        }
    }

    /// Admit and queue a submission
    #[instrument(skip(self, submission), fields(message_id = %submission.message_id))]
    pub async fn submit(&self, submission: &Submission) -> AppResult<SubmitOutcome> {
        let message_id = submission.message_id;
        let decision = self.admission.admit(submission).await?;

        match &decision {
            AdmissionDecision::Admitted { lane, .. } => {
                self.router.dispatch(submission, &decision).await?;
                Ok(SubmitOutcome::Queued {
                    message_id,
                    lane: *lane,
                })
            }
            AdmissionDecision::Rejected { reason } => Ok(SubmitOutcome::Rejected {
                message_id,
                reason: reason.clone(),
            }),
            AdmissionDecision::Duplicate { status } => Ok(SubmitOutcome::Duplicate {
                message_id,
                status: *status,
            }),
        }
    }

    pub async fn status(&self, message_id: Uuid) -> AppResult<MessageStatus> {
        self.ledger
            .get_message_status(message_id)
            .await?
            .ok_or_else(|| AppError::MessageNotFound(message_id.to_string()))
    }

    pub async fn balance(&self, user_id: UserId) -> AppResult<i64> {
        self.ledger.get_balance(user_id).await
    }
}
