use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info};

use super::{CallbackResult, CallbackSink};
use crate::chain::{TxMessage, TxSigner};
use crate::error::{LessorError, Result};
use crate::types::{CommandId, LifecycleAction, OrderId, ResourceRef};

pub const MSG_CONFIRM_LIFECYCLE: &str = "/lessor.market.v1.MsgConfirmLifecycle";
pub const MSG_REPORT_LIFECYCLE_FAILURE: &str = "/lessor.market.v1.MsgReportLifecycleFailure";
pub const MSG_REPORT_ROUTING_FAILURE: &str = "/lessor.market.v1.MsgReportRoutingFailure";

#[derive(Serialize)]
struct LifecycleReport<'a> {
    provider: String,
    command_id: &'a CommandId,
    resource_ref: &'a ResourceRef,
    action: LifecycleAction,
    order_id: Option<&'a OrderId>,
    nonce: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
}

#[derive(Serialize)]
struct RoutingReport<'a> {
    provider: String,
    order_id: &'a OrderId,
    attempts: u32,
    error: &'a str,
}

/// Reports lifecycle and routing outcomes as signed transactions.
///
/// Bid outcomes are not re-broadcast: the bid transaction already is the
/// on-chain record, so they are only logged.
pub struct ChainCallbackSink {
    signer: Arc<TxSigner>,
}

impl fmt::Debug for ChainCallbackSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainCallbackSink")
            .field("signer", &self.signer.address())
            .finish()
    }
}

impl ChainCallbackSink {
    pub fn new(signer: Arc<TxSigner>) -> Self {
        Self { signer }
    }

    fn message_for(&self, result: &CallbackResult) -> Result<Option<TxMessage>> {
        let provider = self.signer.address().0;
        let message = match result {
            CallbackResult::BidOutcome { .. } => return Ok(None),
            CallbackResult::LifecycleConfirmed {
                command_id,
                resource_ref,
                action,
                order_id,
                request_nonce,
            } => TxMessage::new(
                MSG_CONFIRM_LIFECYCLE,
                &LifecycleReport {
                    provider,
                    command_id,
                    resource_ref,
                    action: *action,
                    order_id: order_id.as_ref(),
                    nonce: request_nonce,
                    error: None,
                },
            )?,
            CallbackResult::LifecycleFailed {
                command_id,
                resource_ref,
                action,
                order_id,
                request_nonce,
                error,
                ..
            } => TxMessage::new(
                MSG_REPORT_LIFECYCLE_FAILURE,
                &LifecycleReport {
                    provider,
                    command_id,
                    resource_ref,
                    action: *action,
                    order_id: order_id.as_ref(),
                    nonce: request_nonce,
                    error: Some(error),
                },
            )?,
            CallbackResult::RoutingFailed {
                order_id,
                attempts,
                error,
            } => TxMessage::new(
                MSG_REPORT_ROUTING_FAILURE,
                &RoutingReport {
                    provider,
                    order_id,
                    attempts: *attempts,
                    error,
                },
            )?,
        };
        Ok(Some(message))
    }
}

#[async_trait]
impl CallbackSink for ChainCallbackSink {
    async fn submit(&self, result: &CallbackResult) -> Result<()> {
        let Some(message) = self.message_for(result)? else {
            debug!(target: "lessor::callback", kind = result.label(), "outcome recorded by its own transaction");
            return Ok(());
        };

        let receipt = self
            .signer
            .sign_and_broadcast(vec![message], result.label())
            .await?;
        if !receipt.is_ok() {
            return Err(LessorError::Validation(format!(
                "{} report rejected with code {}: {}",
                result.label(),
                receipt.code,
                receipt.log
            )));
        }
        info!(
            target: "lessor::callback",
            kind = result.label(),
            tx_hash = %receipt.tx_hash,
            "outcome reported on chain"
        );
        Ok(())
    }
}
