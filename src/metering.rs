// Metering pipeline: pricing lookup -> cost -> quota deduction -> request log
//
// The pre-flight check rejects requests whose (config, model) has no pricing
// row before any upstream call is made. After a successful response the
// pipeline runs exactly once per request, on both streaming and
// non-streaming paths; a quota deduction failure after the upstream already
// charged is logged as CRITICAL and the response is still served.

use std::sync::Arc;

use crate::error::{GatewayError, Result};
use crate::models::unified::UsageInfo;
use crate::store::entities::{Pricing, RequestLogEntry};
use crate::store::GatewayStore;

#[derive(Debug, Clone)]
pub struct MeterContext {
    pub user_id: i64,
    pub api_key_id: i64,
    pub api_config_id: i64,
    pub model: String,
    /// Model name for the pricing row (the client-visible one)
    pub pricing: Pricing,
}

pub struct MeteringPipeline {
    store: Arc<dyn GatewayStore>,
}

impl MeteringPipeline {
    pub fn new(store: Arc<dyn GatewayStore>) -> Self {
        Self { store }
    }

    /// Pre-flight: the request must be billable before it runs
    pub async fn preflight(
        &self,
        user_id: i64,
        api_config_id: i64,
        model: &str,
    ) -> Result<Pricing> {
        let pricing = self
            .store
            .get_pricing(api_config_id, model)
            .await?
            .ok_or_else(|| GatewayError::PricingNotConfigured(model.to_string()))?;

        let quota = self
            .store
            .get_quota(user_id)
            .await?
            .ok_or_else(|| GatewayError::QuotaExceeded("no quota configured".to_string()))?;
        if quota.remaining() <= 0.0 {
            return Err(GatewayError::QuotaExceeded(format!(
                "used {:.4} of {:.4}",
                quota.used_quota, quota.total_quota
            )));
        }

        Ok(pricing)
    }

    /// Post-response settlement: cost, quota, log
    pub async fn settle(
        &self,
        ctx: &MeterContext,
        usage: UsageInfo,
        status_code: u16,
        response_time_ms: u64,
        error_msg: Option<String>,
    ) {
        let mut tokens_used = 0;

        if status_code < 400 {
            let cost = ctx
                .pricing
                .cost(usage.prompt_tokens, usage.completion_tokens);
            tokens_used = usage.total_tokens;

            if let Err(e) = self.store.deduct_quota(ctx.user_id, cost).await {
                // The upstream already charged; nothing to retry or reverse
                tracing::error!(
                    "CRITICAL: quota deduction of {:.6} {} failed for user {} after \
                     successful upstream call: {}",
                    cost,
                    ctx.pricing.currency,
                    ctx.user_id,
                    e
                );
            }
        }

        let entry = RequestLogEntry {
            user_id: ctx.user_id,
            api_key_id: ctx.api_key_id,
            api_config_id: Some(ctx.api_config_id),
            model: ctx.model.clone(),
            status_code,
            response_time_ms,
            tokens_used,
            error_msg,
        };
        if let Err(e) = self.store.insert_request_log(&entry).await {
            tracing::error!("Failed to write request log: {}", e);
        }
    }

    /// Log a request that never reached settlement (pre-flight failure or
    /// cache hit)
    pub async fn log_unsettled(
        &self,
        user_id: i64,
        api_key_id: i64,
        api_config_id: Option<i64>,
        model: &str,
        status_code: u16,
        response_time_ms: u64,
        error_msg: Option<String>,
    ) {
        let entry = RequestLogEntry {
            user_id,
            api_key_id,
            api_config_id,
            model: model.to_string(),
            status_code,
            response_time_ms,
            tokens_used: 0,
            error_msg,
        };
        if let Err(e) = self.store.insert_request_log(&entry).await {
            tracing::error!("Failed to write request log: {}", e);
        }
    }
}
