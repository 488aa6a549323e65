// Proxy orchestrator: one request's lifecycle
//
// Admitted -> Selected -> (pricing validated) -> Adapted -> Invoked ->
// Metered -> Logged -> Cached? -> Done. Pre-flight failures short-circuit to
// the log with no upstream call; upstream failures mark the credential and
// surface a 5xx. On streams the metering/log/cache steps move to the stream
// wrapper's terminal step.

use std::sync::Arc;
use std::time::Instant;

use crate::adapters::{build_adapter, ByteStream, UpstreamAdapter};
use crate::balancer::LoadBalancer;
use crate::cache::CacheEngine;
use crate::error::{GatewayError, Result};
use crate::ingress::StreamFormatter;
use crate::mapper::ModelMapper;
use crate::metering::{MeterContext, MeteringPipeline};
use crate::models::unified::{UnifiedRequest, UnifiedResponse, UsageInfo};
use crate::pool::AccountPoolManager;
use crate::runtime_config::RuntimeConfigManager;
use crate::store::entities::{ConfigType, RuntimeSettings};
use crate::store::GatewayStore;
use crate::streaming::{estimate_usage, wrap_stream, Finalizer, StreamOutcome};

#[derive(Debug, Clone, Copy)]
pub struct AuthContext {
    pub user_id: i64,
    pub api_key_id: i64,
}

pub struct Orchestrator {
    pub runtime: Arc<RuntimeConfigManager>,
    balancer: LoadBalancer,
    pools: Arc<AccountPoolManager>,
    cache: Arc<CacheEngine>,
    metering: Arc<MeteringPipeline>,
    mapper: Arc<ModelMapper>,
}

struct Prepared {
    adapter: Arc<dyn UpstreamAdapter>,
    meter: MeterContext,
    credential_id: Option<i64>,
    settings: Arc<RuntimeSettings>,
}

#[derive(Debug)]
pub struct CompletedResponse {
    pub response: UnifiedResponse,
    pub cached: bool,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn GatewayStore>,
        runtime: Arc<RuntimeConfigManager>,
        mapper: Arc<ModelMapper>,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            balancer: LoadBalancer::new(Arc::clone(&store)),
            pools: Arc::new(AccountPoolManager::new(Arc::clone(&store))?),
            cache: Arc::new(CacheEngine::new(Arc::clone(&store))?),
            metering: Arc::new(MeteringPipeline::new(store)),
            runtime,
            mapper,
        })
    }

    /// Admission through adapter construction; shared by both paths
    async fn prepare(&self, request: &UnifiedRequest, auth: AuthContext) -> Result<Prepared> {
        request.validate()?;
        let settings = self.runtime.current().await;

        let config = self
            .balancer
            .select_config(&request.model, settings.enable_load_balance)
            .await?;

        // Billing must be possible before anything is spent
        let pricing = self
            .metering
            .preflight(auth.user_id, config.id, &request.model)
            .await?;

        let credential = match config.config_type {
            ConfigType::AccountPool => {
                let pool_id = config.account_pool_id.ok_or_else(|| {
                    GatewayError::Validation(format!(
                        "config {} is pool-backed but has no pool id",
                        config.id
                    ))
                })?;
                Some(self.pools.select_credential(pool_id).await?)
            }
            ConfigType::Direct => None,
        };

        let adapter = build_adapter(&config, credential.as_ref(), Arc::clone(&self.mapper))?;

        Ok(Prepared {
            adapter,
            meter: MeterContext {
                user_id: auth.user_id,
                api_key_id: auth.api_key_id,
                api_config_id: config.id,
                model: request.model.clone(),
                pricing,
            },
            credential_id: credential.map(|c| c.id),
            settings,
        })
    }

    async fn log_preflight_failure(
        &self,
        auth: AuthContext,
        model: &str,
        started: Instant,
        err: &GatewayError,
    ) {
        self.metering
            .log_unsettled(
                auth.user_id,
                auth.api_key_id,
                None,
                model,
                err.status_code().as_u16(),
                started.elapsed().as_millis() as u64,
                Some(err.to_string()),
            )
            .await;
    }

    /// Non-streaming request lifecycle
    pub async fn execute(
        &self,
        request: UnifiedRequest,
        auth: AuthContext,
    ) -> Result<CompletedResponse> {
        let started = Instant::now();

        let prepared = match self.prepare(&request, auth).await {
            Ok(p) => p,
            Err(err) => {
                self.log_preflight_failure(auth, &request.model, started, &err)
                    .await;
                return Err(err);
            }
        };

        // Cache probe, non-stream only
        match self
            .cache
            .lookup(auth.user_id, &request, &prepared.settings)
            .await
        {
            Ok(Some(hit)) => {
                tracing::info!(
                    "Cache hit for model {}, {} tokens saved",
                    request.model,
                    hit.tokens_saved
                );
                self.metering
                    .log_unsettled(
                        auth.user_id,
                        auth.api_key_id,
                        Some(prepared.meter.api_config_id),
                        &request.model,
                        200,
                        started.elapsed().as_millis() as u64,
                        None,
                    )
                    .await;
                return Ok(CompletedResponse {
                    response: hit.response,
                    cached: true,
                });
            }
            Ok(None) => {}
            Err(e) => tracing::warn!("Cache lookup failed, continuing: {}", e),
        }

        let result = prepared.adapter.call(&request).await;

        if let Some(credential_id) = prepared.credential_id {
            self.pools
                .report_result(credential_id, result.is_ok())
                .await;
        }

        let response = match result {
            Ok(r) => r,
            Err(err) => {
                // The log carries the provider's status; the client sees a 5xx
                let status = match &err {
                    GatewayError::Upstream { status, .. } => *status,
                    other => other.status_code().as_u16(),
                };
                self.metering
                    .settle(
                        &prepared.meter,
                        UsageInfo::default(),
                        status,
                        started.elapsed().as_millis() as u64,
                        Some(err.to_string()),
                    )
                    .await;
                return Err(err);
            }
        };

        let usage = response
            .usage
            .unwrap_or_else(|| estimate_usage(request.messages.len()));
        self.metering
            .settle(
                &prepared.meter,
                usage,
                200,
                started.elapsed().as_millis() as u64,
                None,
            )
            .await;

        // Store runs detached; the response is already on its way out
        Arc::clone(&self.cache).store_async(
            auth.user_id,
            request,
            response.clone(),
            Arc::clone(&prepared.settings),
        );

        Ok(CompletedResponse {
            response,
            cached: false,
        })
    }

    /// Streaming request lifecycle; metering fires from the wrapper's
    /// terminal step
    pub async fn execute_stream(
        &self,
        request: UnifiedRequest,
        auth: AuthContext,
        formatter: Box<dyn StreamFormatter>,
    ) -> Result<ByteStream> {
        let started = Instant::now();

        let prepared = match self.prepare(&request, auth).await {
            Ok(p) => p,
            Err(err) => {
                self.log_preflight_failure(auth, &request.model, started, &err)
                    .await;
                return Err(err);
            }
        };

        let upstream = match prepared.adapter.call_stream(&request).await {
            Ok(s) => s,
            Err(err) => {
                if let Some(credential_id) = prepared.credential_id {
                    self.pools.report_result(credential_id, false).await;
                }
                let status = match &err {
                    GatewayError::Upstream { status, .. } => *status,
                    other => other.status_code().as_u16(),
                };
                self.metering
                    .settle(
                        &prepared.meter,
                        UsageInfo::default(),
                        status,
                        started.elapsed().as_millis() as u64,
                        Some(err.to_string()),
                    )
                    .await;
                return Err(err);
            }
        };

        let metering = Arc::clone(&self.metering);
        let meter_ctx = prepared.meter;
        let credential_id = prepared.credential_id;
        let pools = Arc::clone(&self.pools);
        let message_count = request.messages.len();

        let finalizer: Finalizer = Box::new(move |outcome: StreamOutcome| {
            Box::pin(async move {
                let status = if outcome.success { 200 } else { 499 };
                let error_msg = if outcome.success {
                    None
                } else {
                    Some("stream interrupted".to_string())
                };
                metering
                    .settle(
                        &meter_ctx,
                        outcome.usage,
                        status,
                        started.elapsed().as_millis() as u64,
                        error_msg,
                    )
                    .await;

                if let Some(credential_id) = credential_id {
                    pools.report_result(credential_id, outcome.success).await;
                }
            })
        });

        Ok(Box::pin(wrap_stream(
            upstream,
            formatter,
            message_count,
            finalizer,
        )))
    }
}
