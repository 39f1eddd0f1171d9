//! Pipeline assembly and lifecycle

use crate::broker::BrokerClient;
use crate::dispatcher::MessageDispatcher;
use crate::error::{PipelineError, PipelineResult};
use crate::gate::AnalysisGate;
use crate::prediction::PredictionEngine;
use crate::registry::{effective_managers, BuildContext, ManagerRegistry, Managers};
use crate::router::EventRouter;
use scanflow_common::config::PipelineConfig;
use scanflow_common::queues::PREDICTION_REQUESTS;
use scanflow_common::EventBus;
use std::sync::Arc;
use tracing::info;

pub struct Pipeline {
    config: Arc<PipelineConfig>,
    managers: Managers,
    broker: Arc<BrokerClient>,
    dispatcher: Arc<MessageDispatcher>,
    gate: AnalysisGate,
    events: EventBus,
}

impl Pipeline {
    /// Build every manager with the shipped constructors
    pub async fn build(ctx: BuildContext) -> PipelineResult<Self> {
        Self::build_with(&ManagerRegistry::with_builtin(), ctx).await
    }

    pub async fn build_with(registry: &ManagerRegistry, ctx: BuildContext) -> PipelineResult<Self> {
        let specs = effective_managers(&ctx.config);
        let managers = registry.build(&ctx, &specs).await?;

        let broker = managers
            .broker()
            .ok_or_else(|| PipelineError::config("no broker manager configured"))?;

        let mut router = EventRouter::new(broker.clone());
        for handler in managers.handlers() {
            router.register_handler(handler);
        }
        info!(message_types = ?router.message_types(), "Router ready");

        let dispatcher = Arc::new(MessageDispatcher::new(
            Arc::new(router),
            ctx.events.clone(),
            ctx.config.pipeline.dead_letter_malformed,
        ));

        Ok(Self {
            config: ctx.config,
            managers,
            broker,
            dispatcher,
            gate: ctx.gate,
            events: ctx.events,
        })
    }

    /// Connect, declare every queue, and start the configured consumers
    ///
    /// Prediction requests are consumed behind the analysis gate.
    pub async fn start(&self) -> PipelineResult<()> {
        self.broker.connect().await?;
        for queue in self.broker.queues().all() {
            self.broker.declare_queue(&queue).await?;
        }

        for logical in &self.config.pipeline.consume {
            let gate = (logical == PREDICTION_REQUESTS).then(|| self.gate.clone());
            let queue = self.broker.queue(logical);
            self.broker
                .consume(&queue, self.dispatcher.clone(), gate)
                .await?;
        }
        info!(
            consumers = self.config.pipeline.consume.len(),
            prefix = self.broker.queues().prefix(),
            "Pipeline started"
        );
        Ok(())
    }

    /// Stop consuming (current messages finish) and close the broker
    pub async fn shutdown(&self) -> PipelineResult<()> {
        info!("Shutting down pipeline");
        self.broker.close().await?;
        Ok(())
    }

    pub fn broker(&self) -> &Arc<BrokerClient> {
        &self.broker
    }

    pub fn prediction_engine(&self) -> Option<Arc<PredictionEngine>> {
        self.managers.prediction_engine()
    }

    pub fn router(&self) -> &Arc<EventRouter> {
        self.dispatcher.router()
    }

    pub fn managers(&self) -> &Managers {
        &self.managers
    }

    pub fn gate(&self) -> &AnalysisGate {
        &self.gate
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }
}
