//! Manager registry
//!
//! Builds the pipeline's long-lived components from a declarative graph:
//!
//! ```toml
//! [managers.prediction_handler]
//! implementation = "prediction_handler"
//! dependencies = ["broker", "prediction_engine", "storage"]
//! ```
//!
//! `implementation` is a key into a table of constructor functions compiled
//! into the binary. The whole graph is checked before anything is built:
//! every implementation key must exist, every dependency must name another
//! manager, and there must be no cycles. Each manager is then built exactly
//! once, dependencies first. The resulting set is immutable.

use crate::broker::{BrokerClient, InMemoryTransport, ReconnectPolicy, Transport};
use crate::error::{PipelineError, PipelineResult};
use crate::gate::AnalysisGate;
use crate::handlers::{
    FeedbackHandler, OcrCompletedHandler, OcrFailedHandler, OcrRequestHandler, PredictionHandler,
    PredictionResultHandler, StageHandler, TrainingCompletedHandler, TrainingFailedHandler,
    TrainingTrigger,
};
use crate::prediction::rules::KeywordRules;
use crate::prediction::{EngineSettings, PredictionEngine};
use crate::services::{EmbeddingProvider, HttpEmbeddingClient, OcrEngine, TesseractOcr};
use crate::storage::{init_database_pool, SqliteStorage, Storage};
use futures::future::BoxFuture;
use scanflow_common::config::{BrokerBackend, ManagerSpec, PipelineConfig};
use scanflow_common::{EventBus, Notifier, QueueNames};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Everything a constructor may need besides its dependencies
pub struct BuildContext {
    pub config: Arc<PipelineConfig>,
    pub root_folder: PathBuf,
    pub events: EventBus,
    pub gate: AnalysisGate,
    /// Use this transport instead of the configured backend
    pub transport: Option<Arc<dyn Transport>>,
}

impl BuildContext {
    pub fn new(config: Arc<PipelineConfig>, root_folder: PathBuf, events: EventBus) -> Self {
        Self {
            config,
            root_folder,
            events,
            gate: AnalysisGate::new(),
            transport: None,
        }
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    fn notifier(&self) -> Arc<dyn Notifier> {
        Arc::new(self.events.clone())
    }
}

/// A constructed manager
#[derive(Clone)]
pub enum Manager {
    Broker(Arc<BrokerClient>),
    Storage(Arc<dyn Storage>),
    Embedding(Arc<dyn EmbeddingProvider>),
    Ocr(Arc<dyn OcrEngine>),
    Prediction(Arc<PredictionEngine>),
    TrainingTrigger(Arc<TrainingTrigger>),
    Handler(Arc<dyn StageHandler>),
}

impl Manager {
    pub fn kind(&self) -> &'static str {
        match self {
            Manager::Broker(_) => "broker",
            Manager::Storage(_) => "storage",
            Manager::Embedding(_) => "embedding provider",
            Manager::Ocr(_) => "OCR engine",
            Manager::Prediction(_) => "prediction engine",
            Manager::TrainingTrigger(_) => "training trigger",
            Manager::Handler(_) => "stage handler",
        }
    }
}

/// The already-built dependencies of one manager, in declaration order
pub struct Dependencies {
    owner: String,
    entries: Vec<(String, Manager)>,
}

macro_rules! dependency_accessors {
    ($($optional:ident, $required:ident, $variant:ident, $ty:ty, $label:expr;)*) => {
        $(
            pub fn $optional(&self) -> Option<$ty> {
                self.entries.iter().find_map(|(_, manager)| match manager {
                    Manager::$variant(inner) => Some(inner.clone()),
                    _ => None,
                })
            }

            pub fn $required(&self) -> PipelineResult<$ty> {
                self.$optional().ok_or_else(|| self.missing($label))
            }
        )*
    };
}

impl Dependencies {
    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|(name, _)| name.as_str()).collect()
    }

    fn missing(&self, what: &str) -> PipelineError {
        PipelineError::config(format!(
            "Manager '{}' requires a {} dependency",
            self.owner, what
        ))
    }

    dependency_accessors! {
        broker_opt, broker, Broker, Arc<BrokerClient>, "broker";
        storage_opt, storage, Storage, Arc<dyn Storage>, "storage";
        embedding_opt, embedding, Embedding, Arc<dyn EmbeddingProvider>, "embedding";
        ocr_opt, ocr, Ocr, Arc<dyn OcrEngine>, "OCR";
        prediction_opt, prediction, Prediction, Arc<PredictionEngine>, "prediction engine";
        trigger_opt, trigger, TrainingTrigger, Arc<TrainingTrigger>, "training trigger";
    }
}

pub type Constructor = for<'a> fn(
    &'a BuildContext,
    &'a Dependencies,
    &'a ManagerSpec,
) -> BoxFuture<'a, PipelineResult<Manager>>;

pub struct ManagerRegistry {
    constructors: HashMap<String, Constructor>,
}

impl Default for ManagerRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

impl ManagerRegistry {
    /// Registry with no constructors
    pub fn new() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// Registry with every shipped implementation key
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register("broker", build_broker);
        registry.register("sqlite_storage", build_sqlite_storage);
        registry.register("http_embedding", build_http_embedding);
        registry.register("tesseract_ocr", build_tesseract_ocr);
        registry.register("prediction_engine", build_prediction_engine);
        registry.register("training_trigger", build_training_trigger);
        registry.register("ocr_request_handler", build_ocr_request_handler);
        registry.register("ocr_completed_handler", build_ocr_completed_handler);
        registry.register("ocr_failed_handler", build_ocr_failed_handler);
        registry.register("prediction_handler", build_prediction_handler);
        registry.register("prediction_result_handler", build_prediction_result_handler);
        registry.register("feedback_handler", build_feedback_handler);
        registry.register("training_completed_handler", build_training_completed_handler);
        registry.register("training_failed_handler", build_training_failed_handler);
        registry
    }

    pub fn register(&mut self, implementation: impl Into<String>, constructor: Constructor) {
        self.constructors.insert(implementation.into(), constructor);
    }

    pub fn implementations(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.constructors.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Build order for `specs`: dependencies before dependents
    ///
    /// Fails on an unknown implementation key, an unknown dependency, or a
    /// dependency cycle (naming the chain, e.g. `a -> b -> a`).
    pub fn resolve_order(&self, specs: &BTreeMap<String, ManagerSpec>) -> PipelineResult<Vec<String>> {
        for (name, spec) in specs {
            if !self.constructors.contains_key(&spec.implementation) {
                return Err(PipelineError::config(format!(
                    "Manager '{}' has unknown implementation '{}'",
                    name, spec.implementation
                )));
            }
            if let Some(dep) = spec.dependencies.iter().find(|d| !specs.contains_key(*d)) {
                return Err(PipelineError::config(format!(
                    "Manager '{}' depends on unknown manager '{}'",
                    name, dep
                )));
            }
        }

        let mut order = Vec::with_capacity(specs.len());
        let mut done = HashSet::new();
        let mut visiting = Vec::new();
        for name in specs.keys() {
            visit(name, specs, &mut visiting, &mut done, &mut order)?;
        }
        Ok(order)
    }

    /// Build every manager in `specs`
    pub async fn build(
        &self,
        ctx: &BuildContext,
        specs: &BTreeMap<String, ManagerSpec>,
    ) -> PipelineResult<Managers> {
        let order = self.resolve_order(specs)?;
        let mut instances: BTreeMap<String, Manager> = BTreeMap::new();

        for name in &order {
            let spec = &specs[name];
            let constructor = self.constructors[&spec.implementation];
            let dependencies = Dependencies {
                owner: name.clone(),
                entries: spec
                    .dependencies
                    .iter()
                    .filter_map(|dep| instances.get(dep).map(|m| (dep.clone(), m.clone())))
                    .collect(),
            };

            let manager = constructor(ctx, &dependencies, spec).await?;
            info!(
                manager = %name,
                implementation = %spec.implementation,
                kind = manager.kind(),
                "Manager built"
            );
            instances.insert(name.clone(), manager);
        }

        Ok(Managers { order, instances })
    }
}

fn visit(
    name: &str,
    specs: &BTreeMap<String, ManagerSpec>,
    visiting: &mut Vec<String>,
    done: &mut HashSet<String>,
    order: &mut Vec<String>,
) -> PipelineResult<()> {
    if done.contains(name) {
        return Ok(());
    }
    if let Some(start) = visiting.iter().position(|n| n == name) {
        let mut chain: Vec<&str> = visiting[start..].iter().map(String::as_str).collect();
        chain.push(name);
        return Err(PipelineError::config(format!(
            "Dependency cycle detected: {}",
            chain.join(" -> ")
        )));
    }

    visiting.push(name.to_string());
    for dep in &specs[name].dependencies {
        visit(dep, specs, visiting, done, order)?;
    }
    visiting.pop();

    done.insert(name.to_string());
    order.push(name.to_string());
    Ok(())
}

/// Built managers, keyed by name
pub struct Managers {
    order: Vec<String>,
    instances: BTreeMap<String, Manager>,
}

impl Managers {
    pub fn get(&self, name: &str) -> Option<&Manager> {
        self.instances.get(name)
    }

    /// Manager names in build order
    pub fn build_order(&self) -> &[String] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Stage handlers in build order
    pub fn handlers(&self) -> Vec<Arc<dyn StageHandler>> {
        self.in_order(|m| match m {
            Manager::Handler(h) => Some(h.clone()),
            _ => None,
        })
    }

    pub fn broker(&self) -> Option<Arc<BrokerClient>> {
        self.in_order(|m| match m {
            Manager::Broker(b) => Some(b.clone()),
            _ => None,
        })
        .into_iter()
        .next()
    }

    pub fn prediction_engine(&self) -> Option<Arc<PredictionEngine>> {
        self.in_order(|m| match m {
            Manager::Prediction(p) => Some(p.clone()),
            _ => None,
        })
        .into_iter()
        .next()
    }

    fn in_order<T>(&self, pick: impl Fn(&Manager) -> Option<T>) -> Vec<T> {
        self.order
            .iter()
            .filter_map(|name| self.instances.get(name))
            .filter_map(pick)
            .collect()
    }
}

/// The graph used when the configuration has no `[managers]` section
pub fn default_managers() -> BTreeMap<String, ManagerSpec> {
    [
        ("broker", ManagerSpec::new("broker", &[])),
        ("storage", ManagerSpec::new("sqlite_storage", &[])),
        ("embedding", ManagerSpec::new("http_embedding", &[])),
        ("ocr", ManagerSpec::new("tesseract_ocr", &[])),
        ("prediction_engine", ManagerSpec::new("prediction_engine", &["embedding"])),
        ("training_trigger", ManagerSpec::new("training_trigger", &["broker"])),
        (
            "ocr_request_handler",
            ManagerSpec::new("ocr_request_handler", &["broker", "ocr"]),
        ),
        (
            "ocr_completed_handler",
            ManagerSpec::new("ocr_completed_handler", &["broker"]),
        ),
        ("ocr_failed_handler", ManagerSpec::new("ocr_failed_handler", &["storage"])),
        (
            "prediction_handler",
            ManagerSpec::new("prediction_handler", &["broker", "prediction_engine", "storage"]),
        ),
        (
            "prediction_result_handler",
            ManagerSpec::new("prediction_result_handler", &["storage"]),
        ),
        (
            "feedback_handler",
            ManagerSpec::new("feedback_handler", &["broker", "storage", "training_trigger"]),
        ),
        (
            "training_completed_handler",
            ManagerSpec::new("training_completed_handler", &["prediction_engine", "storage"]),
        ),
        (
            "training_failed_handler",
            ManagerSpec::new("training_failed_handler", &["storage"]),
        ),
    ]
    .into_iter()
    .map(|(name, spec)| (name.to_string(), spec))
    .collect()
}

/// The configured graph, or the default one when none is configured
pub fn effective_managers(config: &PipelineConfig) -> BTreeMap<String, ManagerSpec> {
    if config.managers.is_empty() {
        default_managers()
    } else {
        config.managers.clone()
    }
}

fn param_bool(spec: &ManagerSpec, key: &str) -> PipelineResult<Option<bool>> {
    match spec.parameters.get(key) {
        None => Ok(None),
        Some(toml::Value::Boolean(b)) => Ok(Some(*b)),
        Some(other) => Err(PipelineError::config(format!(
            "parameter '{}' must be a boolean, got {}",
            key, other
        ))),
    }
}

fn param_usize(spec: &ManagerSpec, key: &str) -> PipelineResult<Option<usize>> {
    match spec.parameters.get(key) {
        None => Ok(None),
        Some(toml::Value::Integer(i)) if *i >= 0 => Ok(Some(*i as usize)),
        Some(other) => Err(PipelineError::config(format!(
            "parameter '{}' must be a non-negative integer, got {}",
            key, other
        ))),
    }
}

fn param_str<'a>(spec: &'a ManagerSpec, key: &str) -> PipelineResult<Option<&'a str>> {
    match spec.parameters.get(key) {
        None => Ok(None),
        Some(toml::Value::String(s)) => Ok(Some(s.as_str())),
        Some(other) => Err(PipelineError::config(format!(
            "parameter '{}' must be a string, got {}",
            key, other
        ))),
    }
}

fn configured_transport(ctx: &BuildContext) -> PipelineResult<Arc<dyn Transport>> {
    if let Some(transport) = &ctx.transport {
        return Ok(transport.clone());
    }
    match ctx.config.broker.backend {
        BrokerBackend::Memory => Ok(Arc::new(InMemoryTransport::new())),
        BrokerBackend::Amqp => amqp_transport(&ctx.config.broker.uri),
    }
}

#[cfg(feature = "amqp")]
fn amqp_transport(uri: &str) -> PipelineResult<Arc<dyn Transport>> {
    Ok(Arc::new(crate::broker::amqp::AmqpTransport::new(uri)))
}

#[cfg(not(feature = "amqp"))]
fn amqp_transport(_uri: &str) -> PipelineResult<Arc<dyn Transport>> {
    Err(PipelineError::config(
        "broker.backend = \"amqp\" but this build has no AMQP support",
    ))
}

fn build_broker<'a>(
    ctx: &'a BuildContext,
    _deps: &'a Dependencies,
    _spec: &'a ManagerSpec,
) -> BoxFuture<'a, PipelineResult<Manager>> {
    Box::pin(async move {
        let broker = &ctx.config.broker;
        let client = BrokerClient::new(
            configured_transport(ctx)?,
            QueueNames::new(broker.queue_prefix.clone()),
            ReconnectPolicy::from_config(&broker.reconnect),
            ctx.events.clone(),
        );
        Ok(Manager::Broker(Arc::new(client)))
    })
}

fn build_sqlite_storage<'a>(
    ctx: &'a BuildContext,
    _deps: &'a Dependencies,
    spec: &'a ManagerSpec,
) -> BoxFuture<'a, PipelineResult<Manager>> {
    Box::pin(async move {
        let path = match param_str(spec, "path")? {
            Some(path) => ctx.root_folder.join(path),
            None => ctx.config.database_path(&ctx.root_folder),
        };
        info!(path = %path.display(), "Opening database");
        let pool = init_database_pool(&path, &ctx.config.database)
            .await
            .map_err(|e| PipelineError::config(format!("database {}: {}", path.display(), e)))?;
        let storage = SqliteStorage::new(pool)
            .await
            .map_err(|e| PipelineError::config(format!("database {}: {}", path.display(), e)))?;
        Ok(Manager::Storage(Arc::new(storage)))
    })
}

fn build_http_embedding<'a>(
    ctx: &'a BuildContext,
    _deps: &'a Dependencies,
    _spec: &'a ManagerSpec,
) -> BoxFuture<'a, PipelineResult<Manager>> {
    Box::pin(async move {
        let client = HttpEmbeddingClient::new(
            &ctx.config.embedding,
            ctx.config.embedding_path(&ctx.root_folder),
        )
        .map_err(|e| PipelineError::config(e.to_string()))?;
        debug!(endpoint = client.endpoint(), "Embedding client ready");
        Ok(Manager::Embedding(Arc::new(client)))
    })
}

fn build_tesseract_ocr<'a>(
    ctx: &'a BuildContext,
    _deps: &'a Dependencies,
    _spec: &'a ManagerSpec,
) -> BoxFuture<'a, PipelineResult<Manager>> {
    Box::pin(async move { Ok(Manager::Ocr(Arc::new(TesseractOcr::new(&ctx.config.ocr)))) })
}

fn build_prediction_engine<'a>(
    ctx: &'a BuildContext,
    deps: &'a Dependencies,
    spec: &'a ManagerSpec,
) -> BoxFuture<'a, PipelineResult<Manager>> {
    Box::pin(async move {
        let prediction = &ctx.config.prediction;
        let use_ml_model = param_bool(spec, "use_ml_model")?.unwrap_or(prediction.use_ml_model);
        let engine = PredictionEngine::new(
            KeywordRules::from_config(&prediction.rules),
            deps.embedding_opt(),
            EngineSettings {
                use_ml_model,
                embedding_path: ctx.config.embedding_path(&ctx.root_folder),
                document_types_path: ctx.config.document_types_path(&ctx.root_folder),
            },
        )
        .with_events(ctx.events.clone());

        let status = engine.initialize().await;
        info!(status = ?status, "Prediction engine initialized");
        Ok(Manager::Prediction(Arc::new(engine)))
    })
}

fn build_training_trigger<'a>(
    ctx: &'a BuildContext,
    deps: &'a Dependencies,
    spec: &'a ManagerSpec,
) -> BoxFuture<'a, PipelineResult<Manager>> {
    Box::pin(async move {
        let training = &ctx.config.training;
        let batch_size =
            param_usize(spec, "retrain_batch_size")?.unwrap_or(training.retrain_batch_size);
        let trigger = TrainingTrigger::new(
            deps.broker()?,
            ctx.gate.clone(),
            batch_size,
            training.pause_timeout(),
        );
        Ok(Manager::TrainingTrigger(Arc::new(trigger)))
    })
}

fn build_ocr_request_handler<'a>(
    _ctx: &'a BuildContext,
    deps: &'a Dependencies,
    _spec: &'a ManagerSpec,
) -> BoxFuture<'a, PipelineResult<Manager>> {
    Box::pin(async move {
        let handler = OcrRequestHandler::new(deps.broker()?, deps.ocr()?);
        Ok(Manager::Handler(Arc::new(handler)))
    })
}

fn build_ocr_completed_handler<'a>(
    _ctx: &'a BuildContext,
    deps: &'a Dependencies,
    _spec: &'a ManagerSpec,
) -> BoxFuture<'a, PipelineResult<Manager>> {
    Box::pin(async move {
        let handler = OcrCompletedHandler::new(deps.broker()?);
        Ok(Manager::Handler(Arc::new(handler)))
    })
}

fn build_ocr_failed_handler<'a>(
    ctx: &'a BuildContext,
    deps: &'a Dependencies,
    _spec: &'a ManagerSpec,
) -> BoxFuture<'a, PipelineResult<Manager>> {
    Box::pin(async move {
        let handler = OcrFailedHandler::new(deps.storage_opt(), ctx.notifier());
        Ok(Manager::Handler(Arc::new(handler)))
    })
}

fn build_prediction_handler<'a>(
    _ctx: &'a BuildContext,
    deps: &'a Dependencies,
    _spec: &'a ManagerSpec,
) -> BoxFuture<'a, PipelineResult<Manager>> {
    Box::pin(async move {
        let engine = deps.prediction()?;
        let storage = deps.storage_opt();
        if let Some(storage) = &storage {
            if let Err(e) = storage.add_document_types(&engine.document_types()).await {
                warn!(error = %e, "Could not seed document types");
            }
        }
        let handler = PredictionHandler::new(deps.broker()?, engine, storage);
        Ok(Manager::Handler(Arc::new(handler)))
    })
}

fn build_prediction_result_handler<'a>(
    _ctx: &'a BuildContext,
    deps: &'a Dependencies,
    _spec: &'a ManagerSpec,
) -> BoxFuture<'a, PipelineResult<Manager>> {
    Box::pin(async move {
        let handler = PredictionResultHandler::new(deps.storage()?);
        Ok(Manager::Handler(Arc::new(handler)))
    })
}

fn build_feedback_handler<'a>(
    _ctx: &'a BuildContext,
    deps: &'a Dependencies,
    _spec: &'a ManagerSpec,
) -> BoxFuture<'a, PipelineResult<Manager>> {
    Box::pin(async move {
        let handler = FeedbackHandler::new(deps.broker()?, deps.storage()?, deps.trigger_opt());
        Ok(Manager::Handler(Arc::new(handler)))
    })
}

fn build_training_completed_handler<'a>(
    ctx: &'a BuildContext,
    deps: &'a Dependencies,
    _spec: &'a ManagerSpec,
) -> BoxFuture<'a, PipelineResult<Manager>> {
    Box::pin(async move {
        let handler = TrainingCompletedHandler::new(
            deps.prediction()?,
            deps.storage_opt(),
            ctx.gate.clone(),
            ctx.notifier(),
        );
        Ok(Manager::Handler(Arc::new(handler)))
    })
}

fn build_training_failed_handler<'a>(
    ctx: &'a BuildContext,
    deps: &'a Dependencies,
    _spec: &'a ManagerSpec,
) -> BoxFuture<'a, PipelineResult<Manager>> {
    Box::pin(async move {
        let handler =
            TrainingFailedHandler::new(deps.storage_opt(), ctx.gate.clone(), ctx.notifier());
        Ok(Manager::Handler(Arc::new(handler)))
    })
}
