//! Runtime context
//!
//! Owns every long-lived component. Built once with `Runtime::create`, passed
//! to whoever needs it, and torn down with `Runtime::shutdown`.

use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

use crate::agent::reflection::PeriodicReflection;
use crate::agent::{
    Agent, AgentRegistry, CorrectionDetector, CorrectionStrategy, EventPublisher,
    KeywordCorrectionStrategy, LessonGenerator, LessonLedger, LessonPublisher, LessonSynthesizer,
    MessageHandler, ProcessOutputParser, ReflectionConfig, ReflectionSystem, Signer,
    SqliteLedger, TemplateSynthesizer, ToolExecutor, ToolRegistry,
};
use crate::config::Config;
use crate::conversation::{Author, ConversationError, ConversationStore};
use crate::locks::KeyedLocks;
use crate::router::{
    KeywordRoutingStrategy, PhaseRouter, RouterConfig, RoutingContext, RoutingDecision,
    RoutingError, RoutingStrategy,
};

/// External collaborators injected into the runtime
pub struct Collaborators {
    pub routing: Arc<dyn RoutingStrategy>,
    pub correction: Arc<dyn CorrectionStrategy>,
    pub synthesizer: Arc<dyn LessonSynthesizer>,
    pub publisher: Arc<dyn EventPublisher>,
    pub signer: Arc<dyn Signer>,
    /// Defaults to a `SqliteLedger` at `Config::ledger_path`
    pub ledger: Option<Arc<dyn LessonLedger>>,
    pub tools: ToolRegistry,
}

impl Collaborators {
    /// Deterministic built-in strategies around the given transport
    pub fn new(publisher: Arc<dyn EventPublisher>, signer: Arc<dyn Signer>) -> Self {
        Self {
            routing: Arc::new(KeywordRoutingStrategy::new()),
            correction: Arc::new(KeywordCorrectionStrategy::new()),
            synthesizer: Arc::new(TemplateSynthesizer),
            publisher,
            signer,
            ledger: None,
            tools: ToolRegistry::new(),
        }
    }

    pub fn with_routing(mut self, routing: Arc<dyn RoutingStrategy>) -> Self {
        self.routing = routing;
        self
    }

    pub fn with_correction(mut self, correction: Arc<dyn CorrectionStrategy>) -> Self {
        self.correction = correction;
        self
    }

    pub fn with_synthesizer(mut self, synthesizer: Arc<dyn LessonSynthesizer>) -> Self {
        self.synthesizer = synthesizer;
        self
    }

    pub fn with_ledger(mut self, ledger: Arc<dyn LessonLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TurnError {
    #[error(transparent)]
    Conversation(#[from] ConversationError),

    #[error(transparent)]
    Routing(#[from] RoutingError),
}

pub struct Runtime {
    config: Config,
    store: Arc<ConversationStore>,
    agents: RwLock<AgentRegistry>,
    router: PhaseRouter,
    reflection: Arc<ReflectionSystem>,
    tools: ToolExecutor,
    periodic: Option<PeriodicReflection>,
    turns: KeyedLocks,
}

impl Runtime {
    /// Build all components; starts periodic reflection when configured, which
    /// requires a Tokio runtime
    pub fn create(config: Config, collaborators: Collaborators) -> anyhow::Result<Self> {
        let store = Arc::new(ConversationStore::new());

        let ledger: Arc<dyn LessonLedger> = match collaborators.ledger {
            Some(ledger) => ledger,
            None => Arc::new(SqliteLedger::open(&config.ledger_path)?),
        };

        let reflection_config = ReflectionConfig::from(&config);
        let reflection = Arc::new(ReflectionSystem::new(
            Arc::clone(&store),
            CorrectionDetector::new(collaborators.correction, reflection_config.detector.clone()),
            LessonGenerator::new(collaborators.synthesizer, reflection_config.synthesis_timeout),
            LessonPublisher::new(
                ledger,
                collaborators.publisher,
                collaborators.signer,
                reflection_config.publish_timeout,
            ),
        ));

        let router = PhaseRouter::with_config(
            collaborators.routing,
            RouterConfig {
                reasoning_timeout: config.reasoning_timeout,
                ..RouterConfig::default()
            },
        );

        let tools = ToolExecutor::new(Arc::new(collaborators.tools), config.tool_timeout);

        let periodic = config
            .periodic_reflection_interval
            .map(|interval| Arc::clone(&reflection).spawn_periodic(interval));

        info!(
            "Runtime ready (ledger: {}, {} tools)",
            config.ledger_path.display(),
            tools.registry().len()
        );

        Ok(Self {
            config,
            store,
            agents: RwLock::new(AgentRegistry::new()),
            router,
            reflection,
            tools,
            periodic,
            turns: KeyedLocks::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<ConversationStore> {
        &self.store
    }

    pub fn router(&self) -> &PhaseRouter {
        &self.router
    }

    pub fn reflection(&self) -> &Arc<ReflectionSystem> {
        &self.reflection
    }

    pub fn tools(&self) -> &ToolExecutor {
        &self.tools
    }

    pub async fn register_agent(&self, agent: Agent) {
        info!("Registered agent {} ({})", agent.name, agent.pubkey);
        self.agents.write().await.register(agent);
    }

    /// Append an inbound message, route it, and apply the decision
    ///
    /// On routing failure the message stays in history but phase and agent
    /// are left untouched. Turns on one conversation run one at a time.
    pub async fn route_turn(
        &self,
        conversation_id: &str,
        author: Author,
        content: &str,
    ) -> Result<RoutingDecision, TurnError> {
        let _turn = self.turns.lock(conversation_id).await;
        self.store.append(conversation_id, author, content).await?;

        let conversation = self.store.snapshot(conversation_id).await?;
        let agents = self.agents.read().await.summaries();
        let context = RoutingContext::from_conversation(&conversation, content, agents, 10);

        let decision = self.router.decide(&context, conversation.history()).await?;
        self.store.apply_decision(conversation_id, &decision).await?;

        if decision.needs_confirmation(self.config.routing_confirm_threshold) {
            info!(
                "Routing for {} below confirmation threshold ({:.2})",
                conversation_id,
                decision.confidence()
            );
        }
        Ok(decision)
    }

    /// Fresh parser, optionally feeding `handler` through the configured queue
    pub fn parser(&self, handler: Option<Arc<dyn MessageHandler>>) -> ProcessOutputParser {
        match handler {
            Some(handler) => ProcessOutputParser::with_handler(handler, self.config.handler_queue_capacity),
            None => ProcessOutputParser::new(),
        }
    }

    /// Stop background tasks
    pub async fn shutdown(mut self) {
        if let Some(periodic) = self.periodic.take() {
            periodic.stop().await;
        }
        info!("Runtime shut down");
    }
}
