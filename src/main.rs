//! Chimera agent process entry point
//!
//! One process runs one agent, selected on the command line. The process
//! loads configuration from the environment, initializes logging and
//! tracing, connects to the broker, wires the selected agent's
//! collaborators, and consumes until interrupted.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chimera::agents::{
    AgentKind, AnalysisAgent, DataRetrievalAgent, FactCheckAgent, FollowUpAgent, MarketDataSource,
    NarrativeAgent, QueryAgent, SyntheticMarketData,
};
use chimera::domain_types::epoch_millis;
use chimera::errors::ChimeraError;
use chimera::messaging::payloads::{MetricPoint, TimeRange};
use chimera::messaging::AgentRuntime;
use chimera::monitoring::{MetricSource, MonitoringAgent, MonitoringStateStore, NotificationDispatcher};
use chimera::session::SessionContextStore;
use chimera::storage::RedisStore;
use chimera::{AgentName, ChimeraConfig, HandlerRegistry, PrefetchCount};
use clap::Parser;
use tracing::info;

/// Cadence of the background correlation reaper.
const REAPER_INTERVAL: Duration = Duration::from_secs(600);

/// Correlation entries older than this are reaped.
const CORRELATION_MAX_AGE: Duration = Duration::from_secs(3600);

#[derive(Parser, Debug)]
#[command(name = "chimera", about = "Distributed multi-agent analytics platform")]
struct Cli {
    /// Which agent this process runs
    #[arg(long, value_enum)]
    agent: AgentKind,

    /// Handler concurrency (channel prefetch count)
    #[arg(long, default_value_t = 1)]
    prefetch: u16,
}

/// Polls a market-data source as monitoring observations.
struct MarketMetricSource {
    source: Arc<dyn MarketDataSource>,
    asset: String,
    metrics: Vec<String>,
}

#[async_trait]
impl MetricSource for MarketMetricSource {
    fn name(&self) -> &str {
        self.source.name()
    }

    async fn collect(&self) -> Result<Vec<MetricPoint>, ChimeraError> {
        let now = epoch_millis();
        let window = TimeRange {
            start_ms: now - 3_600_000,
            end_ms: now,
        };
        self.source.fetch(&self.asset, &self.metrics, &window).await
    }
}

async fn session_store(config: &ChimeraConfig) -> Result<Arc<SessionContextStore>> {
    let kv = RedisStore::connect(&config.kv).await?;
    Ok(Arc::new(SessionContextStore::with_default_ttl(Arc::new(kv))))
}

async fn build_registry(
    kind: AgentKind,
    runtime: &AgentRuntime,
    config: &ChimeraConfig,
) -> Result<HandlerRegistry> {
    let core = runtime.core();
    let registry = match kind {
        AgentKind::Query => {
            let sessions = session_store(config).await?;
            Arc::new(QueryAgent::new(core, sessions)).registry()
        }
        AgentKind::DataRetrieval => {
            Arc::new(DataRetrievalAgent::new(core, Arc::new(SyntheticMarketData))).registry()
        }
        AgentKind::Analysis => Arc::new(AnalysisAgent::new(core)).registry(),
        AgentKind::Narrative => Arc::new(NarrativeAgent::new(core, None)).registry(),
        AgentKind::FactCheck => {
            Arc::new(FactCheckAgent::new(core, Arc::new(SyntheticMarketData))).registry()
        }
        AgentKind::FollowUp => {
            let sessions = session_store(config).await?;
            Arc::new(FollowUpAgent::new(core, sessions)).registry()
        }
        AgentKind::Monitoring => {
            let kv = Arc::new(RedisStore::connect(&config.kv).await?);
            let state = Arc::new(MonitoringStateStore::new(kv));
            let dispatcher = Arc::new(NotificationDispatcher::new());
            let agent = Arc::new(MonitoringAgent::new(core, state, dispatcher));
            let loaded = agent.load_rules().await?;
            info!(rules = loaded, "monitoring agent ready");
            agent.start_polling(
                Arc::new(MarketMetricSource {
                    source: Arc::new(SyntheticMarketData),
                    asset: "ZEC".to_string(),
                    metrics: vec!["price".to_string(), "volume".to_string()],
                }),
                Duration::from_secs(60),
            );
            agent.start_maintenance();
            agent.registry()
        }
    };
    Ok(registry)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = ChimeraConfig::from_env()?;
    let agent_name = cli.agent.agent_name();

    chimera::logging::init_observability(agent_name, &config)?;
    info!(agent = agent_name, "starting chimera agent");

    let name = AgentName::try_new(agent_name)?;
    let prefetch = PrefetchCount::try_new(cli.prefetch)?;
    let runtime = AgentRuntime::connect(&config, name, prefetch).await?;

    // Long-lived agents reap abandoned correlation entries on a fixed
    // cadence; the manual cleanup API stays authoritative
    let reaper_core = runtime.core();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(REAPER_INTERVAL);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            reaper_core.cleanup_old_correlations(CORRELATION_MAX_AGE);
        }
    });

    let registry = build_registry(cli.agent, &runtime, &config).await?;

    let shutdown = runtime.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            shutdown.shutdown();
        }
    });

    runtime.run(registry).await?;
    runtime.close().await;
    chimera::telemetry::shutdown_tracer();
    info!(agent = agent_name, "chimera agent stopped");
    Ok(())
}
