//! The specialized agents built on the messaging core
//!
//! Each agent is a struct owning its collaborators plus a
//! [`HandlerRegistry`](crate::messaging::registry::HandlerRegistry)
//! mapping the routing keys it consumes to typed handlers. Domain logic
//! here is deliberately thin; the interesting machinery lives in
//! `messaging`, `resilience`, and `monitoring`.

pub mod analysis;
pub mod data_retrieval;
pub mod fact_check;
pub mod follow_up;
pub mod narrative;
pub mod query;

pub use analysis::AnalysisAgent;
pub use data_retrieval::{DataRetrievalAgent, MarketDataSource, SyntheticMarketData};
pub use fact_check::FactCheckAgent;
pub use follow_up::FollowUpAgent;
pub use narrative::{LlmClient, NarrativeAgent};
pub use query::QueryAgent;

/// Which agent a process runs, selected on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum AgentKind {
    Query,
    DataRetrieval,
    Analysis,
    Narrative,
    FactCheck,
    FollowUp,
    Monitoring,
}

impl AgentKind {
    /// The agent's bus identity (and queue name).
    #[must_use]
    pub fn agent_name(&self) -> &'static str {
        match self {
            Self::Query => "query",
            Self::DataRetrieval => "data_retrieval",
            Self::Analysis => "analysis",
            Self::Narrative => "narrative",
            Self::FactCheck => "fact_checker",
            Self::FollowUp => "follow_up",
            Self::Monitoring => "monitoring",
        }
    }
}
