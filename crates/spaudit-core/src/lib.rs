#![warn(missing_docs)]

//! spaudit core subsystem: tenant discovery crawler, permission resolver, staged audit
//! pipeline with checkpointed resume, inventory storage

pub mod cache;
pub mod checkpoint;
pub mod config;
pub mod crawler;
pub mod error;
pub mod fixture;
pub mod gateway;
pub mod journal;
pub mod metrics;
pub mod model;
pub mod pipeline;
pub mod remote;
pub mod resolver;
pub mod stages;
pub mod store;

pub use cache::{CacheBackend, CacheConfig, CacheKey, MemoryCache, TypedCache};
pub use checkpoint::{CheckpointKind, CheckpointStore};
pub use config::{AuditConfig, CrawlConfig, PermissionConfig, RunConfig, StoreConfig};
pub use crawler::{CrawlReport, DiscoveryCrawler, SiteFilter};
pub use error::{
    CacheError, ConfigError, CrawlError, GatewayError, PipelineError, RemoteError, ResolveError,
    StageError, StoreError,
};
pub use fixture::{FixtureApi, FixtureTenant};
pub use gateway::ApiGateway;
pub use journal::JournalStore;
pub use metrics::MetricsCollector;
pub use pipeline::{Pipeline, RunContext, RunSummary, Stage};
pub use resolver::{InventoryIndex, PermissionResolver, Resolution, ResolveFailure};
pub use stages::{audit_pipeline, run_status, standard_stages};
pub use store::{InventoryStore, MemoryStore};
