//! Fetch gateway + persistence for DealHub.
//!
//! The gateway routes document fetches across interchangeable providers with
//! quota tracking, per-provider spacing and a circuit breaker. The store
//! traits cover listings, price snapshots, watch targets and alert history,
//! with an in-memory backend and a Postgres backend.

pub mod gateway;
pub mod memory;
pub mod postgres;
pub mod providers;
pub mod store;

pub use gateway::{
    BreakerPolicy, CircuitState, FetchGateway, FetchOptions, FetchOutcome, FetchProvider,
    FetchedDocument, GatewayError, ProviderFetchError, ProviderSettings, ProviderStats,
    SpacingLimiter,
};
pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use providers::{
    ApifyActorProvider, BackoffPolicy, DirectHttpProvider, FixtureProvider, HttpClientConfig,
    QueryProxyProvider,
};
pub use store::{
    AlertStore, ListingStore, StoreError, TargetStore, UpsertOutcome, PRICE_EPSILON,
};

pub const CRATE_NAME: &str = "dealhub-storage";
