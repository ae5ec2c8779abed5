// Library exports for the api binary and tests
pub mod config;
pub mod db;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod services;

use std::sync::Arc;

use sqlx::PgPool;

use crate::config::Config;
use crate::db::handle::TenantPools;
use crate::services::sync::SyncDispatcher;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Catalog pool (public schema). Tenant queries use `tenants` handles.
    pub db: PgPool,
    pub redis: redis::aio::MultiplexedConnection,
    pub config: Arc<Config>,
    pub tenants: Arc<TenantPools>,
    pub dispatcher: Arc<dyn SyncDispatcher>,
}
