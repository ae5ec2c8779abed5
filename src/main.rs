use std::sync::Arc;
use std::time::Duration;

use axum::{
    http::{header, HeaderValue, Method},
    routing::{get, post, put},
    Router,
};
use tower_http::cors::{AllowHeaders, AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fieldserve_api::config::Config;
use fieldserve_api::db::{self, handle::TenantPools};
use fieldserve_api::services::sync::{HttpSyncDispatcher, SyncDispatcher};
use fieldserve_api::{middleware, routes, services, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Arc::new(Config::from_env()?);

    let pool = db::create_pool(&config.database_url).await?;
    db::run_migrations(&pool).await?;
    db::migrate_all_existing_tenants(&pool).await?;
    info!("Database connected and migrations applied");

    let redis_client = redis::Client::open(config.redis_url.as_str())?;
    let redis_conn = redis_client.get_multiplexed_async_connection().await?;
    info!("Redis connected");

    let tenants = Arc::new(TenantPools::new(
        config.database_url.clone(),
        config.tenant_pool_size,
    ));

    let dispatcher: Arc<dyn SyncDispatcher> = Arc::new(HttpSyncDispatcher::new(
        config.sync_endpoints(),
        Duration::from_secs(config.sync_dispatch_timeout_secs),
    )?);

    let state = AppState {
        db: pool.clone(),
        redis: redis_conn,
        config: config.clone(),
        tenants: tenants.clone(),
        dispatcher: dispatcher.clone(),
    };

    services::metrics::start(pool.clone(), tenants.clone());
    services::sync_worker::start(pool.clone(), tenants.clone(), dispatcher, config.clone());

    // Build CORS: allow the app base domain and its subdomains (tenant subdomains).
    // In development (localhost), all origins are allowed.
    let base_url = config.app_base_url.clone();
    let cors_origin = {
        let base = base_url.clone();
        AllowOrigin::predicate(move |origin: &HeaderValue, _| {
            let o = match origin.to_str() {
                Ok(s) => s,
                Err(_) => return false,
            };
            // Always allow localhost / 127.0.0.1 for local development
            if o.starts_with("http://localhost") || o.starts_with("http://127.0.0.1") {
                return true;
            }
            // Exact match of app_base_url
            if o == base {
                return true;
            }
            // Subdomain match: extract domain portion from base URL and allow *.domain
            if let Some(idx) = base.find("://") {
                let after_scheme = &base[idx + 3..];
                let domain = after_scheme.split('/').next().unwrap_or(after_scheme);
                let domain_clean = domain.split(':').next().unwrap_or(domain);
                if o.contains(&format!(".{domain_clean}")) {
                    return true;
                }
            }
            false
        })
    };

    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers(AllowHeaders::list([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            header::ACCEPT,
            header::HeaderName::from_static("x-tenant"),
            header::HeaderName::from_static("x-admin-key"),
        ]))
        .allow_origin(cors_origin);

    // Tenant-scoped surface: resolution middleware attaches the schema-bound
    // handle; everything else below is public or admin-key guarded.
    let tenant_routes = Router::new()
        .route("/company/info", get(routes::company::get_company_info))
        .route("/sync-errors", get(routes::sync_errors::list_sync_errors))
        .route("/sync-errors/requeue-stuck", post(routes::sync_errors::requeue_stuck))
        .route("/sync-errors/{id}", get(routes::sync_errors::get_sync_error))
        .route("/sync-errors/{id}/retry", post(routes::sync_errors::retry_sync_error))
        .route("/sync-errors/{id}/resolve", post(routes::sync_errors::resolve_sync_error))
        .route("/sync-errors/{id}/reopen", post(routes::sync_errors::reopen_sync_error))
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::tenant::resolve_tenant,
        ));

    let app = Router::new()
        .route("/health", get(routes::health::health_check))
        .route("/metrics", get(routes::metrics::metrics_handler))
        // Self-serve onboarding
        .route("/signup", post(routes::companies::signup))
        .route("/signup/check-slug", get(routes::companies::check_slug))
        // Company administration
        .route(
            "/admin/companies",
            get(routes::companies::list_companies).post(routes::companies::create_company),
        )
        .route(
            "/admin/companies/{slug}",
            put(routes::companies::update_company).delete(routes::companies::delete_company),
        )
        .route("/admin/cache/clear", post(routes::companies::clear_cache))
        .merge(tenant_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state);

    let addr = format!("{}:{}", config.host, config.port);
    info!("fieldserve API listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
