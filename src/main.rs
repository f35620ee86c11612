use std::sync::Arc;
#[cfg(feature = "postgres-store")]
use std::time::Duration;

use actix_cors::Cors;
use actix_web::{http::header, middleware::Compress, App, HttpServer};
use anyhow::Context;
use tracing::{info, warn, Level};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::EnvFilter;
use utoipa::OpenApi; // bring trait into scope for ApiDoc::openapi()
use utoipa_swagger_ui::SwaggerUi;

use quill::openapi::ApiDoc;
use quill::repo::Repo;
use quill::{routes, telemetry, AppState, SecurityHeaders, Settings};

#[cfg(feature = "postgres-store")]
async fn build_repo(settings: &Settings) -> anyhow::Result<Arc<dyn Repo>> {
    use quill::repo::pg::PgRepo;
    use sqlx::postgres::PgPoolOptions;

    let url = settings
        .database_url
        .as_deref()
        .context("DATABASE_URL must be set for postgres-store")?;
    let pool = PgPoolOptions::new()
        .max_connections(settings.db_max_connections)
        .acquire_timeout(Duration::from_secs(5))
        .connect_lazy(url)
        .context("invalid DATABASE_URL")?;
    let repo = PgRepo::new(pool);
    tokio::time::timeout(Duration::from_secs(30), repo.migrate())
        .await
        .context("database did not answer within 30s")?
        .context("migrations failed")?;
    info!(max_connections = settings.db_max_connections, "using Postgres repository backend");
    Ok(Arc::new(repo))
}

#[cfg(all(feature = "inmem-store", not(feature = "postgres-store")))]
async fn build_repo(settings: &Settings) -> anyhow::Result<Arc<dyn Repo>> {
    use quill::repo::inmem::InMemRepo;

    let repo = match &settings.data_dir {
        Some(dir) => {
            info!(dir = %dir.display(), "using in-memory repository with snapshots");
            InMemRepo::with_snapshot_dir(dir).context("cannot load in-memory snapshot")?
        }
        None => {
            info!("using ephemeral in-memory repository");
            InMemRepo::new()
        }
    };
    Ok(Arc::new(repo))
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Load .env automatically only in debug builds.
    if cfg!(debug_assertions) {
        let _ = dotenv::dotenv();
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    let settings = Settings::from_env()?;
    info!(bind = %settings.bind, frontend = %settings.frontend_url, "bootstrapping quill");

    let metrics = match telemetry::install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!(error = %e, "metrics recorder unavailable, /metrics disabled");
            None
        }
    };

    let repo = build_repo(&settings).await?;
    let mut state = AppState::new(repo);
    if let Some(handle) = metrics {
        state = state.with_metrics(handle);
    }

    let openapi = ApiDoc::openapi();
    let swagger = settings.swagger;
    let frontend = settings.frontend_url.clone();
    let security = SecurityHeaders::new(settings.enable_hsts);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allowed_origin(&frontend)
            .allowed_methods(["GET", "POST", "PATCH", "DELETE", "OPTIONS"])
            .allowed_headers([header::AUTHORIZATION, header::CONTENT_TYPE, header::ACCEPT])
            .supports_credentials()
            .max_age(3600);

        let mut app = App::new()
            .wrap(TracingLogger::default())
            .wrap(Compress::default())
            .wrap(security)
            .wrap(cors)
            .app_data(actix_web::web::Data::new(state.clone()));
        if swagger {
            app = app.service(SwaggerUi::new("/docs/{_:.*}").url("/docs/openapi.json", openapi.clone()));
        }
        app.configure(routes::config)
    })
    .bind(settings.bind)
    .with_context(|| format!("cannot bind {}", settings.bind))?;

    info!("listening on http://{}", settings.bind);
    server.run().await?;
    Ok(())
}
