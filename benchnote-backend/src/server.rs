use std::sync::Arc;

use anyhow::Context;
use axum::{Router, extract::DefaultBodyLimit, routing::get};
use camino::Utf8PathBuf;
use diesel_async::{
    AsyncPgConnection,
    async_connection_wrapper::AsyncConnectionWrapper,
    pooled_connection::{
        AsyncDieselConnectionManager,
        deadpool::{Object, Pool},
    },
};
use diesel_migrations::{EmbeddedMigrations, MigrationHarness, embed_migrations};
use tokio::{net::TcpListener, signal};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::{config::Config, db, storage::FileStore};

mod api;
pub mod auth;
pub mod util;

// Request bodies are capped at 16 MiB, which in practice is a cap on file
// uploads.
const MAX_CONTENT_LENGTH: usize = 16 * 1024 * 1024;

/// # Errors
pub async fn serve(config: Config, log_dir: Option<Utf8PathBuf>) -> anyhow::Result<()> {
    initialize_logging(log_dir);

    let app_addr = config.app_address();

    let app_state = AppState::new(config)
        .await
        .context("failed to initialize app state")?;
    tracing::info!("initialized app state");

    let db_conn = app_state
        .db_conn()
        .await
        .context("failed to connect to database")?;

    run_migrations(db_conn)
        .await
        .context("failed to run database migrations")?;
    tracing::info!("ran database migrations");

    app_state
        .file_store()
        .ensure_root()
        .await
        .context("failed to create upload directory")?;

    let app = app(app_state.clone());

    let listener = TcpListener::bind(&app_addr)
        .await
        .context(format!("failed to listen on {app_addr}"))?;
    tracing::info!("benchnote listening on {app_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(app_state))
        .await
        .context("failed to serve app")?;

    Ok(())
}

fn initialize_logging(log_dir: Option<Utf8PathBuf>) {
    use tracing::Level;
    use tracing_subscriber::{filter::Targets, prelude::*};

    let log_layer = tracing_subscriber::fmt::layer();

    match log_dir {
        None => {
            let dev_test_log_filter = Targets::new()
                .with_target("benchnote_backend", Level::DEBUG)
                .with_target("tower_http", Level::TRACE);
            let log_layer = log_layer.pretty().with_filter(dev_test_log_filter);

            tracing_subscriber::registry().with(log_layer).init();
        }
        Some(path) => {
            let log_writer = tracing_appender::rolling::daily(path, "benchnote.log");
            let prod_log_filter = Targets::new().with_target("benchnote_backend", Level::INFO);
            let log_layer = log_layer
                .json()
                .with_writer(log_writer)
                .with_filter(prod_log_filter);

            tracing_subscriber::registry().with(log_layer).init();
        }
    }
}

#[derive(Clone)]
pub enum AppState {
    Dev {
        db_pool: Pool<AsyncPgConnection>,
        _pg_container: Arc<util::DevContainer>,
        file_store: FileStore,
        config: Arc<Config>,
    },
    Prod {
        db_pool: Pool<AsyncPgConnection>,
        file_store: FileStore,
        config: Arc<Config>,
    },
}

impl AppState {
    async fn new(config: Config) -> anyhow::Result<Self> {
        let state = if config.is_dev() {
            let container = util::DevContainer::new("benchnote-backend_dev")
                .await
                .context("failed to start postgres container instance")?;

            let db_config =
                AsyncDieselConnectionManager::<AsyncPgConnection>::new(container.db_url().await?);
            let db_pool = Pool::builder(db_config).build()?;

            let upload_root = std::env::temp_dir().join(format!("benchnote-{}", Uuid::new_v4()));
            let upload_root = Utf8PathBuf::from_path_buf(upload_root)
                .map_err(|path| anyhow::anyhow!("non-UTF-8 temp dir {}", path.display()))?;

            Self::Dev {
                db_pool,
                _pg_container: Arc::new(container),
                file_store: FileStore::new(upload_root),
                config: Arc::new(config),
            }
        } else {
            let db_config = AsyncDieselConnectionManager::<AsyncPgConnection>::new(config.db_url());
            let db_pool = Pool::builder(db_config).build()?;

            let file_store = FileStore::new(config.upload_dir().to_owned());

            Self::Prod {
                db_pool,
                file_store,
                config: Arc::new(config),
            }
        };

        Ok(state)
    }

    /// # Errors
    pub async fn db_conn(&self) -> db::error::Result<Object<AsyncPgConnection>> {
        use AppState::{Dev, Prod};

        match self {
            Dev { db_pool, .. } | Prod { db_pool, .. } => Ok(db_pool.get().await?),
        }
    }

    pub(crate) fn file_store(&self) -> &FileStore {
        use AppState::{Dev, Prod};

        match self {
            Dev { file_store, .. } | Prod { file_store, .. } => file_store,
        }
    }

    pub(crate) fn config(&self) -> &Config {
        use AppState::{Dev, Prod};

        match self {
            Dev { config, .. } | Prod { config, .. } => config,
        }
    }

    pub(crate) fn session_salt(&self) -> &str {
        self.config().session_salt()
    }
}

pub(crate) async fn run_migrations(
    db_conn: Object<AsyncPgConnection>,
) -> anyhow::Result<()> {
    const MIGRATIONS: EmbeddedMigrations = embed_migrations!("../db/migrations");

    let mut wrapper: AsyncConnectionWrapper<Object<AsyncPgConnection>> =
        AsyncConnectionWrapper::from(db_conn);

    tokio::task::spawn_blocking(move || {
        wrapper.run_pending_migrations(MIGRATIONS).unwrap();
    })
    .await?;

    Ok(())
}

fn app(app_state: AppState) -> Router {
    api::router()
        .layer(DefaultBodyLimit::max(MAX_CONTENT_LENGTH))
        .layer(TraceLayer::new_for_http())
        .route("/health", get(async || ()))
        .with_state(app_state)
}

async fn shutdown_signal(app_state: AppState) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    // Dropping the state here tears down the dev container with the server.
    tokio::select! {
        () = ctrl_c => {drop(app_state);},
        () = terminate => {drop(app_state)},
    }
}
