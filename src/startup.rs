//! Application Startup
//!
//! Application building and server initialization.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::Router;
use sqlx::PgPool;
use tokio::net::TcpListener;

use crate::application::services::AllocationServiceImpl;
use crate::config::Settings;
use crate::domain::AgentRepository;
use crate::infrastructure::broker::{Broker, RedisBroker};
use crate::infrastructure::database;
use crate::infrastructure::repositories::{PgAgentRepository, PgRoomRepository};
use crate::presentation::http::{handlers, routes};
use crate::presentation::middleware::{cors, logging};
use crate::presentation::websocket::RoomDirectory;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub users: Arc<dyn AgentRepository>,
    pub directory: Arc<RoomDirectory>,
    pub settings: Arc<Settings>,
}

/// Application instance
pub struct Application {
    listener: TcpListener,
    router: Router,
}

impl Application {
    /// Build the application from settings
    pub async fn build(settings: Settings) -> Result<Self> {
        handlers::health::init_server_start();

        // Create database pool
        let db = database::create_pool(&settings.database).await?;
        tracing::info!("Database connection pool created");

        if settings.database.run_migrations {
            database::run_migrations(&db).await?;
            tracing::info!("Database migrations applied");
        }

        // Connect the room broker
        let broker: Arc<dyn Broker> = Arc::new(RedisBroker::connect(&settings.redis).await?);

        // Wire allocation and the room directory
        let agents = Arc::new(PgAgentRepository::new(db.clone()));
        let rooms = Arc::new(PgRoomRepository::new(db.clone()));
        let allocation = Arc::new(AllocationServiceImpl::new(agents.clone(), rooms));
        let directory = Arc::new(RoomDirectory::new(
            broker,
            allocation,
            settings.rooms.clone(),
        ));

        let state = AppState {
            db,
            users: agents,
            directory,
            settings: Arc::new(settings.clone()),
        };

        // Build router with middleware
        let router = build_router(state, &settings);

        // Bind to address
        let listener = TcpListener::bind(settings.server_addr()).await?;
        tracing::info!("Listening on {}", listener.local_addr()?);

        Ok(Self { listener, router })
    }

    /// Run the server until Ctrl+C or SIGTERM
    pub async fn run_until_stopped(self) -> Result<()> {
        axum::serve(self.listener, self.router)
            .with_graceful_shutdown(shutdown_signal())
            .await?;
        tracing::info!("Server stopped");
        Ok(())
    }

    /// Get the bound address
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

/// Router with the trace and CORS layers applied
pub fn build_router(state: AppState, settings: &Settings) -> Router {
    routes::create_router(state)
        .layer(logging::create_trace_layer())
        .layer(cors::create_cors_layer(&settings.cors))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => tracing::error!("Failed to listen for SIGTERM: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
