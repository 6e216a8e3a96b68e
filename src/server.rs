//! Composition root.
//!
//! [`GatewayServer`] owns the long-lived pieces: the registry control loop,
//! the relation event bridge, and the durable-log producer. It builds the
//! Axum router and tears everything down in a fixed order:
//!
//! 1. stop accepting upgrades,
//! 2. cancel the event bridge and wait for it,
//! 3. shut the registry down (closing every session) and wait for it,
//! 4. close the durable-log producer.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::Router;
use axum::routing::get;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::api;
use crate::app_state::AppState;
use crate::auth::{Authenticator, JwtAuthenticator};
use crate::config::GatewayConfig;
use crate::domain::Registry;
use crate::error::GatewayError;
use crate::persistence::{LogConsumer, LogProducer, MemoryLog, PostgresLog, PostgresRelations, postgres};
use crate::relation::{OpenRelations, RelationChecker};
use crate::service::{EventBridge, MessageRouter};
use crate::ws::handler::ws_handler;

/// External services the gateway talks to.
#[derive(Debug)]
pub struct Collaborators {
    /// Handshake token verifier.
    pub authenticator: Arc<dyn Authenticator>,
    /// Friend/block lookups.
    pub relations: Arc<dyn RelationChecker>,
    /// Durable log receiving accepted chat messages.
    pub producer: Arc<dyn LogProducer>,
    /// Relation-event topic followed by the bridge; `None` disables it.
    pub relation_feed: Option<Arc<dyn LogConsumer>>,
    /// Issuer behind the development token endpoint; `None` hides it.
    pub token_issuer: Option<Arc<JwtAuthenticator>>,
}

impl Collaborators {
    /// Connects the collaborators described by `config`.
    ///
    /// With persistence enabled this opens the PostgreSQL pool and applies
    /// migrations. Otherwise chat goes to an in-process log that keeps only the
    /// newest `memory_log_retention` records, the relation
    /// gate lets everything through, and no relation feed is followed.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::PersistenceError`] if the database cannot be
    /// reached or migrated.
    pub async fn from_config(config: &GatewayConfig) -> Result<Self, GatewayError> {
        let ttl = chrono::TimeDelta::try_hours(config.jwt_expire_hours)
            .unwrap_or_else(|| chrono::TimeDelta::days(1));
        let jwt = Arc::new(JwtAuthenticator::new(&config.jwt_secret, config.jwt_issuer.as_str(), ttl));
        let token_issuer = config.dev_token_endpoint.then(|| Arc::clone(&jwt));
        let authenticator: Arc<dyn Authenticator> = jwt;

        if !config.persistence_enabled {
            tracing::warn!("persistence disabled: chat goes to an in-process log and the relation gate is open");
            return Ok(Self {
                authenticator,
                relations: Arc::new(OpenRelations),
                producer: Arc::new(
                    MemoryLog::new(config.message_topic.as_str())
                        .with_retention(config.memory_log_retention),
                ),
                relation_feed: None,
                token_issuer,
            });
        }

        let pool = postgres::connect(config).await?;
        postgres::run_migrations(&pool).await?;
        tracing::info!("database connected and migrated");

        Ok(Self {
            authenticator,
            relations: Arc::new(PostgresRelations::new(pool.clone())),
            producer: Arc::new(PostgresLog::new(
                pool.clone(),
                config.message_topic.as_str(),
                config.relation_consumer_group.as_str(),
            )),
            relation_feed: Some(Arc::new(PostgresLog::new(
                pool,
                config.relation_topic.as_str(),
                config.relation_consumer_group.as_str(),
            ))),
            token_issuer,
        })
    }
}

/// Running gateway: registry, router, bridge, and their shutdown.
#[derive(Debug)]
pub struct GatewayServer {
    state: AppState,
    producer: Arc<dyn LogProducer>,
    registry_task: Mutex<Option<JoinHandle<()>>>,
    bridge_task: Mutex<Option<JoinHandle<()>>>,
    bridge_cancel: CancellationToken,
    shutdown_timeout: Duration,
    stopped: AtomicBool,
}

impl GatewayServer {
    /// Starts the registry and, when a feed is given, the event bridge.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn start(config: &GatewayConfig, collaborators: Collaborators) -> Self {
        let (registry, registry_task) = Registry::spawn(config.registry_capacity);

        let router = MessageRouter::new(
            registry.clone(),
            collaborators.relations,
            Arc::clone(&collaborators.producer),
        )
        .with_fallback(config.relation_fallback)
        .with_publish_timeout(config.publish_timeout);

        let bridge_cancel = CancellationToken::new();
        let bridge_task = collaborators.relation_feed.map(|feed| {
            let bridge = EventBridge::new(registry.clone())
                .with_polling(config.relation_batch_size, config.relation_poll_interval);
            tokio::spawn(bridge.run(feed, bridge_cancel.child_token()))
        });

        let state = AppState {
            registry,
            authenticator: collaborators.authenticator,
            router: Arc::new(router),
            session: config.session,
            draining: CancellationToken::new(),
            token_issuer: collaborators.token_issuer,
        };

        tracing::info!(
            fallback = ?config.relation_fallback,
            bridge = bridge_task.is_some(),
            "gateway started"
        );

        Self {
            state,
            producer: collaborators.producer,
            registry_task: Mutex::new(Some(registry_task)),
            bridge_task: Mutex::new(bridge_task),
            bridge_cancel,
            shutdown_timeout: config.shutdown_timeout,
            stopped: AtomicBool::new(false),
        }
    }

    /// Shared handler state.
    #[must_use]
    pub const fn state(&self) -> &AppState {
        &self.state
    }

    /// The connection registry.
    #[must_use]
    pub const fn registry(&self) -> &Registry {
        &self.state.registry
    }

    /// Builds the HTTP router: REST surface, `/ws`, and OpenAPI docs.
    #[must_use]
    pub fn router(&self) -> Router {
        let app = Router::new()
            .merge(api::build_router(self.state.token_issuer.is_some()))
            .route("/ws", get(ws_handler))
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
            .with_state(self.state.clone());
        api::docs::mount(app)
    }

    /// Stops the gateway. Safe to call more than once; only the first call
    /// does anything.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!("gateway shutting down");

        self.state.draining.cancel();

        self.bridge_cancel.cancel();
        let bridge = self.bridge_task.lock().take();
        if let Some(task) = bridge {
            self.join("event bridge", task).await;
        }

        let closed = self.state.registry.shutdown().await;
        let registry = self.registry_task.lock().take();
        if let Some(task) = registry {
            self.join("registry", task).await;
        }

        if let Err(e) = self.producer.close().await {
            tracing::warn!(error = %e, "durable log producer did not close cleanly");
        }

        tracing::info!(sessions_closed = closed, "gateway stopped");
    }

    async fn join(&self, name: &'static str, task: JoinHandle<()>) {
        match tokio::time::timeout(self.shutdown_timeout, task).await {
            Ok(Ok(())) => tracing::debug!(task = name, "task finished"),
            Ok(Err(e)) => tracing::warn!(task = name, error = %e, "task ended abnormally"),
            Err(_) => tracing::warn!(task = name, timeout = ?self.shutdown_timeout, "task did not finish in time"),
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::domain::{Session, SessionIdentity, UserId};
    use crate::relation::MemoryRelations;

    fn collaborators(log: &Arc<MemoryLog>, feed: Option<Arc<MemoryLog>>) -> Collaborators {
        Collaborators {
            authenticator: Arc::new(JwtAuthenticator::new("secret", "chat-gateway", chrono::TimeDelta::hours(1))),
            relations: Arc::new(MemoryRelations::new()),
            producer: Arc::clone(log) as Arc<dyn LogProducer>,
            relation_feed: feed.map(|f| f as Arc<dyn LogConsumer>),
            token_issuer: None,
        }
    }

    #[tokio::test]
    async fn shutdown_closes_sessions_then_producer() {
        let log = Arc::new(MemoryLog::new("chat.messages"));
        let feed = Arc::new(MemoryLog::new("relation.events"));
        let server = GatewayServer::start(&GatewayConfig::default(), collaborators(&log, Some(feed)));

        let (session, mut rx) = Session::new(SessionIdentity::new(UserId::new(1), None, None), 8);
        tokio_test::assert_ok!(server.registry().register(Arc::clone(&session)).await);

        server.shutdown().await;

        assert!(!server.state().is_accepting());
        assert!(session.is_closed());
        assert!(rx.recv().await.is_none());
        assert!(log.is_closed());
        let late = Session::new(SessionIdentity::new(UserId::new(2), None, None), 8).0;
        assert!(matches!(
            server.registry().register(late).await,
            Err(GatewayError::RegistryClosed)
        ));

        server.shutdown().await;
    }

    #[tokio::test]
    async fn in_memory_mode_has_no_relation_feed() {
        let config = GatewayConfig {
            persistence_enabled: false,
            memory_log_retention: 0,
            ..GatewayConfig::default()
        };
        let Ok(collaborators) = Collaborators::from_config(&config).await else {
            panic!("in-memory collaborators need no database");
        };
        assert!(collaborators.relation_feed.is_none());
        assert!(collaborators.token_issuer.is_none());
        for _ in 0..10 {
            tokio_test::assert_ok!(collaborators.producer.publish("k", b"v").await);
        }
    }
}
