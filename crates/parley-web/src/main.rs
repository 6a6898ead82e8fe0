mod auth;
mod error;
mod routes;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use parley_core::assistant::ChatService;
use parley_core::config::ParleyConfig;
use parley_core::ParleyError;
use tokio_util::sync::CancellationToken;

use crate::auth::JwtVerifier;

pub struct AppState {
    pub service: ChatService,
    pub jwt: JwtVerifier,
    pub metrics: PrometheusHandle,
}

#[derive(Debug, Parser)]
#[command(name = "parley-web", version, about = "Parley chat assistant HTTP server")]
struct Args {
    /// Load this TOML file instead of the layered config.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    /// Emit logs as JSON lines.
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let (mut config, load_error) = match &args.config {
        Some(path) => (
            ParleyConfig::load_file(path)
                .with_context(|| format!("failed to load {}", path.display()))?,
            None,
        ),
        None => {
            let cwd = std::env::current_dir().ok();
            load_layered(cwd.as_deref())
        }
    };
    if let Some(host) = args.host {
        config.web.host = host;
    }
    if let Some(port) = args.port {
        config.web.port = port;
    }

    init_tracing(args.json_logs || config.logging.json);
    if let Some(e) = load_error {
        tracing::warn!(error = %e, "failed to load layered config, using defaults");
    }

    let metrics = PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install metrics recorder")?;

    let jwt = JwtVerifier::from_config(&config.auth).context("JWT verification is not configured")?;
    let service = ChatService::from_config(&config)?;
    tracing::info!(
        data_api = service.data_api().name(),
        vector_index = service.vector().is_enabled(),
        audit = %service.audit().path().display(),
        "chat service ready"
    );

    let state = Arc::new(AppState {
        service,
        jwt,
        metrics,
    });

    let shutdown = CancellationToken::new();
    let sweeper = tokio::spawn(sweep_loop(
        Arc::clone(&state),
        Duration::from_secs(config.session.sweep_interval_secs),
        shutdown.clone(),
    ));

    let app = routes::router()
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower_http::cors::CorsLayer::permissive());

    let addr = format!("{}:{}", config.web.host, config.web.port);
    tracing::info!("parley-web listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_signal(shutdown.clone()))
        .await?;

    shutdown.cancel();
    if let Err(e) = sweeper.await {
        tracing::warn!("sweep task ended abnormally: {e}");
    }
    tracing::info!("parley-web stopped");
    Ok(())
}

/// Layered config, or defaults plus the load error. The error is returned
/// rather than logged since no subscriber is installed yet.
fn load_layered(project_dir: Option<&Path>) -> (ParleyConfig, Option<ParleyError>) {
    match ParleyConfig::load(project_dir) {
        Ok(config) => (config, None),
        Err(e) => (ParleyConfig::default_config(), Some(e)),
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("parley_web=info,parley_core=info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn wait_for_signal(shutdown: CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::error!("failed to listen for shutdown signal: {e}");
            }
            tracing::info!("shutdown signal received");
            shutdown.cancel();
        }
        _ = shutdown.cancelled() => {}
    }
}

/// Periodically evict expired sessions, idle rate-limit buckets and stale
/// proposals until shutdown.
async fn sweep_loop(state: Arc<AppState>, every: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                state.service.sweep().await;
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use parley_core::collab::{DataApiBackend, Extractor, InMemoryDataApi, RuleExtractor, VectorBackend};
    use parley_core::model::Role;

    pub const SECRET: &str = "test-secret";

    pub fn state_with(tweak: impl FnOnce(&mut ParleyConfig)) -> Arc<AppState> {
        let mut config = ParleyConfig::default_config();
        config.audit.enabled = false;
        config.audit.path = Some(
            std::env::temp_dir()
                .join(format!("parley-web-{}", uuid::Uuid::now_v7()))
                .join("audit.jsonl")
                .display()
                .to_string(),
        );
        tweak(&mut config);
        let service = ChatService::with_collaborators(
            &config,
            DataApiBackend::Memory(InMemoryDataApi::demo()),
            VectorBackend::Disabled,
            Extractor::Rules(RuleExtractor),
        )
        .unwrap();
        Arc::new(AppState {
            service,
            jwt: JwtVerifier::new(SECRET, &config.auth.jwt_issuer),
            metrics: PrometheusBuilder::new().build_recorder().handle(),
        })
    }

    pub fn test_app_state() -> Arc<AppState> {
        state_with(|_| {})
    }

    pub fn token(sub: &str, client_id: &str, role: Role) -> String {
        let now = chrono::Utc::now().timestamp();
        sign(&crate::auth::Claims {
            sub: sub.to_string(),
            client_id: client_id.to_string(),
            role: role.to_string(),
            iss: "parley".to_string(),
            iat: now,
            exp: now + 3600,
        })
    }

    pub fn sign(claims: &crate::auth::Claims) -> String {
        jsonwebtoken::encode(
            &jsonwebtoken::Header::new(jsonwebtoken::Algorithm::HS256),
            claims,
            &jsonwebtoken::EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malformed_project_config_falls_back_with_error() {
        let dir = std::env::temp_dir().join(format!("parley-cfg-{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(dir.join(".parley")).unwrap();
        std::fs::write(dir.join(".parley").join("config.toml"), "[web\nport = ").unwrap();

        let (config, error) = load_layered(Some(&dir));
        assert!(matches!(error, Some(ParleyError::Config(_))));
        assert_eq!(config.web.port, ParleyConfig::default_config().web.port);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_missing_project_config_loads_cleanly() {
        let dir = std::env::temp_dir().join(format!("parley-cfg-{}", uuid::Uuid::now_v7()));
        let (_, error) = load_layered(Some(&dir));
        assert!(error.is_none());
    }
}
