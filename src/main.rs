//! # Realtime Voice Session - Binary Entry Point
//!
//! Opens one voice session against the configured realtime service, streams the
//! microphone into it, plays the replies, and serves the read-only status endpoints.
//!
//! ## Startup:
//! 1. Load `.env`, configuration and logging
//! 2. Read the short-lived credential from `REALTIME_TOKEN`
//! 3. Connect, start listening
//! 4. Serve `/health` and `/api/v1/status` (unless `server.enabled = false`)
//! 5. On SIGINT/SIGTERM disconnect and exit

use actix_cors::Cors;
use actix_web::{middleware::Logger, web, App, HttpServer};
use anyhow::{Context, Result};
use realtime_voice_session::{status, AppConfig, SessionCoordinator};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const TOKEN_VAR: &str = "REALTIME_TOKEN";

#[actix_web::main]
async fn main() -> Result<()> {
    // A missing .env file is fine
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting realtime-voice-session v{}", env!("CARGO_PKG_VERSION"));
    info!(
        url = %config.connection.url,
        playback_mode = %config.audio.playback_mode,
        "Configuration loaded"
    );

    let credential = std::env::var(TOKEN_VAR).with_context(|| format!("{} is not set", TOKEN_VAR))?;

    let session = Arc::new(SessionCoordinator::from_config(&config)?);
    session.on_transcript(|t| {
        if t.is_final {
            info!(text = %t.text, "Transcript");
        }
    });
    session.on_presence_change(|p| info!(state = ?p.state(), "Presence"));
    session.on_error(|err| warn!(code = err.code(), error = %err, "Session error"));

    session.connect(&config.connection.url, &credential).await?;
    if let Err(err) = session.start_listening().await {
        // The session stays up for playback and status even without a microphone
        error!(error = %err, "Could not start listening");
    }

    if config.server.enabled {
        serve_status(&config, session.clone()).await?;
    } else {
        wait_for_shutdown().await;
    }

    session.disconnect();
    info!("Session closed");
    Ok(())
}

/// Serve the status endpoints until the server exits or a shutdown signal arrives.
async fn serve_status(config: &AppConfig, session: Arc<SessionCoordinator>) -> Result<()> {
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    info!("Starting status server on {}", bind_addr);

    let data = web::Data::from(session);
    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allowed_methods(vec!["GET"])
            .max_age(3600);

        App::new()
            .app_data(data.clone())
            .wrap(cors)
            .wrap(Logger::default())
            .configure(status::configure)
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Status server error: {}", e),
                Err(e) => error!("Status server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping status server...");
            server_handle.stop(true).await;
        }
    }
    Ok(())
}

/// Logging via `RUST_LOG`, defaulting to debug for this crate.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "realtime_voice_session=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Resolve on Ctrl+C or, on unix, SIGTERM.
async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
