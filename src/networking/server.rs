use crate::config::CapConfig;
use crate::error::{Error, Result};
use crate::networking::chat::Chat;
use crate::networking::filters;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{error, info};
use warp::http::StatusCode;
use warp::Filter;

/// Serves the CAP API until a shutdown signal arrives, then drains within
/// the configured shutdown budget before giving up.
pub async fn run(config: &CapConfig, chat: Arc<Chat>) -> Result<()> {
    let addr: SocketAddr = config
        .web_api_host
        .parse()
        .map_err(|err| Error::InvalidArgument(format!("api host: {err}")))?;

    let routes = filters::connect_route(chat)
        .with(warp::trace::request())
        .recover(handle_rejection);

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let (bound, server) = warp::serve(routes)
        .try_bind_with_graceful_shutdown(addr, async move {
            shutdown_rx.await.ok();
        })
        .map_err(|err| Error::InvalidArgument(format!("bind {addr}: {err}")))?;

    info!(host = %bound, "api router started");

    let server_task = tokio::spawn(server);

    signal_for_shutdown().await;
    info!("shutdown started");
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(config.web_shutdown_timeout, server_task).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => error!(error = %err, "server task ended"),
        Err(_) => error!("could not stop server gracefully within the shutdown budget"),
    }

    info!("shutdown complete");

    Ok(())
}

async fn handle_rejection(
    rejection: warp::Rejection,
) -> std::result::Result<impl warp::Reply, std::convert::Infallible> {
    let code = if rejection.is_not_found() {
        StatusCode::NOT_FOUND
    } else {
        error!(?rejection, "unhandled rejection");
        StatusCode::INTERNAL_SERVER_ERROR
    };

    Ok(warp::reply::with_status(
        code.canonical_reason().unwrap_or("error"),
        code,
    ))
}

#[cfg(unix)]
pub async fn signal_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate_signal = match signal(SignalKind::terminate()) {
        Ok(terminate_signal) => terminate_signal,
        Err(err) => {
            error!(error = %err, "terminate signal setup");
            tokio::signal::ctrl_c().await.ok();
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => (),
        _ = terminate_signal.recv() => (),
    }
}

#[cfg(not(unix))]
pub async fn signal_for_shutdown() {
    tokio::signal::ctrl_c().await.ok();
}
