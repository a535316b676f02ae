//! Router assembly and transport binding.
//!
//! The control plane binds either a TCP socket or a Unix domain socket,
//! never both. A pre-existing file at the socket path is unlinked before
//! binding; IPv6 is opt-in and, when enabled, dual-stack.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use axum::routing::{get, post};
use axum::Router;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::Config;

use super::routes;
use super::AppState;

/// Transport and serve failures.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind { addr: String, source: io::Error },
    #[error("server error: {0}")]
    Serve(#[from] io::Error),
}

/// Assemble the API router, mounted under the configured base path.
pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/api/health", get(routes::health))
        .route("/api/accounts", get(routes::list_accounts))
        .route(
            "/api/tasks",
            get(routes::list_tasks).post(routes::create_task),
        )
        .route("/api/tasks/batch", post(routes::batch_tasks))
        .route(
            "/api/tasks/{id}",
            get(routes::get_task)
                .put(routes::update_task)
                .delete(routes::delete_task),
        )
        .route("/api/tasks/{id}/run", post(routes::run_task))
        .route("/api/tasks/{id}/toggle", post(routes::toggle_task))
        .route(
            "/api/tasks/{id}/results",
            get(routes::list_results).delete(routes::purge_results),
        )
        .route(
            "/api/tasks/{id}/results/{result_id}",
            axum::routing::delete(routes::purge_result),
        )
        .route("/api/results/{id}", get(routes::list_results))
        .route(
            "/api/templates",
            get(routes::list_templates).post(routes::create_template),
        )
        .route("/api/templates/export", get(routes::export_templates))
        .route("/api/templates/import", post(routes::import_templates))
        .route(
            "/api/templates/{id}",
            get(routes::get_template)
                .put(routes::update_template)
                .delete(routes::delete_template),
        )
        .route("/api/fs/list", get(routes::fs_list))
        .route("/api/fs/read", get(routes::fs_read))
        .route("/api/fs/write", post(routes::fs_write));

    let base_path = state.config.base_path.clone();
    let router = if base_path == "/" {
        api.with_state(state)
    } else {
        Router::new().nest(&base_path, api.with_state(state))
    };

    router
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind the configured transport and serve until `shutdown` resolves.
pub async fn serve(
    state: AppState,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<(), ServerError> {
    let config = state.config.clone();
    let app = build_router(state);

    match &config.unix_socket {
        #[cfg(unix)]
        Some(socket_path) => {
            if socket_path.exists() {
                let _ = std::fs::remove_file(socket_path);
            }
            let listener =
                tokio::net::UnixListener::bind(socket_path).map_err(|source| ServerError::Bind {
                    addr: socket_path.display().to_string(),
                    source,
                })?;
            tracing::info!(
                "control plane listening on unix://{}{}",
                socket_path.display(),
                config.base_path,
            );
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await?;
            let _ = std::fs::remove_file(socket_path);
        }
        #[cfg(not(unix))]
        Some(socket_path) => {
            return Err(ServerError::Bind {
                addr: socket_path.display().to_string(),
                source: io::Error::new(
                    io::ErrorKind::Unsupported,
                    "unix sockets are not available on this platform",
                ),
            });
        }
        None => {
            let listener = bind_tcp(&config)?;
            tracing::info!(
                "control plane listening on http://{}:{}{}",
                config.bind_address,
                config.port,
                config.base_path,
            );
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await?;
        }
    }
    Ok(())
}

/// TCP bind. With IPv6 enabled the socket is dual-stack (`IPV6_V6ONLY`
/// disabled) so IPv4 clients are still served.
fn bind_tcp(config: &Config) -> Result<TcpListener, ServerError> {
    let (domain, addr): (Domain, SocketAddr) = if config.prefer_ipv6 {
        (Domain::IPV6, (Ipv6Addr::UNSPECIFIED, config.port).into())
    } else {
        let host: Ipv4Addr = config
            .bind_address
            .parse()
            .unwrap_or(Ipv4Addr::UNSPECIFIED);
        (Domain::IPV4, (host, config.port).into())
    };
    let bind_failed = |source: io::Error| ServerError::Bind {
        addr: format!("{}:{}", config.bind_address, config.port),
        source,
    };

    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP)).map_err(bind_failed)?;
    if config.prefer_ipv6 {
        socket.set_only_v6(false).map_err(bind_failed)?;
    }
    socket.set_reuse_address(true).map_err(bind_failed)?;
    socket.bind(&addr.into()).map_err(bind_failed)?;
    socket.listen(1024).map_err(bind_failed)?;

    let listener: std::net::TcpListener = socket.into();
    listener.set_nonblocking(true).map_err(bind_failed)?;
    TcpListener::from_std(listener).map_err(bind_failed)
}
