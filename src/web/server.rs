//! HTTP(S) front end: accepts requests with tiny_http and hands each one to
//! the router on its own thread

use std::fs;
use std::io::Read;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::Builder;

use tiny_http::{Header, Request, Response, Server, SslConfig as TinyHttpSslConfig};

use crate::config::ServerConfig;
use crate::dns::protocol::MAX_MESSAGE_SIZE;
use crate::dns::shutdown::ShutdownCoordinator;
use crate::web::router::{DohRequest, DohResponse, Router};
use crate::web::{Result, ServerError};

pub struct DohServer {
    server: Arc<Server>,
    router: Arc<Router>,
    coordinator: Arc<ShutdownCoordinator>,
}

/// Reads at most one byte more than the largest DNS message, which is enough
/// for the router to tell that a body is oversized.
fn read_body(request: &mut Request) -> std::io::Result<Vec<u8>> {
    let mut body = Vec::new();
    request
        .as_reader()
        .take(MAX_MESSAGE_SIZE as u64 + 1)
        .read_to_end(&mut body)?;

    Ok(body)
}

fn to_doh_request(request: &mut Request) -> std::io::Result<DohRequest> {
    let body = read_body(request)?;

    Ok(DohRequest {
        method: request.method().to_string(),
        url: request.url().to_string(),
        headers: request
            .headers()
            .iter()
            .map(|h| (h.field.to_string(), h.value.to_string()))
            .collect(),
        peer: Some(*request.remote_addr()),
        body,
    })
}

fn respond(request: Request, response: DohResponse) {
    let mut http_response =
        Response::from_data(response.body).with_status_code(response.status);

    for (field, value) in &response.headers {
        match Header::from_bytes(field.as_bytes(), value.as_bytes()) {
            Ok(header) => http_response.add_header(header),
            Err(_) => log::warn!("dropping invalid response header {}", field),
        }
    }

    if let Err(e) = request.respond(http_response) {
        log::debug!("failed to write response: {}", e);
    }
}

fn serve(router: &Router, mut request: Request) {
    match to_doh_request(&mut request) {
        Ok(doh_request) => {
            let response = router.handle(&doh_request);
            respond(request, response);
        }
        Err(e) => {
            log::debug!("failed to read request body: {}", e);
            let response = Response::from_string("Bad Request").with_status_code(400);
            let _ = request.respond(response);
        }
    }
}

impl DohServer {
    /// Binds the listener, over TLS when a certificate is configured.
    pub fn bind(
        config: &ServerConfig,
        router: Arc<Router>,
        coordinator: Arc<ShutdownCoordinator>,
    ) -> Result<DohServer> {
        let addr = config.listen_addr();

        let server = if config.tls_enabled() {
            let ssl_config = TinyHttpSslConfig {
                certificate: fs::read(&config.tls_cert_filepath)?,
                private_key: fs::read(&config.tls_key_filepath)?,
            };
            Server::https(addr.as_str(), ssl_config)
        } else {
            Server::http(addr.as_str())
        }
        .map_err(|e| ServerError::Bind {
            addr: addr.clone(),
            reason: e.to_string(),
        })?;

        log::info!(
            "listening on {} ({})",
            addr,
            if config.tls_enabled() { "https" } else { "http" }
        );

        Ok(DohServer {
            server: Arc::new(server),
            router,
            coordinator,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.server.server_addr()
    }

    /// Handle that stops `run` from accepting further requests
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            server: self.server.clone(),
        }
    }

    /// Accepts requests until shutdown, serving each on its own thread.
    pub fn run(&self) {
        loop {
            let request = match self.server.recv() {
                Ok(request) => request,
                Err(e) => {
                    if self.coordinator.is_shutting_down() {
                        break;
                    }
                    log::warn!("failed to accept request: {}", e);
                    continue;
                }
            };

            if self.coordinator.is_shutting_down() {
                let response = Response::from_string("Service Unavailable").with_status_code(503);
                let _ = request.respond(response);
                continue;
            }

            let guard = self.coordinator.register_request();
            let router = self.router.clone();
            let spawned = Builder::new()
                .name("doh-request".to_string())
                .spawn(move || {
                    let _guard = guard;
                    serve(&router, request);
                });

            if let Err(e) = spawned {
                log::error!("failed to spawn request thread: {}", e);
            }
        }

        log::info!("listener stopped");
    }
}

#[derive(Clone)]
pub struct ServerHandle {
    server: Arc<Server>,
}

impl ServerHandle {
    pub fn unblock(&self) {
        self.server.unblock();
    }
}
