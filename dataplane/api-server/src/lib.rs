/*
Copyright 2025 The Kubernetes Authors.

SPDX-License-Identifier: (GPL-2.0-only OR BSD-2-Clause)
*/

pub mod config;
pub mod netutils;
pub mod routing;
pub mod server;

use std::{
    fs,
    net::{Ipv4Addr, SocketAddrV4},
    sync::Arc,
};

use anyhow::{Context, Result};
use aya::maps::{HashMap, MapData};
use tonic::transport::{Certificate, Identity, Server, ServerTlsConfig};
use tonic::{Request, Status};
use tracing::{debug, error, info};

use backends::backends::backends_server::BackendsServer;
use common::{Backend, VipKey};
use config::TLSConfig;
use routing::RoutingTable;

/// The well-known port every Node Agent serves its gRPC API on.
pub const DATAPLANE_API_PORT: u16 = 9874;

pub async fn start(
    addr: Ipv4Addr,
    port: u16,
    backends_map: HashMap<MapData, VipKey, Backend>,
    routing: Arc<RoutingTable>,
    tls_config: Option<TLSConfig>,
) -> Result<()> {
    debug!("starting api server on {}", addr);

    // TLS configuration is tied to the entire tonic server, not to
    // individual routes, so the plaintext health checks get a server of
    // their own.
    let healthchecks = tokio::spawn(async move {
        let (_, health_service) = tonic_health::server::health_reporter();
        let mut server_builder = Server::builder();

        // by convention we add 1 to the API listen port and use that
        // for the health check port.
        let port = port + 1;
        let addr = SocketAddrV4::new(addr, port);
        let server = server_builder
            .add_service(health_service)
            .serve(addr.into());

        debug!("gRPC Health Checking service listens on port {}", port);
        server
            .await
            .map_err(|e| {
                error!("Failed serve gRPC Health Checking service, err: {:?}", e);
                e
            })
            .unwrap();
    });

    let backends = tokio::spawn(async move {
        let service = server::BackendService::new(backends_map, routing);
        let listen_addr = SocketAddrV4::new(addr, port);

        let serve = match &tls_config {
            Some(_) => {
                let mut server_builder = setup_tls(Server::builder(), &tls_config).unwrap();
                debug!("gRPC server listens on port {}", port);
                server_builder
                    .add_service(BackendsServer::new(service))
                    .serve(listen_addr.into())
                    .await
            }
            None => {
                info!("gRPC TLS is not enabled; only loopback peers are accepted");
                Server::builder()
                    .add_service(BackendsServer::with_interceptor(service, require_loopback))
                    .serve(listen_addr.into())
                    .await
            }
        };

        serve
            .map_err(|e| {
                error!("Failed to serve gRPC, err: {:?}", e);
                e
            })
            .unwrap();
    });

    tokio::try_join!(healthchecks, backends)?;

    Ok(())
}

// Without TLS there is no peer identity at all, so the only connections we
// are willing to take are the node's own.
fn require_loopback(request: Request<()>) -> Result<Request<()>, Status> {
    match request.remote_addr() {
        Some(peer) if peer.ip().is_loopback() => Ok(request),
        _ => Err(Status::permission_denied(
            "plaintext connections are only accepted from loopback",
        )),
    }
}

pub fn setup_tls(mut builder: Server, tls_config: &Option<TLSConfig>) -> Result<Server> {
    match tls_config {
        Some(TLSConfig::TLS(config)) => {
            let mut tls = ServerTlsConfig::new();

            let cert = fs::read_to_string(&config.server_certificate_path).with_context(|| {
                format!(
                    "Failed to read certificate from {:?}",
                    config.server_certificate_path
                )
            })?;
            let key = fs::read_to_string(&config.server_private_key_path).with_context(|| {
                format!(
                    "Failed to read key from {:?}",
                    config.server_private_key_path
                )
            })?;
            let server_identity = Identity::from_pem(cert, key);
            tls = tls.identity(server_identity);

            builder = builder.tls_config(tls)?;
            info!("gRPC TLS enabled");
            Ok(builder)
        }
        Some(TLSConfig::MutualTLS(config)) => {
            let mut tls = ServerTlsConfig::new();

            let cert =
                fs::read_to_string(config.server_certificate_path.clone()).with_context(|| {
                    format!(
                        "Failed to read certificate from {:?}",
                        config.server_certificate_path
                    )
                })?;
            let key =
                fs::read_to_string(config.server_private_key_path.clone()).with_context(|| {
                    format!(
                        "Failed to read key from {:?}",
                        config.server_private_key_path
                    )
                })?;
            let server_identity = Identity::from_pem(cert, key);
            tls = tls.identity(server_identity);

            let client_ca_cert =
                fs::read_to_string(config.client_certificate_authority_root_path.clone())
                    .with_context(|| {
                        format!(
                            "Failed to read client CA from {:?}",
                            config.client_certificate_authority_root_path
                        )
                    })?;
            let client_ca_root = Certificate::from_pem(client_ca_cert);
            tls = tls.client_ca_root(client_ca_root);

            builder = builder.tls_config(tls)?;
            info!("gRPC mTLS enabled");
            Ok(builder)
        }
        None => Ok(builder),
    }
}
