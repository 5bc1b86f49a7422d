/*
Copyright 2025 The Kubernetes Authors.

SPDX-License-Identifier: (GPL-2.0-only OR BSD-2-Clause)
*/

use anyhow::Result;
use api_server::config::{MutualTLSConfig, ServerOnlyTLSConfig, TLSConfig};
use api_server::setup_tls;
use rcgen::{generate_simple_self_signed, CertificateParams, CertifiedKey, KeyPair};
use std::fs;
use tempfile::tempdir;
use tonic::transport::Server;

#[tokio::test]
async fn test_tls_self_signed_cert() -> Result<()> {
    let temp_dir = tempdir().unwrap();

    // Generate a self-signed certificate.
    let CertifiedKey { cert, key_pair } = generate_simple_self_signed(vec!["localhost".into()])?;
    let cert_pem = cert.pem();
    let key_pem = key_pair.serialize_pem();

    // Paths for the server cert and private key.
    let cert_path = temp_dir.path().join("server.crt");
    let key_path = temp_dir.path().join("server.key");

    fs::write(&cert_path, cert_pem.as_bytes())?;
    fs::write(&key_path, key_pem.as_bytes())?;

    let tls_config = Some(TLSConfig::TLS(ServerOnlyTLSConfig {
        server_certificate_path: cert_path.clone(),
        server_private_key_path: key_path.clone(),
    }));

    let builder = Server::builder();

    let result = setup_tls(builder, &tls_config);
    assert!(
        result.is_ok(),
        "setup_tls should succeed with valid self-signed certs"
    );
    Ok(())
}

#[tokio::test]
async fn test_mtls_self_signed_cert() -> Result<()> {
    let temp_dir = tempdir().unwrap();

    // Generate a self-signed certificate.
    let CertifiedKey { cert, key_pair } = generate_simple_self_signed(vec!["localhost".into()])?;
    let cert_pem = cert.pem();
    let key_pem = key_pair.serialize_pem();

    // Generate a client CA.
    let ca_key = KeyPair::generate()?;
    let ca_cert = CertificateParams::default().self_signed(&ca_key)?;
    let ca_cert_pem = ca_cert.pem();

    // Cert file paths.
    let cert_path = temp_dir.path().join("server.crt");
    let key_path = temp_dir.path().join("server.key");
    let ca_cert_path = temp_dir.path().join("ca.crt");

    fs::write(&cert_path, cert_pem.as_bytes())?;
    fs::write(&key_path, key_pem.as_bytes())?;
    fs::write(&ca_cert_path, ca_cert_pem.as_bytes())?;

    let tls_config = Some(TLSConfig::MutualTLS(MutualTLSConfig {
        server_certificate_path: cert_path.clone(),
        server_private_key_path: key_path.clone(),
        client_certificate_authority_root_path: ca_cert_path.clone(),
    }));

    let builder = Server::builder();

    let result = setup_tls(builder, &tls_config);
    assert!(
        result.is_ok(),
        "setup_tls should succeed with valid self-signed certs"
    );
    Ok(())
}

#[tokio::test]
async fn test_no_tls_passes_builder_through() -> Result<()> {
    let builder = Server::builder();
    assert!(setup_tls(builder, &None).is_ok());
    Ok(())
}
