//! seclevel-node: a security-level negotiation node over TCP.

use std::sync::Arc;

use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

use seclevel_core::{
    CredentialClaims, DeviceIdentity, NegotiationState, SecLevelError, SecLevelResult,
    SignedCredentialProvider,
};
use seclevel_server::{
    render_text, NodeConfig, SecurityLevelService, TcpTransport, TokioTimer, Transport,
};

/// Issuer key shared by every node started with the same passphrase.
fn issuer_key(passphrase: &str) -> SigningKey {
    let seed: [u8; 32] = Sha256::digest(passphrase.as_bytes()).into();
    SigningKey::from_bytes(&seed)
}

#[tokio::main]
async fn main() -> SecLevelResult<()> {
    tracing_subscriber::fmt::init();

    let config = NodeConfig::from_args(std::env::args().skip(1))?;

    let device_key = SigningKey::generate(&mut OsRng);
    let identity = config
        .identity
        .unwrap_or_else(|| DeviceIdentity::from_public_key(device_key.verifying_key().as_bytes()));

    let claims = CredentialClaims {
        udid: identity.to_string(),
        version: "1.0.0".to_string(),
        sign_time: chrono::Utc::now(),
        manufacture: "seclevel".to_string(),
        model: "node".to_string(),
        brand: "seclevel".to_string(),
        security_level: format!("SL{}", config.cred_level),
        cred_level: config.cred_level,
    };
    let provider = SignedCredentialProvider::self_issued(&issuer_key(&config.issuer_passphrase), &claims)?;

    let transport = TcpTransport::new(
        identity,
        config.peers.clone(),
        tokio::runtime::Handle::current(),
        config.service.max_message_len,
    );
    let service = SecurityLevelService::builder(transport.clone(), Arc::new(TokioTimer::current()))
        .config(config.service.clone())
        .provider(Arc::new(provider))
        .build()?;
    transport.attach(&service);

    tracing::info!(
        "starting node {} on {} with level {}",
        identity,
        config.bind_addr,
        config.cred_level
    );
    let mut listener = tokio::spawn(Arc::clone(&transport).run(config.bind_addr));

    while !transport.is_ready() {
        if listener.is_finished() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    for peer in config.peers.keys() {
        let service = service.clone();
        let peer = *peer;
        tokio::task::spawn_blocking(move || {
            if let Err(e) = service.on_peer_status_changed(&peer, true, 0) {
                tracing::warn!("peer {} not tracked: {}", peer, e);
            }
        });
    }

    let mut ticker = tokio::time::interval(config.dump_interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let snapshots = service.dump();
                tracing::info!("\n{}", render_text(&snapshots));
                let failed: Vec<DeviceIdentity> = snapshots
                    .iter()
                    .filter(|s| s.state == NegotiationState::Failed)
                    .map(|s| s.identity)
                    .collect();
                if !failed.is_empty() {
                    let service = service.clone();
                    tokio::task::spawn_blocking(move || {
                        for peer in failed {
                            let _ = service.force_recheck(&peer);
                        }
                    });
                }
            }
            finished = &mut listener => {
                return match finished {
                    Ok(result) => result,
                    Err(e) => Err(SecLevelError::Transport(format!("listener task failed: {}", e))),
                };
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutting down");
                return Ok(());
            }
        }
    }
}
