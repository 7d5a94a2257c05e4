//! Swarm construction
//!
//! TCP + Noise + Mplex transport with the exchange behaviour installed.
//! Everything below the exchange protocol (dialling, multiplexing,
//! encryption) belongs to libp2p.

use libp2p::core::transport::Transport;
use libp2p::core::upgrade;
use libp2p::swarm::SwarmBuilder;
use libp2p::{identity, noise, tcp, PeerId, Swarm};
use libp2p_mplex as mplex;
use std::sync::Arc;
use thiserror::Error;

use crate::exchange::{Exchange, ExchangeBehaviour};

#[derive(Error, Debug)]
pub enum P2PError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Swarm error: {0}")]
    Swarm(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Build a swarm around the exchange engine with the given identity.
pub fn create_swarm(
    keypair: identity::Keypair,
    engine: Arc<Exchange>,
) -> Result<Swarm<ExchangeBehaviour>, P2PError> {
    let peer_id = PeerId::from(keypair.public());
    tracing::info!(peer = %peer_id, "local peer identity");

    let transport = tcp::tokio::Transport::new(tcp::Config::default().nodelay(true))
        .upgrade(upgrade::Version::V1Lazy)
        .authenticate(
            noise::Config::new(&keypair).map_err(|e| P2PError::Transport(e.to_string()))?,
        )
        .multiplex(mplex::MplexConfig::new())
        .boxed();

    let behaviour = ExchangeBehaviour::new(engine);
    Ok(SwarmBuilder::with_tokio_executor(transport, behaviour, peer_id).build())
}
