use std::{io, path::Path};

use anyhow::{Context, Result};
use libp2p::identity::Keypair;

/// The gateway's own keypair. Without a path every run gets a fresh Ed25519
/// identity; with one, the key is read from that file and created there on
/// first use so the peer ID survives restarts.
pub fn load(path: Option<&Path>) -> Result<Keypair> {
    let Some(path) = path else {
        let keypair = Keypair::generate_ed25519();
        tracing::info!(peer_id = %keypair.public().to_peer_id(), "using ephemeral identity");
        return Ok(keypair);
    };

    match std::fs::read(path) {
        Ok(bytes) => {
            let keypair = Keypair::from_protobuf_encoding(&bytes)
                .with_context(|| format!("decoding identity from {}", path.display()))?;
            tracing::info!(peer_id = %keypair.public().to_peer_id(), path = %path.display(), "loaded identity");
            Ok(keypair)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => persist_new(path),
        Err(e) => {
            Err(e).with_context(|| format!("reading identity from {}", path.display()))
        }
    }
}

fn persist_new(path: &Path) -> Result<Keypair> {
    let keypair = Keypair::generate_ed25519();
    let bytes = keypair.to_protobuf_encoding().context("encoding identity")?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating directory {}", parent.display()))?;
    }
    std::fs::write(path, &bytes)
        .with_context(|| format!("writing identity to {}", path.display()))?;
    tracing::info!(peer_id = %keypair.public().to_peer_id(), path = %path.display(), "generated new identity");
    Ok(keypair)
}

#[cfg(test)]
mod tests {
    use libp2p::identity::KeyType;

    use super::*;

    #[test]
    fn persisted_identity_survives_reload() {
        let dir = tempfile::tempdir().expect("create temp directory");
        let path = dir.path().join("keys/gateway.key");

        let first = load(Some(&path)).expect("generate identity");
        assert!(path.exists());
        let second = load(Some(&path)).expect("reload identity");

        assert_eq!(first.key_type(), KeyType::Ed25519);
        assert_eq!(first.public().to_peer_id(), second.public().to_peer_id());
    }

    #[test]
    fn ephemeral_identities_differ() {
        let a = load(None).expect("ephemeral identity");
        let b = load(None).expect("ephemeral identity");
        assert_ne!(a.public().to_peer_id(), b.public().to_peer_id());
    }

    #[test]
    fn corrupt_key_file_is_an_error() {
        let dir = tempfile::tempdir().expect("create temp directory");
        let path = dir.path().join("gateway.key");
        std::fs::write(&path, b"not a protobuf keypair").expect("write garbage");

        let err = load(Some(&path)).expect_err("garbage must not decode");
        assert!(err.to_string().contains("decoding identity"));
    }
}
