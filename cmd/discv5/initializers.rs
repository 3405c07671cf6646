use std::{fs, path::Path};

use ethrex_discv5::Discv5Config;
use eyre::WrapErr;
use rand::rngs::OsRng;
use secp256k1::SecretKey;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, filter::Directive};

use crate::cli::Options;

pub fn init_tracing(opts: &Options) {
    let log_filter = EnvFilter::builder()
        .with_default_directive(Directive::from(opts.log_level))
        .from_env_lossy();
    tracing_subscriber::fmt().with_env_filter(log_filter).init();
}

/// Loads the node key from `<datadir>/node.key`, creating it on first run.
pub fn get_signer(datadir: &Path) -> eyre::Result<SecretKey> {
    let key_path = datadir.join("node.key");
    match fs::read_to_string(&key_path) {
        Ok(content) => {
            let bytes = hex::decode(content.trim()).wrap_err("node key is not valid hex")?;
            SecretKey::from_slice(&bytes).wrap_err("node key is not a valid secp256k1 key")
        }
        Err(_) => {
            info!(path = ?key_path, "Key file not found, creating a new key");
            fs::create_dir_all(datadir).wrap_err("key file path could not be created")?;
            let signer = SecretKey::new(&mut OsRng);
            fs::write(&key_path, hex::encode(signer.secret_bytes()))
                .wrap_err("newly created key could not be saved")?;
            Ok(signer)
        }
    }
}

pub fn get_config(opts: &Options) -> Discv5Config {
    if opts.bootnodes.is_empty() {
        warn!("No bootnodes specified. This node will only be reachable by nodes that know it.");
    }
    Discv5Config {
        listen_ip: opts.discovery_addr,
        udp_port: opts.discovery_port,
        external_ip: opts.external_addr,
        bootnodes: opts.bootnodes.clone(),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signer_is_persisted() {
        let datadir = tempfile::tempdir().unwrap();
        let first = get_signer(datadir.path()).unwrap();
        let second = get_signer(datadir.path()).unwrap();
        assert_eq!(first.secret_bytes(), second.secret_bytes());
    }

    #[test]
    fn corrupt_key_is_an_error() {
        let datadir = tempfile::tempdir().unwrap();
        fs::write(datadir.path().join("node.key"), "not hex").unwrap();
        assert!(get_signer(datadir.path()).is_err());
    }
}
