//! TLS listener configuration from PEM files, with mtime-based hot reload.

use anyhow::{Context, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use std::fs;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::RwLock;
use tokio_rustls::TlsAcceptor;

const RELOAD_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Build a server config from a PEM certificate chain and private key.
pub fn build_server_config(chain_path: &Path, key_path: &Path) -> Result<ServerConfig> {
    let chain = load_certs(chain_path)?;
    let key = load_private_key(key_path)?;
    let mut cfg = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(chain, key)
        .with_context(|| "build TLS server config")?;
    cfg.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(cfg)
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = fs::File::open(path)
        .with_context(|| format!("open certificate chain {}", path.display()))?;
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<_, _>>()
        .with_context(|| format!("parse certificate chain {}", path.display()))?;
    if certs.is_empty() {
        anyhow::bail!("no certificates in {}", path.display());
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file =
        fs::File::open(path).with_context(|| format!("open private key {}", path.display()))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .with_context(|| format!("parse private key {}", path.display()))?
        .ok_or_else(|| anyhow::anyhow!("no private key in {}", path.display()))
}

/// Detects on-disk cert/key changes and rebuilds the server config.
#[derive(Debug, Clone)]
pub struct TlsReloader {
    chain_path: PathBuf,
    key_path: PathBuf,
    last_mtime: Option<SystemTime>,
}

impl TlsReloader {
    pub fn new(chain_path: PathBuf, key_path: PathBuf) -> Self {
        Self {
            chain_path,
            key_path,
            last_mtime: None,
        }
    }

    fn changed(&mut self) -> Result<bool> {
        let mtime = latest_mtime(&self.chain_path, &self.key_path)?;
        let changed = self.last_mtime.map(|prev| prev != mtime).unwrap_or(true);
        self.last_mtime = Some(mtime);
        Ok(changed)
    }

    /// Rebuild the config if any TLS material changed since the last check.
    pub fn reload_if_changed(&mut self) -> Result<Option<ServerConfig>> {
        if self.changed()? {
            return Ok(Some(build_server_config(&self.chain_path, &self.key_path)?));
        }
        Ok(None)
    }
}

fn latest_mtime(chain: &Path, key: &Path) -> Result<SystemTime> {
    let chain_mt = fs::metadata(chain)
        .with_context(|| format!("stat chain {}", chain.display()))?
        .modified()
        .with_context(|| format!("mtime chain {}", chain.display()))?;
    let key_mt = fs::metadata(key)
        .with_context(|| format!("stat key {}", key.display()))?
        .modified()
        .with_context(|| format!("mtime key {}", key.display()))?;
    Ok(chain_mt.max(key_mt))
}

/// Swap new certificates into a live acceptor as they appear on disk.
pub fn spawn_tls_hot_reload(acceptor: Arc<RwLock<TlsAcceptor>>, mut reloader: TlsReloader) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(RELOAD_CHECK_INTERVAL).await;
            match reloader.reload_if_changed() {
                Ok(Some(cfg)) => {
                    let mut guard = acceptor.write().await;
                    *guard = TlsAcceptor::from(Arc::new(cfg));
                    tracing::info!("reloaded TLS listener certificates");
                }
                Ok(None) => {}
                Err(err) => tracing::warn!("tls reload failed: {err:?}"),
            }
        }
    });
}
