use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use russh::server::{self, Auth, Msg, Session};
use russh::{Channel, MethodSet};
use russh_keys::key::{KeyPair, PublicKey};
use tempfile::NamedTempFile;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::SHARED_RUNTIME;
use crate::config::TunnelConfig;

/// In-process SSH server that accepts one client key and serves `direct-tcpip`
/// channels, standing in for a bastion host.
pub struct TestBastion {
    pub port: u16,
    client_key: NamedTempFile,
    sessions: Arc<AtomicUsize>,
    cancel: CancellationToken,
    server: JoinHandle<()>,
}

impl TestBastion {
    /// Listen on an ephemeral loopback port with a fresh host key and a fresh
    /// client key written to a temporary PKCS#8 file.
    ///
    /// # Errors
    /// Returns an error if the key file or the listener cannot be created.
    pub async fn start() -> Result<Self, Box<dyn std::error::Error>> {
        let client = KeyPair::generate_ed25519();
        let authorized = client.clone_public_key()?;
        let client_key = NamedTempFile::new()?;
        russh_keys::encode_pkcs8_pem(&client, client_key.as_file())?;

        let config = Arc::new(server::Config {
            keys: vec![KeyPair::generate_ed25519()],
            methods: MethodSet::PUBLICKEY,
            auth_rejection_time: Duration::from_millis(10),
            auth_rejection_time_initial: Some(Duration::ZERO),
            inactivity_timeout: None,
            ..server::Config::default()
        });
        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let port = listener.local_addr()?.port();
        let sessions = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        let server = tokio::spawn(serve(
            listener,
            config,
            authorized,
            Arc::clone(&sessions),
            cancel.clone(),
        ));

        Ok(Self {
            port,
            client_key,
            sessions,
            cancel,
            server,
        })
    }

    /// SSH sessions currently connected.
    #[must_use]
    pub fn open_sessions(&self) -> usize {
        self.sessions.load(Ordering::SeqCst)
    }

    /// Tunnel settings that reach `remote_host:remote_port` through this bastion.
    #[must_use]
    pub fn tunnel_config(&self, remote_host: &str, remote_port: u16) -> TunnelConfig {
        TunnelConfig {
            ssh_host: "127.0.0.1".to_string(),
            ssh_port: self.port,
            ssh_user: "tester".to_string(),
            key_path: self.client_key.path().to_path_buf(),
            key_passphrase: None,
            remote_host: remote_host.to_string(),
            remote_port,
            strict_host_key_checking: false,
            known_hosts: None,
            connect_timeout: Duration::from_secs(5),
        }
    }

    /// Stop accepting SSH connections and end open sessions.
    pub fn stop(self) {
        self.cancel.cancel();
        self.server.abort();
    }
}

/// Blocking form of [`TestBastion::start`]; the server runs on the shared test runtime.
///
/// # Errors
/// See [`TestBastion::start`].
pub fn start_test_bastion() -> Result<TestBastion, Box<dyn std::error::Error>> {
    SHARED_RUNTIME.block_on(TestBastion::start())
}

async fn serve(
    listener: TcpListener,
    config: Arc<server::Config>,
    authorized: PublicKey,
    sessions: Arc<AtomicUsize>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let Ok((stream, _)) = accepted else { continue };
                let config = Arc::clone(&config);
                let handler = BastionHandler { authorized: authorized.clone() };
                let sessions = Arc::clone(&sessions);
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    sessions.fetch_add(1, Ordering::SeqCst);
                    match server::run_stream(config, stream, handler).await {
                        Ok(session) => {
                            tokio::select! {
                                _ = session => {}
                                () = cancel.cancelled() => {}
                            }
                        }
                        Err(e) => tracing::debug!("test bastion handshake failed: {e}"),
                    }
                    sessions.fetch_sub(1, Ordering::SeqCst);
                });
            }
            () = cancel.cancelled() => break,
        }
    }
}

struct BastionHandler {
    authorized: PublicKey,
}

#[async_trait]
impl server::Handler for BastionHandler {
    type Error = russh::Error;

    async fn auth_publickey(
        &mut self,
        _user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        if *public_key == self.authorized {
            Ok(Auth::Accept)
        } else {
            Ok(Auth::Reject {
                proceed_with_methods: None,
            })
        }
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let Ok(port) = u16::try_from(port_to_connect) else {
            return Ok(false);
        };
        let Ok(mut upstream) = TcpStream::connect((host_to_connect, port)).await else {
            return Ok(false);
        };
        tokio::spawn(async move {
            let mut stream = channel.into_stream();
            let _ = tokio::io::copy_bidirectional(&mut stream, &mut upstream).await;
        });
        Ok(true)
    }
}
