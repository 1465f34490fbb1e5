//! SSH local port forward to the database host, carried by an in-process `russh` client.
//!
//! The session authenticates with the configured private key, then a loopback
//! listener hands every accepted connection to its own `direct-tcpip` channel.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client;
use russh_keys::key::{KeyPair, PublicKey};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::config::TunnelConfig;
use crate::error::BrokerError;

/// Longest `stop` waits for the forwarding task and the SSH disconnect.
const STOP_GRACE: Duration = Duration::from_secs(2);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

type SshSession = Arc<Mutex<client::Handle<HostKeyCheck>>>;

struct Forward {
    local_port: u16,
    session: SshSession,
    cancel: CancellationToken,
    accept_loop: JoinHandle<()>,
}

impl Forward {
    /// Stop accepting, end every forwarded connection, and wait a bounded time for
    /// the accept loop and the SSH session to finish.
    async fn close(self) {
        self.cancel.cancel();
        let accept_loop = self.accept_loop.abort_handle();

        let disconnect = async {
            let session = self.session.lock().await;
            session
                .disconnect(russh::Disconnect::ByApplication, "tunnel closed", "en")
                .await
        };
        match timeout(STOP_GRACE, disconnect).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!("SSH session already gone: {e}"),
            Err(_) => tracing::debug!("SSH disconnect did not finish within {STOP_GRACE:?}"),
        }
        if timeout(STOP_GRACE, self.accept_loop).await.is_err() {
            tracing::debug!("tunnel accept loop did not stop within {STOP_GRACE:?}; aborting");
            accept_loop.abort();
        }
    }

    /// Cancel without waiting; used where the caller cannot await.
    fn abort(&self) {
        self.cancel.cancel();
        self.accept_loop.abort();
    }

    fn is_alive(&self) -> bool {
        if self.cancel.is_cancelled() || self.accept_loop.is_finished() {
            return false;
        }
        // A busy lock means a channel is being opened, so the session is still up.
        self.session
            .try_lock()
            .map_or(true, |session| !session.is_closed())
    }
}

enum TunnelState {
    Stopped,
    Running(Forward),
}

/// One local forward from an ephemeral loopback port to the database endpoint.
pub struct TunnelSession {
    config: TunnelConfig,
    state: TunnelState,
}

impl std::fmt::Debug for TunnelSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelSession")
            .field("remote", &self.remote_endpoint())
            .field("local_port", &self.local_port())
            .finish()
    }
}

impl TunnelSession {
    #[must_use]
    pub fn new(config: TunnelConfig) -> Self {
        Self {
            config,
            state: TunnelState::Stopped,
        }
    }

    #[must_use]
    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    /// Bound loopback port while running.
    #[must_use]
    pub fn local_port(&self) -> Option<u16> {
        match &self.state {
            TunnelState::Running(forward) => Some(forward.local_port),
            TunnelState::Stopped => None,
        }
    }

    /// `db_host:db_port via user@ssh_host:ssh_port`, for diagnostics.
    #[must_use]
    pub fn remote_endpoint(&self) -> String {
        format!(
            "{}:{} via {}@{}:{}",
            self.config.remote_host,
            self.config.remote_port,
            self.config.ssh_user,
            self.config.ssh_host,
            self.config.ssh_port
        )
    }

    /// Connect and authenticate to the SSH server, then start forwarding.
    ///
    /// Returns the bound local port. Calling it on a running session returns the
    /// existing port. Must run inside a tokio runtime; the forwarding tasks are
    /// spawned onto it.
    ///
    /// # Errors
    /// Returns `BrokerError::Tunnel` if the key cannot be loaded, the server is
    /// unreachable or rejects the host key or the key, or the whole handshake misses
    /// the `connect_timeout` deadline.
    pub async fn start(&mut self) -> Result<u16, BrokerError> {
        if let Some(port) = self.local_port() {
            return Ok(port);
        }

        let limit = self.config.connect_timeout;
        let opened = match timeout(limit, open_forward(&self.config)).await {
            Ok(opened) => opened,
            Err(_) => Err(format!("handshake not finished within {limit:?}")),
        };
        match opened {
            Ok(forward) => {
                let local_port = forward.local_port;
                tracing::warn!(
                    remote = %self.remote_endpoint(),
                    "SSH tunnel established on local port {local_port}."
                );
                self.state = TunnelState::Running(forward);
                Ok(local_port)
            }
            Err(reason) => {
                let message = format!("ssh forward to {} failed: {reason}", self.remote_endpoint());
                tracing::error!("{message}");
                Err(BrokerError::Tunnel(message))
            }
        }
    }

    /// Tear down the forward, waiting a bounded time for its tasks to finish.
    /// Safe to call on a stopped session.
    pub async fn stop(&mut self) {
        if let TunnelState::Running(forward) =
            std::mem::replace(&mut self.state, TunnelState::Stopped)
        {
            let local_port = forward.local_port;
            forward.close().await;
            tracing::warn!("SSH tunnel on local port {local_port} closed.");
        }
    }

    /// Cancel the forward without waiting for it.
    pub fn abort(&mut self) {
        if let TunnelState::Running(forward) =
            std::mem::replace(&mut self.state, TunnelState::Stopped)
        {
            forward.abort();
            tracing::warn!("SSH tunnel on local port {} closed.", forward.local_port);
        }
    }

    /// True while the SSH session and the accept loop are alive. A session that
    /// dropped on its own is logged and the tunnel moves to the stopped state.
    pub fn is_running(&mut self) -> bool {
        let alive = match &self.state {
            TunnelState::Stopped => return false,
            TunnelState::Running(forward) => forward.is_alive(),
        };
        if !alive {
            tracing::error!(remote = %self.remote_endpoint(), "SSH tunnel was lost");
            self.abort();
        }
        alive
    }
}

impl Drop for TunnelSession {
    fn drop(&mut self) {
        if let TunnelState::Running(forward) = &self.state {
            forward.abort();
        }
    }
}

/// Host key policy: keys recorded in `known_hosts` must match; unrecorded keys are
/// accepted only when strict checking is off.
struct HostKeyCheck {
    host: String,
    port: u16,
    strict: bool,
    known_hosts: Option<PathBuf>,
}

impl HostKeyCheck {
    fn new(config: &TunnelConfig) -> Self {
        Self {
            host: config.ssh_host.clone(),
            port: config.ssh_port,
            strict: config.strict_host_key_checking,
            known_hosts: config.known_hosts.clone(),
        }
    }
}

#[async_trait]
impl client::Handler for HostKeyCheck {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let recorded = match &self.known_hosts {
            Some(path) => {
                russh_keys::check_known_hosts_path(&self.host, self.port, server_public_key, path)
            }
            None => russh_keys::check_known_hosts(&self.host, self.port, server_public_key),
        };
        let fingerprint = server_public_key.fingerprint();
        match recorded {
            Ok(true) => Ok(true),
            Err(russh_keys::Error::KeyChanged { line }) => {
                tracing::error!(
                    "host key for {} changed (known_hosts line {line}, now {fingerprint})",
                    self.host
                );
                Ok(false)
            }
            Ok(false) | Err(_) if !self.strict => {
                tracing::debug!("accepting unrecorded host key {fingerprint} for {}", self.host);
                Ok(true)
            }
            Ok(false) | Err(_) => {
                tracing::error!("host key {fingerprint} for {} is not in known_hosts", self.host);
                Ok(false)
            }
        }
    }
}

async fn open_forward(config: &TunnelConfig) -> Result<Forward, String> {
    let key = load_private_key(&config.key_path, config.key_passphrase.as_deref()).await?;

    let ssh_config = client::Config {
        keepalive_interval: Some(KEEPALIVE_INTERVAL),
        keepalive_max: 3,
        ..client::Config::default()
    };
    let mut session = client::connect(
        Arc::new(ssh_config),
        (config.ssh_host.as_str(), config.ssh_port),
        HostKeyCheck::new(config),
    )
    .await
    .map_err(|e| format!("could not establish the SSH session: {e}"))?;

    let authenticated = session
        .authenticate_publickey(config.ssh_user.as_str(), Arc::new(key))
        .await
        .map_err(|e| format!("key authentication failed: {e}"))?;
    if !authenticated {
        return Err(format!(
            "server rejected the key {} for {}",
            config.key_path.display(),
            config.ssh_user
        ));
    }

    let listener = TcpListener::bind(("127.0.0.1", 0))
        .await
        .map_err(|e| format!("could not bind a local port: {e}"))?;
    let local_port = listener
        .local_addr()
        .map_err(|e| format!("could not read the local port: {e}"))?
        .port();

    let session = Arc::new(Mutex::new(session));
    let cancel = CancellationToken::new();
    let accept_loop = tokio::spawn(accept_loop(
        listener,
        Arc::clone(&session),
        config.remote_host.clone(),
        config.remote_port,
        cancel.clone(),
    ));

    Ok(Forward {
        local_port,
        session,
        cancel,
        accept_loop,
    })
}

async fn load_private_key(path: &Path, passphrase: Option<&str>) -> Result<KeyPair, String> {
    let pem = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| format!("cannot read key file {}: {e}", path.display()))?;
    russh_keys::decode_secret_key(&pem, passphrase)
        .map_err(|e| format!("cannot decode key file {}: {e}", path.display()))
}

async fn accept_loop(
    listener: TcpListener,
    session: SshSession,
    remote_host: String,
    remote_port: u16,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((local, peer)) => {
                    tracing::debug!("forwarding connection from {peer}");
                    let session = Arc::clone(&session);
                    let remote_host = remote_host.clone();
                    let cancel = cancel.clone();
                    tokio::spawn(async move {
                        let forwarded = forward_connection(
                            local,
                            peer.port(),
                            &session,
                            &remote_host,
                            remote_port,
                            &cancel,
                        )
                        .await;
                        if let Err(e) = forwarded {
                            tracing::warn!("tunnel forwarding error: {e}");
                        }
                    });
                }
                Err(e) => tracing::error!("failed to accept tunnel connection: {e}"),
            },
            () = cancel.cancelled() => break,
        }
    }
}

async fn forward_connection(
    mut local: TcpStream,
    local_peer_port: u16,
    session: &SshSession,
    remote_host: &str,
    remote_port: u16,
    cancel: &CancellationToken,
) -> Result<(), String> {
    let channel = {
        let session = session.lock().await;
        session
            .channel_open_direct_tcpip(
                remote_host,
                u32::from(remote_port),
                "127.0.0.1",
                u32::from(local_peer_port),
            )
            .await
            .map_err(|e| format!("could not open a channel to {remote_host}:{remote_port}: {e}"))?
    };
    let mut remote = channel.into_stream();

    tokio::select! {
        copied = tokio::io::copy_bidirectional(&mut local, &mut remote) => {
            copied.map(|_| ()).map_err(|e| e.to_string())
        }
        () = cancel.cancelled() => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(ssh_port: u16, key_path: PathBuf) -> TunnelConfig {
        TunnelConfig {
            ssh_host: "127.0.0.1".into(),
            ssh_port,
            ssh_user: "deploy".into(),
            key_path,
            key_passphrase: None,
            remote_host: "127.0.0.1".into(),
            remote_port: 5432,
            strict_host_key_checking: false,
            known_hosts: None,
            connect_timeout: Duration::from_millis(500),
        }
    }

    #[tokio::test]
    async fn unreadable_key_is_a_tunnel_error() {
        let mut session = TunnelSession::new(config(22, PathBuf::from("/nonexistent/id_ed25519")));
        let err = session.start().await.unwrap_err();
        assert!(
            matches!(err, BrokerError::Tunnel(ref msg) if msg.contains("cannot read key file")),
            "got {err:?}"
        );
        assert_eq!(session.local_port(), None);
    }

    #[tokio::test]
    async fn garbage_key_is_a_tunnel_error() {
        let mut key = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut key, b"not a private key\n").unwrap();
        let mut session = TunnelSession::new(config(22, key.path().to_path_buf()));
        let err = session.start().await.unwrap_err();
        assert!(matches!(err, BrokerError::Tunnel(ref msg) if msg.contains("cannot decode")));
    }

    #[tokio::test]
    async fn refused_connection_is_a_tunnel_error() {
        let key = tempfile::NamedTempFile::new().unwrap();
        russh_keys::encode_pkcs8_pem(&KeyPair::generate_ed25519(), key.as_file()).unwrap();

        // Bind then drop to get a loopback port nothing listens on.
        let port = TcpListener::bind(("127.0.0.1", 0))
            .await
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let mut session = TunnelSession::new(config(port, key.path().to_path_buf()));
        let err = session.start().await.unwrap_err();
        assert!(matches!(err, BrokerError::Tunnel(ref msg) if msg.contains("SSH session")));
        assert!(!session.is_running());
    }

    #[tokio::test]
    async fn silent_server_hits_the_handshake_deadline() {
        let key = tempfile::NamedTempFile::new().unwrap();
        russh_keys::encode_pkcs8_pem(&KeyPair::generate_ed25519(), key.as_file()).unwrap();

        // Accepts TCP but never speaks SSH.
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let silent = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let mut session = TunnelSession::new(config(port, key.path().to_path_buf()));
        let started = tokio::time::Instant::now();
        let err = session.start().await.unwrap_err();
        assert!(matches!(err, BrokerError::Tunnel(ref msg) if msg.contains("not finished within")));
        assert!(started.elapsed() < Duration::from_secs(5));
        silent.abort();
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let mut session = TunnelSession::new(config(22, PathBuf::from("/keys/id_ed25519")));
        session.stop().await;
        session.stop().await;
        session.abort();
        assert_eq!(session.local_port(), None);
        assert!(!session.is_running());
    }
}
