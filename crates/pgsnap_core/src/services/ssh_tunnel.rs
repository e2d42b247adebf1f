//! SSH tunnel to a database reachable only from a bastion host.
//!
//! A local listener on `127.0.0.1:<ephemeral>` accepts connections and
//! forwards each one over its own SSH `direct-tcpip` channel.

use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client;
use russh::Disconnect;
use russh_keys::key::KeyPair;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{SnapError, SnapResult};
use crate::models::SshBastion;
use crate::services::scope::Release;

/// Pause after a failed accept; errors such as EMFILE tend to repeat at once.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Byte stream carried by a tunnel channel.
pub trait TunnelStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> TunnelStream for T {}

/// Opens the remote side of one forwarded connection.
#[async_trait]
pub trait ChannelOpener: Send + Sync {
    async fn open(&self, host: &str, port: u16) -> SnapResult<Box<dyn TunnelStream>>;
}

/// Source of local connections for the accept loop.
#[async_trait]
trait Incoming: Send {
    async fn accept(&mut self) -> io::Result<(TcpStream, SocketAddr)>;
}

#[async_trait]
impl Incoming for TcpListener {
    async fn accept(&mut self) -> io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(&*self).await
    }
}

/// SSH client handler for russh.
struct SshClientHandler {
    host: String,
    port: u16,
    known_hosts: Option<PathBuf>,
}

#[async_trait]
impl client::Handler for SshClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh_keys::key::PublicKey,
    ) -> Result<bool, Self::Error> {
        let Some(path) = &self.known_hosts else {
            tracing::debug!(host = %self.host, "No known_hosts configured; accepting server key");
            return Ok(true);
        };

        match russh_keys::check_known_hosts_path(&self.host, self.port, server_public_key, path) {
            Ok(true) => Ok(true),
            Ok(false) => {
                tracing::error!(
                    host = %self.host,
                    known_hosts = %path.display(),
                    "Server key not found in known_hosts"
                );
                Ok(false)
            }
            Err(e) => {
                tracing::error!(host = %self.host, error = %e, "Server key verification failed");
                Ok(false)
            }
        }
    }
}

type SshHandle = Arc<Mutex<client::Handle<SshClientHandler>>>;

/// Opens `direct-tcpip` channels on an authenticated SSH session.
struct SshChannelOpener {
    handle: SshHandle,
}

#[async_trait]
impl ChannelOpener for SshChannelOpener {
    async fn open(&self, host: &str, port: u16) -> SnapResult<Box<dyn TunnelStream>> {
        let channel = {
            let handle = self.handle.lock().await;
            handle
                .channel_open_direct_tcpip(host, u32::from(port), "127.0.0.1", 0)
                .await
                .map_err(|e| {
                    SnapError::ssh_with_source(
                        format!("Failed to open SSH channel to {host}:{port}"),
                        "The SSH server may not allow TCP forwarding",
                        e,
                    )
                })?
        };

        Ok(Box::new(Box::pin(channel.into_stream())))
    }
}

/// A running tunnel.
pub struct TunnelSession {
    local_port: u16,
    remote: String,
    cancel: CancellationToken,
    accept_task: Option<JoinHandle<()>>,
    ssh: Option<SshHandle>,
}

impl TunnelSession {
    /// Bind `127.0.0.1:0` and forward accepted connections through `opener`.
    pub async fn bind(
        opener: Arc<dyn ChannelOpener>,
        remote_host: &str,
        remote_port: u16,
    ) -> SnapResult<Self> {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.map_err(|e| {
            SnapError::ssh_with_source(
                "Failed to bind local port for SSH tunnel",
                "Check that loopback networking is available",
                e,
            )
        })?;
        let local_port = listener.local_addr()?.port();

        let cancel = CancellationToken::new();
        let accept_task = tokio::spawn(run_tunnel(
            listener,
            opener,
            remote_host.to_string(),
            remote_port,
            cancel.clone(),
        ));

        tracing::info!(local_port, remote = %format!("{remote_host}:{remote_port}"), "Tunnel listening");

        Ok(Self {
            local_port,
            remote: format!("{remote_host}:{remote_port}"),
            cancel,
            accept_task: Some(accept_task),
            ssh: None,
        })
    }

    /// Local port accepting tunneled connections.
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Stop the listener, then disconnect the SSH session.
    ///
    /// Safe to call repeatedly. The disconnect runs even when stopping the
    /// listener failed; the first failure is returned.
    pub async fn close(&mut self) -> SnapResult<()> {
        let mut first_error = None;

        self.cancel.cancel();
        if let Some(task) = self.accept_task.take() {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    first_error = Some(SnapError::internal(format!("Tunnel accept loop failed: {e}")));
                }
            }
        }

        if let Some(handle) = self.ssh.take() {
            let handle = handle.lock().await;
            if let Err(e) = handle.disconnect(Disconnect::ByApplication, "", "English").await {
                tracing::warn!(error = %e, "SSH disconnect failed");
                first_error.get_or_insert(SnapError::from(e));
            }
        }

        tracing::info!(local_port = self.local_port, remote = %self.remote, "Tunnel closed");

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for TunnelSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[async_trait]
impl Release for TunnelSession {
    fn label(&self) -> &str {
        "ssh tunnel"
    }

    async fn release(&mut self) -> SnapResult<()> {
        self.close().await
    }

    fn release_now(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
    }
}

/// Establishes tunnels through an SSH bastion.
pub struct SshTunnelService;

impl SshTunnelService {
    /// Authenticate to `bastion` and start forwarding to `remote_host:remote_port`.
    ///
    /// Session establishment is bounded by the bastion's connect timeout.
    pub async fn open(
        bastion: &SshBastion,
        remote_host: &str,
        remote_port: u16,
    ) -> SnapResult<TunnelSession> {
        tracing::info!(
            bastion = %bastion.display_target(),
            remote = %format!("{remote_host}:{remote_port}"),
            "Establishing SSH tunnel"
        );

        let handle = tokio::time::timeout(bastion.connect_timeout, Self::connect_ssh(bastion))
            .await
            .map_err(|_| {
                SnapError::ssh_with_hint(
                    format!(
                        "Timed out after {}s connecting to SSH server {}",
                        bastion.connect_timeout.as_secs(),
                        bastion.display_target()
                    ),
                    "Verify the bastion host is reachable; raise SSH_CONNECT_TIMEOUT_SECS if it is slow",
                )
            })??;
        let handle = Arc::new(Mutex::new(handle));

        let opener = Arc::new(SshChannelOpener { handle: Arc::clone(&handle) });
        let mut session = match TunnelSession::bind(opener, remote_host, remote_port).await {
            Ok(session) => session,
            Err(e) => {
                let handle = handle.lock().await;
                let _ = handle.disconnect(Disconnect::ByApplication, "", "English").await;
                return Err(e);
            }
        };
        session.ssh = Some(handle);
        Ok(session)
    }

    /// Connect and authenticate to the SSH server.
    async fn connect_ssh(bastion: &SshBastion) -> SnapResult<client::Handle<SshClientHandler>> {
        let config = Arc::new(client::Config::default());
        let handler = SshClientHandler {
            host: bastion.host.clone(),
            port: bastion.port,
            known_hosts: bastion.known_hosts_path.clone(),
        };

        let mut handle = client::connect(config, (bastion.host.as_str(), bastion.port), handler)
            .await
            .map_err(|e| {
                let hint = if bastion.known_hosts_path.is_some() {
                    "Verify the SSH server is reachable and its key is listed in SSH_KNOWN_HOSTS_PATH"
                } else {
                    "Verify the SSH server is running and reachable"
                };
                SnapError::ssh_with_source(
                    format!("Failed to connect to SSH server {}", bastion.display_target()),
                    hint,
                    e,
                )
            })?;

        let key = Self::load_private_key(&bastion.key_path, bastion.key_passphrase.as_deref()).await?;
        let authenticated = handle
            .authenticate_publickey(bastion.username.as_str(), key)
            .await
            .map_err(|e| {
                SnapError::ssh_with_source(
                    "SSH key authentication failed",
                    "Verify your SSH key is valid and has the correct permissions",
                    e,
                )
            })?;

        if !authenticated {
            return Err(SnapError::ssh_with_hint(
                format!("SSH authentication rejected for {}", bastion.display_target()),
                "Check that the public key is authorized for this user on the bastion",
            ));
        }

        tracing::info!(bastion = %bastion.display_target(), "SSH authentication successful");
        Ok(handle)
    }

    /// Load a private key from a file.
    async fn load_private_key(path: &Path, passphrase: Option<&str>) -> SnapResult<Arc<KeyPair>> {
        let key_data = tokio::fs::read_to_string(path).await.map_err(|e| {
            SnapError::ssh_with_source(
                format!("Failed to read SSH key file {}", path.display()),
                "Check that the key file exists and is readable",
                e,
            )
        })?;

        let key = russh_keys::decode_secret_key(&key_data, passphrase).map_err(|e| {
            let hint = if passphrase.is_some() {
                "Check your key passphrase is correct"
            } else {
                "The key may be encrypted; set SSH_KEY_PASSPHRASE"
            };
            SnapError::ssh_with_source("Failed to decode SSH key", hint, e)
        })?;

        Ok(Arc::new(key))
    }
}

/// Accept loop; owns the listener until cancelled.
async fn run_tunnel<I: Incoming>(
    mut incoming: I,
    opener: Arc<dyn ChannelOpener>,
    remote_host: String,
    remote_port: u16,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            accepted = incoming.accept() => {
                match accepted {
                    Ok((local_stream, peer_addr)) => {
                        tracing::debug!(peer = %peer_addr, "Tunnel connection accepted");

                        let opener = Arc::clone(&opener);
                        let remote_host = remote_host.clone();
                        let cancel = cancel.clone();
                        tokio::spawn(async move {
                            if let Err(e) = forward_connection(
                                local_stream,
                                opener.as_ref(),
                                &remote_host,
                                remote_port,
                                cancel,
                            )
                            .await
                            {
                                tracing::warn!(peer = %peer_addr, error = %e, "Tunnel forwarding error");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to accept tunnel connection");
                        tokio::select! {
                            _ = tokio::time::sleep(ACCEPT_ERROR_BACKOFF) => {}
                            _ = cancel.cancelled() => break,
                        }
                    }
                }
            }
            _ = cancel.cancelled() => {
                tracing::debug!("Tunnel accept loop stopped");
                break;
            }
        }
    }
}

/// Splice one local connection with its channel until both directions finish.
async fn forward_connection(
    mut local_stream: TcpStream,
    opener: &dyn ChannelOpener,
    remote_host: &str,
    remote_port: u16,
    cancel: CancellationToken,
) -> SnapResult<()> {
    // On failure the local stream is dropped here, closing only this connection.
    let mut remote = opener.open(remote_host, remote_port).await?;

    tokio::select! {
        copied = tokio::io::copy_bidirectional(&mut local_stream, &mut remote) => {
            let (to_remote, to_local) = copied?;
            tracing::debug!(to_remote, to_local, "Tunnel connection finished");
        }
        _ = cancel.cancelled() => {}
    }

    Ok(())
}

/// Opens plain TCP connections in place of SSH channels.
#[cfg(test)]
pub(crate) struct TcpOpener;

#[cfg(test)]
#[async_trait]
impl ChannelOpener for TcpOpener {
    async fn open(&self, host: &str, port: u16) -> SnapResult<Box<dyn TunnelStream>> {
        let stream = TcpStream::connect((host, port)).await?;
        Ok(Box::new(stream))
    }
}

/// Spawn a TCP echo server; returns its port.
#[cfg(test)]
pub(crate) async fn spawn_echo_server() -> u16 {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.into_split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    port
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use russh::server::{self, Auth, Msg, Session};
    use russh::Channel;
    use russh_keys::key::PublicKey;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn echo_through(port: u16, payload: Vec<u8>) -> Vec<u8> {
        let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let (mut reader, mut writer) = stream.into_split();

        let write = tokio::spawn(async move {
            writer.write_all(&payload).await.unwrap();
            writer.shutdown().await.unwrap();
        });

        let mut echoed = Vec::new();
        reader.read_to_end(&mut echoed).await.unwrap();
        write.await.unwrap();
        echoed
    }

    /// Fails the first open, then behaves like [`TcpOpener`].
    struct FlakyOpener {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ChannelOpener for FlakyOpener {
        async fn open(&self, host: &str, port: u16) -> SnapResult<Box<dyn TunnelStream>> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(SnapError::ssh_with_hint("channel refused", "administratively prohibited"));
            }
            TcpOpener.open(host, port).await
        }
    }

    #[tokio::test]
    async fn test_large_payload_echoes_unmodified() {
        let echo_port = spawn_echo_server().await;
        let mut session = TunnelSession::bind(Arc::new(TcpOpener), "127.0.0.1", echo_port)
            .await
            .unwrap();
        assert_ne!(session.local_port(), 0);

        let payload: Vec<u8> = (0..(1024 * 1024 + 7)).map(|i| (i % 251) as u8).collect();
        let echoed = echo_through(session.local_port(), payload.clone()).await;
        assert_eq!(echoed.len(), payload.len());
        assert!(echoed == payload);

        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_channel_keeps_listener_alive() {
        let echo_port = spawn_echo_server().await;
        let opener = Arc::new(FlakyOpener { calls: AtomicUsize::new(0) });
        let mut session =
            TunnelSession::bind(opener.clone(), "127.0.0.1", echo_port).await.unwrap();

        // First connection is closed without data.
        let mut first = TcpStream::connect(("127.0.0.1", session.local_port())).await.unwrap();
        let mut buf = Vec::new();
        let read = first.read_to_end(&mut buf).await;
        assert!(read.map(|n| n == 0).unwrap_or(true));

        let echoed = echo_through(session.local_port(), b"hello".to_vec()).await;
        assert_eq!(echoed, b"hello");
        assert_eq!(opener.calls.load(Ordering::SeqCst), 2);

        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let echo_port = spawn_echo_server().await;
        let mut session = TunnelSession::bind(Arc::new(TcpOpener), "127.0.0.1", echo_port)
            .await
            .unwrap();

        session.close().await.unwrap();
        session.close().await.unwrap();
        assert!(session.accept_task.is_none());
    }

    #[tokio::test]
    async fn test_release_through_stack_stops_listener() {
        use crate::services::scope::ResourceStack;

        let echo_port = spawn_echo_server().await;
        let session = TunnelSession::bind(Arc::new(TcpOpener), "127.0.0.1", echo_port)
            .await
            .unwrap();
        let port = session.local_port();

        let mut stack = ResourceStack::new();
        stack.push(session);
        assert!(stack.release_all().await.is_empty());

        assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
    }

    /// Fails every accept and counts the attempts.
    struct FailingIncoming {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Incoming for FailingIncoming {
        async fn accept(&mut self) -> io::Result<(TcpStream, SocketAddr)> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(io::Error::new(io::ErrorKind::Other, "too many open files"))
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_accept_errors_back_off() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_tunnel(
            FailingIncoming { calls: Arc::clone(&calls) },
            Arc::new(TcpOpener),
            "127.0.0.1".to_string(),
            9,
            cancel.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(350)).await;
        cancel.cancel();
        task.await.unwrap();

        let attempts = calls.load(Ordering::SeqCst);
        assert!((1..=10).contains(&attempts), "accept attempted {attempts} times");
    }

    // =========================================================================
    // In-process SSH server
    // =========================================================================

    /// Accepts any key and forwards `direct-tcpip` channels to their target.
    #[derive(Clone)]
    struct ForwardingServer {
        refusals: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl server::Handler for ForwardingServer {
        type Error = russh::Error;

        async fn auth_publickey(&mut self, _user: &str, _key: &PublicKey) -> Result<Auth, Self::Error> {
            Ok(Auth::Accept)
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
            let refused = self
                .refusals
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if refused {
                return Ok(false);
            }

            let mut target = TcpStream::connect((host_to_connect, port_to_connect as u16)).await?;
            tokio::spawn(async move {
                let mut stream = Box::pin(channel.into_stream());
                let _ = tokio::io::copy_bidirectional(&mut stream, &mut target).await;
            });
            Ok(true)
        }
    }

    struct SshFixture {
        port: u16,
        host_key: PublicKey,
        dir: tempfile::TempDir,
        bastion: SshBastion,
    }

    /// Start an SSH server refusing the first `refusals` channels, and write a
    /// client key plus a known_hosts entry for it.
    async fn spawn_ssh_server(refusals: usize) -> SshFixture {
        let host_key = KeyPair::generate_ed25519();
        let host_public = host_key.clone_public_key().unwrap();
        let config = Arc::new(server::Config {
            keys: vec![host_key],
            inactivity_timeout: None,
            auth_rejection_time: Duration::from_millis(10),
            ..Default::default()
        });
        let handler = ForwardingServer { refusals: Arc::new(AtomicUsize::new(refusals)) };

        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let config = Arc::clone(&config);
                let handler = handler.clone();
                tokio::spawn(async move {
                    if let Ok(session) = server::run_stream(config, stream, handler).await {
                        let _ = session.await;
                    }
                });
            }
        });

        let dir = tempfile::tempdir().unwrap();
        let key_path = dir.path().join("id_ed25519");
        let client_key = KeyPair::generate_ed25519();
        let mut pem = Vec::new();
        russh_keys::encode_pkcs8_pem(&client_key, &mut pem).unwrap();
        std::fs::write(&key_path, pem).unwrap();

        let known_hosts = dir.path().join("known_hosts");
        russh_keys::known_hosts::learn_known_hosts_path("127.0.0.1", port, &host_public, &known_hosts)
            .unwrap();

        let mut bastion = SshBastion::new("127.0.0.1", "tunnel", key_path).with_port(port);
        bastion.known_hosts_path = Some(known_hosts);
        bastion.connect_timeout = Duration::from_secs(10);

        SshFixture { port, host_key: host_public, dir, bastion }
    }

    #[tokio::test]
    async fn test_ssh_tunnel_carries_large_payload() {
        let echo_port = spawn_echo_server().await;
        let fixture = spawn_ssh_server(0).await;
        let mut session = SshTunnelService::open(&fixture.bastion, "127.0.0.1", echo_port)
            .await
            .unwrap();

        let payload: Vec<u8> = (0..(3 * 1024 * 1024 + 13)).map(|i| (i % 241) as u8).collect();
        let echoed = echo_through(session.local_port(), payload.clone()).await;
        assert_eq!(echoed.len(), payload.len());
        assert!(echoed == payload);

        session.close().await.unwrap();
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_ssh_refused_channel_keeps_listener_alive() {
        let echo_port = spawn_echo_server().await;
        let fixture = spawn_ssh_server(1).await;
        let mut session = SshTunnelService::open(&fixture.bastion, "127.0.0.1", echo_port)
            .await
            .unwrap();

        // The refused channel closes only its own local connection.
        let mut first = TcpStream::connect(("127.0.0.1", session.local_port())).await.unwrap();
        let mut buf = Vec::new();
        let read = first.read_to_end(&mut buf).await;
        assert!(read.map(|n| n == 0).unwrap_or(true));

        let echoed = echo_through(session.local_port(), b"after refusal".to_vec()).await;
        assert_eq!(echoed, b"after refusal");

        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_ssh_changed_host_key_is_rejected() {
        let fixture = spawn_ssh_server(0).await;
        assert_eq!(fixture.bastion.port, fixture.port);

        // Replace the recorded key with one the server does not hold.
        let known_hosts = fixture.dir.path().join("known_hosts");
        std::fs::remove_file(&known_hosts).unwrap();
        let stranger = KeyPair::generate_ed25519().clone_public_key().unwrap();
        assert_ne!(stranger, fixture.host_key);
        russh_keys::known_hosts::learn_known_hosts_path("127.0.0.1", fixture.port, &stranger, &known_hosts)
            .unwrap();

        let err = match SshTunnelService::open(&fixture.bastion, "127.0.0.1", 9).await {
            Ok(_) => panic!("tunnel opened despite a changed host key"),
            Err(e) => e,
        };
        assert_eq!(err.category(), "SSH");
    }
}
