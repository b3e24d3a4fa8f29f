use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use metrics::{counter, gauge};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    sync::Notify,
    time,
};

use crate::lodestone::{
    firewall::{self, FirewallClient},
    identity::IdentityResolver,
    net,
    protocol::{self, Classification},
    registry::{ConnectionRecord, ConnectionRegistry},
    reporter::ManagerReporter,
    routes::{self, RouteTable},
};

/// Shared collaborators and tuning for every session spawned by a listener.
pub struct SessionOptions {
    pub routes: Arc<RouteTable>,
    pub registry: Arc<ConnectionRegistry>,
    pub identity: Arc<IdentityResolver>,
    pub firewall: Option<Arc<FirewallClient>>,
    pub reporter: Option<Arc<ManagerReporter>>,

    pub initial_grace: Duration,
    pub coalesce_idle: Duration,
    pub max_initial_bytes: usize,
    pub dial_timeout: Duration,
    pub debug_marker: Option<String>,
}

pub async fn handle(conn: TcpStream, peer: SocketAddr, opts: Arc<SessionOptions>) {
    counter!("lodestone_connections_total").increment(1);
    gauge!("lodestone_active_sessions").increment(1.0);
    run(conn, peer, &opts).await;
    gauge!("lodestone_active_sessions").decrement(1.0);
}

async fn run(mut conn: TcpStream, peer: SocketAddr, opts: &SessionOptions) {
    let _ = conn.set_nodelay(true);

    // Coalesce the initial frames; clients routinely split the injected
    // header, handshake and Login Start across several segments.
    let buf = match read_initial(&mut conn, opts).await {
        Ok(buf) => buf,
        Err(err) => {
            tracing::debug!(client = %peer, err = %err, "session: initial read failed");
            close_counted(conn, "read_failed").await;
            return;
        }
    };

    let (client_ip, after_header) = match protocol::strip_client_address(&buf) {
        Ok(v) => v,
        Err(err) => {
            tracing::warn!(client = %peer, err = %err, "session: rejected stream without address header");
            reject(conn, &err.to_string(), "protocol").await;
            return;
        }
    };

    if classify_is_legacy(after_header) {
        tracing::debug!(client = %peer, ip = %client_ip, "session: legacy client");
        reject(conn, "Legacy protocol not supported", "legacy").await;
        return;
    }

    let (handshake, after_handshake) = match protocol::parse_handshake(after_header) {
        Ok(v) => v,
        Err(err) => {
            tracing::warn!(client = %peer, ip = %client_ip, err = %err, "session: handshake parse failed");
            reject(conn, &err.to_string(), "protocol").await;
            return;
        }
    };

    // Login Start only follows a login-intent handshake, and is best-effort:
    // a frame we cannot read just means an anonymous session.
    let username = if handshake.next_state == protocol::NEXT_STATE_LOGIN {
        match protocol::parse_login_start(after_handshake) {
            Ok(name) => Some(name),
            Err(err) => {
                tracing::debug!(client = %peer, err = %err, "session: login start unreadable");
                None
            }
        }
    } else {
        None
    };

    let uuid = match &username {
        Some(name) => match opts.identity.resolve(name).await {
            Some(uuid) => Some(uuid),
            None => {
                tracing::warn!(client = %peer, username = %name, "session: identity unresolved");
                reject(conn, "Failed to resolve player identity", "identity").await;
                return;
            }
        },
        None => None,
    };

    let domain = routes::normalize_domain(&handshake.server_address);
    let Some(upstream) = opts.routes.get(&domain) else {
        tracing::info!(client = %peer, ip = %client_ip, domain = %domain, "session: unknown domain");
        reject(conn, "Unknown domain", "unknown_domain").await;
        return;
    };

    if let Some(fw) = &opts.firewall {
        match fw.rules_for(&domain).await {
            Ok(rules) => {
                if firewall::blocks(&rules, &client_ip, username.as_deref(), uuid.as_deref()) {
                    tracing::info!(
                        ip = %client_ip,
                        domain = %domain,
                        username = username.as_deref().unwrap_or("-"),
                        "session: blocked by firewall"
                    );
                    reject(conn, "Connection blocked by firewall", "firewall").await;
                    return;
                }
            }
            Err(err) => {
                tracing::warn!(domain = %domain, err = %err, "firewall: rule fetch failed; admitting");
            }
        }
    }

    if let (Some(reporter), Some(name)) = (&opts.reporter, &username) {
        reporter.report(&domain, name, &client_ip, uuid.as_deref().unwrap_or(""));
    }

    let upstream_addr = net::host_port(&upstream.host, upstream.port);
    let mut remote = match time::timeout(opts.dial_timeout, TcpStream::connect(&upstream_addr))
        .await
    {
        Ok(Ok(remote)) => remote,
        Ok(Err(err)) => {
            tracing::warn!(domain = %domain, upstream = %upstream_addr, err = %err, "session: upstream dial failed");
            reject(conn, "Failed to connect to remote server", "dial_failed").await;
            return;
        }
        Err(_) => {
            tracing::warn!(domain = %domain, upstream = %upstream_addr, "session: upstream dial timed out");
            reject(conn, "Failed to connect to remote server", "dial_failed").await;
            return;
        }
    };
    let _ = remote.set_nodelay(true);

    let kick = Arc::new(Notify::new());
    let id = opts.registry.insert(ConnectionRecord {
        client_ip: client_ip.clone(),
        domain: domain.clone(),
        username: username.clone(),
        uuid,
        upstream_host: upstream.host.clone(),
        upstream_port: upstream.port,
        kick: kick.clone(),
    });

    // Replay everything coalesced so far (sans the injected header) as one
    // write; the client believes these bytes are already on the wire.
    if let Err(err) = remote.write_all(after_handshake_full(&buf, after_header)).await {
        tracing::debug!(sid = id, err = %err, "session: initial replay failed");
        opts.registry.remove(id);
        close_counted(conn, "error").await;
        return;
    }

    tracing::info!(
        sid = id,
        ip = %client_ip,
        domain = %domain,
        username = username.as_deref().unwrap_or("-"),
        upstream = %upstream_addr,
        "session: routed"
    );

    let outcome = splice(conn, remote, opts.debug_marker.as_deref(), &kick).await;
    opts.registry.remove(id);

    match outcome {
        SpliceOutcome::Closed(from_client, from_upstream) => {
            counter!("lodestone_bytes_total", "direction" => "client_to_upstream")
                .increment(from_client);
            counter!("lodestone_bytes_total", "direction" => "upstream_to_client")
                .increment(from_upstream);
            counter!("lodestone_sessions_closed_total", "reason" => "closed").increment(1);
            tracing::debug!(sid = id, from_client, from_upstream, "session: closed");
        }
        SpliceOutcome::Kicked => {
            counter!("lodestone_sessions_closed_total", "reason" => "kicked").increment(1);
            tracing::info!(sid = id, domain = %domain, "session: kicked");
        }
        SpliceOutcome::Failed(err) => {
            counter!("lodestone_sessions_closed_total", "reason" => "error").increment(1);
            tracing::debug!(sid = id, err = %err, "session: transport error");
        }
    }
}

fn classify_is_legacy(buf: &[u8]) -> bool {
    protocol::classify(buf) == Classification::Legacy
}

/// The replayed slice: all coalesced bytes minus the stripped injected
/// header. `rest` is a tail slice of `buf`, so its offset recovers the cut.
fn after_handshake_full<'a>(buf: &'a [u8], rest: &[u8]) -> &'a [u8] {
    &buf[buf.len() - rest.len()..]
}

async fn read_initial(conn: &mut TcpStream, opts: &SessionOptions) -> std::io::Result<Vec<u8>> {
    let mut captured = Vec::with_capacity(1024);
    let mut tmp = vec![0u8; 4096];
    // The short grace drains whatever is already queued on the socket; once
    // bytes arrive, the longer idle window lets stragglers coalesce.
    let mut window = opts.initial_grace;

    loop {
        match time::timeout(window, conn.read(&mut tmp)).await {
            Err(_) => break,
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => {
                // Anything past the cap cannot be replayed faithfully, so an
                // overrun fails the session instead of truncating it.
                if captured.len() + n > opts.max_initial_bytes {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!(
                            "initial bytes exceed the {} byte cap",
                            opts.max_initial_bytes
                        ),
                    ));
                }
                captured.extend_from_slice(&tmp[..n]);
                window = opts.coalesce_idle;
            }
            Ok(Err(err)) => return Err(err),
        }
    }
    Ok(captured)
}

/// Writes a short human-readable reason to the client and closes. The
/// Minecraft client surfaces it as the disconnect message.
async fn reject(mut conn: TcpStream, reason: &str, counted_as: &'static str) {
    let _ = conn.write_all(reason.as_bytes()).await;
    let _ = conn.shutdown().await;
    counter!("lodestone_sessions_closed_total", "reason" => counted_as).increment(1);
}

async fn close_counted(mut conn: TcpStream, counted_as: &'static str) {
    let _ = conn.shutdown().await;
    counter!("lodestone_sessions_closed_total", "reason" => counted_as).increment(1);
}

enum SpliceOutcome {
    /// Both directions drained; byte totals per direction.
    Closed(u64, u64),
    Kicked,
    Failed(std::io::Error),
}

async fn splice(
    client: TcpStream,
    remote: TcpStream,
    marker: Option<&str>,
    kick: &Notify,
) -> SpliceOutcome {
    let (client_read, client_write) = client.into_split();
    let (remote_read, remote_write) = remote.into_split();

    let marker_seen = AtomicBool::new(false);
    let c2s = pipe(
        client_read,
        remote_write,
        marker,
        &marker_seen,
        "client->upstream",
    );
    let s2c = pipe(
        remote_read,
        client_write,
        marker,
        &marker_seen,
        "upstream->client",
    );
    let both = async { tokio::try_join!(c2s, s2c) };

    tokio::select! {
        res = both => match res {
            Ok((from_client, from_upstream)) => SpliceOutcome::Closed(from_client, from_upstream),
            Err(err) => SpliceOutcome::Failed(err),
        },
        // Dropping the halves closes both sockets.
        _ = kick.notified() => SpliceOutcome::Kicked,
    }
}

/// One splice direction: verbatim copy with half-close on EOF. When a marker
/// literal is configured, the first frame containing it (in either direction)
/// is hex-dumped; observation never touches the bytes.
async fn pipe<R, W>(
    mut input: R,
    mut output: W,
    marker: Option<&str>,
    marker_seen: &AtomicBool,
    direction: &'static str,
) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; 16 * 1024];
    let mut total = 0u64;
    loop {
        let n = input.read(&mut buf).await?;
        if n == 0 {
            output.shutdown().await?;
            return Ok(total);
        }

        if let Some(marker) = marker {
            if !marker_seen.load(Ordering::Relaxed) && contains(&buf[..n], marker.as_bytes()) {
                marker_seen.store(true, Ordering::Relaxed);
                tracing::info!(
                    direction,
                    frame = %hex::encode(&buf[..n]),
                    "session: marker frame observed"
                );
            }
        }

        output.write_all(&buf[..n]).await?;
        total += n as u64;
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    !needle.is_empty() && haystack.windows(needle.len()).any(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lodestone::identity::IdentityConfig;
    use crate::lodestone::protocol::testutil;
    use crate::lodestone::routes::Upstream;
    use std::path::PathBuf;
    use tokio::net::TcpListener;

    const UUID_ALICE: &str = "069a79f444e94726a5befca90e38aaf5";

    fn temp_route_file(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "lodestone-session-{tag}-{}.json",
            std::process::id()
        ))
    }

    async fn spawn_http_stub(body: String) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind stub");
        let addr = listener.local_addr().expect("stub addr");
        tokio::spawn(async move {
            while let Ok((mut conn, _)) = listener.accept().await {
                let body = body.clone();
                tokio::spawn(async move {
                    let mut req = Vec::new();
                    let mut tmp = [0u8; 1024];
                    loop {
                        match conn.read(&mut tmp).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => req.extend_from_slice(&tmp[..n]),
                        }
                        if req.windows(4).any(|w| w == b"\r\n\r\n") {
                            break;
                        }
                    }
                    let resp = format!(
                        "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                        body.len(),
                        body
                    );
                    let _ = conn.write_all(resp.as_bytes()).await;
                });
            }
        });
        addr
    }

    struct Harness {
        opts: Arc<SessionOptions>,
        proxy_addr: SocketAddr,
        _route_file: PathBuf,
    }

    async fn harness(
        tag: &str,
        route: Option<(&str, SocketAddr)>,
        identity_url: Option<String>,
        firewall_manager: Option<String>,
    ) -> Harness {
        harness_with_cap(tag, 64 * 1024, route, identity_url, firewall_manager).await
    }

    async fn harness_with_cap(
        tag: &str,
        max_initial_bytes: usize,
        route: Option<(&str, SocketAddr)>,
        identity_url: Option<String>,
        firewall_manager: Option<String>,
    ) -> Harness {
        let route_file = temp_route_file(tag);
        let _ = std::fs::remove_file(&route_file);
        let routes = Arc::new(RouteTable::load(&route_file).expect("routes"));
        if let Some((domain, upstream)) = route {
            routes
                .insert(
                    domain,
                    Upstream {
                        host: upstream.ip().to_string(),
                        port: upstream.port(),
                    },
                )
                .await
                .expect("route");
        }

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(1))
            .build()
            .expect("http client");
        let identity = Arc::new(IdentityResolver::new(
            http.clone(),
            IdentityConfig {
                // Unreachable default: tests that never resolve identities
                // fail fast if the pipeline calls out unexpectedly.
                primary_url: identity_url
                    .clone()
                    .unwrap_or_else(|| "http://127.0.0.1:9/profiles".to_string()),
                fallback_url: identity_url
                    .unwrap_or_else(|| "http://127.0.0.1:9/profiles".to_string()),
                attempts: 1,
                retry_delay: Duration::from_millis(10),
            },
        ));
        let firewall = firewall_manager
            .and_then(|addr| FirewallClient::new(http.clone(), &addr, "test-key"))
            .map(Arc::new);

        let opts = Arc::new(SessionOptions {
            routes,
            registry: Arc::new(ConnectionRegistry::new()),
            identity,
            firewall,
            reporter: None,
            initial_grace: Duration::from_millis(100),
            coalesce_idle: Duration::from_millis(200),
            max_initial_bytes,
            dial_timeout: Duration::from_secs(2),
            debug_marker: None,
        });

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind proxy");
        let proxy_addr = listener.local_addr().expect("proxy addr");
        let accept_opts = opts.clone();
        tokio::spawn(async move {
            while let Ok((conn, peer)) = listener.accept().await {
                let opts = accept_opts.clone();
                tokio::spawn(handle(conn, peer, opts));
            }
        });

        Harness {
            opts,
            proxy_addr,
            _route_file: route_file,
        }
    }

    async fn read_to_end(conn: &mut TcpStream) -> Vec<u8> {
        let mut out = Vec::new();
        let mut tmp = [0u8; 1024];
        loop {
            match time::timeout(Duration::from_secs(5), conn.read(&mut tmp)).await {
                Ok(Ok(0)) | Ok(Err(_)) | Err(_) => break,
                Ok(Ok(n)) => out.extend_from_slice(&tmp[..n]),
            }
        }
        out
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..250 {
            if cond() {
                return;
            }
            time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn login_session_replays_and_splices() {
        let upstream = TcpListener::bind("127.0.0.1:0").await.expect("upstream");
        let upstream_addr = upstream.local_addr().expect("addr");

        let mut expected = testutil::handshake("play.example.com", 25565, 763, 2);
        expected.extend(testutil::login_start("alice"));
        let expected_upstream = expected.clone();

        let upstream_task = tokio::spawn(async move {
            let (mut conn, _) = upstream.accept().await.expect("accept");
            let mut initial = vec![0u8; expected_upstream.len()];
            conn.read_exact(&mut initial).await.expect("initial replay");
            assert_eq!(initial, expected_upstream);

            let mut ping = [0u8; 4];
            conn.read_exact(&mut ping).await.expect("ping");
            assert_eq!(&ping, b"ping");
            conn.write_all(b"pong").await.expect("pong");
        });

        let identity = spawn_http_stub(format!("{{\"id\":\"{UUID_ALICE}\"}}")).await;
        let h = harness(
            "login",
            Some(("play.example.com", upstream_addr)),
            Some(format!("http://{identity}/profiles")),
            None,
        )
        .await;

        let mut client = TcpStream::connect(h.proxy_addr).await.expect("connect");
        let mut initial = testutil::client_address_header("203.0.113.7");
        initial.extend(&expected);
        client.write_all(&initial).await.expect("send initial");

        client.write_all(b"ping").await.expect("send ping");
        let mut pong = [0u8; 4];
        client.read_exact(&mut pong).await.expect("read pong");
        assert_eq!(&pong, b"pong");

        let registry = h.opts.registry.clone();
        wait_until(|| registry.snapshot().len() == 1).await;
        let snap = registry.snapshot();
        assert_eq!(snap[0].client_ip, "203.0.113.7");
        assert_eq!(snap[0].domain, "play.example.com");
        assert_eq!(snap[0].username.as_deref(), Some("alice"));
        assert_eq!(snap[0].uuid.as_deref(), Some(UUID_ALICE));
        assert_eq!(snap[0].upstream_port, upstream_addr.port());

        drop(client);
        wait_until(|| registry.snapshot().is_empty()).await;
        upstream_task.await.expect("upstream assertions");
    }

    #[tokio::test]
    async fn status_ping_skips_identity_and_reporting() {
        let upstream = TcpListener::bind("127.0.0.1:0").await.expect("upstream");
        let upstream_addr = upstream.local_addr().expect("addr");

        let expected = testutil::handshake("play.example.com", 25565, 763, 1);
        let expected_upstream = expected.clone();
        tokio::spawn(async move {
            let (mut conn, _) = upstream.accept().await.expect("accept");
            let mut initial = vec![0u8; expected_upstream.len()];
            conn.read_exact(&mut initial).await.expect("initial replay");
            assert_eq!(initial, expected_upstream);
        });

        // No identity stub: a lookup would hit the unreachable default and fail.
        let h = harness(
            "status",
            Some(("play.example.com", upstream_addr)),
            None,
            None,
        )
        .await;

        let mut client = TcpStream::connect(h.proxy_addr).await.expect("connect");
        let mut initial = testutil::client_address_header("203.0.113.7");
        initial.extend(&expected);
        client.write_all(&initial).await.expect("send initial");

        let registry = h.opts.registry.clone();
        wait_until(|| registry.snapshot().len() == 1).await;
        let snap = registry.snapshot();
        assert_eq!(snap[0].username, None);
        assert_eq!(snap[0].uuid, None);
    }

    #[tokio::test]
    async fn chunked_handshake_coalesces() {
        let upstream = TcpListener::bind("127.0.0.1:0").await.expect("upstream");
        let upstream_addr = upstream.local_addr().expect("addr");

        let expected = testutil::handshake("play.example.com", 25565, 763, 1);
        let expected_upstream = expected.clone();
        tokio::spawn(async move {
            let (mut conn, _) = upstream.accept().await.expect("accept");
            let mut initial = vec![0u8; expected_upstream.len()];
            conn.read_exact(&mut initial).await.expect("initial replay");
            assert_eq!(initial, expected_upstream);
        });

        let h = harness(
            "chunked",
            Some(("play.example.com", upstream_addr)),
            None,
            None,
        )
        .await;

        let mut client = TcpStream::connect(h.proxy_addr).await.expect("connect");
        client
            .write_all(&testutil::client_address_header("203.0.113.7"))
            .await
            .expect("send header");
        // Arrives inside the idle window; the coalescer must keep waiting.
        time::sleep(Duration::from_millis(120)).await;
        client.write_all(&expected).await.expect("send handshake");

        let registry = h.opts.registry.clone();
        wait_until(|| registry.snapshot().len() == 1).await;
    }

    #[tokio::test]
    async fn oversized_initial_burst_fails_the_session() {
        let h = harness_with_cap("overrun", 64, None, None, None).await;

        let mut client = TcpStream::connect(h.proxy_addr).await.expect("connect");
        let mut initial = testutil::client_address_header("203.0.113.7");
        initial.extend_from_slice(&[0x41; 200]);
        client.write_all(&initial).await.expect("send burst");

        // Dropped without a diagnostic: nothing was parsed, routed or
        // truncated into service.
        let reply = read_to_end(&mut client).await;
        assert!(reply.is_empty());
        assert!(h.opts.registry.snapshot().is_empty());
    }

    #[tokio::test]
    async fn unknown_domain_is_rejected() {
        let h = harness("unknown-domain", None, None, None).await;

        let mut client = TcpStream::connect(h.proxy_addr).await.expect("connect");
        let mut initial = testutil::client_address_header("203.0.113.7");
        initial.extend(testutil::handshake("nowhere.example.com", 25565, 763, 1));
        client.write_all(&initial).await.expect("send initial");

        let reply = read_to_end(&mut client).await;
        assert_eq!(reply, b"Unknown domain");
        assert!(h.opts.registry.snapshot().is_empty());
    }

    #[tokio::test]
    async fn missing_address_header_is_rejected() {
        let h = harness("no-header", None, None, None).await;

        let mut client = TcpStream::connect(h.proxy_addr).await.expect("connect");
        client
            .write_all(&testutil::handshake("play.example.com", 25565, 763, 1))
            .await
            .expect("send handshake");

        let reply = read_to_end(&mut client).await;
        assert_eq!(reply, b"missing injected client address marker");
    }

    #[tokio::test]
    async fn legacy_client_is_rejected() {
        let h = harness("legacy", None, None, None).await;

        let mut client = TcpStream::connect(h.proxy_addr).await.expect("connect");
        let mut initial = testutil::client_address_header("203.0.113.7");
        initial.extend([0xfe, 0x01]);
        client.write_all(&initial).await.expect("send legacy ping");

        let reply = read_to_end(&mut client).await;
        assert_eq!(reply, b"Legacy protocol not supported");
    }

    #[tokio::test]
    async fn firewall_uuid_ban_blocks_before_dial() {
        let identity = spawn_http_stub(format!("{{\"id\":\"{UUID_ALICE}\"}}")).await;
        let manager = spawn_http_stub(format!(
            "[{{\"type\":\"uuidBan\",\"value\":\"{UUID_ALICE}\"}}]"
        ))
        .await;

        // Routed at an unbound port: a dial attempt would fail the test
        // with the wrong reject message.
        let unbound = SocketAddr::from(([127, 0, 0, 1], 9));
        let h = harness(
            "firewall",
            Some(("play.example.com", unbound)),
            Some(format!("http://{identity}/profiles")),
            Some(format!("http://{manager}")),
        )
        .await;

        let mut client = TcpStream::connect(h.proxy_addr).await.expect("connect");
        let mut initial = testutil::client_address_header("203.0.113.7");
        initial.extend(testutil::handshake("play.example.com", 25565, 763, 2));
        initial.extend(testutil::login_start("alice"));
        client.write_all(&initial).await.expect("send initial");

        let reply = read_to_end(&mut client).await;
        assert_eq!(reply, b"Connection blocked by firewall");
        assert!(h.opts.registry.snapshot().is_empty());
    }

    #[tokio::test]
    async fn kick_closes_the_client_socket() {
        let upstream = TcpListener::bind("127.0.0.1:0").await.expect("upstream");
        let upstream_addr = upstream.local_addr().expect("addr");
        tokio::spawn(async move {
            // Hold the connection open without reading past the replay.
            let (mut conn, _) = upstream.accept().await.expect("accept");
            let mut tmp = [0u8; 1024];
            while matches!(conn.read(&mut tmp).await, Ok(n) if n > 0) {}
        });

        let h = harness(
            "kick",
            Some(("play.example.com", upstream_addr)),
            None,
            None,
        )
        .await;

        let mut client = TcpStream::connect(h.proxy_addr).await.expect("connect");
        let mut initial = testutil::client_address_header("203.0.113.7");
        initial.extend(testutil::handshake("play.example.com", 25565, 763, 1));
        client.write_all(&initial).await.expect("send initial");

        let registry = h.opts.registry.clone();
        wait_until(|| registry.snapshot().len() == 1).await;
        let id = registry.snapshot()[0].id;
        assert!(registry.kick(id));

        // The session observes the kick and drops both sockets.
        let reply = read_to_end(&mut client).await;
        assert!(reply.is_empty());
        assert!(registry.snapshot().is_empty());
    }
}
