// The proxy-device forwarder child ("warren forkproxy ...").
//
// Listens on one side (host or instance network namespace, chosen by the
// listen pid) and connects on the other. Namespace entry happens on
// dedicated OS threads: setns() binds the calling thread, so sockets are
// created inside the target namespace and handed back; they keep working
// regardless of which namespace the servicing task runs in.
//
// Progress is reported on stdout, which the supervisor redirects into the
// device log: "Status: Started" once every listener is bound, "Error: ..."
// on a startup failure. The device start path polls the log for these.

use crate::device::proxy::ProxyAddr;
use crate::net::error::{NetworkError, NetworkResult};
use nix::sched::{setns, CloneFlags};
use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

pub struct ForkproxyArgs {
    pub listen_pid: u32,
    pub listen: String,
    pub connect_pid: u32,
    pub connect: String,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub mode: Option<u32>,
    pub proxy_protocol: bool,
}

impl ForkproxyArgs {
    /// argv: <listen-pid> <listen-addr> <connect-pid> <connect-addr>
    ///       <log> <pidfile> <gid> <uid> <mode> <proxy-protocol>
    /// The log and pidfile slots are managed by the supervisor and ignored
    /// here; they stay in the argv so the cmdline identifies the device.
    pub fn parse(args: &[String]) -> NetworkResult<Self> {
        if args.len() < 10 {
            return Err(NetworkError::Validation(format!(
                "forkproxy expects 10 arguments, got {}",
                args.len()
            )));
        }

        let parse_pid = |s: &String| {
            s.parse::<u32>()
                .map_err(|_| NetworkError::Validation(format!("invalid pid '{}'", s)))
        };
        let parse_id = |s: &String| -> NetworkResult<Option<u32>> {
            if s.is_empty() {
                return Ok(None);
            }
            Ok(Some(s.parse::<u32>().map_err(|_| {
                NetworkError::Validation(format!("invalid id '{}'", s))
            })?))
        };

        let mode = if args[8].is_empty() {
            None
        } else {
            Some(u32::from_str_radix(args[8].trim_start_matches('0'), 8).unwrap_or(0o644))
        };

        Ok(Self {
            listen_pid: parse_pid(&args[0])?,
            listen: args[1].clone(),
            connect_pid: parse_pid(&args[2])?,
            connect: args[3].clone(),
            gid: parse_id(&args[6])?,
            uid: parse_id(&args[7])?,
            mode,
            proxy_protocol: args[9] == "true",
        })
    }
}

/// Run a closure on a dedicated OS thread inside another process's network
/// namespace. The closure's sockets survive the thread.
fn in_namespace<T, F>(pid: u32, f: F) -> std::io::Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> std::io::Result<T> + Send + 'static,
{
    if pid == std::process::id() {
        return f();
    }

    let handle = std::thread::spawn(move || -> std::io::Result<T> {
        let ns_path = format!("/proc/{}/ns/net", pid);
        let ns_fd = std::fs::File::open(&ns_path)?;
        setns(ns_fd.as_raw_fd(), CloneFlags::CLONE_NEWNET)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        f()
    });

    handle
        .join()
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::Other, "namespace thread panicked"))?
}

type BoxedStream = Box<dyn Stream>;

trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}

/// Open an outbound stream to the connect side, inside its namespace.
fn connect_stream(pid: u32, addr: &ProxyAddr) -> std::io::Result<BoxedStream> {
    let target = addr.addrs[0].clone();
    match addr.conn_type.as_str() {
        "unix" => {
            let stream = in_namespace(pid, move || std::os::unix::net::UnixStream::connect(&target))?;
            stream.set_nonblocking(true)?;
            Ok(Box::new(tokio::net::UnixStream::from_std(stream)?))
        }
        _ => {
            let stream = in_namespace(pid, move || std::net::TcpStream::connect(&target))?;
            stream.set_nonblocking(true)?;
            Ok(Box::new(tokio::net::TcpStream::from_std(stream)?))
        }
    }
}

/// PROXY protocol v1 header describing the inbound client.
fn proxy_header(client: Option<std::net::SocketAddr>, local: Option<std::net::SocketAddr>) -> String {
    match (client, local) {
        (Some(client), Some(local)) => {
            let family = if client.is_ipv6() { "TCP6" } else { "TCP4" };
            format!(
                "PROXY {} {} {} {} {}\r\n",
                family,
                client.ip(),
                local.ip(),
                client.port(),
                local.port()
            )
        }
        _ => "PROXY UNKNOWN\r\n".to_string(),
    }
}

async fn splice(
    mut inbound: BoxedStream,
    args: Arc<ForkproxyArgs>,
    connect: Arc<ProxyAddr>,
    client: Option<std::net::SocketAddr>,
    local: Option<std::net::SocketAddr>,
) {
    let connect_pid = args.connect_pid;
    let connect_addr = connect.clone();
    let outbound =
        tokio::task::spawn_blocking(move || connect_stream(connect_pid, &connect_addr)).await;

    let mut outbound = match outbound {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            tracing::warn!("connect side failed: {}", e);
            return;
        }
        Err(e) => {
            tracing::warn!("connect task failed: {}", e);
            return;
        }
    };

    if args.proxy_protocol {
        let header = proxy_header(client, local);
        if outbound.write_all(header.as_bytes()).await.is_err() {
            return;
        }
    }

    let _ = tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await;
}

async fn run_tcp_listener(
    listener: tokio::net::TcpListener,
    args: Arc<ForkproxyArgs>,
    connect: Arc<ProxyAddr>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, client)) => {
                let local = stream.local_addr().ok();
                let args = args.clone();
                let connect = connect.clone();
                tokio::spawn(async move {
                    splice(Box::new(stream), args, connect, Some(client), local).await;
                });
            }
            Err(e) => {
                tracing::warn!("accept failed: {}", e);
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }
    }
}

async fn run_unix_listener(
    listener: tokio::net::UnixListener,
    args: Arc<ForkproxyArgs>,
    connect: Arc<ProxyAddr>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let args = args.clone();
                let connect = connect.clone();
                tokio::spawn(async move {
                    splice(Box::new(stream), args, connect, None, None).await;
                });
            }
            Err(e) => {
                tracing::warn!("accept failed: {}", e);
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }
    }
}

/// Datagram relay: one upstream socket per client address, replies routed
/// back by the per-client task.
async fn run_udp(
    listener: Arc<tokio::net::UdpSocket>,
    args: Arc<ForkproxyArgs>,
    connect: Arc<ProxyAddr>,
) {
    let mut upstreams: HashMap<std::net::SocketAddr, Arc<tokio::net::UdpSocket>> = HashMap::new();
    let mut buf = vec![0u8; 65536];

    loop {
        let (len, client) = match listener.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!("udp receive failed: {}", e);
                continue;
            }
        };

        let upstream = match upstreams.get(&client) {
            Some(sock) => sock.clone(),
            None => {
                let connect_pid = args.connect_pid;
                let target = connect.addrs[0].clone();
                let created = tokio::task::spawn_blocking(move || {
                    in_namespace(connect_pid, move || {
                        let sock = std::net::UdpSocket::bind("0.0.0.0:0")?;
                        sock.connect(&target)?;
                        sock.set_nonblocking(true)?;
                        Ok(sock)
                    })
                })
                .await;

                let sock = match created {
                    Ok(Ok(sock)) => match tokio::net::UdpSocket::from_std(sock) {
                        Ok(sock) => Arc::new(sock),
                        Err(e) => {
                            tracing::warn!("udp upstream failed: {}", e);
                            continue;
                        }
                    },
                    _ => {
                        tracing::warn!("udp upstream creation failed for {}", client);
                        continue;
                    }
                };

                // Reply pump for this client.
                {
                    let sock = sock.clone();
                    let listener = listener.clone();
                    tokio::spawn(async move {
                        let mut reply = vec![0u8; 65536];
                        while let Ok(len) = sock.recv(&mut reply).await {
                            if listener.send_to(&reply[..len], client).await.is_err() {
                                break;
                            }
                        }
                    });
                }

                upstreams.insert(client, sock.clone());
                sock
            }
        };

        let _ = upstream.send(&buf[..len]).await;
    }
}

pub async fn run(raw_args: Vec<String>) -> NetworkResult<()> {
    let args = Arc::new(ForkproxyArgs::parse(&raw_args)?);
    let listen = ProxyAddr::parse(&args.listen)?;
    let connect = Arc::new(ProxyAddr::parse(&args.connect)?);

    let result = start_listeners(args.clone(), &listen, connect.clone()).await;
    match result {
        Ok(()) => {
            // The device start path watches the log for this exact line.
            // stdout is redirected into the device log and block-buffered,
            // so flush or the supervisor's poll never sees it.
            report("Status: Started");
            // Listener tasks run until the device stop kills us.
            futures::future::pending::<()>().await;
            Ok(())
        }
        Err(e) => {
            report(&format!("Error: {}", e));
            Err(e)
        }
    }
}

fn report(line: &str) {
    use std::io::Write;
    println!("{}", line);
    let _ = std::io::stdout().flush();
}

async fn start_listeners(
    args: Arc<ForkproxyArgs>,
    listen: &ProxyAddr,
    connect: Arc<ProxyAddr>,
) -> NetworkResult<()> {
    let listen_pid = args.listen_pid;

    match listen.conn_type.as_str() {
        "tcp" => {
            for addr in &listen.addrs {
                let bind_addr = addr.clone();
                let listener = in_namespace(listen_pid, move || {
                    let listener = std::net::TcpListener::bind(&bind_addr)?;
                    listener.set_nonblocking(true)?;
                    Ok(listener)
                })
                .map_err(NetworkError::Io)?;
                let listener =
                    tokio::net::TcpListener::from_std(listener).map_err(NetworkError::Io)?;
                tokio::spawn(run_tcp_listener(listener, args.clone(), connect.clone()));
            }
        }
        "udp" => {
            for addr in &listen.addrs {
                let bind_addr = addr.clone();
                let socket = in_namespace(listen_pid, move || {
                    let socket = std::net::UdpSocket::bind(&bind_addr)?;
                    socket.set_nonblocking(true)?;
                    Ok(socket)
                })
                .map_err(NetworkError::Io)?;
                let socket =
                    Arc::new(tokio::net::UdpSocket::from_std(socket).map_err(NetworkError::Io)?);
                tokio::spawn(run_udp(socket, args.clone(), connect.clone()));
            }
        }
        "unix" => {
            let path = listen.addrs[0].clone();
            let abstract_socket = path.starts_with('@');

            if !abstract_socket {
                let _ = std::fs::remove_file(&path);
            }

            let bind_path = path.clone();
            let listener = in_namespace(listen_pid, move || {
                std::os::unix::net::UnixListener::bind(&bind_path).and_then(|l| {
                    l.set_nonblocking(true)?;
                    Ok(l)
                })
            })
            .map_err(NetworkError::Io)?;

            if !abstract_socket {
                apply_socket_permissions(Path::new(&path), &args)?;
            }

            let listener =
                tokio::net::UnixListener::from_std(listener).map_err(NetworkError::Io)?;
            tokio::spawn(run_unix_listener(listener, args.clone(), connect.clone()));
        }
        other => {
            return Err(NetworkError::Validation(format!(
                "unsupported listen protocol '{}'",
                other
            )))
        }
    }

    Ok(())
}

fn apply_socket_permissions(path: &Path, args: &ForkproxyArgs) -> NetworkResult<()> {
    if let Some(mode) = args.mode {
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
            .map_err(NetworkError::Io)?;
    }
    if args.uid.is_some() || args.gid.is_some() {
        nix::unistd::chown(
            path,
            args.uid.map(nix::unistd::Uid::from_raw),
            args.gid.map(nix::unistd::Gid::from_raw),
        )
        .map_err(|e| NetworkError::Command {
            cmd: format!("chown {}", path.display()),
            stderr: e.to_string(),
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn args_parse() {
        let args = ForkproxyArgs::parse(&argv(&[
            "1234",
            "tcp:0.0.0.0:80",
            "5678",
            "tcp:10.0.0.5:80",
            "/var/log/proxy.log",
            "/var/run/proxy.pid",
            "",
            "",
            "0644",
            "false",
        ]))
        .unwrap();

        assert_eq!(args.listen_pid, 1234);
        assert_eq!(args.connect_pid, 5678);
        assert_eq!(args.mode, Some(0o644));
        assert_eq!(args.uid, None);
        assert!(!args.proxy_protocol);

        assert!(ForkproxyArgs::parse(&argv(&["1234"])).is_err());
    }

    #[test]
    fn proxy_header_formats() {
        let client: std::net::SocketAddr = "192.0.2.1:5000".parse().unwrap();
        let local: std::net::SocketAddr = "10.0.0.1:80".parse().unwrap();
        assert_eq!(
            proxy_header(Some(client), Some(local)),
            "PROXY TCP4 192.0.2.1 10.0.0.1 5000 80\r\n"
        );
        assert_eq!(proxy_header(None, None), "PROXY UNKNOWN\r\n");

        let client6: std::net::SocketAddr = "[fd42::1]:5000".parse().unwrap();
        let local6: std::net::SocketAddr = "[fd42::2]:80".parse().unwrap();
        assert!(proxy_header(Some(client6), Some(local6)).starts_with("PROXY TCP6 "));
    }

    #[tokio::test]
    async fn tcp_round_trip_within_own_namespace() {
        // Backend echo server.
        let backend = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = backend.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (mut sock, _) = match backend.accept().await {
                    Ok(c) => c,
                    Err(_) => return,
                };
                tokio::spawn(async move {
                    let (mut r, mut w) = sock.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });

        let own_pid = std::process::id().to_string();
        let args = Arc::new(
            ForkproxyArgs::parse(&argv(&[
                &own_pid,
                "tcp:127.0.0.1:0",
                &own_pid,
                &format!("tcp:{}", backend_addr),
                "/dev/null",
                "/dev/null",
                "",
                "",
                "",
                "false",
            ]))
            .unwrap(),
        );
        let connect = Arc::new(ProxyAddr::parse(&args.connect).unwrap());

        // Bind the proxy listener ourselves so we know its port.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = listener.local_addr().unwrap();
        tokio::spawn(run_tcp_listener(listener, args, connect));

        use tokio::io::AsyncReadExt;
        let mut client = tokio::net::TcpStream::connect(proxy_addr).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }
}
