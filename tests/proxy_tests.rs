//! End-to-end proxy scenarios
//!
//! Each test runs a real proxy instance on an ephemeral port with its
//! runtime files under a private temp directory, real upstream servers on
//! loopback, and drives it exclusively through sockets and the command
//! fifo. The second-instance test exercises the built binary itself.

use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

use tcp_router::{Proxy, ProxyConfig, RouteSpec, RuntimePaths};

struct ProxyUnderTest {
    addr: SocketAddr,
    paths: RuntimePaths,
    handle: thread::JoinHandle<()>,
    _dir: tempfile::TempDir,
}

impl ProxyUnderTest {
    fn start(name: &str, routes: Vec<RouteSpec>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let paths = RuntimePaths::in_dir(dir.path(), name);
        let config = ProxyConfig { port: 0, routes };
        let mut proxy = Proxy::new(&config, &paths).unwrap();
        let addr = proxy.local_addr();
        let handle = thread::spawn(move || proxy.run().unwrap());
        Self {
            addr,
            paths,
            handle,
            _dir: dir,
        }
    }

    /// Write one command to the fifo and close it. The write-only open
    /// blocks until the proxy's read end is in place, which also serialises
    /// commands against fifo recreation.
    fn command(&self, cmd: &str) {
        let mut fifo = std::fs::OpenOptions::new()
            .write(true)
            .open(&self.paths.fifo)
            .unwrap();
        fifo.write_all(cmd.as_bytes()).unwrap();
    }

    fn stop(self) {
        self.command("exit");
        self.handle.join().unwrap();
        assert!(!self.paths.fifo.exists(), "fifo must be removed on exit");
    }
}

fn route_to(port: u16) -> RouteSpec {
    RouteSpec {
        source_host: "127.0.0.1".to_string(),
        target_host: "127.0.0.1".to_string(),
        target_port: port,
    }
}

/// Upstream that answers every connection: reads one chunk, replies with the
/// uppercased bytes, then echoes until the client closes. Serves forever;
/// the thread dies with the test process.
fn spawn_upper_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        for conn in listener.incoming() {
            let Ok(mut conn) = conn else { break };
            let mut buf = [0u8; 1024];
            loop {
                match conn.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let upper: Vec<u8> =
                            buf[..n].iter().map(u8::to_ascii_uppercase).collect();
                        if conn.write_all(&upper).is_err() {
                            break;
                        }
                    }
                }
            }
        }
    });
    addr
}

/// Upstream that replies with a fixed tag to the first input, then holds the
/// connection open until the client side closes.
fn spawn_tagged(tag: &'static [u8]) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        for conn in listener.incoming() {
            let Ok(mut conn) = conn else { break };
            let mut buf = [0u8; 64];
            if matches!(conn.read(&mut buf), Ok(n) if n > 0) {
                let _ = conn.write_all(tag);
                // Drain until EOF so the pair stays up from this side.
                while matches!(conn.read(&mut buf), Ok(n) if n > 0) {}
            }
        }
    });
    addr
}

fn read_until_eof(stream: &mut TcpStream, timeout: Duration) -> Vec<u8> {
    stream.set_read_timeout(Some(timeout)).unwrap();
    let mut out = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => return out,
            Ok(n) => out.extend_from_slice(&buf[..n]),
            Err(e) => panic!("read failed after {} bytes: {e}", out.len()),
        }
    }
}

#[test]
fn basic_forward() {
    let upstream = spawn_upper_echo();
    let proxy = ProxyUnderTest::start("it-forward", vec![route_to(upstream.port())]);

    let mut client = TcpStream::connect(proxy.addr).unwrap();
    client.write_all(b"hello\n").unwrap();

    client
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    let mut reply = [0u8; 6];
    client.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"HELLO\n");

    drop(client);
    proxy.stop();
}

#[test]
fn bulk_transfer_survives_slow_upstream() {
    // The upstream stalls before reading, forcing the 512-byte staging
    // buffer to fill and the proxy to stop pulling from the client.
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let upstream_addr = listener.local_addr().unwrap();
    let upstream = thread::spawn(move || {
        let (mut conn, _) = listener.accept().unwrap();
        thread::sleep(Duration::from_millis(400));
        let mut received = Vec::new();
        conn.read_to_end(&mut received).unwrap();
        received
    });

    let proxy = ProxyUnderTest::start("it-bulk", vec![route_to(upstream_addr.port())]);

    let payload: Vec<u8> = (0..10 * 1024).map(|i| (i % 251) as u8).collect();
    let mut client = TcpStream::connect(proxy.addr).unwrap();
    client.write_all(&payload).unwrap();
    drop(client); // EOF follows the payload through the proxy

    let received = upstream.join().unwrap();
    assert_eq!(received.len(), payload.len());
    assert_eq!(received, payload, "bytes must arrive complete and in order");

    proxy.stop();
}

#[test]
fn upstream_eof_closes_client() {
    // Upstream accepts and immediately closes.
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let upstream_addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        for conn in listener.incoming() {
            drop(conn);
        }
    });

    let proxy = ProxyUnderTest::start("it-eof", vec![route_to(upstream_addr.port())]);

    let mut client = TcpStream::connect(proxy.addr).unwrap();
    let leftovers = read_until_eof(&mut client, Duration::from_secs(10));
    assert!(leftovers.is_empty());

    proxy.stop();
}

#[test]
fn dynamic_add_enables_routing() {
    let upstream = spawn_upper_echo();
    let proxy = ProxyUnderTest::start("it-dynadd", Vec::new());

    // Without a route the proxy accepts and drops the connection.
    {
        let mut client = TcpStream::connect(proxy.addr).unwrap();
        let got = read_until_eof(&mut client, Duration::from_secs(10));
        assert!(got.is_empty());
    }

    proxy.command(&format!("add 127.0.0.1 127.0.0.1:{}", upstream.port()));

    // The command is applied on the proxy's next wakeup; retry briefly.
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut proxied = false;
    while Instant::now() < deadline && !proxied {
        let mut client = TcpStream::connect(proxy.addr).unwrap();
        client.write_all(b"ping").unwrap();
        client
            .set_read_timeout(Some(Duration::from_millis(300)))
            .unwrap();
        let mut reply = [0u8; 4];
        match client.read_exact(&mut reply) {
            Ok(()) => {
                assert_eq!(&reply, b"PING");
                proxied = true;
            }
            Err(ref e)
                if e.kind() == ErrorKind::WouldBlock
                    || e.kind() == ErrorKind::TimedOut
                    || e.kind() == ErrorKind::UnexpectedEof =>
            {
                thread::sleep(Duration::from_millis(50));
            }
            Err(e) => panic!("unexpected client error: {e}"),
        }
    }
    assert!(proxied, "added route never took effect");

    proxy.stop();
}

#[test]
fn route_change_evicts_live_pair() {
    let one = spawn_tagged(b"ONE");
    let two = spawn_tagged(b"TWO");
    let proxy = ProxyUnderTest::start("it-evict", vec![route_to(one.port())]);

    // Establish a live pair through the original route.
    let mut client = TcpStream::connect(proxy.addr).unwrap();
    client.write_all(b"x").unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    let mut tag = [0u8; 3];
    client.read_exact(&mut tag).unwrap();
    assert_eq!(&tag, b"ONE");

    // Replace the route while the pair is up: the pair must be torn down.
    proxy.command(&format!("add 127.0.0.1 127.0.0.1:{}", two.port()));
    let rest = read_until_eof(&mut client, Duration::from_secs(10));
    assert!(rest.is_empty());

    // Subsequent connections land on the new target.
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut replaced = false;
    while Instant::now() < deadline && !replaced {
        let mut client = TcpStream::connect(proxy.addr).unwrap();
        client.write_all(b"x").unwrap();
        client
            .set_read_timeout(Some(Duration::from_millis(300)))
            .unwrap();
        let mut tag = [0u8; 3];
        match client.read_exact(&mut tag) {
            Ok(()) => {
                assert_eq!(&tag, b"TWO");
                replaced = true;
            }
            Err(ref e)
                if e.kind() == ErrorKind::WouldBlock
                    || e.kind() == ErrorKind::TimedOut
                    || e.kind() == ErrorKind::UnexpectedEof =>
            {
                thread::sleep(Duration::from_millis(50));
            }
            Err(e) => panic!("unexpected client error: {e}"),
        }
    }
    assert!(replaced, "replacement route never took effect");

    proxy.stop();
}

#[test]
fn exit_command_closes_open_pairs() {
    let upstream = spawn_upper_echo();
    let proxy = ProxyUnderTest::start("it-exit", vec![route_to(upstream.port())]);

    let mut client = TcpStream::connect(proxy.addr).unwrap();
    client.write_all(b"hi").unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    let mut reply = [0u8; 2];
    client.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"HI");

    proxy.stop();

    // The pair died with the reactor.
    let rest = read_until_eof(&mut client, Duration::from_secs(10));
    assert!(rest.is_empty());
}

mod second_instance {
    use super::*;
    use std::process::{Child, Command, Stdio};

    /// Kills the child on drop so a failing assertion cannot leak a live
    /// proxy process.
    struct Reaper(Child);

    impl Drop for Reaper {
        fn drop(&mut self) {
            let _ = self.0.kill();
            let _ = self.0.wait();
        }
    }

    fn write_config(dir: &std::path::Path, port: u16) -> std::path::PathBuf {
        let path = dir.join("tcp-router.conf");
        std::fs::write(
            &path,
            format!("[tcp_proxy]\n\"port\"=\"{port}\"\n\n[tcp_proxy\\routes]\n"),
        )
        .unwrap();
        path
    }

    /// Scenario: two processes, same binary. The second must exit with
    /// code 1 and report that an instance is already running. Uses the real
    /// /tmp runtime paths, which is the binary's contract.
    #[test]
    fn second_instance_refused() {
        let dir = tempfile::tempdir().unwrap();
        let exe = env!("CARGO_BIN_EXE_tcp-router");
        let fifo = std::path::Path::new("/tmp/tcp-router.fifo");

        // A stale fifo from an earlier run would defeat the startup probe.
        let _ = std::fs::remove_file(fifo);

        // Find a port the first instance can bind.
        let mut first = None;
        for attempt in 0..5u16 {
            let port = 20000 + ((std::process::id() as u16).wrapping_add(attempt * 131) % 20000);
            let config = write_config(dir.path(), port);
            let child = Command::new(exe)
                .arg(&config)
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .spawn()
                .unwrap();
            let mut child = Reaper(child);

            // The fifo appears once the lock is held and startup succeeded.
            let deadline = Instant::now() + Duration::from_secs(10);
            while Instant::now() < deadline && !fifo.exists() {
                if let Some(status) = child.0.try_wait().unwrap() {
                    assert_eq!(status.code(), Some(1), "startup failure must exit 1");
                    break; // port taken, try another
                }
                thread::sleep(Duration::from_millis(20));
            }
            if fifo.exists() && child.0.try_wait().unwrap().is_none() {
                first = Some((child, config));
                break;
            }
        }
        let (first, config) = first.expect("could not start the first instance");

        // Second instance with the same configuration must refuse to start.
        let output = Command::new(exe).arg(&config).output().unwrap();
        assert_eq!(output.status.code(), Some(1));
        let text = format!(
            "{}{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        assert!(
            text.contains("already running"),
            "missing already-running message in: {text}"
        );

        // Clean shutdown of the first instance through its fifo.
        {
            let mut f = std::fs::OpenOptions::new().write(true).open(fifo).unwrap();
            f.write_all(b"exit").unwrap();
        }
        let mut first = first;
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            if let Some(status) = first.0.try_wait().unwrap() {
                assert_eq!(status.code(), Some(0), "clean shutdown must exit 0");
                break;
            }
            assert!(Instant::now() < deadline, "first instance did not exit");
            thread::sleep(Duration::from_millis(20));
        }
    }
}
