//! Connection pairing engine and event loop
//!
//! This is the part that ties the reactor, the routing table, and the
//! control channel together. Per accepted client it selects a route by
//! source IP, starts a non-blocking connect to the target, and installs a
//! forwarding pair: two slots referencing each other as peers, each with
//! both read and write handlers.
//!
//! The forwarding discipline is half-duplex per direction with a 512-byte
//! staging buffer on each side: a read on descriptor X lands in the PEER's
//! buffer (those bytes leave through the peer), and a write on X drains X's
//! own buffer. A reader that finds its peer's buffer non-empty backs off
//! without reading, so a slow receiver exerts end-to-end backpressure; a
//! writer never discards staged bytes until the kernel accepts them, so no
//! byte is lost or duplicated.
//!
//! Teardown is atomic over the pair: the first EOF or hard error on either
//! side closes both descriptors and unbinds the route.

use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};

use socket2::SockRef;
use tracing::{debug, error, info, warn};

use crate::config::ProxyConfig;
use crate::control::{Command, ControlChannel, RuntimePaths};
use crate::error::{is_transient, Result};
use crate::net;
use crate::reactor::{Handler, Reactor, SlotSource, MAX_DESCRIPTORS};
use crate::routes::{RouteSpec, RouteTable};

/// The proxy: reactor state, routing table, and control channel, driven by
/// a strictly single-threaded event loop.
pub struct Proxy {
    reactor: Reactor,
    routes: RouteTable,
    control: ControlChannel,
    listener_fd: RawFd,
    local_addr: SocketAddr,
    keep_running: bool,
}

impl Proxy {
    /// Seed the routing table, bind the listener, and create the command
    /// fifo.
    ///
    /// # Errors
    ///
    /// Fails on unresolvable configured routes, listen failure, or fifo
    /// creation failure — all of which refuse startup.
    pub fn new(config: &ProxyConfig, paths: &RuntimePaths) -> Result<Self> {
        let mut routes = RouteTable::new();
        for spec in &config.routes {
            // No pairs exist yet, so route merging cannot evict anything.
            routes.add(&spec.source_host, &spec.target_host, spec.target_port)?;
        }

        let listener = net::bind_listener(config.port)?;
        let local_addr = listener.local_addr()?;

        let control = ControlChannel::new(paths.fifo.clone());
        let fifo = control.open()?;

        let mut reactor = Reactor::new();
        let listener_fd = reactor.register(
            SlotSource::Listener(listener),
            None,
            Some(Handler::Accept),
            None,
        )?;
        reactor.register(SlotSource::Fifo(fifo), None, Some(Handler::Command), None)?;

        Ok(Self {
            reactor,
            routes,
            control,
            listener_fd,
            local_addr,
            keep_running: true,
        })
    }

    /// Address the listener is bound to.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Read access to the routing table.
    #[must_use]
    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    /// Run the event loop until the `exit` command, then tear everything
    /// down.
    ///
    /// # Errors
    ///
    /// Currently infallible after startup; the signature leaves room for
    /// fatal loop conditions.
    pub fn run(&mut self) -> Result<()> {
        info!(
            "listening for incoming connections on {} (fd {})",
            self.local_addr, self.listener_fd
        );
        while self.keep_running {
            self.turn();
        }
        self.shutdown();
        Ok(())
    }

    /// One reactor iteration: wait for readiness and dispatch one batch.
    ///
    /// Descriptors are serviced in ascending numeric order, read direction
    /// before write. The live interest set is re-consulted before every
    /// dispatch because a handler may unregister any descriptor, including
    /// one later in the same batch.
    pub fn turn(&mut self) {
        let batch = match self.reactor.wait() {
            Ok(batch) => batch,
            Err(e) => {
                error!("readiness wait failed: {e}");
                return;
            }
        };

        for ready in batch {
            if ready.readable {
                match self.reactor.read_handler(ready.fd) {
                    Some(Handler::Accept) => self.on_accept(),
                    Some(Handler::Forward) => self.on_read(ready.fd),
                    Some(Handler::Command) => self.on_command(ready.fd),
                    None => {} // unregistered earlier in this batch
                }
            }
            if ready.writable {
                if let Some(Handler::Forward) = self.reactor.write_handler(ready.fd) {
                    self.on_write(ready.fd);
                }
            }
        }
    }

    /// Whether the loop will keep running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.keep_running
    }

    /// Accept one client and establish its forwarding pair.
    fn on_accept(&mut self) {
        let accepted = {
            let Some(slot) = self.reactor.slot(self.listener_fd) else {
                return;
            };
            let Some(listener) = slot.source.as_listener() else {
                return;
            };
            listener.accept()
        };

        let (stream, peer_addr) = match accepted {
            Ok(conn) => conn,
            Err(ref e) if is_transient(e) => return,
            Err(e) => {
                // An accept failure must not take the service down; keep the
                // listener and wait for the next connection.
                error!("accept failed: {e}");
                return;
            }
        };

        let source_fd = stream.as_raw_fd();
        if source_fd as usize >= MAX_DESCRIPTORS {
            warn!(
                "rejecting connection from {peer_addr}: descriptor {source_fd} \
                 exceeds the limit of {MAX_DESCRIPTORS}"
            );
            return; // dropping the stream closes it
        }
        if let Err(e) = net::apply_socket_policy(SockRef::from(&stream)) {
            warn!("cannot configure accepted socket from {peer_addr}: {e}");
            return;
        }

        let source_ip = peer_addr.ip();
        let Some(route) = self.routes.lookup_by_ip(source_ip) else {
            debug!("no route for {source_ip}, dropping connection");
            return;
        };
        let target = route.target_addr();

        let target_stream = match net::begin_connect(target) {
            Ok(stream) => stream,
            Err(e) => {
                warn!("connect to {target} failed: {e}");
                return;
            }
        };
        let target_fd = target_stream.as_raw_fd();
        if target_fd as usize >= MAX_DESCRIPTORS {
            warn!(
                "rejecting connection from {peer_addr}: descriptor {target_fd} \
                 exceeds the limit of {MAX_DESCRIPTORS}"
            );
            return;
        }

        // Both slots go in before the reactor can schedule either side. The
        // target is write-registered immediately: the first writable event
        // doubles as connect completion and is a no-op while nothing is
        // staged.
        if let Err(e) = self.reactor.register(
            SlotSource::Stream(stream),
            Some(target_fd),
            Some(Handler::Forward),
            Some(Handler::Forward),
        ) {
            warn!("cannot register client socket: {e}");
            return;
        }
        if let Err(e) = self.reactor.register(
            SlotSource::Stream(target_stream),
            Some(source_fd),
            Some(Handler::Forward),
            Some(Handler::Forward),
        ) {
            warn!("cannot register target socket: {e}");
            self.reactor.unregister(source_fd);
            return;
        }
        self.routes.bind(source_ip, source_fd);

        info!(
            "connection proxied: {peer_addr} (fd {source_fd}) -> {target} (fd {target_fd})"
        );
    }

    /// Read readiness on one side of a pair: pull bytes into the peer's
    /// staging buffer.
    fn on_read(&mut self, fd: RawFd) {
        let Some(peer_fd) = self.reactor.peer_of(fd) else {
            return;
        };
        if !self.reactor.contains(peer_fd) {
            // Half the pair is already gone; finish the teardown.
            self.close_pair(fd, Some(peer_fd));
            return;
        }
        let [this, peer] = self.reactor.pair_mut(fd, peer_fd);
        let (Some(this), Some(peer)) = (this, peer) else {
            return;
        };

        if peer.len != 0 {
            return; // backpressure: previous bytes still in flight
        }

        match this.source.read(&mut peer.buf) {
            Ok(0) => {
                debug!("fd {fd}: peer closed the connection");
                self.close_pair(fd, Some(peer_fd));
            }
            Ok(n) => peer.len = n,
            Err(ref e) if is_transient(e) => {}
            Err(e) => {
                debug!("fd {fd}: read error: {e}");
                self.close_pair(fd, Some(peer_fd));
            }
        }
    }

    /// Write readiness on one side of a pair: drain this side's staging
    /// buffer.
    fn on_write(&mut self, fd: RawFd) {
        let Some(slot) = self.reactor.slot_mut(fd) else {
            return;
        };
        if slot.len == 0 {
            return; // nothing staged (also the first event after connect)
        }
        let peer_fd = slot.peer;

        match slot.source.write(&slot.buf[..slot.len]) {
            Ok(0) => {
                debug!("fd {fd}: write returned EOF");
                self.close_pair(fd, peer_fd);
            }
            Ok(n) if n < slot.len => {
                // Partial write: keep the unsent suffix at the front.
                slot.buf.copy_within(n..slot.len, 0);
                slot.len -= n;
            }
            Ok(_) => slot.len = 0,
            Err(ref e) if is_transient(e) => {}
            Err(e) => {
                debug!("fd {fd}: write error: {e}");
                self.close_pair(fd, peer_fd);
            }
        }
    }

    /// Read readiness on the command fifo: accumulate until the writer
    /// closes, then execute.
    fn on_command(&mut self, fd: RawFd) {
        let Some(slot) = self.reactor.slot_mut(fd) else {
            return;
        };
        let offset = slot.len;

        match slot.source.read(&mut slot.buf[offset..]) {
            Ok(0) => {
                // Writer closed: the accumulated text is the whole command.
                let text = String::from_utf8_lossy(&slot.buf[..slot.len])
                    .trim()
                    .to_string();
                self.execute_command(&text);
                if !self.keep_running {
                    return; // shutdown closes the fifo
                }

                // One command per open: recreate the fifo for the next one.
                self.reactor.unregister(fd);
                match self.control.open() {
                    Ok(fifo) => match self.reactor.register(
                        SlotSource::Fifo(fifo),
                        None,
                        Some(Handler::Command),
                        None,
                    ) {
                        Ok(new_fd) => debug!("command fifo reopened (fd {new_fd})"),
                        Err(e) => error!("cannot re-register command fifo: {e}"),
                    },
                    Err(e) => error!("cannot reopen command fifo: {e}"),
                }
            }
            Ok(n) => slot.len += n,
            Err(ref e) if is_transient(e) => {}
            Err(e) => {
                warn!("command fifo read error: {e}");
                slot.len = 0; // drop the partial command, keep the fifo
            }
        }
    }

    fn execute_command(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        match Command::parse(text) {
            Ok(Command::Exit) => {
                info!("exit command received");
                self.keep_running = false;
            }
            Ok(Command::Add(spec)) => self.add_route(&spec),
            Err(e) => warn!("{e}"),
        }
    }

    /// Routing-table add plus forcible teardown of any pair whose route was
    /// replaced while in use.
    fn add_route(&mut self, spec: &RouteSpec) {
        match self
            .routes
            .add(&spec.source_host, &spec.target_host, spec.target_port)
        {
            Ok(evicted) => {
                for fd in evicted {
                    let peer_fd = self.reactor.peer_of(fd);
                    self.close_pair(fd, peer_fd);
                }
            }
            Err(e) => warn!("cannot add route: {e}"),
        }
    }

    /// Tear down a forwarding pair: drop both slots (closing the
    /// descriptors) and clear any route bound to either. Idempotent and
    /// order-independent.
    fn close_pair(&mut self, fd: RawFd, peer_fd: Option<RawFd>) {
        for fd in std::iter::once(fd).chain(peer_fd) {
            if self.reactor.unregister(fd) {
                debug!("fd {fd}: closed");
            }
            self.routes.clear_binding(fd);
        }
    }

    /// Orderly teardown: close every descriptor and remove the fifo.
    fn shutdown(&mut self) {
        info!("shutting down, closing {} descriptor(s)", self.reactor.len());
        self.reactor.clear();
        self.routes.clear_all_bindings();
        self.control.remove();
    }
}
