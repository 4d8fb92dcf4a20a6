//! Readiness reactor
//!
//! A single-threaded, level-triggered event loop core. The reactor tracks a
//! slot per registered descriptor and two interest sets (read and write);
//! [`Reactor::wait`] blocks in poll(2) until at least one descriptor is
//! ready and reports readiness in ascending descriptor order.
//!
//! Handlers are not function pointers but small tags ([`Handler`]); the
//! engine dispatches on the tag so the receiver state is passed explicitly.
//! A handler is installed for a direction exactly when the descriptor is in
//! that direction's interest set.
//!
//! Slots own their OS resource. Unregistering removes the slot, and dropping
//! it closes the descriptor, so a later slot for a reused descriptor number
//! always starts from a clean state.

use std::collections::{BTreeSet, HashMap};
use std::fs::File;
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};

use crate::error::ReactorError;

/// Per-direction staging buffer size in bytes.
pub const BUFFER_SIZE: usize = 512;

/// Highest descriptor value the reactor tracks, exclusive.
pub const MAX_DESCRIPTORS: usize = 1024;

/// Which engine callback services a ready descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handler {
    /// Accept a client on the listening socket.
    Accept,
    /// Shuttle bytes on one side of an established pair.
    Forward,
    /// Accumulate an operator command from the control fifo.
    Command,
}

/// The OS resource owned by a slot.
#[derive(Debug)]
pub enum SlotSource {
    Listener(TcpListener),
    Stream(TcpStream),
    Fifo(File),
}

impl SlotSource {
    /// Single non-blocking read. Listeners are not readable sources.
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            SlotSource::Stream(stream) => {
                let mut stream: &TcpStream = stream;
                stream.read(buf)
            }
            SlotSource::Fifo(fifo) => {
                let mut fifo: &File = fifo;
                fifo.read(buf)
            }
            SlotSource::Listener(_) => Err(io::Error::from(io::ErrorKind::InvalidInput)),
        }
    }

    /// Single non-blocking write. Only streams are writable.
    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        match self {
            SlotSource::Stream(stream) => {
                let mut stream: &TcpStream = stream;
                stream.write(buf)
            }
            _ => Err(io::Error::from(io::ErrorKind::InvalidInput)),
        }
    }

    #[must_use]
    pub fn as_listener(&self) -> Option<&TcpListener> {
        match self {
            SlotSource::Listener(listener) => Some(listener),
            _ => None,
        }
    }
}

impl AsRawFd for SlotSource {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            SlotSource::Listener(listener) => listener.as_raw_fd(),
            SlotSource::Stream(stream) => stream.as_raw_fd(),
            SlotSource::Fifo(fifo) => fifo.as_raw_fd(),
        }
    }
}

/// State attached to one registered descriptor.
///
/// `buf[..len]` holds bytes awaiting transmission on this descriptor; they
/// were read from the peer descriptor (or, for the control fifo, accumulated
/// command text).
#[derive(Debug)]
pub struct Slot {
    pub(crate) source: SlotSource,
    pub(crate) peer: Option<RawFd>,
    pub(crate) read_handler: Option<Handler>,
    pub(crate) write_handler: Option<Handler>,
    pub(crate) buf: [u8; BUFFER_SIZE],
    pub(crate) len: usize,
}

impl Slot {
    fn new(
        source: SlotSource,
        peer: Option<RawFd>,
        read_handler: Option<Handler>,
        write_handler: Option<Handler>,
    ) -> Self {
        Self {
            source,
            peer,
            read_handler,
            write_handler,
            buf: [0; BUFFER_SIZE],
            len: 0,
        }
    }

    /// The paired descriptor, if this slot belongs to a forwarding pair.
    #[must_use]
    pub fn peer(&self) -> Option<RawFd> {
        self.peer
    }

    /// Bytes currently staged for transmission on this descriptor.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.len
    }
}

/// One ready descriptor from a wait, with the directions that fired.
///
/// Error and hang-up conditions are folded into read readiness so EOF and
/// failed connects surface through the read handler.
#[derive(Debug, Clone, Copy)]
pub struct Readiness {
    pub fd: RawFd,
    pub readable: bool,
    pub writable: bool,
}

/// Slot map plus interest sets.
#[derive(Debug, Default)]
pub struct Reactor {
    slots: HashMap<RawFd, Slot>,
    readable: BTreeSet<RawFd>,
    writable: BTreeSet<RawFd>,
}

impl Reactor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered descriptors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    #[must_use]
    pub fn contains(&self, fd: RawFd) -> bool {
        self.slots.contains_key(&fd)
    }

    /// Register a descriptor. `None` handlers leave that direction out of the
    /// interest set.
    ///
    /// On success returns the descriptor number. On failure the source is
    /// consumed and dropped, closing the descriptor, which is what every
    /// caller would do anyway.
    ///
    /// # Errors
    ///
    /// `DescriptorLimit` if the descriptor is at or above the reactor
    /// ceiling; `SlotOccupied` if it already has a slot.
    pub fn register(
        &mut self,
        source: SlotSource,
        peer: Option<RawFd>,
        read_handler: Option<Handler>,
        write_handler: Option<Handler>,
    ) -> Result<RawFd, ReactorError> {
        let fd = source.as_raw_fd();
        if fd < 0 || fd as usize >= MAX_DESCRIPTORS {
            return Err(ReactorError::DescriptorLimit {
                fd,
                limit: MAX_DESCRIPTORS,
            });
        }
        if self.slots.contains_key(&fd) {
            return Err(ReactorError::SlotOccupied { fd });
        }
        if read_handler.is_some() {
            self.readable.insert(fd);
        }
        if write_handler.is_some() {
            self.writable.insert(fd);
        }
        self.slots
            .insert(fd, Slot::new(source, peer, read_handler, write_handler));
        Ok(fd)
    }

    /// Remove a descriptor from both interest sets and drop its slot,
    /// closing the descriptor. Returns whether a slot existed.
    pub fn unregister(&mut self, fd: RawFd) -> bool {
        self.readable.remove(&fd);
        self.writable.remove(&fd);
        self.slots.remove(&fd).is_some()
    }

    /// Drop every slot, closing all registered descriptors.
    pub fn clear(&mut self) {
        self.readable.clear();
        self.writable.clear();
        self.slots.clear();
    }

    /// Read handler for `fd`, consulting the live interest set. This is the
    /// re-check a dispatcher must make before every callback: an earlier
    /// handler in the same batch may have unregistered this descriptor.
    #[must_use]
    pub fn read_handler(&self, fd: RawFd) -> Option<Handler> {
        if !self.readable.contains(&fd) {
            return None;
        }
        self.slots.get(&fd).and_then(|slot| slot.read_handler)
    }

    /// Write handler for `fd`, consulting the live interest set.
    #[must_use]
    pub fn write_handler(&self, fd: RawFd) -> Option<Handler> {
        if !self.writable.contains(&fd) {
            return None;
        }
        self.slots.get(&fd).and_then(|slot| slot.write_handler)
    }

    /// Peer descriptor recorded in the slot for `fd`.
    #[must_use]
    pub fn peer_of(&self, fd: RawFd) -> Option<RawFd> {
        self.slots.get(&fd).and_then(Slot::peer)
    }

    #[must_use]
    pub fn slot(&self, fd: RawFd) -> Option<&Slot> {
        self.slots.get(&fd)
    }

    pub fn slot_mut(&mut self, fd: RawFd) -> Option<&mut Slot> {
        self.slots.get_mut(&fd)
    }

    /// Both slots of a pair, mutably. Yields `[None, None]` when the two
    /// descriptors are equal, which a well-formed pair never is.
    pub fn pair_mut(&mut self, fd: RawFd, peer_fd: RawFd) -> [Option<&mut Slot>; 2] {
        if fd == peer_fd {
            return [None, None];
        }
        self.slots.get_disjoint_mut([&fd, &peer_fd])
    }

    /// Block until at least one descriptor in either interest set is ready.
    ///
    /// Readiness records come back in ascending descriptor order (standard
    /// streams are never registered, so numbering effectively starts at 3).
    ///
    /// # Errors
    ///
    /// `ReactorError::Wait` if poll(2) itself fails. No descriptor state is
    /// changed in that case.
    pub fn wait(&self) -> Result<Vec<Readiness>, ReactorError> {
        let mut pollfds: Vec<libc::pollfd> = Vec::with_capacity(self.slots.len());
        for &fd in self.readable.union(&self.writable) {
            let mut events: libc::c_short = 0;
            if self.readable.contains(&fd) {
                events |= libc::POLLIN;
            }
            if self.writable.contains(&fd) {
                events |= libc::POLLOUT;
            }
            pollfds.push(libc::pollfd {
                fd,
                events,
                revents: 0,
            });
        }

        let rc = unsafe { libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, -1) };
        if rc < 0 {
            return Err(ReactorError::Wait(io::Error::last_os_error()));
        }

        // BTreeSet::union iterates in ascending order, and the order is
        // preserved here.
        let ready = pollfds
            .iter()
            .filter(|p| p.revents != 0)
            .map(|p| Readiness {
                fd: p.fd,
                readable: p.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0,
                writable: p.revents & (libc::POLLOUT | libc::POLLERR) != 0,
            })
            .collect();
        Ok(ready)
    }
}
