// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Channel establishment: the Unix-socket intro handshake.
//
// The listener binds a socket, carves both rings out of the shared memory
// pool, and on accept sends its intro with the pool file descriptor attached.
// The connecter maps the pool from the received descriptor and answers with
// its own intro. Sync negotiation merges both sides' requests. A batch of
// endpoints is driven jointly by poll(2) over nonblocking sockets; any
// failure aborts the whole batch.

use std::mem;
use std::os::unix::io::RawFd;
use std::sync::Arc;

use log::debug;

use crate::channel::{Channel, ChannelParams, RingGeom, SyncMode, SyncProtocol};
use crate::error::{Error, Result};
use crate::proto::base::{intro_bytes, intro_from_bytes, PROTO_VERSION};
use crate::shm::ShmPool;
use crate::uxsocket;

/// Endpoint requests synchronization.
pub const FLAG_SYNC: u64 = 1 << 0;
/// Endpoint forces synchronization.
pub const FLAG_SYNC_FORCE: u64 = 1 << 1;

/// Intro sent by the listener, with the pool file descriptor attached and the
/// upper-layer intro blob appended.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ListenerIntro {
    pub version: u64,
    pub flags: u64,
    /// Listener-to-connecter ring placement.
    pub l2c_offset: u64,
    pub l2c_elen: u64,
    pub l2c_nentries: u64,
    /// Connecter-to-listener ring placement.
    pub c2l_offset: u64,
    pub c2l_elen: u64,
    pub c2l_nentries: u64,
    pub upper_layer_proto: u64,
    /// Offset of the appended upper-layer intro from the start of this struct.
    pub upper_layer_intro_off: u64,
}

const _: () = assert!(mem::size_of::<ListenerIntro>() == 80);

/// Intro sent back by the connecter, upper-layer intro blob appended.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ConnecterIntro {
    pub version: u64,
    pub flags: u64,
    pub upper_layer_proto: u64,
    pub upper_layer_intro_off: u64,
}

const _: () = assert!(mem::size_of::<ConnecterIntro>() == 32);

// ---------------------------------------------------------------------------
// Endpoint state machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HsState {
    /// Listener waits for the peer to connect.
    ListenAccept,
    /// Connecter has a connect in flight (EINPROGRESS).
    Connecting,
    /// Connecter could not reach the socket yet (listener not bound); retry.
    ConnectRetry,
    /// Waiting for the socket to accept our intro.
    SendIntro,
    /// Waiting for the peer's intro.
    RecvIntro,
    Done,
}

/// One channel endpoint being established.
pub struct Endpoint {
    params: ChannelParams,
    listen: bool,
    state: HsState,
    lfd: RawFd,
    cfd: RawFd,
    pool: Option<Arc<ShmPool>>,
    /// Listener-side ring placement within the pool.
    out_off: usize,
    in_off: usize,
    /// Upper-layer intro this side sends.
    tx_intro: Vec<u8>,
    /// Expected byte length of the peer's upper-layer intro.
    peer_intro_len: usize,
    /// The peer's upper-layer intro, filled during establishment.
    peer_intro: Vec<u8>,
    peer_flags: u64,
    /// Ring geometry learned from the listener intro (connecter side).
    conn_out: Option<RingGeom>,
    conn_in: Option<RingGeom>,
}

impl Endpoint {
    pub fn new(params: ChannelParams, listen: bool) -> Result<Self> {
        if params.sync_protocol == SyncProtocol::Barrier {
            return Err(Error::BarrierUnsupported);
        }
        Ok(Self {
            params,
            listen,
            state: if listen {
                HsState::ListenAccept
            } else {
                HsState::ConnectRetry
            },
            lfd: -1,
            cfd: -1,
            pool: None,
            out_off: 0,
            in_off: 0,
            tx_intro: Vec::new(),
            peer_intro_len: 0,
            peer_intro: Vec::new(),
            peer_flags: 0,
            conn_out: None,
            conn_in: None,
        })
    }

    /// Set the upper-layer intro blob this side appends to its base intro.
    pub fn set_intro(&mut self, intro: Vec<u8>) {
        self.tx_intro = intro;
    }

    /// Declare the byte length of the upper-layer intro the peer will send.
    pub fn expect_peer_intro_len(&mut self, len: usize) {
        self.peer_intro_len = len;
    }

    /// The peer's upper-layer intro (valid after establishment).
    pub fn peer_intro(&self) -> &[u8] {
        &self.peer_intro
    }

    pub fn params(&self) -> &ChannelParams {
        &self.params
    }

    pub fn is_listener(&self) -> bool {
        self.listen
    }

    /// Listener setup: bind the socket and carve both rings from `pool`.
    pub fn listen(&mut self, pool: &Arc<ShmPool>) -> Result<()> {
        assert!(self.listen, "listen() on a connecting endpoint");

        let out_size = self.params.out_entry_len * self.params.out_nentries;
        let in_size = self.params.in_entry_len * self.params.in_nentries;
        self.out_off = pool.alloc(out_size).ok_or(Error::PoolExhausted {
            requested: out_size,
            available: pool.available(),
        })?;
        self.in_off = pool.alloc(in_size).ok_or(Error::PoolExhausted {
            requested: in_size,
            available: pool.available(),
        })?;
        self.pool = Some(Arc::clone(pool));

        self.lfd = uxsocket::listen(&self.params.sock_path)?;
        uxsocket::set_nonblocking(self.lfd, true)?;
        debug!("listening on {}", self.params.sock_path);
        Ok(())
    }

    /// Connecter setup: start connecting to the peer's socket.
    pub fn connect(&mut self) -> Result<()> {
        assert!(!self.listen, "connect() on a listening endpoint");
        self.try_connect();
        Ok(())
    }

    fn try_connect(&mut self) {
        match uxsocket::connect_start(&self.params.sock_path, true) {
            Ok((fd, true)) => {
                self.cfd = fd;
                let _ = uxsocket::set_nonblocking(fd, false);
                self.state = HsState::RecvIntro;
            }
            Ok((fd, false)) => {
                self.cfd = fd;
                self.state = HsState::Connecting;
            }
            // Listener may not have bound yet; keep retrying.
            Err(_) => {
                self.state = HsState::ConnectRetry;
            }
        }
    }

    /// The fd and poll events this endpoint currently waits on.
    fn poll_interest(&self) -> Option<(RawFd, libc::c_short)> {
        match self.state {
            HsState::ListenAccept => Some((self.lfd, libc::POLLIN)),
            HsState::Connecting => Some((self.cfd, libc::POLLOUT)),
            HsState::SendIntro => Some((self.cfd, libc::POLLOUT)),
            HsState::RecvIntro => Some((self.cfd, libc::POLLIN)),
            HsState::ConnectRetry | HsState::Done => None,
        }
    }

    /// Advance the state machine after poll reported readiness.
    fn step(&mut self) -> Result<()> {
        match self.state {
            HsState::ListenAccept => {
                let cfd = match uxsocket::accept(self.lfd) {
                    Ok(fd) => fd,
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
                    Err(e) => return Err(e.into()),
                };
                uxsocket::close(self.lfd);
                self.lfd = -1;
                // Intro I/O below is small and framed; run it blocking.
                uxsocket::set_nonblocking(cfd, false)?;
                self.cfd = cfd;
                self.state = HsState::SendIntro;
                debug!("{}: connection accepted", self.params.sock_path);
                Ok(())
            }
            HsState::Connecting => {
                uxsocket::connect_result(self.cfd)?;
                uxsocket::set_nonblocking(self.cfd, false)?;
                self.state = HsState::RecvIntro;
                Ok(())
            }
            HsState::ConnectRetry => {
                self.try_connect();
                Ok(())
            }
            HsState::SendIntro => {
                if self.listen {
                    self.send_listener_intro()?;
                    self.state = HsState::RecvIntro;
                } else {
                    self.send_connecter_intro()?;
                    self.state = HsState::Done;
                }
                Ok(())
            }
            HsState::RecvIntro => {
                if self.listen {
                    self.recv_connecter_intro()?;
                    self.state = HsState::Done;
                } else {
                    self.recv_listener_intro()?;
                    self.state = HsState::SendIntro;
                }
                Ok(())
            }
            HsState::Done => Ok(()),
        }
    }

    fn local_flags(&self) -> u64 {
        let mut flags = 0;
        if self.params.sync_mode != SyncMode::Disabled {
            flags |= FLAG_SYNC;
        }
        if self.params.sync_force {
            flags |= FLAG_SYNC_FORCE;
        }
        flags
    }

    fn send_listener_intro(&mut self) -> Result<()> {
        let intro = ListenerIntro {
            version: PROTO_VERSION,
            flags: self.local_flags(),
            l2c_offset: self.out_off as u64,
            l2c_elen: self.params.out_entry_len as u64,
            l2c_nentries: self.params.out_nentries as u64,
            c2l_offset: self.in_off as u64,
            c2l_elen: self.params.in_entry_len as u64,
            c2l_nentries: self.params.in_nentries as u64,
            upper_layer_proto: self.params.upper_layer_proto,
            upper_layer_intro_off: mem::size_of::<ListenerIntro>() as u64,
        };
        let mut buf = Vec::with_capacity(mem::size_of::<ListenerIntro>() + self.tx_intro.len());
        buf.extend_from_slice(intro_bytes(&intro));
        buf.extend_from_slice(&self.tx_intro);

        let pool_fd = self.pool.as_ref().expect("listener has no pool").fd();
        uxsocket::send_with_fd(self.cfd, &buf, Some(pool_fd))?;
        debug!("{}: intro sent", self.params.sock_path);
        Ok(())
    }

    fn send_connecter_intro(&mut self) -> Result<()> {
        let intro = ConnecterIntro {
            version: PROTO_VERSION,
            flags: self.local_flags(),
            upper_layer_proto: self.params.upper_layer_proto,
            upper_layer_intro_off: mem::size_of::<ConnecterIntro>() as u64,
        };
        let mut buf = Vec::with_capacity(mem::size_of::<ConnecterIntro>() + self.tx_intro.len());
        buf.extend_from_slice(intro_bytes(&intro));
        buf.extend_from_slice(&self.tx_intro);
        uxsocket::send_with_fd(self.cfd, &buf, None)?;
        debug!("{}: intro sent", self.params.sock_path);
        Ok(())
    }

    fn recv_listener_intro(&mut self) -> Result<()> {
        let total = mem::size_of::<ListenerIntro>() + self.peer_intro_len;
        let mut buf = vec![0u8; total];
        let fd = uxsocket::recv_with_fd(self.cfd, &mut buf)?;
        let intro: ListenerIntro = intro_from_bytes(&buf)
            .ok_or_else(|| Error::Proto("short listener intro".into()))?;

        if intro.version != PROTO_VERSION {
            return Err(Error::Proto(format!(
                "version mismatch: peer {} local {PROTO_VERSION}",
                intro.version
            )));
        }
        if intro.upper_layer_proto != self.params.upper_layer_proto {
            return Err(Error::Proto(format!(
                "upper-layer protocol mismatch: peer {:#x} local {:#x}",
                intro.upper_layer_proto, self.params.upper_layer_proto
            )));
        }
        let fd = fd.ok_or_else(|| Error::Proto("listener intro carried no shm fd".into()))?;
        let pool = ShmPool::map_fd(fd)?;
        let needed = (intro.l2c_offset + intro.l2c_elen * intro.l2c_nentries)
            .max(intro.c2l_offset + intro.c2l_elen * intro.c2l_nentries) as usize;
        if needed > pool.size() {
            return Err(Error::Proto(format!(
                "intro ring layout ({needed} bytes) exceeds pool size {}",
                pool.size()
            )));
        }
        self.pool = Some(Arc::new(pool));

        // This side produces into the connecter-to-listener ring.
        self.conn_out = Some(RingGeom {
            offset: intro.c2l_offset as usize,
            entry_len: intro.c2l_elen as usize,
            nentries: intro.c2l_nentries as usize,
        });
        self.conn_in = Some(RingGeom {
            offset: intro.l2c_offset as usize,
            entry_len: intro.l2c_elen as usize,
            nentries: intro.l2c_nentries as usize,
        });
        self.peer_flags = intro.flags;
        let off = intro.upper_layer_intro_off as usize;
        if off > buf.len() {
            return Err(Error::Proto(format!("upper-layer intro offset {off} out of range")));
        }
        self.peer_intro = buf[off..].to_vec();
        debug!("{}: intro received", self.params.sock_path);
        Ok(())
    }

    fn recv_connecter_intro(&mut self) -> Result<()> {
        let total = mem::size_of::<ConnecterIntro>() + self.peer_intro_len;
        let mut buf = vec![0u8; total];
        uxsocket::recv_with_fd(self.cfd, &mut buf)?;
        let intro: ConnecterIntro = intro_from_bytes(&buf)
            .ok_or_else(|| Error::Proto("short connecter intro".into()))?;

        if intro.version != PROTO_VERSION {
            return Err(Error::Proto(format!(
                "version mismatch: peer {} local {PROTO_VERSION}",
                intro.version
            )));
        }
        if intro.upper_layer_proto != self.params.upper_layer_proto {
            return Err(Error::Proto(format!(
                "upper-layer protocol mismatch: peer {:#x} local {:#x}",
                intro.upper_layer_proto, self.params.upper_layer_proto
            )));
        }
        self.peer_flags = intro.flags;
        let off = intro.upper_layer_intro_off as usize;
        if off > buf.len() {
            return Err(Error::Proto(format!("upper-layer intro offset {off} out of range")));
        }
        self.peer_intro = buf[off..].to_vec();
        debug!("{}: intro received", self.params.sock_path);
        Ok(())
    }

    /// Negotiated synchronization: on when both sides request it, or when one
    /// side both requests and forces it.
    pub fn sync_negotiated(&self) -> bool {
        let local_req = self.params.sync_mode != SyncMode::Disabled;
        let local_force = self.params.sync_force;
        let peer_req = self.peer_flags & FLAG_SYNC != 0;
        let peer_force = self.peer_flags & FLAG_SYNC_FORCE != 0;
        (local_req && peer_req) || (local_req && local_force) || (peer_req && peer_force)
    }

    /// Turn the established endpoint into a channel.
    pub fn into_channel(self) -> Result<Channel> {
        if self.state != HsState::Done {
            return Err(Error::Proto("endpoint not established".into()));
        }
        let sync = self.sync_negotiated();
        let pool = self.pool.clone().expect("established endpoint has a pool");
        let (out, inc) = if self.listen {
            (
                RingGeom {
                    offset: self.out_off,
                    entry_len: self.params.out_entry_len,
                    nentries: self.params.out_nentries,
                },
                RingGeom {
                    offset: self.in_off,
                    entry_len: self.params.in_entry_len,
                    nentries: self.params.in_nentries,
                },
            )
        } else {
            (
                self.conn_out.expect("connecter endpoint has ring geometry"),
                self.conn_in.expect("connecter endpoint has ring geometry"),
            )
        };
        Ok(Channel::new(
            pool,
            out,
            inc,
            sync,
            self.params.sync_interval,
            self.params.link_latency,
        ))
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        if self.lfd != -1 {
            uxsocket::close(self.lfd);
        }
        // The connection socket stays open for the lifetime of the channel in
        // the original design; nothing is ever sent on it again, so closing
        // it here is equivalent.
        if self.cfd != -1 {
            uxsocket::close(self.cfd);
        }
    }
}

// ---------------------------------------------------------------------------
// Batch establishment
// ---------------------------------------------------------------------------

/// How long to wait between connect retries while the listener's socket does
/// not exist yet.
const CONNECT_RETRY_MS: libc::c_int = 10;

/// Drive all endpoints' handshakes jointly until every one is done.
///
/// Endpoints must have had [`Endpoint::listen`] or [`Endpoint::connect`]
/// called. Any endpoint failure aborts the whole batch.
pub fn establish(endpoints: &mut [&mut Endpoint]) -> Result<()> {
    loop {
        let mut pollfds: Vec<libc::pollfd> = Vec::with_capacity(endpoints.len());
        let mut index: Vec<usize> = Vec::with_capacity(endpoints.len());
        let mut retrying = false;
        let mut pending = false;

        for (i, ep) in endpoints.iter().enumerate() {
            match ep.state {
                HsState::Done => continue,
                HsState::ConnectRetry => {
                    retrying = true;
                    pending = true;
                }
                _ => {
                    let (fd, events) = ep.poll_interest().expect("non-done endpoint has interest");
                    pollfds.push(libc::pollfd {
                        fd,
                        events,
                        revents: 0,
                    });
                    index.push(i);
                    pending = true;
                }
            }
        }
        if !pending {
            return Ok(());
        }

        let timeout = if retrying { CONNECT_RETRY_MS } else { -1 };
        if !pollfds.is_empty() {
            let ret = unsafe { libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, timeout) };
            if ret < 0 {
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                return Err(err.into());
            }
            for (slot, &i) in pollfds.iter().zip(index.iter()) {
                if slot.revents != 0 {
                    endpoints[i].step()?;
                }
            }
        } else if retrying {
            // Only retrying connects are left; back off briefly.
            unsafe { libc::poll(std::ptr::null_mut(), 0, CONNECT_RETRY_MS) };
        }

        for ep in endpoints.iter_mut() {
            if ep.state == HsState::ConnectRetry {
                ep.step()?;
            }
        }
    }
}
