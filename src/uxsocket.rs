// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Unix stream sockets for the channel handshake, including file descriptor
// passing via SCM_RIGHTS ancillary data. One accept()/connect() per channel;
// after the intro exchange the socket is kept open but unused.

use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::ptr;

fn sockaddr_for(path: &str) -> io::Result<(libc::sockaddr_un, libc::socklen_t)> {
    let mut addr: libc::sockaddr_un = unsafe { mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;

    let bytes = path.as_bytes();
    if bytes.is_empty() || bytes.len() >= addr.sun_path.len() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "socket path empty or too long",
        ));
    }
    for (i, b) in bytes.iter().enumerate() {
        addr.sun_path[i] = *b as libc::c_char;
    }
    let len = mem::size_of::<libc::sockaddr_un>() as libc::socklen_t;
    Ok((addr, len))
}

/// Bind and listen on a Unix stream socket at `path`. Any stale socket file
/// from a previous run is removed first.
pub fn listen(path: &str) -> io::Result<RawFd> {
    let (addr, len) = sockaddr_for(path)?;

    let fd = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_STREAM, 0) };
    if fd == -1 {
        return Err(io::Error::last_os_error());
    }

    // Remove a leftover socket file; bind fails with EADDRINUSE otherwise.
    let c_path = std::ffi::CString::new(path).unwrap();
    unsafe { libc::unlink(c_path.as_ptr()) };

    if unsafe { libc::bind(fd, &addr as *const _ as *const libc::sockaddr, len) } != 0 {
        let err = io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(err);
    }
    if unsafe { libc::listen(fd, 4) } != 0 {
        let err = io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(err);
    }
    Ok(fd)
}

/// Create a socket and start connecting to `path`.
///
/// The socket must already be nonblocking-capable for batch establishment;
/// returns `Ok((fd, true))` when the connection completed immediately,
/// `Ok((fd, false))` when it is still in progress (EINPROGRESS), and an error
/// for anything else. ENOENT/ECONNREFUSED are reported as errors; the caller
/// retries while the listener has not bound yet.
pub fn connect_start(path: &str, nonblocking: bool) -> io::Result<(RawFd, bool)> {
    let (addr, len) = sockaddr_for(path)?;

    let fd = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_STREAM, 0) };
    if fd == -1 {
        return Err(io::Error::last_os_error());
    }
    if nonblocking {
        if let Err(e) = set_nonblocking(fd, true) {
            unsafe { libc::close(fd) };
            return Err(e);
        }
    }

    let ret = unsafe { libc::connect(fd, &addr as *const _ as *const libc::sockaddr, len) };
    if ret == 0 {
        return Ok((fd, true));
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::EINPROGRESS) {
        return Ok((fd, false));
    }
    unsafe { libc::close(fd) };
    Err(err)
}

/// Accept one connection on a listening socket.
pub fn accept(lfd: RawFd) -> io::Result<RawFd> {
    let fd = unsafe { libc::accept(lfd, ptr::null_mut(), ptr::null_mut()) };
    if fd == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

/// Fetch the pending error on a nonblocking connect (SO_ERROR).
pub fn connect_result(fd: RawFd) -> io::Result<()> {
    let mut err: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    if err != 0 {
        return Err(io::Error::from_raw_os_error(err));
    }
    Ok(())
}

pub fn set_nonblocking(fd: RawFd, nonblocking: bool) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags == -1 {
        return Err(io::Error::last_os_error());
    }
    let flags = if nonblocking {
        flags | libc::O_NONBLOCK
    } else {
        flags & !libc::O_NONBLOCK
    };
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub fn close(fd: RawFd) {
    unsafe { libc::close(fd) };
}

/// Send `data` in one message, optionally attaching a file descriptor as
/// SCM_RIGHTS ancillary data.
pub fn send_with_fd(fd: RawFd, data: &[u8], pass_fd: Option<RawFd>) -> io::Result<()> {
    let mut iov = libc::iovec {
        iov_base: data.as_ptr() as *mut libc::c_void,
        iov_len: data.len(),
    };

    // CMSG buffer sized for one fd, alignment per cmsg(3).
    let mut cmsg_buf = [0u8; 64];
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;

    if let Some(pfd) = pass_fd {
        msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = unsafe { libc::CMSG_SPACE(mem::size_of::<RawFd>() as u32) } as _;

        unsafe {
            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN(mem::size_of::<RawFd>() as u32) as _;
            ptr::copy_nonoverlapping(
                &pfd as *const RawFd as *const u8,
                libc::CMSG_DATA(cmsg),
                mem::size_of::<RawFd>(),
            );
        }
    }

    let ret = unsafe { libc::sendmsg(fd, &msg, 0) };
    if ret != data.len() as isize {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Receive exactly `data.len()` bytes, returning an attached file descriptor
/// if one arrived with the message.
pub fn recv_with_fd(fd: RawFd, data: &mut [u8]) -> io::Result<Option<RawFd>> {
    let mut iov = libc::iovec {
        iov_base: data.as_mut_ptr() as *mut libc::c_void,
        iov_len: data.len(),
    };
    let mut cmsg_buf = [0u8; 64];

    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = unsafe { libc::CMSG_SPACE(mem::size_of::<RawFd>() as u32) } as _;

    let ret = unsafe { libc::recvmsg(fd, &mut msg, libc::MSG_WAITALL) };
    if ret != data.len() as isize {
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("short intro read: {ret} of {}", data.len()),
        ));
    }

    let mut passed = None;
    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        if !cmsg.is_null()
            && (*cmsg).cmsg_level == libc::SOL_SOCKET
            && (*cmsg).cmsg_type == libc::SCM_RIGHTS
            && (*cmsg).cmsg_len == libc::CMSG_LEN(mem::size_of::<RawFd>() as u32) as _
        {
            let mut pfd: RawFd = -1;
            ptr::copy_nonoverlapping(
                libc::CMSG_DATA(cmsg),
                &mut pfd as *mut RawFd as *mut u8,
                mem::size_of::<RawFd>(),
            );
            passed = Some(pfd);
        }
    }
    Ok(passed)
}
