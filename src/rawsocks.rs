use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

/// Largest frame read in one call; radiotap + 802.11 + FCS fit comfortably.
pub const RX_BUFFER_LEN: usize = 6000;

fn eth_p_all() -> u16 {
    (libc::ETH_P_ALL as u16).to_be()
}

fn open_socket(ifindex: i32, nonblocking: bool) -> io::Result<OwnedFd> {
    let fd = unsafe { libc::socket(libc::AF_PACKET, libc::SOCK_RAW, eth_p_all() as i32) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // From here the descriptor is closed on every error path.
    let socket = unsafe { OwnedFd::from_raw_fd(fd) };

    let sll = libc::sockaddr_ll {
        sll_family: libc::AF_PACKET as u16,
        sll_protocol: eth_p_all(),
        sll_ifindex: ifindex,
        sll_hatype: 0,
        sll_pkttype: 0,
        sll_halen: 0,
        sll_addr: [0; 8],
    };
    let bound = unsafe {
        libc::bind(
            socket.as_raw_fd(),
            &sll as *const libc::sockaddr_ll as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
        )
    };
    if bound != 0 {
        return Err(io::Error::last_os_error());
    }

    if nonblocking {
        let flags = unsafe { libc::fcntl(socket.as_raw_fd(), libc::F_GETFL) };
        if flags < 0
            || unsafe { libc::fcntl(socket.as_raw_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK) }
                < 0
        {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(socket)
}

/// Non-blocking receive socket bound to `ifindex`.
pub fn open_socket_rx(ifindex: i32) -> io::Result<OwnedFd> {
    open_socket(ifindex, true)
}

pub fn open_socket_tx(ifindex: i32) -> io::Result<OwnedFd> {
    open_socket(ifindex, false)
}

/// Reads one frame. An empty vector means nothing was waiting.
pub fn read_frame(socket: &OwnedFd) -> io::Result<Vec<u8>> {
    let mut buffer = vec![0u8; RX_BUFFER_LEN];
    let len = unsafe {
        libc::read(
            socket.as_raw_fd(),
            buffer.as_mut_ptr() as *mut libc::c_void,
            buffer.len(),
        )
    };
    if len < 0 {
        let error = io::Error::last_os_error();
        if error.kind() == io::ErrorKind::WouldBlock {
            return Ok(Vec::new());
        }
        return Err(error);
    }
    buffer.truncate(len as usize);
    Ok(buffer)
}

pub fn write_packet(socket: &OwnedFd, packet: &[u8]) -> io::Result<()> {
    let written = unsafe {
        libc::write(
            socket.as_raw_fd(),
            packet.as_ptr() as *const libc::c_void,
            packet.len(),
        )
    };
    if written < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
