//! Raw ARP socket on the physical interface.
//!
//! An `AF_PACKET`/`SOCK_RAW` socket filtered to `ETH_P_ARP` and bound to one
//! interface, driven through tokio's `AsyncFd`. Frames go to
//! [`NeighborResponder`]; replies are written back on the same socket.

use std::io::{self, Read, Write};
use std::os::fd::AsRawFd;
use std::path::Path;

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::unix::AsyncFd;

use veil_core::MacAddr;
use veil_services::NeighborResponder;

const ETH_P_ARP: u16 = libc::ETH_P_ARP as u16;

pub struct ArpSocket {
    fd: AsyncFd<Socket>,
    interface: String,
}

impl ArpSocket {
    pub fn bind(interface: &str) -> Result<Self> {
        let index = nix::net::if_::if_nametoindex(interface)
            .with_context(|| format!("interface '{interface}' not found"))?;

        let socket = Socket::new(
            Domain::from(libc::AF_PACKET),
            Type::RAW,
            Some(Protocol::from(ETH_P_ARP.to_be() as libc::c_int)),
        )
        .context("socket(AF_PACKET)")?;

        let mut addr: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
        addr.sll_family = libc::AF_PACKET as libc::sa_family_t;
        addr.sll_protocol = ETH_P_ARP.to_be();
        addr.sll_ifindex = index as libc::c_int;
        let rc = unsafe {
            libc::bind(
                socket.as_raw_fd(),
                &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error())
                .with_context(|| format!("bind(AF_PACKET) to '{interface}'"));
        }

        socket.set_nonblocking(true).context("set_nonblocking")?;
        let fd = AsyncFd::new(socket).context("register ARP socket with tokio")?;

        tracing::info!(interface, index, "ARP socket bound");
        Ok(Self {
            fd,
            interface: interface.to_string(),
        })
    }

    pub async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.fd.readable().await?;
            match guard.try_io(|inner| {
                let mut socket = inner.get_ref();
                socket.read(buf)
            }) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    pub async fn send(&self, frame: &[u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.fd.writable().await?;
            match guard.try_io(|inner| {
                let mut socket = inner.get_ref();
                socket.write(frame)
            }) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }
}

/// The interface's hardware address as reported by sysfs.
pub fn interface_mac(interface: &str) -> Result<MacAddr> {
    let path = Path::new("/sys/class/net").join(interface).join("address");
    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    text.parse()
        .with_context(|| format!("unexpected contents in {}", path.display()))
}

/// Answer ARP until the socket fails. Only returns on a read error.
pub async fn responder_loop(socket: ArpSocket, mut responder: NeighborResponder) -> Result<()> {
    let mut buf = vec![0u8; 2048];
    tracing::info!(
        interface = %socket.interface,
        mac = %responder.local_mac(),
        "neighbor responder starting"
    );

    loop {
        let len = socket
            .recv(&mut buf)
            .await
            .with_context(|| format!("read from ARP socket on '{}' failed", socket.interface))?;

        match responder.handle_frame(&buf[..len]) {
            Ok(Some(reply)) => {
                if let Err(e) = socket.send(&reply).await {
                    tracing::warn!(error = %e, "failed to send ARP reply");
                }
            }
            Ok(None) => {}
            Err(e) => tracing::debug!(error = %e, len, "dropping malformed frame"),
        }
    }
}
