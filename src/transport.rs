//----------------------------------------------------------------------------------------------
// Module transport
// Duplex datagram transports the master runs on

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;

/// Duplex datagram channel to the target
/// Each datagram carries one or more transport layer messages
#[async_trait]
pub trait XcpTransport: Send + Sync {
    /// Send one datagram
    async fn send(&self, buf: &[u8]) -> io::Result<()>;

    /// Receive one datagram, returns 0 when the transport is closed
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;
}

//----------------------------------------------------------------------------------------------
// UDP

/// XCP on UDP
pub struct UdpTransport {
    socket: UdpSocket,
    dest_addr: SocketAddr,
}

impl UdpTransport {
    pub async fn bind(bind_addr: SocketAddr, dest_addr: SocketAddr) -> io::Result<UdpTransport> {
        let socket = UdpSocket::bind(bind_addr).await?;
        debug!("UDP transport bound to {}, target {}", socket.local_addr()?, dest_addr);
        Ok(UdpTransport { socket, dest_addr })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

#[async_trait]
impl XcpTransport for UdpTransport {
    async fn send(&self, buf: &[u8]) -> io::Result<()> {
        self.socket.send_to(buf, self.dest_addr).await?;
        Ok(())
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let (size, addr) = self.socket.recv_from(buf).await?;
            if addr == self.dest_addr {
                return Ok(size);
            }
            warn!("UDP transport: ignored {} bytes from {}", size, addr);
        }
    }
}

//----------------------------------------------------------------------------------------------
// In process

/// One end of an in process datagram channel, used by simulated targets
pub struct MemoryTransport {
    tx: UnboundedSender<Vec<u8>>,
    rx: Mutex<UnboundedReceiver<Vec<u8>>>,
}

impl MemoryTransport {
    /// Create two connected endpoints
    pub fn pair() -> (MemoryTransport, MemoryTransport) {
        let (tx_a, rx_b) = mpsc::unbounded_channel();
        let (tx_b, rx_a) = mpsc::unbounded_channel();
        (
            MemoryTransport {
                tx: tx_a,
                rx: Mutex::new(rx_a),
            },
            MemoryTransport {
                tx: tx_b,
                rx: Mutex::new(rx_b),
            },
        )
    }
}

#[async_trait]
impl XcpTransport for MemoryTransport {
    async fn send(&self, buf: &[u8]) -> io::Result<()> {
        self.tx
            .send(buf.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "memory transport peer closed"))
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut rx = self.rx.lock().await;
        match rx.recv().await {
            Some(datagram) => {
                // Truncate like a datagram socket
                let n = datagram.len().min(buf.len());
                buf[..n].copy_from_slice(&datagram[..n]);
                Ok(n)
            }
            None => Ok(0),
        }
    }
}

//----------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_transport_pair() {
        let (a, b) = MemoryTransport::pair();
        a.send(&[1, 2, 3]).await.unwrap();
        let mut buf = [0u8; 2];
        let n = b.recv(&mut buf).await.unwrap();
        assert_eq!(n, 2);
        assert_eq!(buf, [1, 2]);

        drop(a);
        assert_eq!(b.recv(&mut buf).await.unwrap(), 0);
        assert!(b.send(&[0]).await.is_err());
    }
}
