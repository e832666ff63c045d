// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Transport primitives: the UDP discovery socket, the TCP control stream, and
// the seams that let tests substitute in-memory fakes for both.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UdpSocket};
use tracing::debug;

use forgelink_core::error::{ForgeError, Result};

/// Any byte stream a control session can run over.
///
/// `TcpStream` in production, `tokio::io::DuplexStream` in tests.
pub trait ControlStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ControlStream for T {}

/// A datagram socket that discovery sends probes on and reads replies from.
pub trait DatagramChannel: Send + Sync {
    fn send_to(
        &self,
        buf: &[u8],
        target: SocketAddr,
    ) -> impl Future<Output = io::Result<usize>> + Send;

    fn recv_from(
        &self,
        buf: &mut [u8],
    ) -> impl Future<Output = io::Result<(usize, SocketAddr)>> + Send;
}

impl DatagramChannel for UdpSocket {
    fn send_to(
        &self,
        buf: &[u8],
        target: SocketAddr,
    ) -> impl Future<Output = io::Result<usize>> + Send {
        UdpSocket::send_to(self, buf, target)
    }

    fn recv_from(
        &self,
        buf: &mut [u8],
    ) -> impl Future<Output = io::Result<(usize, SocketAddr)>> + Send {
        UdpSocket::recv_from(self, buf)
    }
}

/// Bind an ephemeral, broadcast-enabled UDP socket for one discovery call.
pub async fn bind_discovery_socket() -> io::Result<UdpSocket> {
    let socket = UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], 0))).await?;
    socket.set_broadcast(true)?;
    debug!(local = ?socket.local_addr().ok(), "discovery socket bound");
    Ok(socket)
}

/// Open a TCP connection within `timeout`.
pub async fn connect_tcp(addr: SocketAddr, timeout: Duration) -> Result<TcpStream> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| {
            ForgeError::Timeout(format!(
                "TCP connection to {addr} timed out after {}ms",
                timeout.as_millis()
            ))
        })?
        .map_err(|e| ForgeError::Connection(format!("TCP connect to {addr}: {e}")))?;

    // Command frames are tiny; don't let Nagle hold them back.
    stream
        .set_nodelay(true)
        .map_err(|e| ForgeError::Connection(format!("set TCP_NODELAY on {addr}: {e}")))?;
    debug!(%addr, "TCP control connection established");
    Ok(stream)
}
