//! UDP transport bound to a single device.
//! Independent read and write pumps decouple socket I/O from protocol logic
//! through bounded queues.

use crate::config::QUEUE_CAPACITY;
use crate::error::{MiioError, Result};
use log::{debug, warn};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const READ_BUFFER_SIZE: usize = 2048;

/// A datagram link to one peer.
///
/// Sending enqueues onto the outbound queue; `receive` yields each inbound
/// datagram exactly once. Full queues block their producer, nothing is
/// dropped at this layer.
pub struct Transport {
    peer: String,
    outbound: mpsc::Sender<Vec<u8>>,
    inbound: mpsc::Receiver<Vec<u8>>,
    cancel_token: CancellationToken,
}

/// The far side of an in-memory transport, used to drive simulated devices.
pub struct Endpoint {
    /// Datagrams the local side sent
    pub rx: mpsc::Receiver<Vec<u8>>,
    /// Datagrams to deliver to the local side
    pub tx: mpsc::Sender<Vec<u8>>,
}

impl Transport {
    /// Open a UDP socket connected to `address` and start both pumps.
    pub async fn open(address: SocketAddr) -> Result<Self> {
        let socket = Self::connect_socket(address)?;
        let socket = Arc::new(socket);

        let (out_tx, out_rx) = mpsc::channel::<Vec<u8>>(QUEUE_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel::<Vec<u8>>(QUEUE_CAPACITY);
        let cancel_token = CancellationToken::new();

        tokio::spawn(read_pump(socket.clone(), in_tx, cancel_token.clone()));
        tokio::spawn(write_pump(socket, out_rx, cancel_token.clone()));

        debug!("Transport to {} opened", address);
        Ok(Self {
            peer: address.to_string(),
            outbound: out_tx,
            inbound: in_rx,
            cancel_token,
        })
    }

    /// In-memory transport whose peer is the returned [`Endpoint`].
    pub fn channel(capacity: usize) -> (Self, Endpoint) {
        let (out_tx, out_rx) = mpsc::channel(capacity);
        let (in_tx, in_rx) = mpsc::channel(capacity);
        let transport = Self {
            peer: "memory".to_string(),
            outbound: out_tx,
            inbound: in_rx,
            cancel_token: CancellationToken::new(),
        };
        (
            transport,
            Endpoint {
                rx: out_rx,
                tx: in_tx,
            },
        )
    }

    fn connect_socket(address: SocketAddr) -> Result<UdpSocket> {
        let socket = Socket::new(
            Domain::for_address(address),
            Type::DGRAM,
            Some(Protocol::UDP),
        )
        .map_err(|e| MiioError::ConnectionFailed(e.to_string()))?;

        let local: SocketAddr = if address.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        };
        socket
            .bind(&SockAddr::from(local))
            .and_then(|_| socket.connect(&SockAddr::from(address)))
            .and_then(|_| socket.set_nonblocking(true))
            .map_err(|e| MiioError::ConnectionFailed(e.to_string()))?;

        let std_socket: std::net::UdpSocket = socket.into();
        UdpSocket::from_std(std_socket).map_err(|e| MiioError::ConnectionFailed(e.to_string()))
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Queue a datagram for sending. Waits while the outbound queue is full.
    pub async fn send(&self, bytes: Vec<u8>) -> Result<()> {
        if self.cancel_token.is_cancelled() {
            return Err(MiioError::Closed);
        }
        self.outbound
            .send(bytes)
            .await
            .map_err(|_| MiioError::Closed)
    }

    /// Next inbound datagram, `None` once the transport is closed.
    pub async fn receive(&mut self) -> Option<Vec<u8>> {
        tokio::select! {
            _ = self.cancel_token.cancelled() => None,
            msg = self.inbound.recv() => msg,
        }
    }

    /// Drop anything already queued inbound. Returns the number discarded.
    pub fn drain(&mut self) -> usize {
        let mut count = 0;
        while self.inbound.try_recv().is_ok() {
            count += 1;
        }
        count
    }

    /// Release the socket and stop both pumps.
    pub fn close(&self) {
        if !self.cancel_token.is_cancelled() {
            debug!("Closing transport to {}", self.peer);
            self.cancel_token.cancel();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

async fn read_pump(socket: Arc<UdpSocket>, tx: mpsc::Sender<Vec<u8>>, ct: CancellationToken) {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        tokio::select! {
            _ = ct.cancelled() => break,
            res = socket.recv(&mut buf) => {
                match res {
                    Ok(0) => continue,
                    Ok(len) => {
                        // Owned copy, the read buffer is reused
                        let msg = buf[..len].to_vec();
                        tokio::select! {
                            _ = ct.cancelled() => break,
                            sent = tx.send(msg) => {
                                if sent.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        warn!("Error reading from UDP: {}", e);
                    }
                }
            }
        }
    }
    debug!("Read pump stopped");
}

async fn write_pump(socket: Arc<UdpSocket>, mut rx: mpsc::Receiver<Vec<u8>>, ct: CancellationToken) {
    loop {
        tokio::select! {
            _ = ct.cancelled() => break,
            msg = rx.recv() => {
                match msg {
                    Some(msg) => {
                        if let Err(e) = socket.send(&msg).await {
                            warn!("Error writing to UDP: {}", e);
                        }
                    }
                    None => break,
                }
            }
        }
    }
    debug!("Write pump stopped");
}
