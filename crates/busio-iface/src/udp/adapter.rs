//! Multicast UDP interface

use std::fmt;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use busio_core::{AlienTransfer, Frame, Timestamp, UdpConfig, UdpFrame};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::time::Instant;

use super::frame::{self, UdpHeader, SUBJECT_ID_MAX};
use crate::adapter::{CaptureHandler, CaptureHandlers, Iface, IfaceCapture};
use crate::error::IfaceError;
use crate::stats::{IfaceStatistics, StatsCell};

/// How long the reader blocks before re-checking the closed flag
const READ_POLL: Duration = Duration::from_millis(100);
const MAX_DATAGRAM: usize = 65_536;

/// UDP interface bound to one NIC
pub struct UdpIface {
    config: UdpConfig,
    local_ip: Ipv4Addr,
    local_addr: SocketAddr,
    socket: Arc<UdpSocket>,
    handlers: Arc<CaptureHandlers>,
    stats: Arc<StatsCell>,
    closed: Arc<AtomicBool>,
}

impl UdpIface {
    /// Open the socket, join the capture groups and start the reader.
    ///
    /// Must be called within a tokio runtime.
    pub fn new(config: &UdpConfig) -> Result<Self, IfaceError> {
        let local_ip = match config.local_nic_address {
            std::net::IpAddr::V4(ip) => ip,
            std::net::IpAddr::V6(ip) => {
                return Err(IfaceError::Unsupported(format!("IPv6 NIC address {}", ip)))
            }
        };
        if config.mtu == 0 {
            return Err(IfaceError::InvalidConfig("MTU must be positive".to_string()));
        }

        let socket = Self::create_socket(config, local_ip)?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| IfaceError::ConnectionFailed(format!("Failed to query socket: {}", e)))?;

        let iface = Self {
            config: config.clone(),
            local_ip,
            local_addr,
            socket: Arc::new(socket),
            handlers: Arc::new(CaptureHandlers::new()),
            stats: Arc::new(StatsCell::new()),
            closed: Arc::new(AtomicBool::new(false)),
        };
        iface.start_reader();

        tracing::info!(
            nic = %local_ip,
            port = local_addr.port(),
            subjects = ?config.capture_subjects,
            service_nodes = ?config.capture_service_nodes,
            "UDP interface opened"
        );
        Ok(iface)
    }

    /// Address the capture socket is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn create_socket(config: &UdpConfig, local_ip: Ipv4Addr) -> Result<UdpSocket, IfaceError> {
        let failed = |what: &str, e: io::Error| {
            IfaceError::ConnectionFailed(format!("Failed to {}: {}", what, e))
        };

        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|e| failed("create socket", e))?;
        socket
            .set_reuse_address(true)
            .map_err(|e| failed("set SO_REUSEADDR", e))?;
        let bind = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.port));
        socket
            .bind(&bind.into())
            .map_err(|e| failed(&format!("bind {}", bind), e))?;

        for &subject_id in &config.capture_subjects {
            if subject_id > SUBJECT_ID_MAX {
                return Err(IfaceError::InvalidConfig(format!(
                    "Subject-ID {} exceeds {}",
                    subject_id, SUBJECT_ID_MAX
                )));
            }
            let group = frame::subject_group(subject_id);
            socket
                .join_multicast_v4(&group, &local_ip)
                .map_err(|e| failed(&format!("join {}", group), e))?;
        }
        for &node_id in &config.capture_service_nodes {
            let group = frame::service_group(node_id);
            socket
                .join_multicast_v4(&group, &local_ip)
                .map_err(|e| failed(&format!("join {}", group), e))?;
        }

        if !local_ip.is_unspecified() {
            socket
                .set_multicast_if_v4(&local_ip)
                .map_err(|e| failed("select multicast NIC", e))?;
        }
        socket
            .set_multicast_loop_v4(true)
            .map_err(|e| failed("enable multicast loop", e))?;
        socket
            .set_read_timeout(Some(READ_POLL))
            .map_err(|e| failed("set read timeout", e))?;

        Ok(socket.into())
    }

    fn start_reader(&self) {
        let socket = self.socket.clone();
        let handlers = self.handlers.clone();
        let stats = self.stats.clone();
        let closed = self.closed.clone();
        let local_addr = self.local_addr;
        let port = self.config.port;

        tokio::task::spawn_blocking(move || {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            while !closed.load(Ordering::SeqCst) {
                match socket.recv_from(&mut buf) {
                    Ok(_) if closed.load(Ordering::SeqCst) => break,
                    Ok((len, source)) => {
                        let payload = buf[..len].to_vec();
                        let destination = UdpHeader::decode(&payload)
                            .map(|h| SocketAddr::V4(SocketAddrV4::new(h.destination_group(), port)))
                            .unwrap_or(local_addr);
                        stats.record_frame(len);
                        handlers.dispatch(IfaceCapture {
                            timestamp: Timestamp::now(),
                            frame: Frame::Udp(UdpFrame {
                                source,
                                destination,
                                payload,
                            }),
                        });
                    }
                    Err(ref e)
                        if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {}
                    Err(e) => {
                        if closed.load(Ordering::SeqCst) {
                            break;
                        }
                        stats.record_error();
                        tracing::warn!(error = %e, "UDP read error");
                        std::thread::sleep(READ_POLL);
                    }
                }
            }
            tracing::debug!(addr = %local_addr, "UDP reader stopped");
        });
    }
}

impl fmt::Debug for UdpIface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UdpIface")
            .field("local_ip", &self.local_ip)
            .field("local_addr", &self.local_addr)
            .field("mtu", &self.config.mtu)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Iface for UdpIface {
    fn transport_name(&self) -> &'static str {
        "udp"
    }

    fn begin_capture(&self, handler: CaptureHandler) {
        self.handlers.add(handler);
    }

    async fn spoof(&self, transfer: &AlienTransfer, deadline: Instant) -> Result<bool, IfaceError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(IfaceError::ResourceClosed);
        }
        let datagrams = frame::serialize_transfer(transfer, self.config.mtu)?;
        let group = frame::destination_group(&transfer.session)?;
        let destination = SocketAddrV4::new(group, self.config.port);
        let copies = if transfer.session.is_service() && self.config.duplicate_service_transfers {
            2
        } else {
            1
        };

        let socket = self.socket.clone();
        let send = tokio::task::spawn_blocking(move || -> io::Result<()> {
            for _ in 0..copies {
                for datagram in &datagrams {
                    socket.send_to(datagram, destination)?;
                }
            }
            Ok(())
        });

        match tokio::time::timeout_at(deadline, send).await {
            Err(_) => Ok(false),
            Ok(Err(join)) => Err(IfaceError::SendFailed(join.to_string())),
            Ok(Ok(Err(e))) => {
                self.stats.record_error();
                if self.closed.load(Ordering::SeqCst) {
                    Err(IfaceError::ResourceClosed)
                } else {
                    Err(IfaceError::SendFailed(format!("{} to {}", e, destination)))
                }
            }
            Ok(Ok(Ok(()))) => Ok(true),
        }
    }

    fn sample_statistics(&self) -> IfaceStatistics {
        self.stats.snapshot()
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.handlers.clear();
            tracing::info!(addr = %self.local_addr, "UDP interface closed");
        }
    }
}

impl Drop for UdpIface {
    fn drop(&mut self) {
        // Stops the reader thread, which owns the other socket handle
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use busio_core::{DataSpecifier, Priority, SessionSpecifier};
    use bytes::Bytes;
    use parking_lot::Mutex;

    fn loopback_config() -> UdpConfig {
        UdpConfig {
            local_nic_address: Ipv4Addr::LOCALHOST.into(),
            port: 0,
            mtu: 1408,
            duplicate_service_transfers: false,
            capture_subjects: vec![],
            capture_service_nodes: vec![],
        }
    }

    #[tokio::test]
    async fn test_captures_incoming_datagrams() {
        let iface = UdpIface::new(&loopback_config()).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        iface.begin_capture(Arc::new(move |cap: IfaceCapture| sink.lock().push(cap)));

        let transfer = AlienTransfer {
            priority: Priority::Nominal,
            transfer_id: 3,
            session: SessionSpecifier {
                data_specifier: DataSpecifier::Message { subject_id: 100 },
                source_node_id: Some(7),
                destination_node_id: None,
            },
            payload: Bytes::from_static(b"ping"),
        };
        let datagram = frame::serialize_transfer(&transfer, 1408).unwrap().remove(0);
        let target = SocketAddr::from((Ipv4Addr::LOCALHOST, iface.local_addr().port()));
        let sender = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        sender.send_to(&datagram, target).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while seen.lock().is_empty() && std::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        match &seen[0].frame {
            Frame::Udp(f) => {
                assert_eq!(f.payload, datagram);
                assert_eq!(f.source, sender.local_addr().unwrap());
                assert_eq!(f.destination.ip(), std::net::IpAddr::from([239, 0, 0, 100]));
            }
            other => panic!("Unexpected frame {:?}", other),
        }
        assert_eq!(iface.sample_statistics().n_frames, 1);
        iface.close();
    }

    #[tokio::test]
    async fn test_closed_rejects_spoof() {
        let iface = UdpIface::new(&loopback_config()).unwrap();
        iface.close();
        iface.close();
        let transfer = AlienTransfer {
            priority: Priority::Nominal,
            transfer_id: 0,
            session: SessionSpecifier {
                data_specifier: DataSpecifier::Message { subject_id: 1 },
                source_node_id: None,
                destination_node_id: None,
            },
            payload: Bytes::new(),
        };
        let err = iface
            .spoof(&transfer, Instant::now() + Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.is_resource_closed());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_dropped_iface_stops_capturing() {
        let iface = UdpIface::new(&loopback_config()).unwrap();
        let hits = Arc::new(Mutex::new(0usize));
        let sink = hits.clone();
        iface.begin_capture(Arc::new(move |_cap: IfaceCapture| *sink.lock() += 1));
        let target = SocketAddr::from((Ipv4Addr::LOCALHOST, iface.local_addr().port()));
        drop(iface);

        let sender = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        // The port may already be released, in which case the send just goes nowhere
        let _ = sender.send_to(b"late", target);
        tokio::time::sleep(READ_POLL * 3).await;

        assert_eq!(*hits.lock(), 0);
        // The handler registry was emptied, releasing the callback
        assert_eq!(Arc::strong_count(&hits), 1);
    }

    #[tokio::test]
    async fn test_rejects_ipv6_and_zero_mtu() {
        let mut cfg = loopback_config();
        cfg.local_nic_address = std::net::Ipv6Addr::LOCALHOST.into();
        assert!(matches!(UdpIface::new(&cfg), Err(IfaceError::Unsupported(_))));

        let mut cfg = loopback_config();
        cfg.mtu = 0;
        assert!(matches!(UdpIface::new(&cfg), Err(IfaceError::InvalidConfig(_))));
    }
}
