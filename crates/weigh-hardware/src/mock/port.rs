//! Host and device ends of an in-memory serial link.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};

use crate::transport::PortIo;

/// Capacity of each direction of the in-memory link.
pub(crate) const LINK_BUFFER: usize = 4096;

/// Fault injection shared by both ends of a link.
#[derive(Debug, Default)]
struct LinkFaults {
    probe_fails: AtomicBool,
    panic_on_read: AtomicBool,
}

/// Host end, as seen by a transport.
#[derive(Debug)]
pub struct MockPort {
    stream: DuplexStream,
    faults: Arc<LinkFaults>,
}

/// Device end, held by a test playing the instrument.
///
/// Dropping the link is an unplug: the host sees end-of-stream.
#[derive(Debug)]
pub struct MockLink {
    stream: DuplexStream,
    faults: Arc<LinkFaults>,
}

/// A connected host/device pair.
pub(crate) fn link() -> (MockPort, MockLink) {
    let (host, device) = tokio::io::duplex(LINK_BUFFER);
    let faults = Arc::new(LinkFaults::default());
    (
        MockPort {
            stream: host,
            faults: faults.clone(),
        },
        MockLink {
            stream: device,
            faults,
        },
    )
}

impl AsyncRead for MockPort {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.faults.panic_on_read.load(Ordering::SeqCst) {
            panic!("mock port: injected panic on read");
        }
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for MockPort {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

impl PortIo for MockPort {
    fn probe(&self) -> io::Result<()> {
        if self.faults.probe_fails.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "device vanished"));
        }
        Ok(())
    }
}

impl MockLink {
    /// Send bytes to the host as the instrument would.
    pub async fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.stream.write_all(bytes).await
    }

    /// Read exactly `len` bytes written by the host.
    pub async fn read_exact(&mut self, len: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.stream.read_exact(&mut buf).await?;
        Ok(buf)
    }

    /// Make the host's next liveness probe fail while the stream stays open,
    /// like a USB adapter removed without closing the file descriptor.
    pub fn fail_probe(&self) {
        self.faults.probe_fails.store(true, Ordering::SeqCst);
    }

    /// Make the host panic inside its next read.
    pub async fn trigger_panic(&mut self) -> io::Result<()> {
        self.faults.panic_on_read.store(true, Ordering::SeqCst);
        // Wake the pending read.
        self.stream.write_all(b"!").await
    }

    /// Unplug the device.
    pub fn disconnect(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_link_carries_both_directions() {
        let (mut port, mut device) = link();

        device.send(b"MULTITAG\r\n").await.unwrap();
        let mut buf = [0u8; 10];
        port.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"MULTITAG\r\n");

        port.write_all(b"x").await.unwrap();
        assert_eq!(device.read_exact(1).await.unwrap(), b"x");
    }

    #[tokio::test]
    async fn test_disconnect_is_end_of_stream() {
        let (mut port, device) = link();
        device.disconnect();

        let mut buf = Vec::new();
        assert_eq!(port.read_to_end(&mut buf).await.unwrap(), 0);
    }

    #[test]
    fn test_probe_failure() {
        let (port, device) = link();
        assert!(port.probe().is_ok());
        device.fail_probe();
        assert_eq!(port.probe().unwrap_err().kind(), io::ErrorKind::NotConnected);
    }
}
