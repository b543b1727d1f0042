//! Link to the microcontroller: write one command byte, read one inbound line.
//! The `serial` feature gates the real USB-serial port; the simulated device
//! in `sim` implements the same trait for development without hardware.

use anyhow::Result;

#[allow(async_fn_in_trait)]
pub trait ActuationChannel {
    async fn send(&mut self, byte: u8) -> Result<()>;

    /// Next inbound line, newline stripped. `None` once the link is closed.
    async fn recv_line(&mut self) -> Result<Option<Vec<u8>>>;
}

// ---------------------------------------------------------------------------
// Serial link (production, requires the `serial` feature)
// ---------------------------------------------------------------------------
#[cfg(any(feature = "serial", test))]
pub use serial::SerialChannel;

#[cfg(any(feature = "serial", test))]
mod serial {
    use std::io::{self, ErrorKind, Read, Write};
    use std::time::Duration;

    use anyhow::{anyhow, Context, Result};
    use tokio::sync::mpsc::error::TryRecvError;
    use tokio::sync::{mpsc, oneshot};
    use tracing::{debug, error, info, warn};

    use super::ActuationChannel;

    /// Lines buffered between the I/O thread and the control loop.
    const LINE_BUFFER: usize = 64;
    /// Read timeout on the port; also bounds how long a queued write waits.
    #[cfg(feature = "serial")]
    const POLL_INTERVAL: Duration = Duration::from_millis(50);
    #[cfg(feature = "serial")]
    const REOPEN_DELAY: Duration = Duration::from_secs(2);

    type WriteRequest = (u8, oneshot::Sender<io::Result<()>>);

    /// Handle to a dedicated I/O thread that owns the port. Writes are queued
    /// to the thread, so `send` never blocks the runtime. When the port fails
    /// the thread reopens it and the control loop just sees a quiet link.
    pub struct SerialChannel {
        writes: mpsc::UnboundedSender<WriteRequest>,
        lines: mpsc::Receiver<Vec<u8>>,
    }

    impl SerialChannel {
        #[cfg(feature = "serial")]
        pub fn open(port: &str, baud_rate: u32) -> Result<Self> {
            let first = open_port(port, baud_rate)
                .with_context(|| format!("failed to open serial port {port}"))?;
            info!(port, baud_rate, "serial link open");

            let name = port.to_string();
            Ok(Self::spawn(port, first, REOPEN_DELAY, move || {
                open_port(&name, baud_rate)
            }))
        }

        /// Start the I/O thread on an already open port. `reopen` is called
        /// every `reopen_delay` after a failure until it succeeds.
        pub fn spawn<P, F>(name: &str, first: P, reopen_delay: Duration, reopen: F) -> Self
        where
            P: Read + Write + Send + 'static,
            F: FnMut() -> io::Result<P> + Send + 'static,
        {
            let (writes, write_rx) = mpsc::unbounded_channel();
            let (line_tx, lines) = mpsc::channel(LINE_BUFFER);
            let link = Link {
                name: name.to_string(),
                writes: write_rx,
                lines: line_tx,
                reopen_delay,
            };
            std::thread::spawn(move || link.run(first, reopen));
            Self { writes, lines }
        }
    }

    #[cfg(feature = "serial")]
    fn open_port(port: &str, baud_rate: u32) -> io::Result<Box<dyn serialport::SerialPort>> {
        let port = serialport::new(port, baud_rate)
            .timeout(POLL_INTERVAL)
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .parity(serialport::Parity::None)
            .open()?;
        // Drop whatever the board printed while it booted.
        port.clear(serialport::ClearBuffer::All)?;
        Ok(port)
    }

    enum SessionEnd {
        Failed,
        Shutdown,
    }

    struct Link {
        name: String,
        writes: mpsc::UnboundedReceiver<WriteRequest>,
        lines: mpsc::Sender<Vec<u8>>,
        reopen_delay: Duration,
    }

    impl Link {
        fn run<P, F>(mut self, first: P, mut reopen: F)
        where
            P: Read + Write,
            F: FnMut() -> io::Result<P>,
        {
            let mut port = first;
            loop {
                if let SessionEnd::Shutdown = self.session(&mut port) {
                    debug!(port = %self.name, "control loop gone, serial thread exiting");
                    return;
                }
                port = loop {
                    std::thread::sleep(self.reopen_delay);
                    if self.reject_pending_writes() {
                        return;
                    }
                    match reopen() {
                        Ok(p) => {
                            info!(port = %self.name, "serial link reopened");
                            break p;
                        }
                        Err(e) => warn!(port = %self.name, "serial reopen failed: {e}"),
                    }
                };
            }
        }

        /// Service queued writes and forward complete lines until the port
        /// fails or the control loop goes away.
        fn session<P: Read + Write>(&mut self, port: &mut P) -> SessionEnd {
            let mut partial = Vec::new();
            let mut chunk = [0u8; 256];
            loop {
                loop {
                    match self.writes.try_recv() {
                        Ok((byte, reply)) => {
                            let res = port.write_all(&[byte]).and_then(|()| port.flush());
                            let failed = res.is_err();
                            if let Err(e) = &res {
                                error!(port = %self.name, "serial write failed: {e}");
                            }
                            let _ = reply.send(res);
                            if failed {
                                return SessionEnd::Failed;
                            }
                        }
                        Err(TryRecvError::Empty) => break,
                        Err(TryRecvError::Disconnected) => return SessionEnd::Shutdown,
                    }
                }

                match port.read(&mut chunk) {
                    Ok(0) => {
                        error!(port = %self.name, "serial port closed");
                        return SessionEnd::Failed;
                    }
                    Ok(n) => {
                        partial.extend_from_slice(&chunk[..n]);
                        while let Some(end) = partial.iter().position(|&b| b == b'\n') {
                            let line: Vec<u8> = partial.drain(..=end).collect();
                            if self.lines.blocking_send(line).is_err() {
                                return SessionEnd::Shutdown;
                            }
                        }
                    }
                    Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {}
                    Err(e) => {
                        error!(port = %self.name, "serial read failed: {e}");
                        return SessionEnd::Failed;
                    }
                }

                if self.lines.is_closed() {
                    return SessionEnd::Shutdown;
                }
            }
        }

        /// Fail writes queued while the port is down. Returns true once the
        /// control loop has gone away.
        fn reject_pending_writes(&mut self) -> bool {
            loop {
                match self.writes.try_recv() {
                    Ok((_, reply)) => {
                        let _ = reply.send(Err(ErrorKind::NotConnected.into()));
                    }
                    Err(TryRecvError::Empty) => return self.lines.is_closed(),
                    Err(TryRecvError::Disconnected) => return true,
                }
            }
        }
    }

    impl ActuationChannel for SerialChannel {
        async fn send(&mut self, byte: u8) -> Result<()> {
            let (reply, done) = oneshot::channel();
            self.writes
                .send((byte, reply))
                .map_err(|_| anyhow!("serial link thread gone"))?;
            done.await
                .context("serial link thread gone")?
                .context("serial write failed")
        }

        async fn recv_line(&mut self) -> Result<Option<Vec<u8>>> {
            Ok(self.lines.recv().await)
        }
    }

    // =======================================================================
    // Tests
    // =======================================================================

    #[cfg(test)]
    mod tests {
        use super::*;
        use std::collections::VecDeque;
        use std::sync::{Arc, Mutex};

        /// One scripted read result per call; an empty script reads as a
        /// timeout.
        #[derive(Clone, Default)]
        struct FakePort {
            reads: Arc<Mutex<VecDeque<io::Result<Vec<u8>>>>>,
            written: Arc<Mutex<Vec<u8>>>,
            fail_writes: bool,
        }

        impl FakePort {
            fn script(reads: Vec<io::Result<Vec<u8>>>) -> Self {
                Self {
                    reads: Arc::new(Mutex::new(reads.into())),
                    ..Self::default()
                }
            }

            fn written(&self) -> Vec<u8> {
                self.written.lock().unwrap().clone()
            }
        }

        impl Read for FakePort {
            fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
                let next = self.reads.lock().unwrap().pop_front();
                match next {
                    Some(Ok(bytes)) => {
                        buf[..bytes.len()].copy_from_slice(&bytes);
                        Ok(bytes.len())
                    }
                    Some(Err(e)) => Err(e),
                    None => {
                        std::thread::sleep(Duration::from_millis(1));
                        Err(ErrorKind::TimedOut.into())
                    }
                }
            }
        }

        impl Write for FakePort {
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                if self.fail_writes {
                    return Err(ErrorKind::BrokenPipe.into());
                }
                self.written.lock().unwrap().extend_from_slice(buf);
                Ok(buf.len())
            }

            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        fn reopen_with(port: FakePort) -> impl FnMut() -> io::Result<FakePort> + Send {
            move || Ok(port.clone())
        }

        const REOPEN: Duration = Duration::from_millis(5);

        #[tokio::test]
        async fn lines_split_across_reads_are_joined() {
            let port = FakePort::script(vec![Ok(b"iSoil".to_vec()), Ok(b"H: 1\nc\r\n".to_vec())]);
            let mut ch = SerialChannel::spawn("fake", port.clone(), REOPEN, reopen_with(port));

            assert_eq!(ch.recv_line().await.unwrap(), Some(b"iSoilH: 1\n".to_vec()));
            assert_eq!(ch.recv_line().await.unwrap(), Some(b"c\r\n".to_vec()));
        }

        #[tokio::test]
        async fn writes_go_through_the_io_thread() {
            let port = FakePort::default();
            let mut ch =
                SerialChannel::spawn("fake", port.clone(), REOPEN, reopen_with(port.clone()));

            ch.send(b'a').await.unwrap();
            ch.send(b'c').await.unwrap();

            assert_eq!(port.written(), b"ac");
        }

        #[tokio::test]
        async fn read_error_reopens_and_keeps_reading() {
            let broken = FakePort::script(vec![Err(io::Error::other("EIO"))]);
            let fresh = FakePort::script(vec![Ok(b"j back\n".to_vec())]);
            let mut ch = SerialChannel::spawn("fake", broken, REOPEN, reopen_with(fresh.clone()));

            assert_eq!(ch.recv_line().await.unwrap(), Some(b"j back\n".to_vec()));
            ch.send(b'a').await.unwrap();
            assert_eq!(fresh.written(), b"a");
        }

        #[tokio::test]
        async fn failed_write_reports_error_then_link_recovers() {
            let broken = FakePort {
                fail_writes: true,
                ..FakePort::default()
            };
            let fresh = FakePort::default();
            let mut ch = SerialChannel::spawn("fake", broken, REOPEN, reopen_with(fresh.clone()));

            assert!(ch.send(b'a').await.is_err());

            // Writes queued while the port is down may be rejected; a later
            // one lands on the reopened port.
            let mut delivered = false;
            for _ in 0..50 {
                if ch.send(b'c').await.is_ok() {
                    delivered = true;
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            assert!(delivered);
            assert_eq!(fresh.written(), b"c");
        }

        #[tokio::test]
        async fn failed_reopen_is_retried() {
            let broken = FakePort::script(vec![Ok(Vec::new())]);
            let fresh = FakePort::script(vec![Ok(b"j up\n".to_vec())]);
            let mut attempts = 0;
            let reopen = move || {
                attempts += 1;
                if attempts < 3 {
                    Err(io::Error::from(ErrorKind::NotFound))
                } else {
                    Ok(fresh.clone())
                }
            };
            let mut ch = SerialChannel::spawn("fake", broken, REOPEN, reopen);

            assert_eq!(ch.recv_line().await.unwrap(), Some(b"j up\n".to_vec()));
        }
    }
}
