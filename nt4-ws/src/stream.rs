use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::time::Duration;

/// The byte transport a session rides on. `read` observes the configured
/// read timeout; `shutdown` takes `&self` so a control handle can break a
/// blocked peer without holding the write lock.
pub trait Transport: Send + 'static {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()>;
    fn shutdown(&self);
    fn try_clone(&self) -> io::Result<Self>
    where
        Self: Sized;

    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn set_read_timeout(&self, _timeout: Option<Duration>) -> io::Result<()> {
        Ok(())
    }
}

impl Transport for TcpStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Read::read(self, buf)
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        Write::write_all(self, buf)
    }

    fn shutdown(&self) {
        let _ = TcpStream::shutdown(self, Shutdown::Both);
    }

    fn try_clone(&self) -> io::Result<Self> {
        TcpStream::try_clone(self)
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        TcpStream::peer_addr(self).ok()
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_read_timeout(self, timeout)
    }
}

/// True for the error a timed-out blocking read surfaces as.
pub fn is_timeout(err: &io::Error) -> bool {
    match err.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => true,
        _ => false,
    }
}

const LINE_CHUNK: usize = 512;

/// A CRLF line reader over a transport, used for the HTTP upgrade
/// exchange. Bytes read past the final header line are handed back via
/// `into_parts` so the frame loop starts with them.
pub struct LineReader<T> {
    inner: T,
    buf: Vec<u8>,
    pos: usize,
}

impl<T: Transport> LineReader<T> {
    pub fn new(inner: T) -> Self {
        LineReader {
            inner,
            buf: Vec::with_capacity(1024),
            pos: 0,
        }
    }

    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Reads one line, stripping the terminator.
    pub fn read_line(&mut self) -> io::Result<String> {
        loop {
            if let Some(offset) = self.buf[self.pos..].iter().position(|&b| b == b'\n') {
                let end = self.pos + offset;
                let mut line = &self.buf[self.pos..end];
                if line.ends_with(b"\r") {
                    line = &line[..line.len() - 1];
                }
                let line = String::from_utf8_lossy(line).into_owned();
                self.pos = end + 1;
                return Ok(line);
            }

            let mut chunk = [0u8; LINE_CHUNK];
            let read = self.inner.read(&mut chunk)?;
            if read == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed during handshake",
                ));
            }
            self.buf.extend_from_slice(&chunk[..read]);
        }
    }

    /// Returns the transport and any bytes buffered past the last line.
    pub fn into_parts(self) -> (T, Vec<u8>) {
        let LineReader { inner, buf, pos } = self;
        (inner, buf[pos..].to_vec())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    use super::*;

    /// A scripted transport: `read` pops queued chunks (EOF when drained),
    /// writes accumulate for inspection.
    #[derive(Clone)]
    pub struct MockTransport {
        incoming: Arc<Mutex<VecDeque<Vec<u8>>>>,
        pub outgoing: Arc<Mutex<Vec<u8>>>,
        connected: Arc<AtomicBool>,
    }

    impl MockTransport {
        pub fn new(chunks: Vec<Vec<u8>>) -> Self {
            MockTransport {
                incoming: Arc::new(Mutex::new(chunks.into_iter().collect())),
                outgoing: Arc::new(Mutex::new(Vec::new())),
                connected: Arc::new(AtomicBool::new(true)),
            }
        }

        pub fn written(&self) -> Vec<u8> {
            self.outgoing.lock().unwrap().clone()
        }

        pub fn is_shutdown(&self) -> bool {
            !self.connected.load(Ordering::SeqCst)
        }
    }

    impl Transport for MockTransport {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if !self.connected.load(Ordering::SeqCst) {
                return Ok(0);
            }
            let mut incoming = self.incoming.lock().unwrap();
            match incoming.pop_front() {
                Some(chunk) => {
                    let n = chunk.len().min(buf.len());
                    buf[..n].copy_from_slice(&chunk[..n]);
                    if n < chunk.len() {
                        incoming.push_front(chunk[n..].to_vec());
                    }
                    Ok(n)
                }
                None => Ok(0),
            }
        }

        fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
            if !self.connected.load(Ordering::SeqCst) {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "disconnected"));
            }
            self.outgoing.lock().unwrap().extend_from_slice(buf);
            Ok(())
        }

        fn shutdown(&self) {
            self.connected.store(false, Ordering::SeqCst);
        }

        fn try_clone(&self) -> io::Result<Self> {
            Ok(self.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::MockTransport;
    use super::*;

    #[test]
    fn reads_crlf_lines_and_keeps_the_remainder() {
        let transport = MockTransport::new(vec![b"GET /nt/alice HTTP/1.1\r\nHost: x\r\n\r\n\x81\x00".to_vec()]);
        let mut reader = LineReader::new(transport);
        assert_eq!(reader.read_line().unwrap(), "GET /nt/alice HTTP/1.1");
        assert_eq!(reader.read_line().unwrap(), "Host: x");
        assert_eq!(reader.read_line().unwrap(), "");
        let (_, rest) = reader.into_parts();
        assert_eq!(rest, vec![0x81, 0x00]);
    }

    #[test]
    fn line_split_across_chunks() {
        let transport = MockTransport::new(vec![b"partial ".to_vec(), b"line\r\n".to_vec()]);
        let mut reader = LineReader::new(transport);
        assert_eq!(reader.read_line().unwrap(), "partial line");
    }

    #[test]
    fn eof_mid_handshake_is_an_error() {
        let transport = MockTransport::new(vec![b"no terminator".to_vec()]);
        let mut reader = LineReader::new(transport);
        assert!(reader.read_line().is_err());
    }
}
