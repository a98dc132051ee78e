//! Event-source subscribers: HTTP clients on a UNIX socket receiving the
//! jailed program's output as Server-Sent Events.
//!
//! Each accepted connection gets a fixed HTTP/1.1 response header and then
//! one SSE event per supervisor flush:
//!
//! ```text
//! data:{"offset":0,"data":"hello\n","end_offset":6}
//! id:6
//! ```
//!
//! A subscriber owns a private send buffer and its own position in the
//! output stream, so a slow client never stalls the PTY or other clients.

use std::os::fd::RawFd;

use crate::buffer::JailBuffer;
use crate::error::{Error, Result};

const RESPONSE_HEADER: &[u8] = b"HTTP/1.1 200 OK\r\n\
Cache-Control: no-store\r\n\
Content-Type: text/event-stream\r\n\
X-Accel-Buffering: no\r\n\r\n";

pub struct Subscriber {
    pub fd: RawFd,
    /// Bytes queued for this client.
    pub buf: JailBuffer,
    /// Absolute send offset within `buf`.
    pub off: u64,
    /// Position in the program-output stream this client has been told
    /// about (the `end_offset` of its last event).
    pub output_off: u64,
}

impl Subscriber {
    /// Adopt an accepted connection starting at `output_off` in the stream.
    pub fn new(fd: RawFd, output_off: u64) -> Subscriber {
        let sub = Subscriber {
            fd,
            buf: JailBuffer::new(4096),
            off: 0,
            output_off,
        };
        // blocking write is fine here: the socket buffer is empty
        unsafe {
            libc::write(
                fd,
                RESPONSE_HEADER.as_ptr().cast::<libc::c_void>(),
                RESPONSE_HEADER.len(),
            )
        };
        sub
    }

    /// Queue one event carrying the output between this client's position
    /// and the buffered end of `from_slave`.
    pub fn write_event(&mut self, from_slave: &JailBuffer) {
        self.buf
            .extend(format!("data:{{\"offset\":{},\"data\":\"", self.output_off).as_bytes());
        let chunk = from_slave.from_offset(self.output_off);
        let taken = self.buf.append_json_chars(chunk);
        let new_off = self.output_off + taken as u64;
        self.buf
            .extend(format!("\",\"end_offset\":{new_off}}}\nid:{new_off}\n\n").as_bytes());
        self.output_off = new_off;
    }

    /// Queue the final event sent before the supervisor exits.
    pub fn write_done_event(&mut self) {
        self.buf.extend(b"data:{\"done\":true}\n\n");
    }

    /// Flush queued bytes; returns false once the connection is dead.
    pub fn flush(&mut self) -> bool {
        if self.buf.write_to(self.fd, &mut self.off) {
            self.buf.consume_to(self.off);
        }
        !self.buf.write_closed
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

/// Bind the listening UNIX socket at `path`, permissions 0700, non-blocking.
/// Listening starts later, inside the supervisor.
pub fn bind_listener(path: &str) -> Result<RawFd> {
    let fd = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(Error::sys("socket", path));
    }

    let mut addr = unsafe { std::mem::zeroed::<libc::sockaddr_un>() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
    let bytes = path.as_bytes();
    if bytes.len() + 1 > addr.sun_path.len() {
        unsafe { libc::close(fd) };
        return Err(Error::msg(format!("{path}: socket name too long")));
    }
    for (i, b) in bytes.iter().enumerate() {
        addr.sun_path[i] = *b as libc::c_char;
    }

    let old_umask = unsafe { libc::umask(0o077) };
    let r = unsafe {
        libc::bind(
            fd,
            std::ptr::addr_of!(addr).cast::<libc::sockaddr>(),
            std::mem::size_of::<libc::sockaddr_un>() as libc::socklen_t,
        )
    };
    unsafe { libc::umask(old_umask) };
    if r < 0 {
        let err = Error::Sys {
            op: "bind",
            path: path.into(),
            source: std::io::Error::last_os_error(),
        };
        unsafe { libc::close(fd) };
        return Err(err);
    }

    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) } == -1
        || flags == -1
        || unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } == -1
    {
        unsafe { libc::close(fd) };
        return Err(Error::sys("fcntl", path));
    }
    Ok(fd)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::os::fd::FromRawFd;

    fn socketpair() -> (RawFd, std::os::unix::net::UnixStream) {
        let mut fds = [0; 2];
        assert_eq!(
            unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) },
            0
        );
        let reader = unsafe { std::os::unix::net::UnixStream::from_raw_fd(fds[1]) };
        (fds[0], reader)
    }

    #[test]
    fn header_and_first_event() {
        let (wfd, mut reader) = socketpair();
        let mut out = JailBuffer::new(64);
        out.extend(b"hello\n");

        let mut sub = Subscriber::new(wfd, 0);
        sub.write_event(&out);
        assert!(sub.flush());
        drop(sub);

        let mut got = String::new();
        reader.read_to_string(&mut got).unwrap();
        assert!(got.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(got.contains("Content-Type: text/event-stream\r\n"));
        assert!(got.contains("Cache-Control: no-store\r\n"));
        assert!(got.contains(
            "data:{\"offset\":0,\"data\":\"hello\\n\",\"end_offset\":6}\nid:6\n\n"
        ));
    }

    #[test]
    fn late_subscriber_sees_consistent_offsets() {
        let (wfd, mut reader) = socketpair();
        let mut out = JailBuffer::new(64);
        out.base = 100; // stdout was an append-mode file at offset 100
        out.extend(b"abc");

        let mut sub = Subscriber::new(wfd, 100);
        sub.write_event(&out);
        out.extend(b"de");
        sub.write_event(&out);
        sub.write_done_event();
        assert!(sub.flush());
        drop(sub);

        let mut got = String::new();
        reader.read_to_string(&mut got).unwrap();
        assert!(got.contains("\"offset\":100,\"data\":\"abc\",\"end_offset\":103"));
        assert!(got.contains("\"offset\":103,\"data\":\"de\",\"end_offset\":105"));
        assert!(got.contains("data:{\"done\":true}\n\n"));
    }

    #[test]
    fn event_payload_is_valid_json() {
        let (wfd, mut reader) = socketpair();
        let mut out = JailBuffer::new(64);
        out.extend(b"\x1b[31mred\xff\x00\n");

        let mut sub = Subscriber::new(wfd, 0);
        sub.write_event(&out);
        assert!(sub.flush());
        drop(sub);

        let mut got = String::new();
        reader.read_to_string(&mut got).unwrap();
        let line = got
            .lines()
            .find(|l| l.starts_with("data:{\"offset\""))
            .unwrap();
        let payload = &line["data:".len()..];
        // hand-rolled structural check: balanced quotes, no raw controls
        assert!(payload.starts_with('{') && payload.ends_with('}'));
        assert!(payload.bytes().all(|b| b >= 0x20));
        assert!(std::str::from_utf8(payload.as_bytes()).is_ok());
    }

    #[test]
    fn listener_socket_mode() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = format!("{}/events.sock", tmp.path().display());
        let fd = bind_listener(&path).unwrap();
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o077, 0, "socket must be private to the owner");
        unsafe { libc::close(fd) };
    }

    #[test]
    fn dead_subscriber_detected() {
        let (wfd, reader) = socketpair();
        drop(reader);
        // SIGPIPE must not kill the test
        unsafe { libc::signal(libc::SIGPIPE, libc::SIG_IGN) };
        let mut sub = Subscriber::new(wfd, 0);
        let mut out = JailBuffer::new(64);
        out.extend(b"data");
        sub.write_event(&out);
        assert!(!sub.flush());
    }
}
