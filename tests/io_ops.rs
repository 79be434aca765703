use std::cell::Cell;
use std::io::Write as _;
use std::net::UdpSocket;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::rc::Rc;
use std::time::Duration;

use spindle::{chain, Buffer, ChainOp, Error, Interest, RingListener};

/// Owned descriptor for raw-pipe tests.
struct Fd(RawFd);

impl AsRawFd for Fd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

impl Drop for Fd {
    fn drop(&mut self) {
        unsafe { libc::close(self.0) };
    }
}

fn pipe_pair() -> (Fd, Fd) {
    let mut fds = [0 as RawFd; 2];
    let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
    assert_eq!(rc, 0);
    (Fd(fds[0]), Fd(fds[1]))
}

fn shutdown_write(fd: RawFd) {
    unsafe { libc::shutdown(fd, libc::SHUT_WR) };
}

#[test]
fn write_read_round_trip() {
    spindle::run(|| {
        let (a, b) = UnixStream::pair().unwrap();
        let payload = Buffer::from("hello world");
        assert_eq!(spindle::io::write(&a, &payload).unwrap(), 11);
        shutdown_write(a.as_raw_fd());

        let buf = Buffer::new();
        let n = spindle::io::read(&b, &buf, 11, true, None).unwrap();
        assert_eq!(n, Some(11));
        assert_eq!(buf, b"hello world" as &[u8]);
        assert_eq!(spindle::inflight_ops(), 0);
    })
    .unwrap();
}

#[test]
fn zero_length_read_submits_nothing() {
    spindle::run(|| {
        let (_a, b) = UnixStream::pair().unwrap();
        let buf = Buffer::new();
        assert_eq!(spindle::io::read(&b, &buf, 0, false, None).unwrap(), Some(0));
        assert_eq!(spindle::inflight_ops(), 0);
    })
    .unwrap();
}

#[test]
fn read_on_a_closed_stream_returns_none() {
    spindle::run(|| {
        let (a, b) = UnixStream::pair().unwrap();
        drop(a);
        let buf = Buffer::new();
        assert_eq!(spindle::io::read(&b, &buf, 64, false, None).unwrap(), None);
    })
    .unwrap();
}

#[test]
fn read_at_a_position_overwrites_in_place() {
    spindle::run(|| {
        let (a, b) = UnixStream::pair().unwrap();
        spindle::io::write(&a, &Buffer::from("XY")).unwrap();

        let buf = Buffer::from("ab....");
        let n = spindle::io::read(&b, &buf, 2, false, Some(2)).unwrap();
        assert_eq!(n, Some(2));
        assert_eq!(buf, b"abXY.." as &[u8]);
    })
    .unwrap();
}

#[test]
fn writev_matches_a_concatenated_write() {
    spindle::run(|| {
        let (a, b) = UnixStream::pair().unwrap();
        let parts = [
            Buffer::from("one "),
            Buffer::from("two "),
            Buffer::from("three"),
        ];
        assert_eq!(spindle::io::writev(&a, &parts).unwrap(), 13);
        shutdown_write(a.as_raw_fd());

        let buf = Buffer::new();
        let n = spindle::io::read(&b, &buf, 64, true, None).unwrap();
        assert_eq!(n, Some(13));
        assert_eq!(buf, b"one two three" as &[u8]);
    })
    .unwrap();
}

#[test]
fn read_loop_sees_every_chunk_until_eof() {
    spindle::run(|| {
        let (a, b) = UnixStream::pair().unwrap();
        let writer = spindle::spawn(move || {
            for chunk in ["aa", "bb", "cc"] {
                spindle::io::write(&a, &Buffer::from(chunk)).unwrap();
            }
            shutdown_write(a.as_raw_fd());
            // keep `a` alive until the reader is done draining
            spindle::sleep(Duration::from_millis(10)).unwrap();
        });

        let mut collected = Vec::new();
        spindle::io::read_loop(&b, 4096, |chunk| {
            collected.extend_from_slice(chunk);
            Ok(())
        })
        .unwrap();
        assert_eq!(collected, b"aabbcc");
        writer.join().unwrap();
    })
    .unwrap();
}

#[test]
fn recv_and_send_work_on_sockets() {
    spindle::run(|| {
        let (a, b) = UnixStream::pair().unwrap();
        assert_eq!(spindle::io::send(&a, &Buffer::from("ping"), 0).unwrap(), 4);
        let buf = Buffer::new();
        assert_eq!(spindle::io::recv(&b, &buf, 16).unwrap(), Some(4));
        assert_eq!(buf, b"ping" as &[u8]);
    })
    .unwrap();
}

#[test]
fn sendmsg_and_recvmsg_carry_the_peer_address() {
    spindle::run(|| {
        let rx = UdpSocket::bind("127.0.0.1:0").unwrap();
        let tx = UdpSocket::bind("127.0.0.1:0").unwrap();
        let rx_addr = rx.local_addr().unwrap();
        let tx_addr = tx.local_addr().unwrap();

        let n = spindle::io::sendmsg(&tx, &Buffer::from("datagram"), 0, Some(&rx_addr)).unwrap();
        assert_eq!(n, 8);

        let buf = Buffer::new();
        let (n, from) = spindle::io::recvmsg(&rx, &buf, 64, 0).unwrap();
        assert_eq!(n, Some(8));
        assert_eq!(buf, b"datagram" as &[u8]);
        assert_eq!(from, Some(tx_addr));
        assert_eq!(spindle::inflight_ops(), 0);
    })
    .unwrap();
}

#[test]
fn file_read_to_eof_returns_the_whole_file() {
    spindle::run(|| {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"file contents here").unwrap();
        let reopened = std::fs::File::open(file.path()).unwrap();

        let buf = Buffer::new();
        let n = spindle::io::read(&reopened, &buf, 7, true, None).unwrap();
        assert_eq!(n, Some(18));
        assert_eq!(buf, b"file contents here" as &[u8]);
    })
    .unwrap();
}

#[test]
fn echo_server_round_trip() {
    spindle::run(|| {
        let listener = RingListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = spindle::spawn(move || {
            let client = listener.accept().unwrap();
            spindle::io::read_loop(&client, 8192, |chunk| {
                spindle::io::write(&client, &Buffer::from(chunk)).map(|_| ())
            })
            .unwrap();
        });

        let conn = spindle::connect(addr).unwrap();
        spindle::io::write(&conn, &Buffer::from("hello world")).unwrap();
        shutdown_write(conn.as_raw_fd());

        let buf = Buffer::new();
        let n = spindle::io::read(&conn, &buf, 8192, true, None).unwrap();
        assert_eq!(n, Some(11));
        assert_eq!(buf, b"hello world" as &[u8]);

        server.join().unwrap();
        assert_eq!(spindle::inflight_ops(), 0);
    })
    .unwrap();
}

#[test]
fn multishot_accept_feeds_the_backlog() {
    spindle::run(|| {
        let listener = RingListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Rc::new(Cell::new(0u32));

        let count = accepted.clone();
        let server = spindle::spawn(move || {
            let result = listener.multishot_accept(|stream| {
                count.set(count.get() + 1);
                drop(stream);
                Ok(())
            });
            assert!(matches!(result, Err(Error::Cancelled)));
        });
        spindle::yield_now().unwrap();

        let c1 = spindle::connect(addr).unwrap();
        let c2 = spindle::connect(addr).unwrap();
        // both connections must land without the server fiber re-arming
        while accepted.get() < 2 {
            spindle::yield_now().unwrap();
        }

        server.cancel();
        server.join().unwrap();
        drop(c1);
        drop(c2);

        // the multishot entry needs its cancellation echo before the
        // context can die
        spindle::sleep(Duration::from_millis(10)).unwrap();
        assert_eq!(spindle::inflight_ops(), 0);
    })
    .unwrap();
}

#[test]
fn cancelled_read_releases_context_and_buffer() {
    spindle::run(|| {
        let (r, _w) = pipe_pair();
        let reader = spindle::spawn(move || {
            let buf = Buffer::with_capacity(1 << 20);
            spindle::io::read(&r, &buf, 1 << 20, true, None)
        });
        spindle::yield_now().unwrap();

        reader.cancel();
        let result = reader.join().unwrap();
        assert!(matches!(result, Err(Error::Cancelled)));

        // the backend stays healthy: submit and reap another op
        let (a, b) = UnixStream::pair().unwrap();
        spindle::io::write(&a, &Buffer::from("x")).unwrap();
        let buf = Buffer::new();
        assert_eq!(spindle::io::read(&b, &buf, 1, false, None).unwrap(), Some(1));

        // the cancellation echo returns the context and its buffer
        spindle::sleep(Duration::from_millis(10)).unwrap();
        assert_eq!(spindle::inflight_ops(), 0);
    })
    .unwrap();
}

#[test]
fn splice_moves_bytes_through_a_pipe() {
    spindle::run(|| {
        let (r1, w1) = pipe_pair();
        let (r2, w2) = pipe_pair();

        spindle::io::write(&w1, &Buffer::from("spliced!")).unwrap();
        drop(w1);

        // negative maxlen: splice until end of stream
        let moved = spindle::io::splice(&r1, &w2, -4096).unwrap();
        assert_eq!(moved, 8);
        drop(w2);

        let buf = Buffer::new();
        let n = spindle::io::read(&r2, &buf, 4096, true, None).unwrap();
        assert_eq!(n, Some(8));
        assert_eq!(buf, b"spliced!" as &[u8]);
    })
    .unwrap();
}

#[test]
fn zero_length_splice_is_an_argument_error() {
    spindle::run(|| {
        let (r, w) = pipe_pair();
        assert!(matches!(
            spindle::io::splice(&r, &w, 0),
            Err(Error::InvalidArgument(_))
        ));
        assert_eq!(spindle::inflight_ops(), 0);
    })
    .unwrap();
}

#[test]
fn tee_duplicates_without_consuming() {
    spindle::run(|| {
        let (r1, w1) = pipe_pair();
        let (r2, w2) = pipe_pair();

        spindle::io::write(&w1, &Buffer::from("twice")).unwrap();
        let n = spindle::io::tee(&r1, &w2, 4096).unwrap();
        assert_eq!(n, 5);

        drop(w2);
        let copy = Buffer::new();
        assert_eq!(spindle::io::read(&r2, &copy, 64, false, None).unwrap(), Some(5));

        // the original stream still has the bytes
        drop(w1);
        let original = Buffer::new();
        assert_eq!(
            spindle::io::read(&r1, &original, 64, true, None).unwrap(),
            Some(5)
        );
        assert_eq!(original, b"twice" as &[u8]);
    })
    .unwrap();
}

#[test]
fn double_splice_relays_between_non_pipe_ends() {
    spindle::run(|| {
        let (a, b) = UnixStream::pair().unwrap();
        let (c, d) = UnixStream::pair().unwrap();

        spindle::io::write(&a, &Buffer::from("relayed")).unwrap();
        shutdown_write(a.as_raw_fd());

        let moved = spindle::io::double_splice(&b, &c).unwrap();
        assert_eq!(moved, 7);
        shutdown_write(c.as_raw_fd());

        let buf = Buffer::new();
        let n = spindle::io::read(&d, &buf, 4096, true, None).unwrap();
        assert_eq!(n, Some(7));
        assert_eq!(buf, b"relayed" as &[u8]);
    })
    .unwrap();
}

#[test]
fn splice_chunks_frames_the_stream() {
    spindle::run(|| {
        let (src_r, src_w) = pipe_pair();
        let (dst_r, dst_w) = pipe_pair();

        spindle::io::write(&src_w, &Buffer::from("body")).unwrap();
        drop(src_w);

        let prefix = Buffer::from("HEAD|");
        let postfix = Buffer::from("|TAIL");
        let chunk_prefix = |len: usize| Buffer::from(format!("{}:", len).as_str());
        let written = spindle::io::splice_chunks(
            &src_r,
            &dst_w,
            Some(&prefix),
            Some(&postfix),
            Some(&chunk_prefix),
            None,
            4096,
        )
        .unwrap();
        drop(dst_w);

        let buf = Buffer::new();
        spindle::io::read(&dst_r, &buf, 4096, true, None).unwrap();
        assert_eq!(buf, b"HEAD|4:body|TAIL" as &[u8]);
        assert_eq!(written, 16);
        assert_eq!(spindle::inflight_ops(), 0);
    })
    .unwrap();
}

#[test]
fn chain_is_atomic_and_reports_total_bytes() {
    spindle::run(|| {
        let (a, b) = UnixStream::pair().unwrap();
        let hello = Buffer::from("hello");
        let world = Buffer::from(" world");
        let total = chain(&[ChainOp::write(&a, &hello), ChainOp::write(&a, &world)]).unwrap();
        assert_eq!(total, 11);
        shutdown_write(a.as_raw_fd());

        let buf = Buffer::new();
        let n = spindle::io::read(&b, &buf, 64, true, None).unwrap();
        assert_eq!(n, Some(11));
        assert_eq!(buf, b"hello world" as &[u8]);
        assert_eq!(spindle::inflight_ops(), 0);
    })
    .unwrap();
}

#[test]
fn invalid_chains_fail_before_submitting() {
    spindle::run(|| {
        assert!(matches!(chain(&[]), Err(Error::InvalidArgument(_))));

        let (r, w) = pipe_pair();
        let ops = [ChainOp::splice(&r, &w, 0)];
        assert!(matches!(chain(&ops), Err(Error::InvalidArgument(_))));
        assert_eq!(spindle::inflight_ops(), 0);
    })
    .unwrap();
}

#[test]
fn wait_io_wakes_on_readability() {
    spindle::run(|| {
        let (a, b) = UnixStream::pair().unwrap();
        let waiter = spindle::spawn(move || {
            spindle::io::wait_io(&b, Interest::READ).unwrap();
            let buf = Buffer::new();
            spindle::io::read(&b, &buf, 16, false, None).unwrap();
            buf.to_vec()
        });
        spindle::yield_now().unwrap();

        spindle::io::write(&a, &Buffer::from("ready")).unwrap();
        assert_eq!(waiter.join().unwrap(), b"ready");
    })
    .unwrap();
}

#[test]
fn wait_event_is_woken_by_an_external_waker() {
    spindle::run(|| {
        let waker = spindle::waker().unwrap();
        let thread = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            waker.wake();
        });
        spindle::io::wait_event().unwrap();
        thread.join().unwrap();
    })
    .unwrap();
}

#[test]
fn waitpid_reaps_the_child_status() {
    spindle::run(|| {
        let child = std::process::Command::new("sh")
            .args(["-c", "exit 3"])
            .spawn()
            .unwrap();
        let status = spindle::io::waitpid(child.id() as libc::pid_t).unwrap();
        assert!(libc::WIFEXITED(status));
        assert_eq!(libc::WEXITSTATUS(status), 3);
    })
    .unwrap();
}

#[test]
fn ring_stream_close_reports_through_the_ring() {
    spindle::run(|| {
        let listener = RingListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = spindle::spawn(move || {
            let stream = listener.accept().unwrap();
            stream.close().unwrap();
        });
        let conn = spindle::connect(addr).unwrap();
        server.join().unwrap();

        // peer closed: end of stream
        let buf = Buffer::new();
        assert_eq!(spindle::io::read(&conn, &buf, 16, false, None).unwrap(), None);
    })
    .unwrap();
}
