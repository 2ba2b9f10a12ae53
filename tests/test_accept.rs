//! Accept failures from running out of descriptors. Lives in its own binary:
//! the descriptor limit is process-wide, so one test drives both policies in
//! sequence.

use quickie::http::RESPONSE;
use quickie::{Config, FatalPolicy, Server};

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::time::Duration;

const REQUEST: &[u8] = b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n";

/// Lowers the soft descriptor limit to the lowest free descriptor for as long
/// as it lives, so the next `accept` fails with `EMFILE`.
struct Exhausted {
    saved: libc::rlimit,
}

impl Exhausted {
    fn new() -> Exhausted {
        let mut saved = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };

        // SAFETY: plain syscalls on local values and a descriptor we own.
        unsafe {
            assert_eq!(libc::getrlimit(libc::RLIMIT_NOFILE, &mut saved), 0);

            let next = libc::dup(2);
            assert!(next >= 0, "dup failed: {}", io::Error::last_os_error());
            libc::close(next);

            let lowered = libc::rlimit {
                rlim_cur: next as libc::rlim_t,
                rlim_max: saved.rlim_max,
            };
            assert_eq!(libc::setrlimit(libc::RLIMIT_NOFILE, &lowered), 0);
        }

        Exhausted { saved }
    }
}

impl Drop for Exhausted {
    fn drop(&mut self) {
        // SAFETY: restores the limit read in `new`.
        unsafe {
            libc::setrlimit(libc::RLIMIT_NOFILE, &self.saved);
        }
    }
}

fn queued_clients(server: &Server, n: usize) -> Vec<TcpStream> {
    let addr = server.local_addr().unwrap();
    (0..n)
        .map(|_| {
            let mut client = TcpStream::connect(addr).unwrap();
            client.write_all(REQUEST).unwrap();
            client
        })
        .collect()
}

#[test]
fn test_out_of_descriptors() {
    // Abort: the accept error ends the loop
    let mut server = Server::bind(Config::new("127.0.0.1:0".parse().unwrap())).unwrap();
    let _clients = queued_clients(&server, 2);

    let err = {
        let _exhausted = Exhausted::new();
        let mut outcome = Ok(());
        for _ in 0..50 {
            outcome = server.turn(Some(Duration::from_millis(20)));
            if outcome.is_err() {
                break;
            }
        }
        outcome.unwrap_err()
    };
    assert_eq!(err.raw_os_error(), Some(libc::EMFILE));
    assert_eq!(server.stats().accepted, 0);
    drop(server);

    // LogAndContinue: queued connections are picked up once descriptors free up
    let config = Config::new("127.0.0.1:0".parse().unwrap()).fatal(FatalPolicy::LogAndContinue);
    let mut server = Server::bind(config).unwrap();
    let mut clients = queued_clients(&server, 3);

    {
        let _exhausted = Exhausted::new();
        for _ in 0..10 {
            server.turn(Some(Duration::from_millis(10))).unwrap();
        }
        assert_eq!(server.stats().accepted, 0);
    }

    // No new client ever connects, so nothing re-arms the listener
    for _ in 0..500 {
        if server.stats().responded == 3 {
            break;
        }
        server.turn(Some(Duration::from_millis(10))).unwrap();
    }
    assert_eq!(server.stats().accepted, 3);
    assert_eq!(server.stats().responded, 3);

    for client in clients.iter_mut() {
        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut received = Vec::new();
        client.read_to_end(&mut received).unwrap();
        assert_eq!(received, RESPONSE);
    }
}
