//! Shared helpers for the end-to-end tests: throwaway upstreams, raw HTTP
//! clients, and certificate fixtures.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::thread;
use std::time::{Duration, Instant};

pub fn wait_for<F>(timeout: Duration, mut f: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if f() {
            return true;
        }
        thread::sleep(Duration::from_millis(50));
    }
    false
}

pub fn pick_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

pub fn wait_for_port(port: u16) {
    assert!(
        wait_for(Duration::from_secs(10), || {
            TcpStream::connect(("127.0.0.1", port)).is_ok()
        }),
        "port {} never came up",
        port
    );
}

/// Start the pingora server for a configured proxy on a background thread.
pub fn start_server(proxy: &shrike::ReverseProxy) {
    let server = proxy.build_server().expect("failed to build proxy server");
    thread::spawn(move || server.run_forever());
}

fn read_head(stream: &mut impl Read) -> std::io::Result<String> {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    while !buf.ends_with(b"\r\n\r\n") && buf.len() < 65536 {
        if stream.read(&mut byte)? == 0 {
            break;
        }
        buf.push(byte[0]);
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

fn parse_head(head: &str) -> (String, HashMap<String, String>) {
    let mut lines = head.lines();
    let request_line = lines.next().unwrap_or_default().to_string();
    let mut headers = HashMap::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }
    (request_line, headers)
}

/// A plain-HTTP upstream that answers every request with `hello from
/// <name>` and echoes the interesting request bits back as `X-Echo-*`
/// response headers.
pub struct Upstream {
    pub port: u16,
    pub hits: Arc<AtomicUsize>,
}

impl Upstream {
    pub fn hit_count(&self) -> usize {
        self.hits.load(std::sync::atomic::Ordering::SeqCst)
    }
}

pub fn spawn_echo_upstream(name: &'static str) -> Upstream {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let hits = Arc::new(AtomicUsize::new(0));

    let upstream_hits = hits.clone();
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { continue };
            let hits = upstream_hits.clone();
            thread::spawn(move || {
                if echo_connection(&mut stream, name).is_ok() {
                    hits.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                }
            });
        }
    });

    Upstream { port, hits }
}

fn echo_response(request_line: &str, headers: &HashMap<String, String>, name: &str) -> String {
    let path = request_line.split_whitespace().nth(1).unwrap_or("/");
    let body = format!("hello from {}", name);

    let mut response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nX-Echo-Path: {}\r\n",
        path
    );
    let echoed = [
        ("host", "X-Echo-Host"),
        ("foo", "X-Echo-Foo"),
        ("blah", "X-Echo-Blah"),
        ("x-forwarded-for", "X-Echo-Xff"),
        ("x-forwarded-proto", "X-Echo-Proto"),
        ("x-forwarded-host", "X-Echo-Fwd-Host"),
    ];
    for (request_header, echo_header) in echoed {
        if let Some(value) = headers.get(request_header) {
            response.push_str(&format!("{}: {}\r\n", echo_header, value));
        }
    }
    response.push_str(&format!(
        "Content-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    ));
    response
}

fn echo_connection(stream: &mut TcpStream, name: &str) -> std::io::Result<()> {
    let head = read_head(stream)?;
    let (request_line, headers) = parse_head(&head);
    stream.write_all(echo_response(&request_line, &headers, name).as_bytes())
}

/// An event-stream upstream: emits each event with a short pause, then
/// closes.
pub fn spawn_sse_upstream(events: Vec<&'static str>) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { continue };
            let events = events.clone();
            thread::spawn(move || {
                let _ = read_head(&mut stream);
                let _ = stream.write_all(
                    b"HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nCache-Control: no-cache\r\nConnection: close\r\n\r\n",
                );
                for event in events {
                    let _ = stream.write_all(format!("data: {}\n\n", event).as_bytes());
                    let _ = stream.flush();
                    thread::sleep(Duration::from_millis(50));
                }
            });
        }
    });

    port
}

/// A WebSocket-ish upstream: answers an upgrade with 101 and then echoes
/// raw bytes over the tunneled connection.
pub fn spawn_ws_upstream() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { continue };
            thread::spawn(move || {
                let Ok(head) = read_head(&mut stream) else {
                    return;
                };
                if !head.to_ascii_lowercase().contains("upgrade: websocket") {
                    let _ = stream.write_all(
                        b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                    );
                    return;
                }
                let _ = stream.write_all(
                    b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n",
                );
                // Tunnel phase: echo whatever arrives.
                let mut buf = [0u8; 1024];
                while let Ok(n) = stream.read(&mut buf) {
                    if n == 0 {
                        break;
                    }
                    if stream.write_all(&buf[..n]).is_err() {
                        break;
                    }
                }
            });
        }
    });

    port
}

/// A raw HTTP response, parsed just enough for assertions.
#[derive(Debug)]
pub struct RawResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl RawResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.headers
            .iter()
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v.as_str())
    }
}

pub fn http_get(port: u16, host: &str, path: &str) -> RawResponse {
    http_request(port, host, path, &[])
}

pub fn http_request(port: u16, host: &str, path: &str, extra: &[(&str, &str)]) -> RawResponse {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();

    let mut request = format!("GET {} HTTP/1.1\r\nHost: {}\r\n", path, host);
    for (name, value) in extra {
        request.push_str(&format!("{}: {}\r\n", name, value));
    }
    request.push_str("Connection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).unwrap();

    let mut raw = Vec::new();
    let _ = stream.read_to_end(&mut raw);
    parse_response(&String::from_utf8_lossy(&raw))
}

fn parse_response(raw: &str) -> RawResponse {
    let (head, body) = raw.split_once("\r\n\r\n").unwrap_or((raw, ""));
    let mut lines = head.lines();
    let status = lines
        .next()
        .and_then(|l| l.split_whitespace().nth(1))
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    let headers = lines
        .filter_map(|l| {
            l.split_once(':')
                .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim().to_string()))
        })
        .collect();

    RawResponse {
        status,
        headers,
        body: body.to_string(),
    }
}

/// Write a self-signed certificate (CN + matching SAN) into `dir` and hand
/// back `(key_path, cert_path)`.
pub fn write_self_signed(dir: &Path, cn: &str) -> (PathBuf, PathBuf) {
    use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, SanType};

    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, cn);
    params.distinguished_name = dn;
    params.subject_alt_names = vec![SanType::DnsName(cn.try_into().unwrap())];

    let key_pair = KeyPair::generate().unwrap();
    let cert = params.self_signed(&key_pair).unwrap();

    let cert_path = dir.join(format!("{cn}.crt"));
    let key_path = dir.join(format!("{cn}.key"));
    std::fs::write(&cert_path, cert.pem()).unwrap();
    std::fs::write(&key_path, key_pair.serialize_pem()).unwrap();
    (key_path, cert_path)
}

/// An HTTPS upstream with a self-signed certificate, for verifying the
/// `secure = false` forwarding path.
pub fn spawn_tls_echo_upstream(name: &'static str) -> u16 {
    use openssl::pkey::PKey;
    use openssl::ssl::{SslAcceptor, SslMethod};
    use openssl::x509::X509;

    let dir = tempfile::tempdir().unwrap();
    let (key_path, cert_path) = write_self_signed(dir.path(), "upstream.local");
    let key = PKey::private_key_from_pem(&std::fs::read(&key_path).unwrap()).unwrap();
    let cert = X509::from_pem(&std::fs::read(&cert_path).unwrap()).unwrap();

    let mut acceptor = SslAcceptor::mozilla_intermediate(SslMethod::tls()).unwrap();
    acceptor.set_private_key(&key).unwrap();
    acceptor.set_certificate(&cert).unwrap();
    let acceptor = Arc::new(acceptor.build());

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    thread::spawn(move || {
        let _dir = dir;
        for stream in listener.incoming() {
            let Ok(stream) = stream else { continue };
            let acceptor = acceptor.clone();
            thread::spawn(move || {
                let Ok(mut tls) = acceptor.accept(stream) else {
                    return;
                };
                let Ok(head) = read_head(&mut tls) else {
                    return;
                };
                let (request_line, headers) = parse_head(&head);
                let _ = tls.write_all(echo_response(&request_line, &headers, name).as_bytes());
                let _ = tls.shutdown();
            });
        }
    });

    port
}
