use crate::prelude::*;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// A minimal single-threaded HTTP/1.1 server for tests: serves a fixed
/// table of `path -> body` responses (200) and 404s everything else.
/// Used to exercise [`crate::repository::Repository`] end to end
/// without a real network.
pub struct StaticHTTPServer {
    addr: SocketAddr,
    shutdown: Arc<Mutex<bool>>,
    handle: Option<JoinHandle<()>>,
    requests: Arc<Mutex<Vec<String>>>,
}

impl StaticHTTPServer {
    pub fn new(routes: HashMap<String, Vec<u8>>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind static http server");
        listener
            .set_nonblocking(true)
            .expect("set listener nonblocking");
        let addr = listener.local_addr().expect("local_addr");

        let shutdown = Arc::new(Mutex::new(false));
        let shutdown_worker = shutdown.clone();
        let routes = Arc::new(routes);
        let requests = Arc::new(Mutex::new(Vec::new()));
        let requests_worker = requests.clone();

        let handle = std::thread::spawn(move || loop {
            if *shutdown_worker.lock().unwrap() {
                return;
            }
            match listener.accept() {
                Ok((stream, _)) => handle_connection(stream, &routes, &requests_worker),
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(5));
                }
                Err(_) => return,
            }
        });

        StaticHTTPServer {
            addr,
            shutdown,
            handle: Some(handle),
            requests,
        }
    }

    pub fn base_url(&self) -> Url {
        Url::parse(&format!("http://{}", self.addr)).expect("valid base url")
    }

    /// The request path of every GET this server has served so far, in
    /// arrival order. Lets a test assert exactly which URLs a sync
    /// touched, per the idempotence and delta invariants.
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }

    /// Resets the request log, so a test can isolate the requests made
    /// by a single `update()` call from whatever came before it.
    pub fn clear_requests(&self) {
        self.requests.lock().unwrap().clear();
    }
}

impl Drop for StaticHTTPServer {
    fn drop(&mut self) {
        *self.shutdown.lock().unwrap() = true;
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn handle_connection(
    mut stream: TcpStream,
    routes: &HashMap<String, Vec<u8>>,
    requests: &Arc<Mutex<Vec<String>>>,
) {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(5)));
    let mut buf = [0u8; 8192];
    let n = match stream.read(&mut buf) {
        Ok(n) if n > 0 => n,
        _ => return,
    };
    let request = String::from_utf8_lossy(&buf[..n]);
    let path = request
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or("/")
        .to_string();
    requests.lock().unwrap().push(path.clone());

    let (status_line, body): (&str, &[u8]) = match routes.get(&path) {
        Some(body) => ("HTTP/1.1 200 OK", body.as_slice()),
        None => ("HTTP/1.1 404 Not Found", b"not found"),
    };
    let header = format!(
        "{status_line}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    let _ = stream.write_all(header.as_bytes());
    let _ = stream.write_all(body);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serves_registered_paths_and_404s_the_rest() {
        let mut routes = HashMap::new();
        routes.insert("/.dirindex".to_string(), b"version:1\n".to_vec());
        let server = StaticHTTPServer::new(routes);

        let url = server.base_url().join(".dirindex").unwrap();
        let body: Vec<u8> = ureq::get(url.as_str())
            .call()
            .unwrap()
            .into_reader()
            .bytes()
            .collect::<std::io::Result<_>>()
            .unwrap();
        assert_eq!(body, b"version:1\n");

        let missing = server.base_url().join("nope").unwrap();
        let err = ureq::get(missing.as_str()).call().unwrap_err();
        match err {
            ureq::Error::Status(404, _) => {}
            other => panic!("expected 404, got {other:?}"),
        }
    }
}
