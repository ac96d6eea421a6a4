//! Loopback HTTP fixture standing in for the release registry and asset host.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// Canned response for one path.
#[derive(Debug, Clone)]
pub(crate) struct Route {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    /// Honour `Range: bytes=N-` with 206 responses.
    pub ranged: bool,
    pub chunk_size: usize,
    pub chunk_delay: Duration,
}

impl Route {
    pub fn json(status: u16, body: serde_json::Value) -> Self {
        Self {
            status,
            headers: vec![("Content-Type".into(), "application/json".into())],
            body: body.to_string().into_bytes(),
            ranged: false,
            chunk_size: usize::MAX,
            chunk_delay: Duration::ZERO,
        }
    }

    pub fn bytes(body: Vec<u8>) -> Self {
        Self {
            status: 200,
            headers: vec![("Content-Type".into(), "application/octet-stream".into())],
            body,
            ranged: true,
            chunk_size: usize::MAX,
            chunk_delay: Duration::ZERO,
        }
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
            ranged: false,
            chunk_size: usize::MAX,
            chunk_delay: Duration::ZERO,
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn without_ranges(mut self) -> Self {
        self.ranged = false;
        self
    }

    pub fn slow(mut self, chunk_size: usize, chunk_delay: Duration) -> Self {
        self.chunk_size = chunk_size.max(1);
        self.chunk_delay = chunk_delay;
        self
    }
}

/// A request as seen by the fixture. Header names are lowercased.
#[derive(Debug, Clone)]
pub(crate) struct RecordedRequest {
    pub path: String,
    pub headers: HashMap<String, String>,
}

pub(crate) struct TestServer {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    task: JoinHandle<()>,
}

impl TestServer {
    pub async fn start(routes: Vec<(&str, Route)>) -> Self {
        let routes: Arc<HashMap<String, Route>> = Arc::new(
            routes
                .into_iter()
                .map(|(path, route)| (path.to_string(), route))
                .collect(),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));

        let recorded = requests.clone();
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let routes = routes.clone();
                let recorded = recorded.clone();
                tokio::spawn(async move {
                    let _ = serve(stream, routes, recorded).await;
                });
            }
        });

        Self {
            addr,
            requests,
            task,
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn requests_to(&self, path: &str) -> Vec<RecordedRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.path == path)
            .collect()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(
    mut stream: TcpStream,
    routes: Arc<HashMap<String, Route>>,
    recorded: Arc<Mutex<Vec<RecordedRequest>>>,
) -> std::io::Result<()> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    let head = String::from_utf8_lossy(&buf).to_string();
    let mut lines = head.split("\r\n");
    let request_line = lines.next().unwrap_or_default();
    let target = request_line.split_whitespace().nth(1).unwrap_or("/");
    let path = target.split('?').next().unwrap_or("/").to_string();
    let headers: HashMap<String, String> = lines
        .take_while(|l| !l.is_empty())
        .filter_map(|l| l.split_once(':'))
        .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim().to_string()))
        .collect();

    recorded.lock().unwrap().push(RecordedRequest {
        path: path.clone(),
        headers: headers.clone(),
    });

    let route = routes
        .get(&path)
        .cloned()
        .unwrap_or_else(|| Route::json(404, serde_json::json!({"message": "Not Found"})));

    let mut status = route.status;
    let mut body = route.body.clone();
    let mut extra = route.headers.clone();

    if route.ranged && route.status == 200 {
        extra.push(("Accept-Ranges".into(), "bytes".into()));
        let start = headers
            .get("range")
            .and_then(|r| r.strip_prefix("bytes="))
            .and_then(|r| r.trim_end_matches('-').parse::<usize>().ok());
        if let Some(start) = start {
            let total = route.body.len();
            if start >= total {
                status = 416;
                body = Vec::new();
                extra.push(("Content-Range".into(), format!("bytes */{}", total)));
            } else {
                status = 206;
                body = route.body[start..].to_vec();
                extra.push((
                    "Content-Range".into(),
                    format!("bytes {}-{}/{}", start, total - 1, total),
                ));
            }
        }
    }

    let mut response = format!(
        "HTTP/1.1 {} {}\r\nContent-Length: {}\r\nConnection: close\r\n",
        status,
        reason(status),
        body.len()
    );
    for (name, value) in &extra {
        response.push_str(&format!("{}: {}\r\n", name, value));
    }
    response.push_str("\r\n");
    stream.write_all(response.as_bytes()).await?;

    for piece in body.chunks(route.chunk_size.max(1)) {
        stream.write_all(piece).await?;
        stream.flush().await?;
        if !route.chunk_delay.is_zero() {
            tokio::time::sleep(route.chunk_delay).await;
        }
    }
    stream.shutdown().await
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        206 => "Partial Content",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        416 => "Range Not Satisfiable",
        500 => "Internal Server Error",
        _ => "Status",
    }
}
