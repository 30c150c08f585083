//! HTTP surface for the detection pipeline.
//!
//! A plain `TcpListener` accept loop on a background thread. Every accepted
//! connection is served on its own thread and closed after one response, so
//! requests never wait on each other. At most `max_connections` are served at
//! once; extra connections get an immediate 503. The only shared state is the
//! pipeline, which is read-only apart from the backend mutex.

pub mod multipart;

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::pipeline::DetectionPipeline;

const MAX_HEADER_BYTES: usize = 16 * 1024;
const READ_TIMEOUT: Duration = Duration::from_secs(30);
const DRAIN_LIMIT_BYTES: usize = 64 * 1024 * 1024;
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 16 * 1024 * 1024;
pub const DEFAULT_MAX_CONNECTIONS: usize = 32;

const INDEX_HTML: &str = include_str!("index.html");

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
    pub max_upload_bytes: usize,
    /// Connections served concurrently before new ones are turned away.
    pub max_connections: usize,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:5000".to_string(),
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

pub struct ApiServer {
    cfg: ApiConfig,
    pipeline: Arc<DetectionPipeline>,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, pipeline: Arc<DetectionPipeline>) -> Self {
        Self { cfg, pipeline }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self
            .cfg
            .addr
            .parse()
            .with_context(|| format!("invalid listen address '{}'", self.cfg.addr))?;
        let listener = TcpListener::bind(configured_addr)
            .with_context(|| format!("failed to bind {}", configured_addr))?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let cfg = self.cfg;
        let pipeline = self.pipeline;
        let join = std::thread::spawn(move || {
            if let Err(err) = run_api(listener, cfg, pipeline, shutdown_thread) {
                log::error!("detection api stopped: {}", err);
            }
        });

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(
    listener: TcpListener,
    cfg: ApiConfig,
    pipeline: Arc<DetectionPipeline>,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    let in_flight = Arc::new(AtomicUsize::new(0));
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, peer)) => match ConnectionSlot::acquire(&in_flight, cfg.max_connections) {
                Some(slot) => {
                    let pipeline = pipeline.clone();
                    let max_upload_bytes = cfg.max_upload_bytes;
                    std::thread::spawn(move || {
                        let _slot = slot;
                        if let Err(err) = handle_connection(stream, &pipeline, max_upload_bytes) {
                            log::warn!("request from {} failed: {:#}", peer, err);
                        }
                    });
                }
                None => {
                    log::warn!(
                        "rejecting {}: {} connections already in flight",
                        peer,
                        cfg.max_connections
                    );
                    std::thread::spawn(move || {
                        if let Err(err) = reject_busy(stream) {
                            log::debug!("busy response to {} failed: {:#}", peer, err);
                        }
                    });
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

/// One unit of the concurrent connection budget, returned on drop.
struct ConnectionSlot(Arc<AtomicUsize>);

impl ConnectionSlot {
    fn acquire(in_flight: &Arc<AtomicUsize>, limit: usize) -> Option<Self> {
        in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < limit).then_some(n + 1))
            .ok()?;
        Some(Self(in_flight.clone()))
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn reject_busy(mut stream: TcpStream) -> Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_write_timeout(Some(READ_TIMEOUT))?;
    write_response(&mut stream, &Response::error(503, "server busy, retry shortly"))?;
    let _ = stream.shutdown(Shutdown::Write);
    drain(&mut stream);
    Ok(())
}

fn handle_connection(
    mut stream: TcpStream,
    pipeline: &DetectionPipeline,
    max_upload_bytes: usize,
) -> Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(READ_TIMEOUT))?;
    let started = Instant::now();

    let request = match read_request(&mut stream, max_upload_bytes) {
        Ok(request) => request,
        Err(err) if err.downcast_ref::<ConnectionClosed>().is_some() => return Ok(()),
        Err(err) => {
            let response = match err.downcast_ref::<PayloadTooLarge>() {
                Some(too_large) => Response::error(413, &too_large.to_string()),
                None => Response::error(400, &format!("bad request: {}", err)),
            };
            log::warn!("rejected request: {}", err);
            write_response(&mut stream, &response)?;
            let _ = stream.shutdown(Shutdown::Write);
            drain(&mut stream);
            return Ok(());
        }
    };

    let response = route(&request, pipeline);
    write_response(&mut stream, &response)?;
    log::info!(
        "{} {} -> {} ({} ms)",
        request.method,
        request.path,
        response.status,
        started.elapsed().as_millis()
    );
    Ok(())
}

fn route(request: &HttpRequest, pipeline: &DetectionPipeline) -> Response {
    match (request.method.as_str(), request.path.as_str()) {
        ("GET", "/") | ("GET", "/index.html") => Response::html(INDEX_HTML),
        ("GET", "/health") => Response::json(
            200,
            &HealthBody {
                status: "healthy",
                backend: pipeline.capability().as_str(),
                simulation_enabled: pipeline.options().simulate_on_missing_backend,
            },
        ),
        ("POST", "/detect") => detect(request, pipeline),
        (_, "/") | (_, "/index.html") | (_, "/health") | (_, "/detect") => {
            Response::error(405, "method not allowed")
        }
        _ => Response::error(404, "not found"),
    }
}

fn detect(request: &HttpRequest, pipeline: &DetectionPipeline) -> Response {
    let Some(boundary) = request
        .header("content-type")
        .and_then(multipart::boundary_from_content_type)
    else {
        return Response::error(400, "No image provided");
    };
    let parts = match multipart::parse(&request.body, &boundary) {
        Ok(parts) => parts,
        Err(err) => return Response::error(400, &format!("malformed multipart body: {}", err)),
    };
    let Some(part) = multipart::find_part(&parts, "image") else {
        return Response::error(400, "No image provided");
    };
    match part.filename.as_deref() {
        None => return Response::error(400, "No image provided"),
        Some(name) if name.trim().is_empty() => return Response::error(400, "No image selected"),
        Some(_) => {}
    }

    match pipeline.detect_upload(&part.data) {
        Ok(report) => Response::json(200, &report),
        Err(err) => {
            let status = err.status();
            if status >= 500 {
                log::error!("detection failed: {}", err);
            } else {
                log::warn!("detection rejected: {}", err);
            }
            Response::error(status, &err.to_string())
        }
    }
}

#[derive(Serialize)]
struct HealthBody {
    status: &'static str,
    backend: &'static str,
    simulation_enabled: bool,
}

#[derive(Debug)]
struct Response {
    status: u16,
    content_type: &'static str,
    body: Vec<u8>,
}

impl Response {
    fn json<T: Serialize>(status: u16, value: &T) -> Self {
        match serde_json::to_vec(value) {
            Ok(body) => Self {
                status,
                content_type: "application/json",
                body,
            },
            Err(err) => Self::error(500, &format!("failed to serialize response: {}", err)),
        }
    }

    fn error(status: u16, message: &str) -> Self {
        Self {
            status,
            content_type: "application/json",
            body: serde_json::json!({ "error": message }).to_string().into_bytes(),
        }
    }

    fn html(page: &str) -> Self {
        Self {
            status: 200,
            content_type: "text/html; charset=utf-8",
            body: page.as_bytes().to_vec(),
        }
    }
}

fn write_response(stream: &mut TcpStream, response: &Response) -> Result<()> {
    let header = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        status = response.status,
        reason = reason_phrase(response.status),
        content_type = response.content_type,
        len = response.body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(&response.body)?;
    stream.flush()?;
    Ok(())
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        413 => "Payload Too Large",
        503 => "Service Unavailable",
        _ => "Internal Server Error",
    }
}

#[derive(Debug)]
struct PayloadTooLarge {
    declared: usize,
    limit: usize,
}

impl std::fmt::Display for PayloadTooLarge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "request body of {} bytes exceeds the {} byte upload limit",
            self.declared, self.limit
        )
    }
}

impl std::error::Error for PayloadTooLarge {}

#[derive(Debug)]
struct ConnectionClosed;

impl std::fmt::Display for ConnectionClosed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("connection closed before a request was sent")
    }
}

impl std::error::Error for ConnectionClosed {}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

impl HttpRequest {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

fn read_request(stream: &mut TcpStream, max_body: usize) -> Result<HttpRequest> {
    let mut buf = [0u8; 8192];
    let mut data = Vec::new();
    let header_end = loop {
        if let Some(pos) = find_header_end(&data) {
            break pos;
        }
        if data.len() > MAX_HEADER_BYTES {
            return Err(anyhow!("request headers too large"));
        }
        let n = stream.read(&mut buf)?;
        if n == 0 {
            if data.is_empty() {
                return Err(ConnectionClosed.into());
            }
            return Err(anyhow!("connection closed mid-headers"));
        }
        data.extend_from_slice(&buf[..n]);
    };

    let head = String::from_utf8_lossy(&data[..header_end]).into_owned();
    let mut lines = head.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let mut headers = HashMap::new();
    for line in lines {
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }
    if headers
        .get("transfer-encoding")
        .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"))
    {
        return Err(anyhow!("chunked request bodies are not supported"));
    }

    let content_length = match headers.get("content-length") {
        Some(v) => v
            .parse::<usize>()
            .map_err(|_| anyhow!("invalid content-length '{}'", v))?,
        None => 0,
    };
    if content_length > max_body {
        return Err(PayloadTooLarge {
            declared: content_length,
            limit: max_body,
        }
        .into());
    }

    let mut body = data[header_end + 4..].to_vec();
    let expects_continue = headers
        .get("expect")
        .is_some_and(|v| v.eq_ignore_ascii_case("100-continue"));
    if expects_continue && body.len() < content_length {
        stream.write_all(b"HTTP/1.1 100 Continue\r\n\r\n")?;
        stream.flush()?;
    }
    while body.len() < content_length {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!(
                "request body truncated at {} of {} bytes",
                body.len(),
                content_length
            ));
        }
        body.extend_from_slice(&buf[..n]);
    }
    body.truncate(content_length);

    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(HttpRequest {
        method: method.to_string(),
        path,
        headers,
        body,
    })
}

fn find_header_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n")
}

// Read and discard what the client is still sending so closing the socket
// does not reset the connection before the response is read.
fn drain(stream: &mut TcpStream) {
    let _ = stream.set_read_timeout(Some(Duration::from_millis(500)));
    let mut buf = [0u8; 8192];
    let mut total = 0usize;
    while total < DRAIN_LIMIT_BYTES {
        match stream.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => total += n,
        }
    }
}
