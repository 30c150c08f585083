use anyhow::Result;
use base64::Engine as _;
use serde_json::Value;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lot_watch::api::{ApiConfig, ApiHandle, ApiServer};
use lot_watch::detect::StubBackend;
use lot_watch::{
    BoundingBox, Detection, DetectionCapability, DetectionPipeline, PipelineOptions, Resolution,
    SimulationProfile,
};

const BOUNDARY: &str = "----lotwatchTestBoundary";

struct TestApi {
    api_handle: Option<ApiHandle>,
}

impl TestApi {
    fn new(resolution: Resolution, options: PipelineOptions) -> Result<Self> {
        Self::with_limit(resolution, options, ApiConfig::default().max_upload_bytes)
    }

    fn with_limit(
        resolution: Resolution,
        options: PipelineOptions,
        max_upload_bytes: usize,
    ) -> Result<Self> {
        Self::with_config(
            resolution,
            options,
            ApiConfig {
                max_upload_bytes,
                ..ApiConfig::default()
            },
        )
    }

    fn with_config(
        resolution: Resolution,
        options: PipelineOptions,
        api_config: ApiConfig,
    ) -> Result<Self> {
        let pipeline = Arc::new(DetectionPipeline::new(resolution, options));
        let api_config = ApiConfig {
            addr: "127.0.0.1:0".to_string(),
            ..api_config
        };
        let api_handle = ApiServer::new(api_config, pipeline).spawn()?;
        Ok(Self {
            api_handle: Some(api_handle),
        })
    }

    fn addr(&self) -> std::net::SocketAddr {
        self.api_handle.as_ref().expect("api handle").addr
    }

    fn send(&self, raw: &[u8]) -> Result<(u16, String, Vec<u8>)> {
        let mut stream = TcpStream::connect(self.addr())?;
        stream.write_all(raw)?;
        let mut response = Vec::new();
        stream.read_to_end(&mut response)?;
        let split = response
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .expect("response has a header terminator");
        let headers = String::from_utf8_lossy(&response[..split]).into_owned();
        let body = response[split + 4..].to_vec();
        let status = headers
            .split_whitespace()
            .nth(1)
            .and_then(|s| s.parse().ok())
            .expect("status code");
        Ok((status, headers, body))
    }

    fn get(&self, path: &str) -> Result<(u16, String, Vec<u8>)> {
        self.send(format!("GET {} HTTP/1.1\r\nHost: localhost\r\n\r\n", path).as_bytes())
    }

    fn post_multipart(&self, body: &[u8]) -> Result<(u16, Value)> {
        let mut raw = format!(
            "POST /detect HTTP/1.1\r\nHost: localhost\r\nContent-Type: multipart/form-data; boundary={}\r\nContent-Length: {}\r\n\r\n",
            BOUNDARY,
            body.len()
        )
        .into_bytes();
        raw.extend_from_slice(body);
        let (status, _, body) = self.send(&raw)?;
        Ok((status, serde_json::from_slice(&body)?))
    }

    fn upload(&self, filename: &str, data: &[u8]) -> Result<(u16, Value)> {
        self.post_multipart(&multipart_body("image", filename, data))
    }
}

impl Drop for TestApi {
    fn drop(&mut self) {
        if let Some(handle) = self.api_handle.take() {
            let _ = handle.stop();
        }
    }
}

fn multipart_body(field: &str, filename: &str, data: &[u8]) -> Vec<u8> {
    let mut out = format!(
        "--{}\r\nContent-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\nContent-Type: image/png\r\n\r\n",
        BOUNDARY, field, filename
    )
    .into_bytes();
    out.extend_from_slice(data);
    out.extend_from_slice(format!("\r\n--{}--\r\n", BOUNDARY).as_bytes());
    out
}

// Smallest valid GIF89a: one white pixel.
const GIF_1X1: &[u8] = b"GIF89a\x01\x00\x01\x00\x80\x00\x00\xff\xff\xff\x00\x00\x00!\xf9\x04\x01\x00\x00\x00\x00,\x00\x00\x00\x00\x01\x00\x01\x00\x00\x02\x02D\x01\x00;";

fn webp_bytes(width: u32, height: u32) -> Vec<u8> {
    let img = image::RgbImage::from_pixel(width, height, image::Rgb([40, 140, 60]));
    let mut out = std::io::Cursor::new(Vec::new());
    img.write_to(&mut out, image::ImageFormat::WebP)
        .expect("encode webp");
    out.into_inner()
}

fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let img = image::RgbImage::from_pixel(width, height, image::Rgb([90, 90, 90]));
    let mut out = std::io::Cursor::new(Vec::new());
    img.write_to(&mut out, image::ImageFormat::Png)
        .expect("encode png");
    out.into_inner()
}

fn decode_annotated(report: &Value) -> image::RgbImage {
    let encoded = report["annotated_image"].as_str().expect("annotated image");
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .expect("valid base64");
    image::load_from_memory(&bytes)
        .expect("annotated image decodes")
        .into_rgb8()
}

fn stub_resolution(detections: Vec<Detection>) -> Resolution {
    Resolution::with_backend(StubBackend::with_detections(detections), None)
}

#[test]
fn health_reports_backend_tier() -> Result<()> {
    let api = TestApi::new(stub_resolution(Vec::new()), PipelineOptions::default())?;
    let (status, headers, body) = api.get("/health")?;
    assert_eq!(status, 200);
    assert!(headers.contains("application/json"));
    let json: Value = serde_json::from_slice(&body)?;
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["backend"], "real_model");
    assert_eq!(json["simulation_enabled"], true);

    let api = TestApi::new(
        Resolution::unavailable(DetectionCapability::MissingDependency),
        PipelineOptions::default(),
    )?;
    let (_, _, body) = api.get("/health")?;
    let json: Value = serde_json::from_slice(&body)?;
    assert_eq!(json["backend"], "missing_dependency");
    Ok(())
}

#[test]
fn index_page_is_served() -> Result<()> {
    let api = TestApi::new(stub_resolution(Vec::new()), PipelineOptions::default())?;
    let (status, headers, body) = api.get("/")?;
    assert_eq!(status, 200);
    assert!(headers.contains("text/html"));
    assert!(String::from_utf8(body)?.contains("/detect"));
    Ok(())
}

#[test]
fn unknown_routes_and_methods() -> Result<()> {
    let api = TestApi::new(stub_resolution(Vec::new()), PipelineOptions::default())?;
    let (status, _, _) = api.get("/nope")?;
    assert_eq!(status, 404);
    let (status, _, _) = api.get("/detect")?;
    assert_eq!(status, 405);
    Ok(())
}

#[test]
fn missing_or_unnamed_image_is_rejected() -> Result<()> {
    let api = TestApi::new(stub_resolution(Vec::new()), PipelineOptions::default())?;

    let (status, _, body) = api.send(
        b"POST /detect HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: 2\r\n\r\n{}",
    )?;
    assert_eq!(status, 400);
    let json: Value = serde_json::from_slice(&body)?;
    assert_eq!(json["error"], "No image provided");

    let (status, json) = api.post_multipart(&multipart_body("photo", "lot.png", &png_bytes(8, 8)))?;
    assert_eq!(status, 400);
    assert_eq!(json["error"], "No image provided");

    let (status, json) = api.upload("", &png_bytes(8, 8))?;
    assert_eq!(status, 400);
    assert_eq!(json["error"], "No image selected");

    let (status, json) = api.upload("lot.png", b"")?;
    assert_eq!(status, 400);
    assert_eq!(json["error"], "Uploaded image is empty");
    Ok(())
}

#[test]
fn real_backend_counts_only_vehicles() -> Result<()> {
    let detections = vec![
        Detection::new(BoundingBox::new(10.0, 10.0, 90.0, 70.0), 0.91, 2, "car"),
        Detection::new(BoundingBox::new(120.0, 40.0, 150.0, 120.0), 0.66, 0, "person"),
    ];
    let api = TestApi::new(stub_resolution(detections), PipelineOptions::default())?;
    let (status, json) = api.upload("lot.png", &png_bytes(320, 240))?;
    assert_eq!(status, 200);

    assert_eq!(json["success"], true);
    assert_eq!(json["is_simulation"], false);
    assert_eq!(json["backend"], "real_model");
    assert_eq!(json["car_count"], 1);
    assert_eq!(json["detections"].as_array().map(Vec::len), Some(2));
    assert_eq!(json["detections"][0]["class"], 2);
    assert_eq!(json["detections"][0]["bbox"][2], 90.0);

    let total = json["total_spaces"].as_u64().expect("total");
    let empty = json["empty_spaces"].as_u64().expect("empty");
    assert!(total >= 15);
    assert_eq!(empty, total - 1);
    assert!(json["message"]
        .as_str()
        .expect("message")
        .starts_with("AI Detection: Found 1 vehicles"));

    let annotated = decode_annotated(&json);
    assert_eq!(annotated.dimensions(), (320, 240));
    assert_eq!(json["image_width"], 320);
    assert_eq!(json["image_height"], 240);
    Ok(())
}

#[test]
fn empty_lot_still_reports_capacity() -> Result<()> {
    let api = TestApi::new(stub_resolution(Vec::new()), PipelineOptions::default())?;
    let (status, json) = api.upload("empty.png", &png_bytes(64, 48))?;
    assert_eq!(status, 200);
    assert_eq!(json["car_count"], 0);
    assert!(json["total_spaces"].as_u64().expect("total") >= 15);
    assert_eq!(json["empty_spaces"], json["total_spaces"]);
    assert_eq!(json["occupancy_rate"], 0.0);
    Ok(())
}

#[test]
fn missing_model_falls_back_to_simulation() -> Result<()> {
    let options = PipelineOptions {
        simulation: SimulationProfile::FullLot,
        ..PipelineOptions::default()
    };
    let api = TestApi::new(Resolution::unavailable(DetectionCapability::MissingModel), options)?;
    let (status, json) = api.upload("lot.png", &png_bytes(200, 150))?;
    assert_eq!(status, 200);

    assert_eq!(json["is_simulation"], true);
    assert_eq!(json["backend"], "missing_model");
    let cars = json["car_count"].as_u64().expect("car count");
    assert!((8..=25).contains(&cars));
    let empty = json["empty_spaces"].as_u64().expect("empty");
    assert!((5..=15).contains(&empty));
    assert_eq!(json["detections"].as_array().map(Vec::len), Some(0));
    assert!(json["message"]
        .as_str()
        .expect("message")
        .starts_with("Simulation:"));
    assert_eq!(decode_annotated(&json).dimensions(), (200, 150));
    Ok(())
}

#[test]
fn few_cars_simulation_draws_boxes() -> Result<()> {
    let options = PipelineOptions {
        simulation: SimulationProfile::FewCars,
        ..PipelineOptions::default()
    };
    let api = TestApi::new(Resolution::unavailable(DetectionCapability::MissingModel), options)?;
    let (status, json) = api.upload("lot.png", &png_bytes(640, 480))?;
    assert_eq!(status, 200);
    let cars = json["car_count"].as_u64().expect("car count");
    assert!((3..=8).contains(&cars));
    assert_eq!(
        json["detections"].as_array().map(|d| d.len() as u64),
        Some(cars)
    );
    Ok(())
}

#[test]
fn disabled_simulation_returns_service_unavailable() -> Result<()> {
    let options = PipelineOptions {
        simulate_on_missing_backend: false,
        ..PipelineOptions::default()
    };
    let api = TestApi::new(Resolution::unavailable(DetectionCapability::MissingModel), options)?;
    let (status, json) = api.upload("lot.png", &png_bytes(32, 32))?;
    assert_eq!(status, 503);
    assert!(json["error"].is_string());
    Ok(())
}

#[test]
fn undecodable_image_is_a_server_error() -> Result<()> {
    let api = TestApi::new(stub_resolution(Vec::new()), PipelineOptions::default())?;
    let (status, json) = api.upload("lot.png", b"this is not an image")?;
    assert_eq!(status, 500);
    assert!(json["error"].as_str().expect("error").contains("decode"));
    Ok(())
}

#[test]
fn backend_failure_is_reported_not_fatal() -> Result<()> {
    let api = TestApi::new(
        Resolution::with_backend(StubBackend::failing("tensor shape mismatch"), None),
        PipelineOptions::default(),
    )?;
    let (status, json) = api.upload("lot.png", &png_bytes(32, 32))?;
    assert_eq!(status, 500);
    assert!(json["error"]
        .as_str()
        .expect("error")
        .contains("tensor shape mismatch"));

    let (status, _, _) = api.get("/health")?;
    assert_eq!(status, 200);
    Ok(())
}

#[test]
fn oversized_upload_is_rejected() -> Result<()> {
    let api = TestApi::with_limit(stub_resolution(Vec::new()), PipelineOptions::default(), 1024)?;
    let (status, json) = api.upload("big.png", &vec![0u8; 4096])?;
    assert_eq!(status, 413);
    assert!(json["error"].is_string());
    Ok(())
}

#[test]
fn gif_and_webp_uploads_are_accepted() -> Result<()> {
    let api = TestApi::new(stub_resolution(Vec::new()), PipelineOptions::default())?;

    let (status, json) = api.upload("lot.gif", GIF_1X1)?;
    assert_eq!(status, 200, "gif rejected: {}", json);
    assert_eq!(json["success"], true);
    assert_eq!(json["image_width"], 1);

    let (status, json) = api.upload("lot.webp", &webp_bytes(48, 32))?;
    assert_eq!(status, 200, "webp rejected: {}", json);
    assert_eq!(decode_annotated(&json).dimensions(), (48, 32));
    Ok(())
}

#[test]
fn expect_continue_gets_interim_response() -> Result<()> {
    let api = TestApi::new(stub_resolution(Vec::new()), PipelineOptions::default())?;
    let body = multipart_body("image", "lot.png", &png_bytes(40, 30));

    let mut stream = TcpStream::connect(api.addr())?;
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;
    let head = format!(
        "POST /detect HTTP/1.1\r\nHost: localhost\r\nExpect: 100-continue\r\nContent-Type: multipart/form-data; boundary={}\r\nContent-Length: {}\r\n\r\n",
        BOUNDARY,
        body.len()
    );
    stream.write_all(head.as_bytes())?;

    let mut interim = Vec::new();
    let mut byte = [0u8; 1];
    while !interim.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte)?;
        interim.push(byte[0]);
    }
    assert_eq!(interim, b"HTTP/1.1 100 Continue\r\n\r\n");

    stream.write_all(&body)?;
    let mut response = String::new();
    stream.read_to_string(&mut response)?;
    assert!(response.starts_with("HTTP/1.1 200"), "{}", response);
    Ok(())
}

#[test]
fn connections_over_the_limit_get_busy_response() -> Result<()> {
    let api = TestApi::with_config(
        stub_resolution(Vec::new()),
        PipelineOptions::default(),
        ApiConfig {
            max_connections: 1,
            ..ApiConfig::default()
        },
    )?;

    // Holds the only slot: connected but silent.
    let idle = TcpStream::connect(api.addr())?;

    let mut busy = TcpStream::connect(api.addr())?;
    busy.set_read_timeout(Some(Duration::from_secs(5)))?;
    let mut response = String::new();
    busy.read_to_string(&mut response)?;
    assert!(response.starts_with("HTTP/1.1 503"), "{}", response);
    assert!(response.contains("server busy"));

    drop(idle);
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let (status, _, _) = api.get("/health")?;
        if status == 200 {
            break;
        }
        assert!(Instant::now() < deadline, "slot was never released");
        std::thread::sleep(Duration::from_millis(50));
    }
    Ok(())
}
