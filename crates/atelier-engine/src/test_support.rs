//! In-process HTTP stub and in-memory collaborators for tests.

use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use atelier_contracts::prompt::PromptRecord;
use atelier_contracts::records::GeneratedImage;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use serde_json::{Map, Value};

use crate::persistence::{ImageRecordStore, PromptSource};

#[derive(Debug, Clone)]
pub struct StubResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub delay: Option<Duration>,
}

impl StubResponse {
    pub fn json(status: u16, value: Value) -> Self {
        Self {
            status,
            headers: vec![("Content-Type".to_string(), "application/json".to_string())],
            body: value.to_string().into_bytes(),
            delay: None,
        }
    }

    pub fn bytes(status: u16, content_type: &str, body: Vec<u8>) -> Self {
        Self {
            status,
            headers: vec![("Content-Type".to_string(), content_type.to_string())],
            body,
            delay: None,
        }
    }

    pub fn text(status: u16, body: &str) -> Self {
        Self::bytes(status, "text/plain", body.as_bytes().to_vec())
    }

    /// Holds the response back after the request has been read.
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }
}

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.body).unwrap_or(Value::Null)
    }
}

/// Serves the given responses in order, one per connection.
pub struct StubServer {
    base_url: String,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl StubServer {
    /// `build` receives the server's base URL so responses can point back at it.
    pub fn start(build: impl FnOnce(&str) -> Vec<StubResponse>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind stub server");
        let base_url = format!("http://{}", listener.local_addr().expect("local addr"));
        let responses = build(&base_url);
        let requests = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&requests);
        thread::spawn(move || {
            for response in responses {
                let Ok((mut stream, _)) = listener.accept() else {
                    return;
                };
                if let Some(request) = read_request(&mut stream) {
                    recorded.lock().expect("requests lock").push(request);
                }
                write_response(&mut stream, &response);
            }
        });
        Self { base_url, requests }
    }

    pub fn url(&self) -> &str {
        &self.base_url
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().expect("requests lock").clone()
    }
}

fn read_request(stream: &mut TcpStream) -> Option<RecordedRequest> {
    let mut reader = BufReader::new(stream.try_clone().ok()?);
    let mut request_line = String::new();
    reader.read_line(&mut request_line).ok()?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next()?.to_string();
    let path = parts.next()?.to_string();

    let mut headers = Vec::new();
    let mut content_length = 0usize;
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).ok()?;
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            let name = name.trim().to_string();
            let value = value.trim().to_string();
            if name.eq_ignore_ascii_case("content-length") {
                content_length = value.parse().unwrap_or(0);
            }
            headers.push((name, value));
        }
    }

    let mut body = vec![0u8; content_length];
    reader.read_exact(&mut body).ok()?;
    Some(RecordedRequest {
        method,
        path,
        headers,
        body,
    })
}

fn write_response(stream: &mut TcpStream, response: &StubResponse) {
    if let Some(delay) = response.delay {
        thread::sleep(delay);
    }
    let mut head = format!("HTTP/1.1 {} Stub\r\n", response.status);
    for (name, value) in &response.headers {
        head.push_str(&format!("{name}: {value}\r\n"));
    }
    head.push_str(&format!("Content-Length: {}\r\n", response.body.len()));
    head.push_str("Connection: close\r\n\r\n");
    let _ = stream.write_all(head.as_bytes());
    let _ = stream.write_all(&response.body);
    let _ = stream.flush();
}

/// Small PNG with a horizontal gradient.
pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let image = RgbImage::from_fn(width, height, |x, y| {
        Rgb([(x % 256) as u8, (y % 256) as u8, 128])
    });
    let mut bytes = std::io::Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(image)
        .write_to(&mut bytes, ImageFormat::Png)
        .expect("encode png");
    bytes.into_inner()
}

#[derive(Default)]
pub struct MemoryPromptSource {
    prompts: BTreeMap<String, PromptRecord>,
}

impl MemoryPromptSource {
    pub fn new(prompts: impl IntoIterator<Item = PromptRecord>) -> Self {
        Self {
            prompts: prompts
                .into_iter()
                .map(|record| (record.id.clone(), record))
                .collect(),
        }
    }
}

impl PromptSource for MemoryPromptSource {
    fn prompt(&self, id: &str) -> Result<Option<PromptRecord>> {
        Ok(self.prompts.get(id).cloned())
    }
}

#[derive(Default)]
pub struct MemoryRecordStore {
    rows: Mutex<BTreeMap<String, Map<String, Value>>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().map(|rows| rows.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ImageRecordStore for MemoryRecordStore {
    fn name(&self) -> &str {
        "memory"
    }

    fn insert(&self, record: &GeneratedImage) -> Result<()> {
        let mut rows = self.rows.lock().map_err(|_| anyhow!("record store lock poisoned"))?;
        if rows.contains_key(&record.id) {
            bail!("record {} already exists", record.id);
        }
        rows.insert(record.id.clone(), record.to_row()?);
        Ok(())
    }

    fn update(&self, id: &str, patch: &Map<String, Value>) -> Result<()> {
        let mut rows = self.rows.lock().map_err(|_| anyhow!("record store lock poisoned"))?;
        let row = rows
            .get_mut(id)
            .ok_or_else(|| anyhow!("record {id} not found"))?;
        for (key, value) in patch {
            row.insert(key.clone(), value.clone());
        }
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Option<GeneratedImage>> {
        let rows = self.rows.lock().map_err(|_| anyhow!("record store lock poisoned"))?;
        rows.get(id)
            .cloned()
            .map(GeneratedImage::from_row)
            .transpose()
    }
}
