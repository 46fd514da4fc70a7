#![allow(dead_code)]

use std::net::SocketAddr;
use std::ops::Deref;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use hookline::{config::Config, service::Service};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Mutex;

pub struct TmpService {
    pub svc: Service,
    #[allow(unused)]
    tmpdir: TempDir,
}

impl Deref for TmpService {
    type Target = Service;

    fn deref(&self) -> &Self::Target {
        &self.svc
    }
}

pub async fn setup() -> TmpService {
    setup_with(|_| {}).await
}

pub async fn setup_with(adjust: impl FnOnce(&mut Config)) -> TmpService {
    let path = tempfile::tempdir().unwrap();

    let mut config = Config {
        db_path: Some(path.path().join("hookline.db").to_string_lossy().to_string()),
        api_secret: "test-secret".to_owned(),
        ..Config::default()
    };
    adjust(&mut config);

    TmpService {
        svc: Service::connect_with(config).await.unwrap(),
        tmpdir: path,
    }
}

/// Like [`setup_with`], but wrapped for sharing with an actix `App`.
pub async fn setup_data_with(
    adjust: impl FnOnce(&mut Config),
) -> (TempDir, actix_web::web::Data<Service>) {
    let TmpService { svc, tmpdir } = setup_with(adjust).await;
    (tmpdir, actix_web::web::Data::new(svc))
}

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.headers
            .iter()
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Minimal HTTP/1.1 receiver standing in for dispatch targets and webhook
/// subscribers. Responds with `status_for(path)` and records every request.
pub struct StubServer {
    pub addr: SocketAddr,
    pub hits: Arc<AtomicUsize>,
    pub requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl StubServer {
    pub async fn start(status_for: fn(&str) -> u16) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let requests = Arc::new(Mutex::new(Vec::new()));

        let task_hits = hits.clone();
        let task_requests = requests.clone();

        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };

                let hits = task_hits.clone();
                let requests = task_requests.clone();

                tokio::spawn(async move {
                    loop {
                        let Some(req) = read_request(&mut socket).await else {
                            return;
                        };

                        let status = status_for(&req.path);
                        hits.fetch_add(1, Ordering::SeqCst);
                        requests.lock().await.push(req);

                        let response = format!(
                            "HTTP/1.1 {status} X\r\ncontent-length: 2\r\n\r\nok"
                        );
                        if socket.write_all(response.as_bytes()).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });

        Self {
            addr,
            hits,
            requests,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn hit_count(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    pub async fn last_request(&self) -> Option<RecordedRequest> {
        self.requests.lock().await.last().cloned()
    }
}

async fn read_request(socket: &mut tokio::net::TcpStream) -> Option<RecordedRequest> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];

    let header_end = loop {
        if let Some(pos) = find_header_end(&buf) {
            break pos;
        }
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).into_owned();
    let mut lines = head.split("\r\n");
    let request_line = lines.next()?;
    let path = request_line.split_whitespace().nth(1)?.to_owned();

    let headers: Vec<(String, String)> = lines
        .filter_map(|line| {
            let (name, value) = line.split_once(':')?;
            Some((name.trim().to_ascii_lowercase(), value.trim().to_owned()))
        })
        .collect();

    let content_length: usize = headers
        .iter()
        .find(|(k, _)| k == "content-length")
        .and_then(|(_, v)| v.parse().ok())
        .unwrap_or(0);

    let mut body = buf[header_end + 4..].to_vec();
    while body.len() < content_length {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(content_length);

    Some(RecordedRequest {
        path,
        headers,
        body,
    })
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}
