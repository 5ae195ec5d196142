//! Shared utilities for gateway integration testing.
//!
//! The mock backend speaks real FastCGI over a real Unix socket, reusing the
//! crate's own framer and codec, so the tests exercise the full wire path.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{TcpListener, UnixListener, UnixStream};

use fcgi_gate::config::GatewayConfig;
use fcgi_gate::fcgi::codec;
use fcgi_gate::fcgi::{RecordBody, RecordFramer, RecordType};
use fcgi_gate::{gateway, HttpServer, Shutdown};

pub const DEFAULT_RESPONSE: &str = "Status: 200 OK\r\nContent-Type: text/plain\r\n\r\nok";

/// What the backend does once a request is fully received.
#[derive(Clone)]
#[allow(dead_code)]
pub enum MockAction {
    /// Write the payload as stdout, then complete the request.
    Respond(&'static str),
    /// Like Respond, after a delay (lets tests overlap requests).
    RespondDelayed(u64, &'static str),
    /// Respond, but first emit a stdout record for an unknown request id,
    /// a stderr record for the real request, and a management (id 0)
    /// record. None of them may reach the client.
    RespondWithNoise(&'static str),
    /// Drop the connection without completing the request.
    CloseConnection,
}

/// One request as observed by the backend.
#[derive(Clone, Debug)]
pub struct ReceivedRequest {
    pub params: Vec<(String, String)>,
    pub stdin: Vec<u8>,
    pub keep_connection: bool,
}

impl ReceivedRequest {
    #[allow(dead_code)]
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Scripted FastCGI responder listening on a Unix socket.
///
/// Actions are consumed in order, one per completed request, across all
/// connections; once the script is empty every request gets
/// [`DEFAULT_RESPONSE`].
#[derive(Clone)]
pub struct MockBackend {
    pub socket_path: PathBuf,
    mpxs: i64,
    requests: Arc<Mutex<Vec<ReceivedRequest>>>,
    script: Arc<Mutex<Vec<MockAction>>>,
    in_progress: Arc<AtomicU32>,
    max_in_progress: Arc<AtomicU32>,
}

struct PartialRequest {
    params: Vec<(String, String)>,
    stdin: Vec<u8>,
    keep_connection: bool,
}

impl MockBackend {
    pub async fn start(socket_path: &Path, mpxs: i64, script: Vec<MockAction>) -> Self {
        let _ = std::fs::remove_file(socket_path);
        let listener = UnixListener::bind(socket_path).unwrap();
        let backend = Self {
            socket_path: socket_path.to_path_buf(),
            mpxs,
            requests: Arc::new(Mutex::new(Vec::new())),
            script: Arc::new(Mutex::new(script)),
            in_progress: Arc::new(AtomicU32::new(0)),
            max_in_progress: Arc::new(AtomicU32::new(0)),
        };

        let acceptor = backend.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        let backend = acceptor.clone();
                        tokio::spawn(async move {
                            backend.serve(stream).await;
                        });
                    }
                    Err(_) => break,
                }
            }
        });
        backend
    }

    /// Every request received so far, in arrival order.
    #[allow(dead_code)]
    pub fn requests(&self) -> Vec<ReceivedRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// High-water mark of concurrently open requests.
    #[allow(dead_code)]
    pub fn max_in_progress(&self) -> u32 {
        self.max_in_progress.load(Ordering::SeqCst)
    }

    async fn serve(&self, stream: UnixStream) {
        let (mut reader, writer) = stream.into_split();
        let writer = Arc::new(tokio::sync::Mutex::new(writer));
        let mut framer = RecordFramer::new();
        let mut partial: HashMap<u16, PartialRequest> = HashMap::new();

        loop {
            let mut chunk = BytesMut::with_capacity(8 * 1024);
            match reader.read_buf(&mut chunk).await {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            }
            framer.write(chunk.freeze());

            while let Some((header, body)) = framer.next_record() {
                let record = codec::decode_record(&header, body).unwrap();
                let id = record.request_id;
                match record.body {
                    RecordBody::GetValues(names) => {
                        self.answer_get_values(&writer, &names).await;
                    }
                    RecordBody::BeginRequest {
                        keep_connection, ..
                    } => {
                        let now = self.in_progress.fetch_add(1, Ordering::SeqCst) + 1;
                        self.max_in_progress.fetch_max(now, Ordering::SeqCst);
                        partial.insert(
                            id,
                            PartialRequest {
                                params: Vec::new(),
                                stdin: Vec::new(),
                                keep_connection,
                            },
                        );
                    }
                    RecordBody::Params(pairs) => {
                        if let Some(p) = partial.get_mut(&id) {
                            for (name, value) in pairs {
                                p.params.push((
                                    String::from_utf8_lossy(&name).into_owned(),
                                    String::from_utf8_lossy(&value).into_owned(),
                                ));
                            }
                        }
                    }
                    RecordBody::Stdin(data) if !data.is_empty() => {
                        if let Some(p) = partial.get_mut(&id) {
                            p.stdin.extend_from_slice(&data);
                        }
                    }
                    RecordBody::Stdin(_) => {
                        // Empty stdin record: the request is complete.
                        let Some(p) = partial.remove(&id) else { continue };
                        let keep = p.keep_connection;
                        self.requests.lock().unwrap().push(ReceivedRequest {
                            params: p.params,
                            stdin: p.stdin,
                            keep_connection: keep,
                        });

                        let action = {
                            let mut script = self.script.lock().unwrap();
                            if script.is_empty() {
                                MockAction::Respond(DEFAULT_RESPONSE)
                            } else {
                                script.remove(0)
                            }
                        };

                        match action {
                            MockAction::CloseConnection => {
                                self.in_progress.fetch_sub(1, Ordering::SeqCst);
                                let _ = writer.lock().await.shutdown().await;
                                return;
                            }
                            MockAction::Respond(payload) => {
                                self.respond(&writer, id, 0, payload).await;
                            }
                            MockAction::RespondWithNoise(payload) => {
                                self.write_noise(&writer, id).await;
                                self.respond(&writer, id, 0, payload).await;
                            }
                            MockAction::RespondDelayed(delay_ms, payload) => {
                                let backend = self.clone();
                                let writer = writer.clone();
                                tokio::spawn(async move {
                                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                                    backend.respond(&writer, id, 0, payload).await;
                                });
                            }
                        }
                    }
                    other => panic!("unexpected record from gateway: {:?}", other),
                }
            }
        }
    }

    async fn answer_get_values(
        &self,
        writer: &Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
        names: &[bytes::Bytes],
    ) {
        let mut values: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
        for name in names {
            let value = match &name[..] {
                b"FCGI_MPXS_CONNS" => Some(self.mpxs.to_string().into_bytes()),
                b"FCGI_MAX_CONNS" => Some(b"25".to_vec()),
                b"FCGI_MAX_REQS" => Some(b"100".to_vec()),
                _ => None,
            };
            if let Some(value) = value {
                values.push((name.to_vec(), value));
            }
        }

        let body = if values.is_empty() {
            // An empty query doubles as the exchange terminator.
            bytes::Bytes::new()
        } else {
            let pairs = values.iter().map(|(n, v)| (n.as_slice(), v.as_slice()));
            codec::encode_params(pairs).unwrap()
        };
        let record = codec::encode_record(RecordType::GetValuesResult, 0, &body).unwrap();
        let _ = writer.lock().await.write_all(&record).await;
    }

    /// Records the gateway must ignore: stdout for a request id that was
    /// never begun, stderr for the live request, and a management record.
    async fn write_noise(&self, writer: &Arc<tokio::sync::Mutex<OwnedWriteHalf>>, id: u16) {
        let stray = codec::encode_record(RecordType::Stdout, id + 999, b"stray body").unwrap();
        let stderr = codec::encode_record(RecordType::Stderr, id, b"warning line\n").unwrap();
        let management = codec::encode_record(RecordType::GetValuesResult, 0, &[]).unwrap();

        let mut writer = writer.lock().await;
        let _ = writer.write_all(&stray).await;
        let _ = writer.write_all(&stderr).await;
        let _ = writer.write_all(&management).await;
    }

    async fn respond(
        &self,
        writer: &Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
        id: u16,
        app_status: u32,
        payload: &str,
    ) {
        let stdout = codec::encode_record(RecordType::Stdout, id, payload.as_bytes()).unwrap();
        let stdout_close = codec::encode_record(RecordType::Stdout, id, &[]).unwrap();

        let mut end_body = Vec::with_capacity(8);
        end_body.extend_from_slice(&app_status.to_be_bytes());
        end_body.push(0); // request complete
        end_body.extend_from_slice(&[0, 0, 0]);
        let end = codec::encode_record(RecordType::EndRequest, id, &end_body).unwrap();

        let mut writer = writer.lock().await;
        let _ = writer.write_all(&stdout).await;
        let _ = writer.write_all(&stdout_close).await;
        let _ = writer.write_all(&end).await;
        self.in_progress.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Unique socket path under the temp dir.
pub fn temp_socket(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("fcgi-gate-test-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    dir.join(name)
}

/// Start the full gateway stack against the given backend socket.
///
/// The backend must already be listening: the engine connects at startup.
/// Returns the base URL of the HTTP listener.
pub async fn start_gateway(socket_path: &Path) -> (String, Shutdown) {
    let mut config = GatewayConfig::default();
    config.listener.bind_address = "127.0.0.1:0".into();
    config.backend.socket_path = socket_path.display().to_string();
    start_gateway_with(config).await
}

pub async fn start_gateway_with(config: GatewayConfig) -> (String, Shutdown) {
    let listener = TcpListener::bind(&config.listener.bind_address)
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();

    let (handle, _engine) = gateway::spawn(config.backend.clone());
    let server = HttpServer::new(&config, handle, addr.port());

    let shutdown = Shutdown::new();
    tokio::spawn(server.run(listener, shutdown.clone()));
    (format!("http://{}", addr), shutdown)
}
