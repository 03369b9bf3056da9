//! # Test Doubles
//!
//! Minimal blocking servers on `std::net::TcpListener` used by the
//! integration tests: a Canary Views HTTP endpoint and an MQTT 3.1.1 broker.
//! Each runs on its own thread and records what it receives.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;

// --- Canary Views mock ---

/// One HTTP request as seen by [`MockHttpServer`].
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    /// Path including the query string.
    pub target: String,
    pub body: String,
}

impl RecordedRequest {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_str(&self.body).unwrap_or(serde_json::Value::Null)
    }
}

type Handler = dyn Fn(&RecordedRequest) -> (u16, String) + Send + Sync;

/// Answers every request through `handler`, one connection per request.
pub struct MockHttpServer {
    pub base_url: String,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl MockHttpServer {
    pub fn start<F>(handler: F) -> Self
    where
        F: Fn(&RecordedRequest) -> (u16, String) + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let base_url = format!("http://{}/", listener.local_addr().unwrap());
        let requests = Arc::new(Mutex::new(Vec::new()));
        let handler: Arc<Handler> = Arc::new(handler);

        let recorded = requests.clone();
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                let _ = serve_http(stream, handler.as_ref(), &recorded);
            }
        });

        Self { base_url, requests }
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn count(&self, path_prefix: &str) -> usize {
        self.requests()
            .iter()
            .filter(|r| r.target.trim_start_matches('/').starts_with(path_prefix))
            .count()
    }
}

fn serve_http(stream: TcpStream, handler: &Handler, recorded: &Mutex<Vec<RecordedRequest>>) -> std::io::Result<()> {
    let mut reader = BufReader::new(stream.try_clone()?);

    let mut request_line = String::new();
    reader.read_line(&mut request_line)?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let target = parts.next().unwrap_or_default().to_string();

    let mut content_length = 0usize;
    loop {
        let mut line = String::new();
        reader.read_line(&mut line)?;
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.eq_ignore_ascii_case("content-length") {
                content_length = value.trim().parse().unwrap_or(0);
            }
        }
    }

    let mut body = vec![0u8; content_length];
    reader.read_exact(&mut body)?;

    let request = RecordedRequest {
        method,
        target,
        body: String::from_utf8_lossy(&body).into_owned(),
    };
    let (status, response_body) = handler(&request);
    recorded.lock().unwrap().push(request);

    let mut stream = stream;
    write!(
        stream,
        "HTTP/1.1 {} Mock\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        response_body.len(),
        response_body
    )?;
    stream.flush()
}

// --- MQTT broker mock ---

/// How the mock broker treats PUBLISH packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    /// PUBACK for QoS 1, PUBREC/PUBCOMP for QoS 2.
    Ack,
    /// Never acknowledge.
    Silent,
    /// Drop the connection on the first PUBLISH of the first connection,
    /// acknowledge normally afterwards.
    DropFirst,
}

/// A PUBLISH the broker received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedPublish {
    pub topic: String,
    pub qos: u8,
    pub retain: bool,
    pub payload: Vec<u8>,
}

pub struct MockBroker {
    pub port: u16,
    published: Arc<Mutex<Vec<ReceivedPublish>>>,
    connections: Arc<Mutex<usize>>,
}

impl MockBroker {
    pub fn start(mode: AckMode) -> Self {
        Self::start_on(0, mode)
    }

    /// Listens on a fixed port, e.g. one a client already failed to reach.
    pub fn start_on(port: u16, mode: AckMode) -> Self {
        let listener = TcpListener::bind(("127.0.0.1", port)).unwrap();
        let port = listener.local_addr().unwrap().port();
        let published = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(Mutex::new(0usize));

        let (published_in, connections_in) = (published.clone(), connections.clone());
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                let index = {
                    let mut count = connections_in.lock().unwrap();
                    *count += 1;
                    *count
                };
                let published = published_in.clone();
                thread::spawn(move || {
                    let _ = serve_mqtt(stream, mode, index, &published);
                });
            }
        });

        Self {
            port,
            published,
            connections,
        }
    }

    pub fn published(&self) -> Vec<ReceivedPublish> {
        self.published.lock().unwrap().clone()
    }

    pub fn connections(&self) -> usize {
        *self.connections.lock().unwrap()
    }
}

fn read_packet(stream: &mut TcpStream) -> std::io::Result<(u8, Vec<u8>)> {
    let mut header = [0u8; 1];
    stream.read_exact(&mut header)?;

    let mut remaining = 0usize;
    let mut shift = 0;
    loop {
        let mut byte = [0u8; 1];
        stream.read_exact(&mut byte)?;
        remaining |= ((byte[0] & 0x7F) as usize) << shift;
        if byte[0] & 0x80 == 0 {
            break;
        }
        shift += 7;
    }

    let mut body = vec![0u8; remaining];
    stream.read_exact(&mut body)?;
    Ok((header[0], body))
}

fn serve_mqtt(
    mut stream: TcpStream,
    mode: AckMode,
    connection: usize,
    published: &Mutex<Vec<ReceivedPublish>>,
) -> std::io::Result<()> {
    // CONNECT → CONNACK (accepted, no session)
    let (header, _) = read_packet(&mut stream)?;
    assert_eq!(header >> 4, 1, "first packet must be CONNECT");
    stream.write_all(&[0x20, 0x02, 0x00, 0x00])?;

    loop {
        let (header, body) = read_packet(&mut stream)?;
        match header >> 4 {
            // PUBLISH
            3 => {
                let qos = (header >> 1) & 0x03;
                let topic_len = u16::from_be_bytes([body[0], body[1]]) as usize;
                let topic = String::from_utf8_lossy(&body[2..2 + topic_len]).into_owned();
                let mut offset = 2 + topic_len;
                let pkid = if qos > 0 {
                    offset += 2;
                    [body[offset - 2], body[offset - 1]]
                } else {
                    [0, 0]
                };

                if mode == AckMode::DropFirst && connection == 1 {
                    return Ok(());
                }

                published.lock().unwrap().push(ReceivedPublish {
                    topic,
                    qos,
                    retain: header & 0x01 == 1,
                    payload: body[offset..].to_vec(),
                });

                if mode == AckMode::Silent {
                    continue;
                }
                match qos {
                    1 => stream.write_all(&[0x40, 0x02, pkid[0], pkid[1]])?,
                    2 => stream.write_all(&[0x50, 0x02, pkid[0], pkid[1]])?,
                    _ => {}
                }
            }
            // PUBREL → PUBCOMP
            6 => stream.write_all(&[0x70, 0x02, body[0], body[1]])?,
            // PINGREQ → PINGRESP
            12 => stream.write_all(&[0xD0, 0x00])?,
            // DISCONNECT
            14 => return Ok(()),
            _ => {}
        }
    }
}
