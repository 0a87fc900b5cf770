use std::io::{BufRead, BufReader, Write};
use std::net::TcpListener;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use assert_matches::assert_matches;

use seq_submit::archive::{ArchiveClient, ArchiveHttpClient};
use seq_submit::config::ClientSettings;
use seq_submit::error::{INTERNAL_ERROR_MESSAGE, SubmitError};
use seq_submit::http::{Service, build_client, send_with_retries};

/// Answers one connection per canned response, in order, and hands back the
/// request lines it saw.
struct CannedServer {
    url: String,
    handle: JoinHandle<Vec<String>>,
}

impl CannedServer {
    fn start(responses: Vec<(u16, &'static str)>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let handle = thread::spawn(move || {
            let mut requests = Vec::new();
            for (status, body) in responses {
                let (mut stream, _) = listener.accept().unwrap();
                let mut reader = BufReader::new(stream.try_clone().unwrap());
                let mut request_line = String::new();
                reader.read_line(&mut request_line).unwrap();
                loop {
                    let mut line = String::new();
                    let read = reader.read_line(&mut line).unwrap();
                    if read == 0 || line == "\r\n" {
                        break;
                    }
                }
                requests.push(request_line.trim_end().to_string());

                let response = format!(
                    "HTTP/1.1 {status} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    reason(status),
                    body.len()
                );
                stream.write_all(response.as_bytes()).unwrap();
                stream.flush().unwrap();
            }
            requests
        });
        Self { url, handle }
    }

    fn requests(self) -> Vec<String> {
        self.handle.join().unwrap()
    }
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

fn archive(url: &str, max_retries: usize) -> ArchiveHttpClient {
    ArchiveHttpClient::new(&ClientSettings {
        archive_url: url.to_string(),
        storage_url: url.to_string(),
        token: None,
        timeout: Duration::from_secs(5),
        max_retries,
        ignore_undefined_md5: false,
    })
    .unwrap()
}

#[test]
fn archive_not_found_keeps_message_and_does_not_retry() {
    let server = CannedServer::start(vec![(404, r#"{"message": "Analysis an1 not found"}"#)]);
    let client = archive(&server.url, 3);

    let err = client.file_specs("S1", "an1").unwrap_err();
    assert_eq!(err.persisted_message(), "Analysis an1 not found");
    assert_matches!(err, SubmitError::ArchiveStatus { status: 404, message } => {
        assert_eq!(message, "Analysis an1 not found");
    });
    assert_eq!(
        server.requests(),
        vec!["GET /studies/S1/analysis/an1/files HTTP/1.1".to_string()]
    );
}

#[test]
fn repeated_unavailable_exhausts_retries() {
    let unavailable = r#"{"message": "archive unavailable"}"#;
    let server = CannedServer::start(vec![(503, unavailable); 3]);
    let client = archive(&server.url, 2);

    let err = client.file_specs("S1", "an1").unwrap_err();
    assert!(err.is_remote());
    assert_eq!(err.persisted_message(), "archive unavailable");
    assert_matches!(err, SubmitError::RetriesExhausted { attempts: 3, source } => {
        assert_matches!(*source, SubmitError::ArchiveStatus { status: 503, message } => {
            assert_eq!(message, "archive unavailable");
        });
    });
    assert_eq!(server.requests().len(), 3);
}

#[test]
fn transient_unavailable_then_success() {
    let server = CannedServer::start(vec![
        (503, r#"{"message": "busy"}"#),
        (503, ""),
        (200, "[]"),
    ]);
    let client = archive(&server.url, 3);

    let specs = client.file_specs("S1", "an1").unwrap();
    assert!(specs.is_empty());
    assert_eq!(server.requests().len(), 3);
}

#[test]
fn storage_errors_use_text_or_status_line() {
    let server = CannedServer::start(vec![(400, "bad part number\n"), (403, "")]);
    let client = build_client(Service::Storage, Some("secret"), Duration::from_secs(5)).unwrap();
    let url = format!("{}/upload/obj1/parts", server.url);

    let err = send_with_retries(Service::Storage, 3, || client.get(&url)).unwrap_err();
    assert_eq!(err.persisted_message(), INTERNAL_ERROR_MESSAGE);
    assert_matches!(err, SubmitError::StorageStatus { status: 400, message } => {
        assert_eq!(message, "bad part number");
    });

    let err = send_with_retries(Service::Storage, 3, || client.get(&url)).unwrap_err();
    assert_matches!(err, SubmitError::StorageStatus { status: 403, message } => {
        assert_eq!(message, "HTTP 403 Forbidden");
    });
    assert_eq!(server.requests().len(), 2);
}
