use std::io::{BufRead, BufReader, Write};
use std::net::TcpListener;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use assert_matches::assert_matches;

use grimperium::error::GrimError;
use grimperium::pubchem::{Lookup, PubchemHttpClient, StructureRegistry};
use grimperium::retry::RetryPolicy;

const ETHANOL_SDF: &str = "\
702
  -OEChem-

  9  8  0     0  0  0  0  0  0999 V2000
M  END
$$$$
";

/// Answers each request on localhost with `respond(path)`.
fn serve_with<F>(mut respond: F) -> String
where
    F: FnMut(&str) -> (u16, &'static str) + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { break };
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut request_line = String::new();
            reader.read_line(&mut request_line).unwrap();
            loop {
                let mut header = String::new();
                if reader.read_line(&mut header).unwrap() == 0 || header == "\r\n" {
                    break;
                }
            }
            let target = request_line.split_whitespace().nth(1).unwrap_or("/");
            let (status, body) = respond(target);
            let response = format!(
                "HTTP/1.1 {status} X\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            let _ = stream.write_all(response.as_bytes());
        }
    });
    format!("http://{addr}/rest/pug/compound")
}

/// Serves canned responses, keyed by request path.
fn serve(routes: Vec<(&'static str, u16, &'static str)>) -> String {
    serve_with(move |target| {
        routes
            .iter()
            .find(|(path, _, _)| target.ends_with(path))
            .map(|(_, status, body)| (*status, *body))
            .unwrap_or((404, "PUGREST.NotFound"))
    })
}

/// Serves `responses` in order, then 404s.
fn serve_sequence(responses: Vec<(u16, &'static str)>) -> (String, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    let base = serve_with(move |_| {
        let index = counter.fetch_add(1, Ordering::SeqCst);
        responses
            .get(index)
            .copied()
            .unwrap_or((404, "PUGREST.NotFound"))
    });
    (base, hits)
}

#[test]
fn lookup_falls_back_to_2d_structure() {
    let base = serve(vec![
        ("/name/ethanol/cids/JSON", 200, r#"{"IdentifierList":{"CID":[702,12345]}}"#),
        ("/cid/702/SDF?record_type=2d", 200, ETHANOL_SDF),
    ]);
    let client = PubchemHttpClient::with_base(&base).unwrap();
    let temp = tempfile::tempdir().unwrap();

    let lookup = client.lookup("ethanol", temp.path()).unwrap();

    assert_matches!(lookup, Lookup::Found(path) => {
        assert!(path.ends_with("ethanol.sdf"));
        assert_eq!(std::fs::read_to_string(path).unwrap(), ETHANOL_SDF);
    });
}

#[test]
fn unknown_name_is_not_found() {
    let base = serve(Vec::new());
    let client = PubchemHttpClient::with_base(&base).unwrap();
    let temp = tempfile::tempdir().unwrap();

    assert!(!client.exists("unobtainium").unwrap());
    assert_eq!(
        client.lookup("unobtainium", temp.path()).unwrap(),
        Lookup::NotFound
    );
}

#[test]
fn known_name_exists() {
    let base = serve(vec![(
        "/name/water/cids/JSON",
        200,
        r#"{"IdentifierList":{"CID":[962]}}"#,
    )]);
    let client = PubchemHttpClient::with_base(&base).unwrap();
    assert!(client.exists("water").unwrap());
}

#[test]
fn busy_responses_are_retried() {
    let (base, hits) = serve_sequence(vec![
        (503, "busy"),
        (429, "slow down"),
        (200, r#"{"IdentifierList":{"CID":[962]}}"#),
    ]);
    let client = PubchemHttpClient::with_base(&base)
        .unwrap()
        .with_retry(RetryPolicy::new(3, Duration::ZERO, 1.0));

    assert!(client.exists("water").unwrap());
    assert_eq!(hits.load(Ordering::SeqCst), 3);
}

#[test]
fn busy_after_last_attempt_is_a_status_error() {
    let (base, hits) = serve_sequence(vec![(503, "busy"), (503, "still busy")]);
    let client = PubchemHttpClient::with_base(&base)
        .unwrap()
        .with_retry(RetryPolicy::new(2, Duration::ZERO, 1.0));

    assert_matches!(
        client.cids("water"),
        Err(GrimError::PubchemStatus { status: 503, message }) => {
            assert_eq!(message, "still busy");
        }
    );
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[test]
#[ignore]
fn fetch_real_ethanol_structure() {
    let client = PubchemHttpClient::new().unwrap();
    let temp = tempfile::tempdir().unwrap();
    let lookup = client.lookup("ethanol", temp.path()).unwrap();
    assert_matches!(lookup, Lookup::Found(path) => assert!(path.is_file()));
}
