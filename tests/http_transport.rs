//! HttpTransport against a local warp server.
//!
//! Run with:
//!   cargo test --test http_transport

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;

use bytes::Bytes;
use futures_util::stream;
use serde_json::{json, Value};
use warp::http::StatusCode;
use warp::Filter;

use solrcl::config::ConnectionConfig;
use solrcl::transport::{params, ServerInfo, Transport, Upload, XML_CONTENT_TYPE};
use solrcl::{HttpTransport, SolrError};

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

fn start_server() -> SocketAddr {
    let system = warp::path!("solr" / "admin" / "info" / "system")
        .and(warp::get())
        .map(|| {
            warp::reply::json(&json!({
                "responseHeader": {"status": 0, "QTime": 1},
                "lucene": {"solr-spec-version": "4.10.4", "lucene-spec-version": "4.10.4"}
            }))
        });

    let select = warp::path!("solr" / "core0" / "select")
        .and(warp::get())
        .and(warp::query::<HashMap<String, String>>())
        .map(|query: HashMap<String, String>| {
            warp::reply::json(&json!({
                "responseHeader": {"status": 0, "QTime": 2, "params": query},
                "response": {"numFound": 0, "start": 0, "docs": []}
            }))
        });

    let broken = warp::path!("solr" / "core0" / "broken").map(|| {
        warp::reply::with_status(
            warp::reply::json(&json!({
                "responseHeader": {"status": 500, "QTime": 0},
                "error": {"msg": "index is corrupt", "code": 500}
            })),
            StatusCode::INTERNAL_SERVER_ERROR,
        )
    });

    let plain = warp::path!("solr" / "core0" / "plain").map(|| "not json");

    let update = warp::path!("solr" / "core0" / "update")
        .and(warp::post())
        .and(warp::header::<String>("content-type"))
        .and(warp::body::bytes())
        .map(|content_type: String, body: Bytes| {
            warp::reply::json(&json!({
                "responseHeader": {"status": 0, "QTime": 0},
                "content_type": content_type,
                "received": String::from_utf8_lossy(&body),
            }))
        });

    let routes = system.or(select).or(broken).or(plain).or(update);
    let (addr, server) = warp::serve(routes).bind_ephemeral(([127, 0, 0, 1], 0));
    tokio::spawn(server);
    addr
}

fn transport(addr: SocketAddr) -> HttpTransport {
    HttpTransport::new(&ConnectionConfig::new("127.0.0.1", addr.port())).unwrap()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_get_adds_json_writer() {
    let http = transport(start_server());
    let response = http
        .request("core0/select", params(&[("q", "id:\"a b\"")]), None)
        .await
        .unwrap();
    let sent = &response["responseHeader"]["params"];
    assert_eq!(sent["q"], json!("id:\"a b\""));
    assert_eq!(sent["wt"], json!("json"));
}

#[tokio::test]
async fn test_server_info() {
    let http = transport(start_server());
    let info = ServerInfo::fetch(&http).await.unwrap();
    assert_eq!(info.solr_version, "4.10.4");
}

#[tokio::test]
async fn test_error_response() {
    let http = transport(start_server());
    match http.request("core0/broken", Vec::new(), None).await {
        Err(SolrError::Response { message, status }) => {
            assert_eq!(status, 500);
            assert!(message.contains("index is corrupt"));
        }
        other => panic!("expected response error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_non_json_responses() {
    let http = transport(start_server());
    let missing = http.request("core0/nowhere", Vec::new(), None).await.unwrap_err();
    assert_eq!(missing.status(), Some(404));

    let plain = http.request("core0/plain", Vec::new(), None).await.unwrap_err();
    assert_eq!(plain.status(), Some(200));
    assert!(plain.to_string().contains("content type"));
}

#[tokio::test]
async fn test_connection_refused() {
    let http = HttpTransport::new(&ConnectionConfig::new("127.0.0.1", 1)).unwrap();
    let err = http.request("core0/select", Vec::new(), None).await.unwrap_err();
    assert!(matches!(err, SolrError::Network(_)));
}

#[tokio::test]
async fn test_text_upload() {
    let http = transport(start_server());
    let response = http
        .request("core0/update", Vec::new(), Some(Upload::xml("<commit/>")))
        .await
        .unwrap();
    assert_eq!(response["received"], json!("<commit/>"));
    assert_eq!(response["content_type"], json!(XML_CONTENT_TYPE));
}

#[tokio::test]
async fn test_streamed_upload() {
    let http = transport(start_server());
    let chunks: Vec<io::Result<Bytes>> = vec![
        Ok(Bytes::from_static(b"<add>")),
        Ok(Bytes::from_static(b"<doc><field name=\"id\">1</field></doc>")),
        Ok(Bytes::from_static(b"\n")),
        Ok(Bytes::from_static(b"</add>")),
    ];
    let upload = Upload::stream(Box::pin(stream::iter(chunks)), XML_CONTENT_TYPE);
    let response: Value = http
        .request("core0/update", Vec::new(), Some(upload))
        .await
        .unwrap();
    assert_eq!(
        response["received"],
        json!("<add><doc><field name=\"id\">1</field></doc>\n</add>")
    );
}
