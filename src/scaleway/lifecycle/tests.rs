//! Unit tests for Scaleway lifecycle helpers.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use rstest::{fixture, rstest};
use scaleway_rs::{ScalewayApi, ScalewayImage};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use super::*;
use crate::ScalewayConfig;
use crate::backend::{InstanceHandle, InstanceRequest};
use crate::scaleway::types::{ServerAction, ServerState, Zone};
use crate::scaleway::{ScalewayBackend, ScalewayBackendError};

fn snapshot(state: &str, allowed: &[&str], public_ip: Option<&str>) -> InstanceSnapshot {
    InstanceSnapshot {
        id: InstanceId::from("srv-1"),
        state: ServerState::from(state),
        allowed_actions: allowed.iter().map(|s| ServerAction::from(*s)).collect(),
        public_ip: public_ip.map(str::to_owned),
        private_ip: None,
    }
}

fn image(id: &str, arch: &str, state: &str, creation_date: &str) -> ScalewayImage {
    ScalewayImage {
        id: id.to_owned(),
        name: String::new(),
        arch: arch.to_owned(),
        creation_date: creation_date.to_owned(),
        modification_date: String::new(),
        from_server: None,
        organization: String::new(),
        public: true,
        state: state.to_owned(),
        project: String::new(),
        tags: vec![],
        zone: String::new(),
        root_volume: scaleway_rs::ScalewayImageRootVolume {
            id: String::new(),
            name: String::new(),
            size: 0,
            volume_type: String::new(),
        },
        default_bootscript: None,
        extra_volumes: scaleway_rs::ScalewayImageExtraVolumes {
            volumes: HashMap::new(),
        },
    }
}

fn server_json(state: &str, public_ip: Option<&str>, private_ip: Option<&str>) -> String {
    let public = public_ip.map_or_else(
        || String::from("null"),
        |ip| format!(r#"{{"id":"ip-1","address":"{ip}","dynamic":true}}"#),
    );
    let private = private_ip.map_or_else(|| String::from("null"), |ip| format!(r#""{ip}""#));
    format!(
        r#"{{"server":{{"id":"srv-1","name":"flotilla-x","state":"{state}","allowed_actions":["poweroff","terminate"],"public_ip":{public},"private_ip":{private},"tags":["flotilla"]}}}}"#
    )
}

#[fixture]
fn config() -> ScalewayConfig {
    ScalewayConfig {
        access_key: None,
        secret_key: String::from("dummy"),
        default_organization_id: None,
        default_project_id: String::from("proj"),
        default_zone: String::from("fr-par-1"),
        default_instance_type: String::from("DEV1-S"),
        default_image: String::from("Ubuntu 24.04 Noble Numbat"),
        default_architecture: String::from("x86_64"),
    }
}

fn backend_at(config: ScalewayConfig, api_base: String) -> ScalewayBackend {
    ScalewayBackend {
        api: ScalewayApi::new("dummy"),
        config,
        api_base,
        poll_interval: Duration::from_millis(1),
        wait_timeout: Duration::from_secs(2),
    }
}

fn handle() -> InstanceHandle {
    InstanceHandle {
        id: String::from("srv-1"),
        zone: String::from("fr-par-1"),
    }
}

/// Serves the scripted `(status, body)` responses, one per connection, and
/// returns the raw requests received.
async fn serve(responses: Vec<(u16, String)>) -> (String, JoinHandle<Vec<String>>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind listener");
    let addr = listener.local_addr().expect("listener address");
    let handle = tokio::spawn(async move {
        let mut requests = Vec::new();
        for (status, body) in responses {
            let (mut socket, _) = listener.accept().await.expect("accept connection");
            requests.push(read_request(&mut socket).await);
            let response = format!(
                "HTTP/1.1 {status} Scripted\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            socket
                .write_all(response.as_bytes())
                .await
                .expect("write response");
        }
        requests
    });
    (format!("http://{addr}"), handle)
}

async fn read_request(socket: &mut TcpStream) -> String {
    let mut raw = Vec::new();
    let mut chunk = [0_u8; 1024];
    loop {
        let read = socket.read(&mut chunk).await.expect("read request");
        raw.extend_from_slice(chunk.get(..read).unwrap_or_default());
        let text = String::from_utf8_lossy(&raw).into_owned();
        if let Some((head, body)) = text.split_once("\r\n\r\n") {
            let expected = head
                .lines()
                .find_map(|line| {
                    line.to_ascii_lowercase()
                        .strip_prefix("content-length:")
                        .and_then(|len| len.trim().parse::<usize>().ok())
                })
                .unwrap_or(0);
            if body.len() >= expected {
                return text;
            }
        }
        if read == 0 {
            return String::from_utf8_lossy(&raw).into_owned();
        }
    }
}

#[test]
fn server_view_maps_addresses() {
    let envelope: ServerEnvelope =
        serde_json::from_str(&server_json("running", Some("51.15.0.10"), Some("10.1.2.3")))
            .expect("server json");
    let snapshot = InstanceSnapshot::from(envelope.server);

    assert!(snapshot.is_running());
    assert!(snapshot.allows(&ServerAction::Terminate));
    assert_eq!(
        snapshot.public_address(),
        Some(IpAddr::V4(Ipv4Addr::new(51, 15, 0, 10)))
    );
    assert_eq!(
        snapshot.private_address(),
        Some(IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3)))
    );
}

#[rstest]
#[tokio::test]
async fn power_on_if_needed_returns_ok_for_running(config: ScalewayConfig) {
    let backend = backend_at(config, String::from("http://127.0.0.1:9"));
    let snap = snapshot("running", &["poweroff"], Some("1.1.1.1"));

    let result = backend
        .power_on_if_needed(&Zone::from("fr-par-1"), &snap)
        .await;

    assert!(result.is_ok());
}

#[rstest]
#[tokio::test]
async fn power_on_if_needed_errors_when_not_allowed(config: ScalewayConfig) {
    let backend = backend_at(config, String::from("http://127.0.0.1:9"));
    let snap = snapshot("stopping", &[], None);

    let result = backend
        .power_on_if_needed(&Zone::from("fr-par-1"), &snap)
        .await;

    assert!(matches!(
        result,
        Err(ScalewayBackendError::PowerOnNotAllowed { .. })
    ));
}

#[rstest]
fn filter_images_discards_wrong_arch_or_state(config: ScalewayConfig) {
    let backend = backend_at(config, String::new());
    let images = vec![
        image("keep", "x86_64", "available", "2025-01-01T00:00:00Z"),
        image("wrong-arch", "arm64", "available", "2025-01-01T00:00:00Z"),
        image("wrong-state", "x86_64", "failed", "2025-01-01T00:00:00Z"),
    ];

    let filtered = backend.filter_images(images);

    assert_eq!(filtered.len(), 1);
    assert_eq!(filtered.first().map(|img| img.id.as_str()), Some("keep"));
}

#[rstest]
fn select_image_id_picks_newest(config: ScalewayConfig) {
    let backend = backend_at(config, String::new());
    let images = vec![
        image("oldest", "x86_64", "available", "2024-12-01T00:00:00Z"),
        image("newest", "x86_64", "available", "2025-02-01T00:00:00Z"),
    ];

    let id = backend.select_image_id(images).expect("image selected");

    assert_eq!(id, "newest");
}

#[rstest]
#[tokio::test]
async fn resolve_falls_back_to_public_images(config: ScalewayConfig) {
    let backend = backend_at(config, String::new());

    let id = backend
        .resolve_image_id_with(
            || async { Ok(vec![image("project-arm", "arm64", "available", "2025-03-01")]) },
            || async { Ok(vec![image("public", "x86_64", "available", "2025-01-01")]) },
        )
        .await
        .expect("public image selected");

    assert_eq!(id, "public");
}

#[rstest]
#[tokio::test]
async fn resolve_reports_missing_image(config: ScalewayConfig) {
    let backend = backend_at(config, String::new());

    let err = backend
        .resolve_image_id_with(|| async { Ok(Vec::new()) }, || async { Ok(Vec::new()) })
        .await
        .expect_err("no candidates");

    assert_eq!(
        err,
        ScalewayBackendError::ImageNotFound {
            label: String::from("Ubuntu 24.04 Noble Numbat"),
            arch: String::from("x86_64"),
            zone: String::from("fr-par-1"),
        }
    );
}

#[rstest]
#[tokio::test]
async fn create_sends_boot_config_as_cloud_init(config: ScalewayConfig) {
    let (base, server) = serve(vec![(201, server_json("stopped", None, None))]).await;
    let backend = backend_at(config, base);
    let request = InstanceRequest::builder()
        .name("flotilla-abc")
        .boot_config("#cloud-config\nruncmd: [true]\n")
        .build()
        .expect("request");

    let snapshot = backend
        .create_instance_stopped(&request, "img-1")
        .await
        .expect("create succeeds");

    assert_eq!(snapshot.id.as_str(), "srv-1");
    let requests = server.await.expect("server task");
    let sent = requests.first().expect("one request");
    assert!(sent.starts_with("POST /zones/fr-par-1/servers "), "{sent}");
    assert!(sent.contains(r#""name":"flotilla-abc""#), "{sent}");
    assert!(sent.contains(r#""stopped":true"#), "{sent}");
    assert!(
        sent.contains(r##""cloud_init":"#cloud-config\nruncmd: [true]\n""##),
        "{sent}"
    );
}

#[rstest]
#[tokio::test]
async fn wait_for_public_ip_polls_until_address_assigned(config: ScalewayConfig) {
    let (base, server) = serve(vec![
        (200, server_json("starting", None, None)),
        (200, server_json("running", None, None)),
        (200, server_json("running", Some("51.15.0.10"), Some("10.1.2.3"))),
    ])
    .await;
    let backend = backend_at(config, base);

    let networking = backend
        .wait_for_public_ip(&handle())
        .await
        .expect("instance ready");

    assert_eq!(networking.public_ip.to_string(), "51.15.0.10");
    assert_eq!(
        networking.private_ip.map(|ip| ip.to_string()).as_deref(),
        Some("10.1.2.3")
    );
    assert_eq!(server.await.expect("server task").len(), 3);
}

#[rstest]
#[tokio::test]
async fn remove_instance_is_noop_when_already_gone(config: ScalewayConfig) {
    let (base, server) = serve(vec![(404, String::from(r#"{"type":"not_found"}"#))]).await;
    let backend = backend_at(config, base);

    backend
        .remove_instance(&handle())
        .await
        .expect("missing instance is already removed");

    let requests = server.await.expect("server task");
    assert!(
        requests
            .first()
            .is_some_and(|req| req.starts_with("GET /zones/fr-par-1/servers/srv-1 ")),
        "{requests:?}"
    );
}

#[rstest]
#[tokio::test]
async fn api_errors_surface_status_and_body(config: ScalewayConfig) {
    let (base, server) = serve(vec![(500, String::from("upstream exploded"))]).await;
    let backend = backend_at(config, base);

    let err = backend
        .fetch_instance(&handle())
        .await
        .expect_err("500 should fail");

    assert_eq!(
        err,
        ScalewayBackendError::Http {
            status: 500,
            body: String::from("upstream exploded"),
        }
    );
    assert_eq!(err.to_string(), "instances API returned 500: upstream exploded");
    server.await.expect("server task");
}
