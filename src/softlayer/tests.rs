//! Tests for SoftLayer payloads, response decoding, and error mapping.

use super::wire::{
    BlockDevice, GuestStatus, TemplateGroup, api_error, archive_payload, decode, image_filter,
    instance_payload, newest_image, ssh_key_payload,
};
use super::*;
use crate::resolve::BaseImage;
use crate::test_support::sample_config;
use rstest::{fixture, rstest};
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

#[fixture]
fn request() -> InstanceRequest {
    InstanceRequest::from_config(&sample_config(), vec![1001])
}

#[rstest]
fn os_code_instances_carry_boot_disk_capacity(request: InstanceRequest) {
    let payload = instance_payload(&request);

    assert_eq!(
        payload,
        json!({"parameters": [{
            "hostname": "kiln-1700000000",
            "domain": "defaultdomain.com",
            "startCpus": 1,
            "maxMemory": 1024,
            "hourlyBillingFlag": true,
            "localDiskFlag": true,
            "datacenter": {"name": "ams01"},
            "networkComponents": [{"maxSpeed": 10}],
            "operatingSystemReferenceCode": "UBUNTU_LATEST",
            "blockDevices": [{"device": "0", "diskImage": {"capacity": 25}}],
            "sshKeys": [{"id": 1001}]
        }]})
    );
}

#[rstest]
fn image_instances_reference_the_template_group(request: InstanceRequest) {
    let request = InstanceRequest {
        boot: BaseImage::Image(String::from("0a1b-2c3d")),
        ssh_key_ids: Vec::new(),
        ..request
    };

    let payload = instance_payload(&request);
    let guest = payload
        .pointer("/parameters/0")
        .expect("payload should wrap the guest");

    assert_eq!(
        guest.pointer("/blockDeviceTemplateGroup/globalIdentifier"),
        Some(&json!("0a1b-2c3d"))
    );
    assert!(guest.get("operatingSystemReferenceCode").is_none());
    assert!(guest.get("blockDevices").is_none());
    assert!(guest.get("sshKeys").is_none());
}

#[test]
fn ssh_key_payload_carries_label_and_key() {
    assert_eq!(
        ssh_key_payload("kiln-abc", "ssh-rsa AAAA"),
        json!({"parameters": [{"key": "ssh-rsa AAAA", "label": "kiln-abc"}]})
    );
}

#[test]
fn standard_archive_skips_swap_devices() {
    let capture = ImageCapture {
        name: String::from("web"),
        description: String::from("desc"),
        image_type: ImageType::Standard,
    };
    let devices = vec![
        BlockDevice {
            id: 11,
            device: Some(String::from("0")),
        },
        BlockDevice {
            id: 12,
            device: Some(String::from("1")),
        },
        BlockDevice {
            id: 13,
            device: Some(String::from("2")),
        },
    ];

    assert_eq!(
        archive_payload(&capture, &devices),
        json!({"parameters": ["web", [{"id": 11}, {"id": 13}], "desc"]})
    );
}

#[test]
fn image_filter_matches_on_the_given_field() {
    let filter: serde_json::Value =
        serde_json::from_str(&image_filter("name", "web-base")).expect("filter is JSON");
    assert_eq!(
        filter,
        json!({"blockDeviceTemplateGroups": {"name": {"operation": "web-base"}}})
    );
}

#[test]
fn newest_image_prefers_the_highest_id() {
    let groups = vec![
        TemplateGroup {
            id: 5,
            global_identifier: Some(String::from("old")),
        },
        TemplateGroup {
            id: 9,
            global_identifier: None,
        },
        TemplateGroup {
            id: 7,
            global_identifier: Some(String::from("new")),
        },
    ];

    assert_eq!(
        newest_image(groups).and_then(|group| group.global_identifier),
        Some(String::from("new"))
    );
}

#[test]
fn guest_status_decodes_nested_power_state() {
    let body = br#"{"id":42,"primaryIpAddress":"169.50.1.2","powerState":{"keyName":"RUNNING"},"activeTransactionCount":0}"#;
    let guest: GuestStatus = decode("status", body).expect("status should decode");
    let status = InstanceStatus::from(guest);

    assert!(status.is_running());
    assert_eq!(status.primary_ip.as_deref(), Some("169.50.1.2"));
    assert!(status.ready_address().is_some());
}

#[rstest]
#[case(
    br#"{"error":"Object not found","code":"SoftLayer_Exception_ObjectNotFound"}"#.as_slice(),
    Some("SoftLayer_Exception_ObjectNotFound"),
    "Object not found"
)]
#[case(b"gateway timeout\n".as_slice(), None, "gateway timeout")]
fn api_errors_use_the_softlayer_body(
    #[case] body: &[u8],
    #[case] code: Option<&str>,
    #[case] message: &str,
) {
    assert_eq!(
        api_error(404, body),
        ProviderError::Api {
            status: 404,
            code: code.map(str::to_owned),
            message: message.to_owned(),
        }
    );
}

#[test]
fn debug_output_hides_credentials() {
    let client = SoftLayerClient::new("alice", "s3cret", &ClientSettings::default())
        .expect("client should build");
    let rendered = format!("{client:?}");

    assert!(!rendered.contains("alice"));
    assert!(!rendered.contains("s3cret"));
}

#[test]
fn blank_credentials_are_rejected() {
    let err = SoftLayerClient::new("", "key", &ClientSettings::default())
        .expect_err("blank username should fail");
    assert!(matches!(err, ProviderError::Config(_)));
}

/// Serves one canned HTTP response and yields the raw request head.
async fn serve_once(status: &'static str, body: &'static str) -> (String, JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind should succeed");
    let address = listener.local_addr().expect("local address");
    let handle = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.expect("accept should succeed");
        let mut buffer = vec![0_u8; 8192];
        let read = socket.read(&mut buffer).await.expect("read request");
        let response = format!(
            "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\
             Connection: close\r\n\r\n{body}",
            body.len()
        );
        socket
            .write_all(response.as_bytes())
            .await
            .expect("write response");
        String::from_utf8_lossy(buffer.get(..read).unwrap_or_default()).into_owned()
    });
    (format!("http://{address}/rest/v3/"), handle)
}

fn client_for(endpoint: String) -> SoftLayerClient {
    let settings = ClientSettings {
        api_endpoint: endpoint,
        ..ClientSettings::default()
    };
    SoftLayerClient::new("alice", "s3cret", &settings).expect("client should build")
}

#[tokio::test]
async fn instance_status_reads_the_guest_object() {
    let (endpoint, server) = serve_once(
        "200 OK",
        r#"{"id":42,"primaryIpAddress":"10.1.2.3","powerState":{"keyName":"HALTED"},"activeTransactionCount":1}"#,
    )
    .await;
    let client = client_for(endpoint);
    let handle = InstanceHandle {
        id: 42,
        datacenter: String::from("ams01"),
    };

    let status = client
        .instance_status(&handle)
        .await
        .expect("status should decode");
    let request = server.await.expect("server task");

    assert_eq!(status.power_state.as_deref(), Some("HALTED"));
    assert_eq!(status.active_transactions, 1);
    assert!(
        request.starts_with("GET /rest/v3/SoftLayer_Virtual_Guest/42/getObject.json?objectMask="),
        "unexpected request: {request}"
    );
    assert!(
        request.to_ascii_lowercase().contains("authorization: basic "),
        "missing basic auth: {request}"
    );
}

#[tokio::test]
async fn error_responses_become_api_errors() {
    let (endpoint, server) = serve_once(
        "500 Internal Server Error",
        r#"{"error":"Invalid API token.","code":"SoftLayer_Exception_InvalidLogin"}"#,
    )
    .await;
    let client = client_for(endpoint);

    let err = client
        .delete_ssh_key(7)
        .await
        .expect_err("server error should fail");
    let request = server.await.expect("server task");

    assert_eq!(
        err,
        ProviderError::Api {
            status: 500,
            code: Some(String::from("SoftLayer_Exception_InvalidLogin")),
            message: String::from("Invalid API token."),
        }
    );
    assert!(request.starts_with("DELETE /rest/v3/SoftLayer_Security_Ssh_Key/7.json"));
}
