//! Request payloads and response shapes of the SoftLayer REST API.

use serde::Deserialize;
use serde_json::{Value, json};

use crate::provider::{ImageCapture, InstanceRequest, InstanceStatus, ProviderError};
use crate::resolve::BaseImage;

/// Object mask selecting the fields read by status polls.
pub(super) const STATUS_MASK: &str = "id;primaryIpAddress;powerState.keyName;activeTransactionCount";

/// Object mask selecting the fields read by image lookups.
pub(super) const IMAGE_MASK: &str = "id;globalIdentifier";

/// Block device name SoftLayer assigns to the swap disk.
const SWAP_DEVICE: &str = "1";

#[derive(Debug, Deserialize)]
pub(super) struct IdResponse {
    pub(super) id: i64,
}

#[derive(Debug, Deserialize)]
struct PowerState {
    #[serde(rename = "keyName")]
    key_name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct GuestStatus {
    power_state: Option<PowerState>,
    active_transaction_count: Option<u32>,
    primary_ip_address: Option<String>,
}

impl From<GuestStatus> for InstanceStatus {
    fn from(guest: GuestStatus) -> Self {
        Self {
            power_state: guest.power_state.and_then(|state| state.key_name),
            active_transactions: guest.active_transaction_count.unwrap_or_default(),
            primary_ip: guest.primary_ip_address,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub(super) struct BlockDevice {
    pub(super) id: i64,
    pub(super) device: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub(super) struct TemplateGroup {
    pub(super) id: i64,
    pub(super) global_identifier: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: Option<String>,
    code: Option<String>,
}

pub(super) fn ssh_key_payload(label: &str, public_key: &str) -> Value {
    json!({"parameters": [{"key": public_key, "label": label}]})
}

pub(super) fn instance_payload(request: &InstanceRequest) -> Value {
    let mut guest = json!({
        "hostname": request.hostname,
        "domain": request.domain,
        "startCpus": request.cpus,
        "maxMemory": request.memory_mb,
        "hourlyBillingFlag": true,
        "localDiskFlag": true,
        "datacenter": {"name": request.datacenter},
        "networkComponents": [{"maxSpeed": request.network_speed}],
    });

    if let Some(object) = guest.as_object_mut() {
        match &request.boot {
            BaseImage::OsCode(code) => {
                object.insert(
                    String::from("operatingSystemReferenceCode"),
                    Value::from(code.as_str()),
                );
                object.insert(
                    String::from("blockDevices"),
                    json!([{"device": "0", "diskImage": {"capacity": request.disk_capacity_gb}}]),
                );
            }
            BaseImage::Image(id) => {
                object.insert(
                    String::from("blockDeviceTemplateGroup"),
                    json!({"globalIdentifier": id}),
                );
            }
        }

        if !request.ssh_key_ids.is_empty() {
            let keys: Vec<Value> = request
                .ssh_key_ids
                .iter()
                .map(|id| json!({"id": id}))
                .collect();
            object.insert(String::from("sshKeys"), Value::Array(keys));
        }
    }

    json!({"parameters": [guest]})
}

pub(super) fn capture_payload(capture: &ImageCapture) -> Value {
    json!({"parameters": [{"name": capture.name, "description": capture.description}]})
}

/// Archive payload covering every block device except swap.
pub(super) fn archive_payload(capture: &ImageCapture, devices: &[BlockDevice]) -> Value {
    let disks: Vec<Value> = devices
        .iter()
        .filter(|device| device.device.as_deref() != Some(SWAP_DEVICE))
        .map(|device| json!({"id": device.id}))
        .collect();
    json!({"parameters": [capture.name, disks, capture.description]})
}

pub(super) fn image_filter(field: &str, value: &str) -> String {
    json!({"blockDeviceTemplateGroups": {field: {"operation": value}}}).to_string()
}

/// Picks the most recently created group (highest id) with an identifier.
pub(super) fn newest_image(groups: Vec<TemplateGroup>) -> Option<TemplateGroup> {
    groups
        .into_iter()
        .filter(|group| group.global_identifier.is_some())
        .max_by_key(|group| group.id)
}

pub(super) fn api_error(status: u16, body: &[u8]) -> ProviderError {
    match serde_json::from_slice::<ApiErrorBody>(body) {
        Ok(ApiErrorBody {
            error: Some(message),
            code,
        }) => ProviderError::Api {
            status,
            code,
            message,
        },
        _ => ProviderError::Api {
            status,
            code: None,
            message: String::from_utf8_lossy(body).trim().to_owned(),
        },
    }
}

pub(super) fn decode<T>(what: &str, body: &[u8]) -> Result<T, ProviderError>
where
    T: serde::de::DeserializeOwned,
{
    serde_json::from_slice(body).map_err(|err| ProviderError::Decode {
        what: what.to_owned(),
        message: err.to_string(),
    })
}
