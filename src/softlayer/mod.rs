//! SoftLayer implementation of [`Provider`] over the REST API.

use std::fmt;

use reqwest::{Client, RequestBuilder};
use tracing::debug;

use crate::config::ClientSettings;
use crate::provider::{
    ImageCapture, InstanceHandle, InstanceRequest, InstanceStatus, Provider, ProviderError,
    ProviderFuture,
};
use crate::resolve::ImageType;

mod wire;

use wire::{BlockDevice, GuestStatus, IdResponse, TemplateGroup};

/// REST client authenticated with an account user name and API key.
#[derive(Clone)]
pub struct SoftLayerClient {
    http: Client,
    endpoint: String,
    username: String,
    api_key: String,
}

impl fmt::Debug for SoftLayerClient {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("SoftLayerClient")
            .field("endpoint", &self.endpoint)
            .field("username", &"<Filtered>")
            .field("api_key", &"<Filtered>")
            .finish_non_exhaustive()
    }
}

impl SoftLayerClient {
    /// Creates a client for the configured endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Config`] when the HTTP client cannot be built
    /// or the credentials are blank.
    pub fn new(
        username: impl Into<String>,
        api_key: impl Into<String>,
        settings: &ClientSettings,
    ) -> Result<Self, ProviderError> {
        let username = username.into();
        let api_key = api_key.into();
        if username.trim().is_empty() || api_key.trim().is_empty() {
            return Err(ProviderError::Config(String::from(
                "username and api_key must not be empty",
            )));
        }

        let http = Client::builder()
            .timeout(settings.http_timeout())
            .build()
            .map_err(|err| ProviderError::Config(err.to_string()))?;

        Ok(Self {
            http,
            endpoint: settings.api_endpoint.trim_end_matches('/').to_owned(),
            username,
            api_key,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.endpoint)
    }

    async fn execute(&self, request: RequestBuilder) -> Result<Vec<u8>, ProviderError> {
        let response = request
            .basic_auth(&self.username, Some(&self.api_key))
            .send()
            .await?;
        let status = response.status();
        let body = response.bytes().await?.to_vec();
        debug!(status = status.as_u16(), bytes = body.len(), "softlayer response");

        if status.is_success() {
            return Ok(body);
        }
        Err(wire::api_error(status.as_u16(), &body))
    }

    async fn template_groups(
        &self,
        field: &str,
        value: &str,
    ) -> Result<Vec<TemplateGroup>, ProviderError> {
        let request = self
            .http
            .get(self.url("SoftLayer_Account/getBlockDeviceTemplateGroups.json"))
            .query(&[
                ("objectMask", wire::IMAGE_MASK.to_owned()),
                ("objectFilter", wire::image_filter(field, value)),
            ]);
        let body = self.execute(request).await?;
        wire::decode("image template groups", &body)
    }

    async fn capture_flex(
        &self,
        handle: &InstanceHandle,
        capture: &ImageCapture,
    ) -> Result<(), ProviderError> {
        let path = format!("SoftLayer_Virtual_Guest/{}/captureImage.json", handle.id);
        let request = self
            .http
            .post(self.url(&path))
            .json(&wire::capture_payload(capture));
        self.execute(request).await.map(drop)
    }

    async fn capture_standard(
        &self,
        handle: &InstanceHandle,
        capture: &ImageCapture,
    ) -> Result<(), ProviderError> {
        let devices_path = format!("SoftLayer_Virtual_Guest/{}/getBlockDevices.json", handle.id);
        let body = self.execute(self.http.get(self.url(&devices_path))).await?;
        let devices: Vec<BlockDevice> = wire::decode("block devices", &body)?;

        let archive_path = format!(
            "SoftLayer_Virtual_Guest/{}/createArchiveTransaction.json",
            handle.id
        );
        let request = self
            .http
            .post(self.url(&archive_path))
            .json(&wire::archive_payload(capture, &devices));
        self.execute(request).await.map(drop)
    }
}

impl Provider for SoftLayerClient {
    fn create_ssh_key<'a>(
        &'a self,
        label: &'a str,
        public_key: &'a str,
    ) -> ProviderFuture<'a, i64> {
        Box::pin(async move {
            let request = self
                .http
                .post(self.url("SoftLayer_Security_Ssh_Key.json"))
                .json(&wire::ssh_key_payload(label, public_key));
            let body = self.execute(request).await?;
            let created: IdResponse = wire::decode("ssh key", &body)?;
            Ok(created.id)
        })
    }

    fn delete_ssh_key(&self, key_id: i64) -> ProviderFuture<'_, ()> {
        Box::pin(async move {
            let path = format!("SoftLayer_Security_Ssh_Key/{key_id}.json");
            self.execute(self.http.delete(self.url(&path))).await.map(drop)
        })
    }

    fn create_instance<'a>(
        &'a self,
        request: &'a InstanceRequest,
    ) -> ProviderFuture<'a, InstanceHandle> {
        Box::pin(async move {
            let http_request = self
                .http
                .post(self.url("SoftLayer_Virtual_Guest.json"))
                .json(&wire::instance_payload(request));
            let body = self.execute(http_request).await?;
            let created: IdResponse = wire::decode("virtual guest", &body)?;
            Ok(InstanceHandle {
                id: created.id,
                datacenter: request.datacenter.clone(),
            })
        })
    }

    fn instance_status<'a>(
        &'a self,
        handle: &'a InstanceHandle,
    ) -> ProviderFuture<'a, InstanceStatus> {
        Box::pin(async move {
            let path = format!("SoftLayer_Virtual_Guest/{}/getObject.json", handle.id);
            let request = self
                .http
                .get(self.url(&path))
                .query(&[("objectMask", wire::STATUS_MASK)]);
            let body = self.execute(request).await?;
            let guest: GuestStatus = wire::decode("virtual guest status", &body)?;
            Ok(guest.into())
        })
    }

    fn capture_image<'a>(
        &'a self,
        handle: &'a InstanceHandle,
        capture: &'a ImageCapture,
    ) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            match capture.image_type {
                ImageType::Flex => self.capture_flex(handle, capture).await,
                ImageType::Standard => self.capture_standard(handle, capture).await,
            }
        })
    }

    fn find_image<'a>(&'a self, name: &'a str) -> ProviderFuture<'a, Option<String>> {
        Box::pin(async move {
            let groups = self.template_groups("name", name).await?;
            Ok(wire::newest_image(groups).and_then(|group| group.global_identifier))
        })
    }

    fn delete_instance<'a>(&'a self, handle: &'a InstanceHandle) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            let path = format!("SoftLayer_Virtual_Guest/{}.json", handle.id);
            self.execute(self.http.delete(self.url(&path))).await.map(drop)
        })
    }

    fn delete_image<'a>(&'a self, image_id: &'a str) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            let groups = self.template_groups("globalIdentifier", image_id).await?;
            let group =
                wire::newest_image(groups).ok_or_else(|| ProviderError::InvalidIdentifier {
                    value: image_id.to_owned(),
                })?;
            let path = format!(
                "SoftLayer_Virtual_Guest_Block_Device_Template_Group/{}.json",
                group.id
            );
            self.execute(self.http.delete(self.url(&path))).await.map(drop)
        })
    }
}

#[cfg(test)]
mod tests;
