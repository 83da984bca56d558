//! Immutable record of a successfully built image.

use std::fmt;
use std::sync::Arc;

use crate::provider::{Provider, ProviderError};

/// Identifier of the builder that produces [`Artifact`]s.
pub const BUILDER_ID: &str = "kiln.softlayer";

/// Image produced by a successful build.
#[derive(Clone, Debug)]
pub struct Artifact {
    image_name: String,
    image_id: String,
    datacenter_name: String,
    client: Arc<dyn Provider>,
}

impl Artifact {
    /// Creates an artifact sharing the build's provider client.
    #[must_use]
    pub const fn new(
        image_name: String,
        image_id: String,
        datacenter_name: String,
        client: Arc<dyn Provider>,
    ) -> Self {
        Self {
            image_name,
            image_id,
            datacenter_name,
            client,
        }
    }

    /// Returns the image identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.image_id
    }

    /// Returns [`BUILDER_ID`].
    #[must_use]
    pub const fn builder_id(&self) -> &'static str {
        BUILDER_ID
    }

    /// Returns the image name.
    #[must_use]
    pub fn image_name(&self) -> &str {
        &self.image_name
    }

    /// Returns the datacenter the image was built in.
    #[must_use]
    pub fn datacenter_name(&self) -> &str {
        &self.datacenter_name
    }

    /// Deletes the image.
    ///
    /// # Errors
    ///
    /// Returns the provider's error when deletion fails.
    pub async fn destroy(&self) -> Result<(), ProviderError> {
        self.client.delete_image(&self.image_id).await
    }
}

impl fmt::Display for Artifact {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            formatter,
            "{}::{} ({})",
            self.datacenter_name, self.image_id, self.image_name
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeProvider;

    fn artifact(client: Arc<FakeProvider>) -> Artifact {
        Artifact::new(
            String::from("web-base"),
            String::from("0a1b-2c3d"),
            String::from("dal05"),
            client,
        )
    }

    #[test]
    fn displays_datacenter_id_and_name() {
        let artifact = artifact(Arc::new(FakeProvider::new()));

        assert_eq!(artifact.to_string(), "dal05::0a1b-2c3d (web-base)");
        assert_eq!(artifact.id(), "0a1b-2c3d");
        assert_eq!(artifact.builder_id(), "kiln.softlayer");
    }

    #[tokio::test]
    async fn destroy_deletes_the_image() {
        let client = Arc::new(FakeProvider::new());
        let artifact = artifact(Arc::clone(&client));

        artifact.destroy().await.expect("destroy should succeed");

        assert_eq!(client.calls(), vec!["delete_image 0a1b-2c3d"]);
    }
}
