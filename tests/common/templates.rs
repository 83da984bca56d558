//! Template documents shared by the integration tests.

/// Template with inline credentials, one variable and one shell provisioner.
pub const VALID_TEMPLATE: &str = r#"{
    "description": "web base image",
    "variables": {"image": "web-base"},
    "builders": [{
        "type": "softlayer",
        "name": "primary",
        "username": "alice",
        "api_key": "s3cret",
        "datacenter_name": "dal05",
        "image_name": "{{user `image`}}-{{timestamp}}",
        "base_os_code": "UBUNTU_LATEST",
        "ssh_timeout": "10m"
    }],
    "provisioners": [{
        "type": "shell",
        "environment_vars": ["IMAGE={{user `image`}}"],
        "inline": ["apt-get update"]
    }]
}"#;

/// Builder section missing its base image and carrying a bad timeout.
pub const INVALID_BUILDER_TEMPLATE: &str = r#"{
    "builders": [{
        "type": "softlayer",
        "username": "alice",
        "api_key": "s3cret",
        "image_name": "web",
        "instance_state_timeout": "forever"
    }]
}"#;
