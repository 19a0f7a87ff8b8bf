//! Controller settings
//!
//! Plain typed values built once from the command line and shared through
//! the controller context.

use std::time::Duration;

use kube::ResourceExt;
use virtimage_common::crd::VirtualImage;

/// Default interval between registry presence checks of Ready images
pub const DEFAULT_PRESENCE_CHECK_INTERVAL: Duration = Duration::from_secs(300);

/// Default number of images reconciled in parallel
pub const DEFAULT_CONCURRENCY: u16 = 4;

/// Everything the reconciler needs besides the cluster client
#[derive(Clone, Debug)]
pub struct ControllerSettings {
    /// Namespace the controller runs in
    pub namespace: String,
    /// Image of the importer pod
    pub importer_image: String,
    /// Image of the uploader pod
    pub uploader_image: String,
    /// Image of the bounder pod
    pub bounder_image: String,
    /// Pull policy of helper pods
    pub pull_policy: String,
    /// How often Ready registry images are re-checked
    pub presence_check_interval: Duration,
    /// Images reconciled in parallel
    pub concurrency: u16,
    /// DVCR registry
    pub dvcr: DvcrSettings,
    /// Storage class policy
    pub storage_class: StorageClassSettings,
    /// Upload ingress
    pub uploader: UploaderSettings,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            namespace: "d8-virtualization".to_string(),
            importer_image: "dvcr-importer:latest".to_string(),
            uploader_image: "dvcr-uploader:latest".to_string(),
            bounder_image: "bounder:latest".to_string(),
            pull_policy: "IfNotPresent".to_string(),
            presence_check_interval: DEFAULT_PRESENCE_CHECK_INTERVAL,
            concurrency: DEFAULT_CONCURRENCY,
            dvcr: DvcrSettings::default(),
            storage_class: StorageClassSettings::default(),
            uploader: UploaderSettings::default(),
        }
    }
}

/// Connection settings of the DVCR registry
#[derive(Clone, Debug, Default)]
pub struct DvcrSettings {
    /// Registry address, e.g. `dvcr.d8-virtualization.svc`
    pub registry_url: String,
    /// Secret with registry credentials (dockerconfigjson)
    pub auth_secret: Option<String>,
    /// Namespace of the credentials secret; the controller namespace when unset
    pub auth_secret_namespace: Option<String>,
    /// Secret with the registry CA certificate
    pub cert_secret: Option<String>,
    /// Skip TLS verification when talking to the registry
    pub insecure_tls: bool,
}

impl DvcrSettings {
    /// DVCR image the given VirtualImage is stored as
    pub fn image_for(&self, vi: &VirtualImage) -> String {
        vi.registry_image(&self.registry_url)
    }

    /// Namespace of the credentials secret
    pub fn auth_namespace<'a>(&'a self, controller_namespace: &'a str) -> &'a str {
        self.auth_secret_namespace
            .as_deref()
            .unwrap_or(controller_namespace)
    }
}

/// Module-wide storage class policy
#[derive(Clone, Debug, Default)]
pub struct StorageClassSettings {
    /// Every image goes to this class
    pub forced: Option<String>,
    /// Classes images may request
    pub allowed: Vec<String>,
    /// Class used when the image requests none
    pub default: Option<String>,
    /// Cluster default class used when no StorageClass carries the default annotation
    pub cluster_default: Option<String>,
}

/// Ingress settings for the upload endpoint
#[derive(Clone, Debug)]
pub struct UploaderSettings {
    /// IngressClass of the uploader ingress
    pub ingress_class: Option<String>,
    /// External host of the upload endpoint
    pub ingress_host: String,
    /// TLS secret copied next to the uploader ingress
    pub tls_secret: Option<String>,
}

impl Default for UploaderSettings {
    fn default() -> Self {
        Self {
            ingress_class: None,
            ingress_host: "virtualization.example.com".to_string(),
            tls_secret: None,
        }
    }
}

impl UploaderSettings {
    /// Path the uploader of an image listens on
    pub fn upload_path(&self, vi: &VirtualImage) -> String {
        format!("/upload/{}", vi.uid().unwrap_or_default())
    }
}
