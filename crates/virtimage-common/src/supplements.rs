//! Deterministic names of helper objects
//!
//! Every helper object an import creates (importer pod, volume claim,
//! DataVolume, secrets, config maps, ...) is named from the owner's short
//! kind, name, namespace and UID. Re-fetching by name is therefore the same
//! as asking "does this helper already exist", and two owners can never race
//! for the same name because the UID is part of it.
//!
//! Objects created by older releases carry shorter legacy names;
//! [`fetch_with_fallback`] looks for the current name first and falls back
//! to the legacy one.

use std::fmt;
use std::future::Future;

use kube::ResourceExt;

use crate::crd::VirtualImage;
use crate::Result;

/// Short kind of VirtualImage used in helper names
pub const VI_SHORT_NAME: &str = "vi";

/// Prefix of current helper names
const NAME_PREFIX: &str = "d8v";

/// Maximum length of a DNS-1123 label
const MAX_NAME_LEN: usize = 63;

/// Hex characters of the hash suffix on shortened names
const HASH_LEN: usize = 8;

/// Logical role of a helper object
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Supplement {
    /// Pod importing data into DVCR
    ImporterPod,
    /// Pod receiving user uploads
    UploaderPod,
    /// Service in front of the uploader
    UploaderService,
    /// Ingress exposing the uploader
    UploaderIngress,
    /// TLS secret of the uploader Ingress
    UploaderTlsSecret,
    /// Pod binding a WaitForFirstConsumer claim
    BounderPod,
    /// Copy of the DVCR auth secret for the importer/uploader
    DvcrAuthSecret,
    /// Copy of the DVCR auth secret for the DataVolume importer
    DvcrAuthSecretForDv,
    /// DVCR CA bundle for the DataVolume importer
    DvcrCaBundleForDv,
    /// CA bundle of an HTTP or registry source
    CaBundleConfigMap,
    /// Copy of the user's image pull secret
    ImagePullSecret,
    /// DataVolume importing into the image's claim
    DataVolume,
    /// Claim holding a volume-backed image
    PersistentVolumeClaim,
}

impl Supplement {
    /// Every role, in a stable order
    pub const ALL: &'static [Supplement] = &[
        Supplement::ImporterPod,
        Supplement::UploaderPod,
        Supplement::UploaderService,
        Supplement::UploaderIngress,
        Supplement::UploaderTlsSecret,
        Supplement::BounderPod,
        Supplement::DvcrAuthSecret,
        Supplement::DvcrAuthSecretForDv,
        Supplement::DvcrCaBundleForDv,
        Supplement::CaBundleConfigMap,
        Supplement::ImagePullSecret,
        Supplement::DataVolume,
        Supplement::PersistentVolumeClaim,
    ];

    fn role(&self) -> Option<&'static str> {
        match self {
            Self::ImporterPod => Some("importer"),
            Self::UploaderPod => Some("uploader"),
            Self::UploaderService => Some("uploader-svc"),
            Self::UploaderIngress => Some("uploader-ing"),
            Self::UploaderTlsSecret => Some("uploader-tls"),
            Self::BounderPod => Some("bounder"),
            Self::DvcrAuthSecret => Some("dvcr-auth"),
            Self::DvcrAuthSecretForDv => Some("dvcr-auth-dv"),
            Self::DvcrCaBundleForDv => Some("dvcr-ca-dv"),
            Self::CaBundleConfigMap => Some("ca"),
            Self::ImagePullSecret => Some("pull-image"),
            Self::DataVolume | Self::PersistentVolumeClaim => None,
        }
    }
}

/// Namespaced name of a helper object
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SupplementName {
    /// Object name
    pub name: String,
    /// Object namespace
    pub namespace: String,
}

impl fmt::Display for SupplementName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Name generator for the helpers of one owner
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SupplementNames {
    short_kind: String,
    name: String,
    namespace: String,
    uid: String,
}

impl SupplementNames {
    /// Create a generator for an owner
    pub fn new(
        short_kind: impl Into<String>,
        name: impl Into<String>,
        namespace: impl Into<String>,
        uid: impl Into<String>,
    ) -> Self {
        Self {
            short_kind: short_kind.into(),
            name: name.into(),
            namespace: namespace.into(),
            uid: uid.into(),
        }
    }

    /// Create the generator of a VirtualImage
    pub fn for_image(vi: &VirtualImage) -> Self {
        Self::new(
            VI_SHORT_NAME,
            vi.name_any(),
            vi.namespace_or_default(),
            vi.uid_or_default(),
        )
    }

    /// Owner namespace
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Current name of a helper
    pub fn get(&self, supplement: Supplement) -> SupplementName {
        let name = match supplement.role() {
            Some(role) => format!(
                "{NAME_PREFIX}-{}-{role}-{}-{}",
                self.short_kind, self.name, self.uid
            ),
            None => format!("{NAME_PREFIX}-{}-{}-{}", self.short_kind, self.name, self.uid),
        };
        self.namespaced(name)
    }

    /// Name the helper had in older releases
    pub fn legacy(&self, supplement: Supplement) -> SupplementName {
        let kind = &self.short_kind;
        let name = match supplement {
            Supplement::UploaderService => format!("{kind}-uploader-svc-{}", self.uid),
            Supplement::UploaderIngress => format!("{kind}-uploader-ingress-{}", self.uid),
            Supplement::UploaderTlsSecret => format!("{kind}-uploader-tls-ing-{}", self.name),
            Supplement::DataVolume | Supplement::PersistentVolumeClaim => {
                format!("{kind}-{}-{}", self.name, self.uid)
            }
            other => {
                // every remaining role has a role string
                let role = other.role().unwrap_or_default();
                format!("{kind}-{role}-{}", self.name)
            }
        };
        self.namespaced(name)
    }

    /// Current names of every helper role
    pub fn all(&self) -> Vec<(Supplement, SupplementName)> {
        Supplement::ALL.iter().map(|s| (*s, self.get(*s))).collect()
    }

    /// Importer pod name
    pub fn importer_pod(&self) -> SupplementName {
        self.get(Supplement::ImporterPod)
    }

    /// Volume claim name
    pub fn persistent_volume_claim(&self) -> SupplementName {
        self.get(Supplement::PersistentVolumeClaim)
    }

    /// DataVolume name
    pub fn data_volume(&self) -> SupplementName {
        self.get(Supplement::DataVolume)
    }

    fn namespaced(&self, name: String) -> SupplementName {
        SupplementName {
            name: shorten(name),
            namespace: self.namespace.clone(),
        }
    }
}

/// Shorten a name to a DNS label, keeping it unique with a hash suffix
pub fn shorten(name: String) -> String {
    if name.len() <= MAX_NAME_LEN {
        return name;
    }

    use aws_lc_rs::digest::{digest, SHA256};
    let hash = digest(&SHA256, name.as_bytes());
    let suffix: String = hash
        .as_ref()
        .iter()
        .take(HASH_LEN / 2)
        .map(|b| format!("{:02x}", b))
        .collect();

    let keep = MAX_NAME_LEN - HASH_LEN - 1;
    let prefix = name[..keep].trim_end_matches(['-', '.']);
    format!("{prefix}-{suffix}")
}

/// Fetch a helper by its current name, falling back to its legacy name
///
/// A helper found under the current name wins even if a legacy one exists.
/// `get` must return `Ok(None)` for a missing object; any other error is
/// returned as is.
pub async fn fetch_with_fallback<T, F, Fut>(
    names: &SupplementNames,
    supplement: Supplement,
    mut get: F,
) -> Result<Option<T>>
where
    F: FnMut(SupplementName) -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    if let Some(found) = get(names.get(supplement)).await? {
        return Ok(Some(found));
    }
    get(names.legacy(supplement)).await
}
