//! Module-wide storage class policy for volume-backed images

use virtimage_common::StorageError;

use crate::settings::StorageClassSettings;

/// Storage class policy built from the controller settings
#[derive(Clone, Debug, Default)]
pub struct StorageClassPolicy {
    settings: StorageClassSettings,
}

impl StorageClassPolicy {
    /// Create a policy
    pub fn new(settings: StorageClassSettings) -> Self {
        Self { settings }
    }

    /// Resolve the class an image requests
    ///
    /// `Ok(None)` means the cluster default class is used.
    pub fn resolve(&self, requested: Option<&str>) -> Result<Option<String>, StorageError> {
        let settings = &self.settings;
        let not_allowed = |class: Option<&str>| StorageError::StorageClassNotAllowed(class.unwrap_or_default().to_string());

        if let Some(forced) = &settings.forced {
            return match requested {
                None => Ok(Some(forced.clone())),
                Some(class) if class == forced => Ok(Some(forced.clone())),
                other => Err(not_allowed(other)),
            };
        }

        let allowed = &settings.allowed;
        match (allowed.is_empty(), &settings.default) {
            (true, None) => Ok(requested.map(str::to_string)),
            (false, None) => match requested {
                Some(class) if allowed.iter().any(|a| a == class) => Ok(Some(class.to_string())),
                other => Err(not_allowed(other)),
            },
            (true, Some(default)) => match requested {
                None => Ok(Some(default.clone())),
                Some(class) if class == default => Ok(Some(class.to_string())),
                other => Err(not_allowed(other)),
            },
            (false, Some(default)) => match requested {
                None => Ok(Some(default.clone())),
                Some(class) if allowed.iter().any(|a| a == class) || class == default => {
                    Ok(Some(class.to_string()))
                }
                other => Err(not_allowed(other)),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn policy(forced: Option<&str>, allowed: &[&str], default: Option<&str>) -> StorageClassPolicy {
        StorageClassPolicy::new(StorageClassSettings {
            forced: forced.map(str::to_string),
            allowed: allowed.iter().map(|s| s.to_string()).collect(),
            default: default.map(str::to_string),
            cluster_default: None,
        })
    }

    #[rstest]
    #[case::no_policy_keeps_request(None, &[], None, Some("fast"), Ok(Some("fast")))]
    #[case::no_policy_falls_back_to_cluster(None, &[], None, None, Ok(None))]
    #[case::forced_wins_over_nothing(Some("ceph"), &[], None, None, Ok(Some("ceph")))]
    #[case::forced_accepts_itself(Some("ceph"), &[], None, Some("ceph"), Ok(Some("ceph")))]
    #[case::forced_rejects_others(Some("ceph"), &[], None, Some("fast"), Err("fast"))]
    #[case::allowed_accepts_listed(None, &["a", "b"], None, Some("b"), Ok(Some("b")))]
    #[case::allowed_rejects_unlisted(None, &["a", "b"], None, Some("c"), Err("c"))]
    #[case::allowed_rejects_nothing(None, &["a"], None, None, Err(""))]
    #[case::default_fills_nothing(None, &[], Some("d"), None, Ok(Some("d")))]
    #[case::default_accepts_itself(None, &[], Some("d"), Some("d"), Ok(Some("d")))]
    #[case::default_rejects_others(None, &[], Some("d"), Some("x"), Err("x"))]
    #[case::both_fill_default(None, &["a"], Some("d"), None, Ok(Some("d")))]
    #[case::both_accept_listed(None, &["a"], Some("d"), Some("a"), Ok(Some("a")))]
    #[case::both_reject_unlisted(None, &["a"], Some("d"), Some("x"), Err("x"))]
    fn resolution(
        #[case] forced: Option<&str>,
        #[case] allowed: &[&str],
        #[case] default: Option<&str>,
        #[case] requested: Option<&str>,
        #[case] expected: std::result::Result<Option<&str>, &str>,
    ) {
        let got = policy(forced, allowed, default).resolve(requested);
        match expected {
            Ok(class) => assert_eq!(got, Ok(class.map(str::to_string))),
            Err(class) => assert_eq!(got, Err(StorageError::StorageClassNotAllowed(class.to_string()))),
        }
    }
}
