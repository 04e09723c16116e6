//! Numbered alias namespaces.
//!
//! A container can publish up to five more virtual hosts by prefixing env
//! keys with `SECOND_` through `SIXTH_`. Each namespace is resolved against
//! the container's base environment with the keys in [`IMPORTANT_KEYS`]
//! removed and the namespaced keys laid over the rest.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use super::Identity;
use crate::config::NamingConfig;

/// Keys that bind an identity to one host and must not leak into aliases
pub const IMPORTANT_KEYS: [&str; 7] = [
    "SERVICE_FQDN",
    "VIRTUAL_HOST",
    "VIRTUAL_PORT",
    "CERT_NAME",
    "OTHER_DNS_NAMES",
    "PKI_ROLE",
    "PKI_SECRET_ID",
];

/// Alias namespaces, in expansion order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AliasNamespace {
    /// `SECOND_*`
    Second,
    /// `THIRD_*`
    Third,
    /// `FOURTH_*`
    Fourth,
    /// `FIFTH_*`
    Fifth,
    /// `SIXTH_*`
    Sixth,
}

impl AliasNamespace {
    /// All namespaces in the order they are tried
    pub const ALL: [Self; 5] = [Self::Second, Self::Third, Self::Fourth, Self::Fifth, Self::Sixth];

    /// Env key prefix including the trailing underscore
    #[must_use]
    pub const fn prefix(self) -> &'static str {
        match self {
            Self::Second => "SECOND_",
            Self::Third => "THIRD_",
            Self::Fourth => "FOURTH_",
            Self::Fifth => "FIFTH_",
            Self::Sixth => "SIXTH_",
        }
    }

    /// Environment view for this namespace, or `None` when the container
    /// defines no key under its prefix.
    #[must_use]
    pub fn overlay_env(self, base: &BTreeMap<String, String>) -> Option<BTreeMap<String, String>> {
        let prefix = self.prefix();
        let scoped: Vec<(String, String)> = base
            .iter()
            .filter_map(|(k, v)| {
                k.strip_prefix(prefix)
                    .filter(|rest| !rest.is_empty())
                    .map(|rest| (rest.to_string(), v.clone()))
            })
            .collect();
        if scoped.is_empty() {
            return None;
        }

        let mut env = base.clone();
        for key in IMPORTANT_KEYS {
            env.remove(key);
        }
        env.extend(scoped);
        Some(env)
    }
}

impl fmt::Display for AliasNamespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Second => "second",
            Self::Third => "third",
            Self::Fourth => "fourth",
            Self::Fifth => "fifth",
            Self::Sixth => "sixth",
        };
        f.write_str(name)
    }
}

/// Lazily resolve the alias identities of `base`, in namespace order.
///
/// The sequence ends at the first namespace the container does not use,
/// and callers stop earlier still, at the first candidate that fails
/// qualification. An unused namespace is never re-resolved: its overlay
/// would only hold the base's unscoped keys, so a hostname taken from the
/// domain name or `SERVICE_NAME` would publish the base host a second time.
pub fn candidates<'a>(
    base: &'a Identity,
    naming: &'a NamingConfig,
) -> impl Iterator<Item = Identity> + 'a {
    let base_env = base.raw().env_map();
    AliasNamespace::ALL
        .into_iter()
        .map_while(move |ns| {
            ns.overlay_env(&base_env).map(|env| {
                Identity::resolve_with_env(base.snapshot_handle(), env, naming, Some(ns))
            })
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::ContainerSnapshot;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn env(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn overlay_strips_important_keys_and_lifts_scoped_ones() {
        // GIVEN: a base env with a primary binding and a SECOND_ binding
        let base = env(&[
            ("SERVICE_FQDN", "app.example.com"),
            ("PKI_SECRET_ID", "primary-secret"),
            ("PKI_ROLE_ID", "role"),
            ("SECOND_SERVICE_FQDN", "admin.example.com"),
        ]);

        // WHEN: overlaid for SECOND
        let overlay = AliasNamespace::Second.overlay_env(&base).unwrap();

        // THEN: the primary secret is gone, shared keys survive
        assert_eq!(overlay.get("SERVICE_FQDN").unwrap(), "admin.example.com");
        assert_eq!(overlay.get("PKI_ROLE_ID").unwrap(), "role");
        assert!(!overlay.contains_key("PKI_SECRET_ID"));
    }

    #[test]
    fn unused_namespace_has_no_overlay() {
        let base = env(&[("SERVICE_FQDN", "app.example.com"), ("SECOND_", "x")]);
        assert!(AliasNamespace::Second.overlay_env(&base).is_none());
        assert!(AliasNamespace::Third.overlay_env(&base).is_none());
    }

    #[test]
    fn candidates_stop_at_first_unused_namespace() {
        // GIVEN: SECOND and FOURTH defined, THIRD missing
        let snapshot = Arc::new(ContainerSnapshot {
            name: "multi".to_string(),
            env: vec![
                "SERVICE_FQDN=a.example.com".to_string(),
                "SECOND_SERVICE_FQDN=b.example.com".to_string(),
                "FOURTH_SERVICE_FQDN=d.example.com".to_string(),
            ],
            ..ContainerSnapshot::default()
        });
        let naming = NamingConfig::default();
        let base = Identity::resolve(snapshot, &naming);

        // WHEN: expanding
        let aliases: Vec<_> = candidates(&base, &naming).collect();

        // THEN: only SECOND is produced
        assert_eq!(aliases.len(), 1);
        assert_eq!(aliases[0].alias, Some(AliasNamespace::Second));
        assert_eq!(aliases[0].service_fqdn.as_deref(), Some("b.example.com"));
    }

    #[test]
    fn domain_name_alone_does_not_duplicate_the_base() {
        // GIVEN: a hostname that only comes from the domain name and no scoped keys
        let snapshot = Arc::new(ContainerSnapshot {
            name: "plain".to_string(),
            domain_name: Some("plain.example.com".to_string()),
            env: vec!["SERVICE_NAME=plain".to_string()],
            ..ContainerSnapshot::default()
        });
        let naming = NamingConfig::default();
        let base = Identity::resolve(snapshot, &naming);

        // THEN: the base resolves and no alias is attempted
        assert_eq!(base.service_fqdn.as_deref(), Some("plain.example.com"));
        assert_eq!(candidates(&base, &naming).count(), 0);
    }

    #[test]
    fn prefixes_and_names() {
        let names: Vec<String> = AliasNamespace::ALL.iter().map(ToString::to_string).collect();
        assert_eq!(names, vec!["second", "third", "fourth", "fifth", "sixth"]);
        assert_eq!(AliasNamespace::Sixth.prefix(), "SIXTH_");
    }
}
