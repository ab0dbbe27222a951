use std::collections::HashMap;

use api_types::ClientBinaryConfig;
use api_types::ClientDistribution;
use tracing::warn;

/// Outcome of a client lookup.
#[derive(Debug, PartialEq, Eq)]
pub enum ClientResolution<'a> {
    /// The pod did not name an OS or a client version.
    NotRequested,
    /// The pod named a pair the distribution does not ship.
    Missing {
        guest_os: String,
        client_version: String,
    },
    Found(&'a ClientBinaryConfig),
}

/// Guest OS → client version → client binary, read-only after load.
#[derive(Debug, Clone, Default)]
pub struct ClientDistributionMatrix {
    clients: HashMap<String, HashMap<String, ClientBinaryConfig>>,
}

impl From<ClientDistribution> for ClientDistributionMatrix {
    fn from(distribution: ClientDistribution) -> Self {
        let mut clients: HashMap<String, HashMap<String, ClientBinaryConfig>> = HashMap::new();
        for entry in distribution.clients {
            let config = ClientBinaryConfig {
                binary_path: entry.binary_path,
                library_path_env: entry.library_path_env,
            };
            let replaced = clients
                .entry(entry.guest_os.clone())
                .or_default()
                .insert(entry.client_version.clone(), config);
            if replaced.is_some() {
                warn!(
                    guest_os = %entry.guest_os,
                    client_version = %entry.client_version,
                    "Duplicate client distribution entry, keeping the later one"
                );
            }
        }
        Self { clients }
    }
}

impl ClientDistributionMatrix {
    pub fn resolve(&self, guest_os: &str, client_version: &str) -> ClientResolution<'_> {
        if guest_os.is_empty() || client_version.is_empty() {
            return ClientResolution::NotRequested;
        }
        match self
            .clients
            .get(guest_os)
            .and_then(|versions| versions.get(client_version))
        {
            Some(config) => ClientResolution::Found(config),
            None => ClientResolution::Missing {
                guest_os: guest_os.to_string(),
                client_version: client_version.to_string(),
            },
        }
    }

    /// Number of distinct (OS, version) pairs.
    pub fn len(&self) -> usize {
        self.clients.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every (OS, version, config) triple, sorted for stable output.
    pub fn entries(&self) -> Vec<(&str, &str, &ClientBinaryConfig)> {
        let mut entries: Vec<_> = self
            .clients
            .iter()
            .flat_map(|(os, versions)| {
                versions
                    .iter()
                    .map(move |(version, config)| (os.as_str(), version.as_str(), config))
            })
            .collect();
        entries.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));
        entries
    }
}

#[cfg(test)]
mod tests {
    use api_types::ClientDistributionEntry;
    use similar_asserts::assert_eq;

    use super::*;

    fn entry(os: &str, version: &str, binary: &str) -> ClientDistributionEntry {
        ClientDistributionEntry {
            client_version: version.to_string(),
            guest_os: os.to_string(),
            binary_path: binary.to_string(),
            library_path_env: format!("/bitfusion/{os}/usr/lib"),
        }
    }

    fn matrix() -> ClientDistributionMatrix {
        ClientDistribution {
            clients: vec![
                entry("ubuntu18", "250", "/bitfusion/bf-250/usr/bin/bitfusion"),
                entry("ubuntu20", "250", "/bitfusion/bf-250-u20/usr/bin/bitfusion"),
                entry("centos7", "300", "/bitfusion/bf-300/usr/bin/bitfusion"),
            ],
        }
        .into()
    }

    #[test]
    fn resolves_known_pair() {
        let matrix = matrix();

        let ClientResolution::Found(config) = matrix.resolve("ubuntu20", "250") else {
            panic!("ubuntu20/250 should resolve");
        };

        assert_eq!(config.binary_path, "/bitfusion/bf-250-u20/usr/bin/bitfusion");
        assert_eq!(config.library_path_env, "/bitfusion/ubuntu20/usr/lib");
    }

    #[test]
    fn empty_os_or_version_is_not_requested() {
        let matrix = matrix();
        assert_eq!(matrix.resolve("", "250"), ClientResolution::NotRequested);
        assert_eq!(matrix.resolve("ubuntu18", ""), ClientResolution::NotRequested);
    }

    #[test]
    fn unknown_pair_is_missing() {
        let matrix = matrix();
        assert_eq!(
            matrix.resolve("ubuntu18", "300"),
            ClientResolution::Missing {
                guest_os: "ubuntu18".to_string(),
                client_version: "300".to_string(),
            }
        );
        assert!(matches!(
            matrix.resolve("windows", "250"),
            ClientResolution::Missing { .. }
        ));
    }

    #[test]
    fn later_duplicate_replaces_earlier_entry() {
        let matrix: ClientDistributionMatrix = ClientDistribution {
            clients: vec![
                entry("ubuntu18", "250", "/old/bitfusion"),
                entry("ubuntu18", "250", "/new/bitfusion"),
            ],
        }
        .into();

        assert_eq!(matrix.len(), 1);
        let ClientResolution::Found(config) = matrix.resolve("ubuntu18", "250") else {
            panic!("ubuntu18/250 should resolve");
        };
        assert_eq!(config.binary_path, "/new/bitfusion");
    }

    #[test]
    fn entries_are_sorted() {
        let matrix = matrix();
        let pairs: Vec<_> = matrix
            .entries()
            .into_iter()
            .map(|(os, version, _)| format!("{os}/{version}"))
            .collect();
        assert_eq!(pairs, vec!["centos7/300", "ubuntu18/250", "ubuntu20/250"]);
    }
}
