use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Container;
use k8s_openapi::api::core::v1::ResourceRequirements;
use k8s_openapi::api::core::v1::Volume;
use k8s_openapi::api::core::v1::VolumeMount;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use serde::Deserialize;
use serde::Serialize;
use tracing::debug;

use super::quantity::ParsedQuantity;

/// Token in init container commands standing for the client install tree.
pub const CLIENT_OPT_PATH_PLACEHOLDER: &str = "BITFUSION_CLIENT_OPT_PATH";

const CLIENT_OPT_SEGMENT: &str = "/opt/bitfusion";
const SIZED_RESOURCES: [&str; 2] = ["cpu", "memory"];

/// Runtime payload merged into every mutated pod.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SidecarTemplate {
    #[serde(default)]
    pub init_containers: Vec<Container>,
    /// Only donate their volume mounts to GPU workloads.
    #[serde(default)]
    pub containers: Vec<Container>,
    #[serde(default)]
    pub volumes: Vec<Volume>,
}

impl SidecarTemplate {
    pub fn from_yaml(document: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(document)
    }

    /// Volume mounts handed to every GPU-demanding workload container.
    pub fn mount_donors(&self) -> Vec<VolumeMount> {
        self.containers
            .iter()
            .flat_map(|container| container.volume_mounts.iter().flatten().cloned())
            .collect()
    }

    /// Copies of the init containers prepared for one pod.
    ///
    /// The client placeholder is expanded against `library_path_env` and each
    /// copy is sized to the largest cpu/memory of `workloads`.
    pub fn init_containers_for(
        &self,
        library_path_env: &str,
        workloads: &[Container],
    ) -> Vec<Container> {
        let opt_path = client_opt_path(library_path_env);
        let sizing = WorkloadSizing::of(workloads);
        self.init_containers
            .iter()
            .cloned()
            .map(|mut container| {
                if let Some(opt_path) = &opt_path {
                    expand_placeholder(&mut container, opt_path);
                }
                sizing.apply(&mut container);
                container
            })
            .collect()
    }
}

/// `<prefix>/opt/bitfusion/*` for a library path under `<prefix>/opt/bitfusion`.
fn client_opt_path(library_path_env: &str) -> Option<String> {
    let index = library_path_env.find(CLIENT_OPT_SEGMENT)?;
    Some(format!(
        "{}{CLIENT_OPT_SEGMENT}/*",
        &library_path_env[..index]
    ))
}

fn expand_placeholder(container: &mut Container, opt_path: &str) {
    for token in container
        .command
        .iter_mut()
        .flatten()
        .chain(container.args.iter_mut().flatten())
    {
        if token.contains(CLIENT_OPT_PATH_PLACEHOLDER) {
            *token = token.replace(CLIENT_OPT_PATH_PLACEHOLDER, opt_path);
        }
    }
}

/// Largest cpu/memory limits and requests across a pod's workloads.
#[derive(Debug, Default)]
struct WorkloadSizing {
    limits: BTreeMap<&'static str, (ParsedQuantity, Quantity)>,
    requests: BTreeMap<&'static str, (ParsedQuantity, Quantity)>,
}

impl WorkloadSizing {
    fn of(workloads: &[Container]) -> Self {
        let mut sizing = Self::default();
        for resources in workloads.iter().filter_map(|c| c.resources.as_ref()) {
            track_max(&mut sizing.limits, resources.limits.as_ref());
            track_max(&mut sizing.requests, resources.requests.as_ref());
        }
        sizing
    }

    fn apply(&self, container: &mut Container) {
        if self.limits.is_empty() && self.requests.is_empty() {
            return;
        }
        let resources = container
            .resources
            .get_or_insert_with(ResourceRequirements::default);
        for (target, maxima) in [
            (&mut resources.limits, &self.limits),
            (&mut resources.requests, &self.requests),
        ] {
            if maxima.is_empty() {
                continue;
            }
            let target = target.get_or_insert_with(BTreeMap::new);
            for (name, (_, quantity)) in maxima {
                target.insert(name.to_string(), quantity.clone());
            }
        }
    }
}

fn track_max(
    maxima: &mut BTreeMap<&'static str, (ParsedQuantity, Quantity)>,
    list: Option<&BTreeMap<String, Quantity>>,
) {
    let Some(list) = list else {
        return;
    };
    for name in SIZED_RESOURCES {
        let Some(quantity) = list.get(name) else {
            continue;
        };
        let parsed = match ParsedQuantity::parse(&quantity.0) {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!(resource = name, error = %e, "Ignoring unparsable workload quantity");
                continue;
            }
        };
        match maxima.get(name) {
            Some((current, _)) if *current >= parsed => {}
            _ => {
                maxima.insert(name, (parsed, quantity.clone()));
            }
        }
    }
}
