//! GPU demand negotiation.
//!
//! A container expresses GPU demand through up to three request keys: a whole
//! GPU count, a percentage of one GPU and an amount of GPU memory. The
//! negotiator folds them into a single share quantity for the scheduler and a
//! launch command for the sharing client.

use std::collections::BTreeMap;

use api_types::ClientBinaryConfig;
use api_types::PatchOperation;
use error_stack::Report;
use error_stack::ResultExt;
use k8s_openapi::api::core::v1::Container;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use tracing::debug;

use super::quantity::ParsedQuantity;
use super::AdmissionError;
use super::GPU_COUNT_RESOURCE;
use super::GPU_MEMORY_RESOURCE;
use super::GPU_PERCENT_RESOURCE;
use super::GPU_SHARE_RESOURCE;
use super::RUNTIME_COMMAND_NAME;

const FULL_GPU_PERCENT: i128 = 100;
const BYTES_PER_MEGABYTE: i128 = 1_000_000;
const SHELL_WRAPPERS: [&str; 4] = ["/bin/bash", "/bin/sh", "bash", "sh"];
const SHELL_COMMAND_FLAG: &str = "-c";
const WRAPPER_SHELL: &str = "/bin/bash";

/// Result of negotiating one container.
#[derive(Debug, Clone, PartialEq)]
pub enum Negotiation {
    /// The container does not take part in GPU sharing.
    Skip,
    Negotiated(NegotiatedContainer),
}

/// Rewritten state of a GPU-sharing container.
#[derive(Debug, Clone, PartialEq)]
pub struct NegotiatedContainer {
    pub share: i128,
    /// `None` when the launch command is left as is.
    pub command: Option<Vec<String>>,
    pub requests: BTreeMap<String, Quantity>,
    pub limits: BTreeMap<String, Quantity>,
}

impl NegotiatedContainer {
    /// Operations applying this negotiation to the container at `container_path`.
    pub fn patch(&self, container_path: &str) -> Result<Vec<PatchOperation>, serde_json::Error> {
        let mut ops = Vec::with_capacity(3);
        if let Some(command) = &self.command {
            ops.push(PatchOperation::replace(
                format!("{container_path}/command"),
                serde_json::to_value(command)?,
            ));
        }
        ops.push(PatchOperation::replace(
            format!("{container_path}/resources/requests"),
            serde_json::to_value(&self.requests)?,
        ));
        ops.push(PatchOperation::add(
            format!("{container_path}/resources/limits"),
            serde_json::to_value(&self.limits)?,
        ));
        Ok(ops)
    }
}

/// How the client should be launched for a container.
#[derive(Debug, Clone, Copy)]
pub struct LaunchContext<'a> {
    pub client: &'a ClientBinaryConfig,
    /// Device filter forwarded to the client.
    pub filter: Option<&'a str>,
    /// False in injection-only mode.
    pub rewrite_command: bool,
}

/// Turns per-container GPU demand into a share quantity and a command.
#[derive(Debug, Clone, Default)]
pub struct ResourceNegotiator {
    total_memory_mb: Option<i128>,
}

impl ResourceNegotiator {
    /// `total_memory_mb` is the memory of one physical GPU; memory-based
    /// requests are rejected while it is unknown.
    pub fn new(total_memory_mb: Option<i128>) -> Self {
        Self { total_memory_mb }
    }

    pub fn total_memory_mb(&self) -> Option<i128> {
        self.total_memory_mb
    }

    /// Negotiate the GPU demand of one container.
    ///
    /// # Errors
    ///
    /// - [`AdmissionError::InvalidDemand`] for a percent without a count, a
    ///   percent outside `1..=100`, memory out of range or an unparsable value
    /// - [`AdmissionError::MissingTotalMemory`] for a memory request while no
    ///   total GPU memory is configured
    pub fn negotiate(
        &self,
        container: &Container,
        launch: LaunchContext<'_>,
    ) -> Result<Negotiation, Report<AdmissionError>> {
        let Some(original_command) = container.command.as_ref().filter(|c| !c.is_empty()) else {
            return Ok(Negotiation::Skip);
        };

        let empty = BTreeMap::new();
        let resources = container.resources.as_ref();
        let requests = resources
            .and_then(|r| r.requests.as_ref())
            .unwrap_or(&empty);
        let limits = resources.and_then(|r| r.limits.as_ref()).unwrap_or(&empty);

        let count = read_quantity(requests, GPU_COUNT_RESOURCE)?
            .map(|q| q.ceil_integer())
            .filter(|count| *count > 0);
        let percent = read_quantity(requests, GPU_PERCENT_RESOURCE)?.map(|q| q.ceil_integer());

        let count = match (count, percent) {
            (Some(count), _) => count,
            (None, None) => return Ok(Negotiation::Skip),
            (None, Some(_)) => {
                return Err(Report::new(AdmissionError::invalid_demand(
                    GPU_COUNT_RESOURCE,
                    "gpu count missing",
                )));
            }
        };

        let percent = percent.unwrap_or(FULL_GPU_PERCENT);
        if !(1..=FULL_GPU_PERCENT).contains(&percent) {
            return Err(Report::new(AdmissionError::invalid_demand(
                GPU_PERCENT_RESOURCE,
                format!("invalid percent {percent}, expected 1..=100"),
            )));
        }

        let (mut line, share) = match read_quantity(requests, GPU_MEMORY_RESOURCE)? {
            Some(memory) => {
                let (memory_mb, total_mb) = self.memory_megabytes(&memory)?;
                let share = memory_share(memory_mb, total_mb, count)?;
                (
                    format!("{} run -n {count} -m {memory_mb}", launch.client.binary_path),
                    share,
                )
            }
            None => {
                let share = percent.checked_mul(count).ok_or_else(|| {
                    Report::new(AdmissionError::invalid_demand(
                        GPU_COUNT_RESOURCE,
                        format!("gpu count {count} is out of range"),
                    ))
                })?;
                (
                    format!(
                        "{} run -n {count} -p {:.6}",
                        launch.client.binary_path,
                        percent as f64 / 100.0
                    ),
                    share,
                )
            }
        };

        if let Some(filter) = launch.filter.filter(|f| !f.is_empty()) {
            line.push_str(" --filter ");
            line.push_str(filter);
        }

        let trailing = strip_shell_wrapper(original_command);
        let invokes_client = trailing
            .iter()
            .any(|token| is_client_invocation(token, &launch.client.binary_path));
        let command = if launch.rewrite_command && !invokes_client {
            for token in trailing {
                line.push(' ');
                line.push_str(token);
            }
            Some(vec![
                WRAPPER_SHELL.to_string(),
                SHELL_COMMAND_FLAG.to_string(),
                line,
            ])
        } else {
            debug!(
                container = %container.name,
                invokes_client,
                "Leaving launch command untouched"
            );
            None
        };

        Ok(Negotiation::Negotiated(NegotiatedContainer {
            share,
            command,
            requests: with_share(requests, share),
            limits: with_share(limits, share),
        }))
    }

    /// Requested and total memory in megabytes.
    fn memory_megabytes(
        &self,
        memory: &ParsedQuantity,
    ) -> Result<(i128, i128), Report<AdmissionError>> {
        let Some(total_mb) = self.total_memory_mb else {
            return Err(Report::new(AdmissionError::MissingTotalMemory {
                resource: GPU_MEMORY_RESOURCE.to_string(),
            }));
        };
        let bytes = memory.exact_integer().ok_or_else(|| {
            Report::new(AdmissionError::invalid_demand(
                GPU_MEMORY_RESOURCE,
                format!("{memory} is not a whole number of bytes"),
            ))
        })?;
        let memory_mb = bytes / BYTES_PER_MEGABYTE;
        if memory_mb <= 0 || memory_mb >= total_mb {
            return Err(Report::new(AdmissionError::invalid_demand(
                GPU_MEMORY_RESOURCE,
                format!("memory {memory_mb}MB out of range, expected 0 < memory < {total_mb}MB"),
            )));
        }
        Ok((memory_mb, total_mb))
    }
}

/// `ceil(memory_mb * count * 100 / total_mb)`.
fn memory_share(memory_mb: i128, total_mb: i128, count: i128) -> Result<i128, Report<AdmissionError>> {
    let scaled = memory_mb
        .checked_mul(count)
        .and_then(|v| v.checked_mul(FULL_GPU_PERCENT))
        .ok_or_else(|| {
            Report::new(AdmissionError::invalid_demand(
                GPU_COUNT_RESOURCE,
                format!("gpu count {count} is out of range"),
            ))
        })?;
    Ok((scaled + total_mb - 1) / total_mb)
}

fn read_quantity(
    list: &BTreeMap<String, Quantity>,
    resource: &str,
) -> Result<Option<ParsedQuantity>, Report<AdmissionError>> {
    list.get(resource)
        .map(|quantity| {
            ParsedQuantity::parse(&quantity.0).change_context_lazy(|| {
                AdmissionError::invalid_demand(resource, format!("{:?} is not a quantity", quantity.0))
            })
        })
        .transpose()
}

/// Drop a leading shell and its `-c` flag.
fn strip_shell_wrapper(command: &[String]) -> &[String] {
    let mut rest = command;
    if let Some((first, tail)) = rest.split_first() {
        if SHELL_WRAPPERS.contains(&first.trim().to_lowercase().as_str()) {
            rest = tail;
            if let Some((flag, tail)) = rest.split_first() {
                if flag.trim() == SHELL_COMMAND_FLAG {
                    rest = tail;
                }
            }
        }
    }
    rest
}

fn is_client_invocation(token: &str, binary_path: &str) -> bool {
    let token = token.trim();
    let binary_name = binary_path.rsplit('/').next().unwrap_or(binary_path);
    token.starts_with(RUNTIME_COMMAND_NAME)
        || (!binary_path.is_empty() && token.starts_with(binary_path))
        || (!binary_name.is_empty() && token.starts_with(binary_name))
}

fn with_share(list: &BTreeMap<String, Quantity>, share: i128) -> BTreeMap<String, Quantity> {
    let mut list = list.clone();
    for internal in [GPU_COUNT_RESOURCE, GPU_PERCENT_RESOURCE, GPU_MEMORY_RESOURCE] {
        list.remove(internal);
    }
    list.insert(GPU_SHARE_RESOURCE.to_string(), Quantity(share.to_string()));
    list
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::ResourceRequirements;
    use similar_asserts::assert_eq;

    use super::*;

    const BINARY: &str = "/bitfusion/bitfusion-client-ubuntu1804_2.5.0-10/usr/bin/bitfusion";

    fn client() -> ClientBinaryConfig {
        ClientBinaryConfig {
            binary_path: BINARY.to_string(),
            library_path_env: "/bitfusion/lib".to_string(),
        }
    }

    fn launch(client: &ClientBinaryConfig) -> LaunchContext<'_> {
        LaunchContext {
            client,
            filter: None,
            rewrite_command: true,
        }
    }

    fn container(command: &[&str], requests: &[(&str, &str)]) -> Container {
        let list: BTreeMap<String, Quantity> = requests
            .iter()
            .map(|(k, v)| (k.to_string(), Quantity(v.to_string())))
            .collect();
        Container {
            name: "main".to_string(),
            command: Some(command.iter().map(|s| s.to_string()).collect()),
            resources: Some(ResourceRequirements {
                requests: Some(list.clone()),
                limits: Some(list),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn negotiated(result: Negotiation) -> NegotiatedContainer {
        match result {
            Negotiation::Negotiated(negotiated) => negotiated,
            Negotiation::Skip => panic!("container should be negotiated"),
        }
    }

    fn rejection(result: Result<Negotiation, Report<AdmissionError>>) -> String {
        result
            .expect_err("negotiation should fail")
            .current_context()
            .to_string()
    }

    #[test]
    fn whole_gpus_default_to_full_percent() {
        let client = client();
        for count in 1..=4 {
            let c = container(
                &["python", "train.py"],
                &[(GPU_COUNT_RESOURCE, &count.to_string())],
            );

            let result = negotiated(
                ResourceNegotiator::default()
                    .negotiate(&c, launch(&client))
                    .expect("should negotiate"),
            );

            assert_eq!(result.share, 100 * count);
        }
    }

    #[test]
    fn percent_scales_with_count() {
        let client = client();
        let c = container(
            &["python", "train.py"],
            &[(GPU_COUNT_RESOURCE, "2"), (GPU_PERCENT_RESOURCE, "30")],
        );

        let result = negotiated(
            ResourceNegotiator::default()
                .negotiate(&c, launch(&client))
                .expect("should negotiate"),
        );

        assert_eq!(result.share, 60);
        assert_eq!(
            result.command,
            Some(vec![
                "/bin/bash".to_string(),
                "-c".to_string(),
                format!("{BINARY} run -n 2 -p 0.300000 python train.py"),
            ])
        );
    }

    #[test]
    fn shell_wrapper_is_stripped_and_filter_appended() {
        let client = client();
        let c = container(
            &["/bin/sh", "-c", "python train.py --epochs 3"],
            &[(GPU_COUNT_RESOURCE, "1")],
        );

        let result = negotiated(
            ResourceNegotiator::default()
                .negotiate(
                    &c,
                    LaunchContext {
                        filter: Some("server.addr==10.0.0.1"),
                        ..launch(&client)
                    },
                )
                .expect("should negotiate"),
        );

        assert_eq!(
            result.command.expect("command should be rewritten")[2],
            format!(
                "{BINARY} run -n 1 -p 1.000000 --filter server.addr==10.0.0.1 python train.py --epochs 3"
            )
        );
    }

    #[test]
    fn memory_share_is_rounded_up() {
        let client = client();
        let c = container(
            &["python"],
            &[(GPU_COUNT_RESOURCE, "2"), (GPU_MEMORY_RESOURCE, "4G")],
        );

        let result = negotiated(
            ResourceNegotiator::new(Some(16_000))
                .negotiate(&c, launch(&client))
                .expect("should negotiate"),
        );

        // 4000 / 16000 * 2 * 100
        assert_eq!(result.share, 50);
        assert_eq!(
            result.command.expect("command should be rewritten")[2],
            format!("{BINARY} run -n 2 -m 4000 python")
        );

        let c = container(
            &["python"],
            &[(GPU_COUNT_RESOURCE, "1"), (GPU_MEMORY_RESOURCE, "1001M")],
        );
        let result = negotiated(
            ResourceNegotiator::new(Some(3_000))
                .negotiate(&c, launch(&client))
                .expect("should negotiate"),
        );
        assert_eq!(result.share, 34);
    }

    #[test]
    fn memory_wins_over_percent() {
        let client = client();
        let c = container(
            &["python"],
            &[
                (GPU_COUNT_RESOURCE, "1"),
                (GPU_PERCENT_RESOURCE, "10"),
                (GPU_MEMORY_RESOURCE, "8000M"),
            ],
        );

        let result = negotiated(
            ResourceNegotiator::new(Some(16_000))
                .negotiate(&c, launch(&client))
                .expect("should negotiate"),
        );

        assert_eq!(result.share, 50);
    }

    #[test]
    fn memory_must_be_strictly_inside_total() {
        let client = client();
        let negotiator = ResourceNegotiator::new(Some(16_000));
        for memory in ["16000M", "20G", "999999", "0"] {
            let c = container(
                &["python"],
                &[(GPU_COUNT_RESOURCE, "1"), (GPU_MEMORY_RESOURCE, memory)],
            );
            let message = rejection(negotiator.negotiate(&c, launch(&client)));
            assert!(
                message.starts_with("Invalid bitfusion.io/gpu-memory request"),
                "unexpected message for {memory}: {message}"
            );
        }
    }

    #[test]
    fn memory_edge_cases() {
        let client = client();
        let negotiator = ResourceNegotiator::new(Some(16_000));
        let memory_request = |memory: &str| {
            container(
                &["python"],
                &[(GPU_COUNT_RESOURCE, "1"), (GPU_MEMORY_RESOURCE, memory)],
            )
        };

        let message = rejection(negotiator.negotiate(&memory_request("1500m"), launch(&client)));
        assert!(
            message.starts_with("Invalid bitfusion.io/gpu-memory request")
                && message.ends_with("is not a whole number of bytes"),
            "unexpected message: {message}"
        );

        let largest = negotiated(
            negotiator
                .negotiate(&memory_request("15999M"), launch(&client))
                .expect("memory just below the total should negotiate"),
        );
        assert_eq!(largest.share, 100);
        assert_eq!(
            largest.command.expect("command should be rewritten")[2],
            format!("{BINARY} run -n 1 -m 15999 python")
        );
    }

    #[test]
    fn memory_share_matches_equivalent_percent() {
        let client = client();
        let total_mb = 16_000;
        let negotiator = ResourceNegotiator::new(Some(total_mb));
        for count in ["1", "3"] {
            for percent in [1_i128, 10, 25, 50, 75, 99] {
                let by_memory = container(
                    &["python"],
                    &[
                        (GPU_COUNT_RESOURCE, count),
                        (GPU_MEMORY_RESOURCE, &format!("{}M", percent * total_mb / 100)),
                    ],
                );
                let by_percent = container(
                    &["python"],
                    &[
                        (GPU_COUNT_RESOURCE, count),
                        (GPU_PERCENT_RESOURCE, &percent.to_string()),
                    ],
                );

                let memory_share = negotiated(
                    negotiator
                        .negotiate(&by_memory, launch(&client))
                        .expect("memory request should negotiate"),
                )
                .share;
                let percent_share = negotiated(
                    negotiator
                        .negotiate(&by_percent, launch(&client))
                        .expect("percent request should negotiate"),
                )
                .share;

                assert_eq!(
                    memory_share, percent_share,
                    "count {count}, percent {percent}"
                );
            }
        }
    }

    #[test]
    fn memory_without_total_is_rejected() {
        let client = client();
        let c = container(
            &["python"],
            &[(GPU_COUNT_RESOURCE, "1"), (GPU_MEMORY_RESOURCE, "1G")],
        );

        let err = ResourceNegotiator::default()
            .negotiate(&c, launch(&client))
            .expect_err("negotiation should fail");

        assert!(matches!(
            err.current_context(),
            AdmissionError::MissingTotalMemory { .. }
        ));
    }

    #[test]
    fn percent_outside_range_is_rejected() {
        let client = client();
        for percent in ["0", "101", "250"] {
            let c = container(
                &["python"],
                &[(GPU_COUNT_RESOURCE, "1"), (GPU_PERCENT_RESOURCE, percent)],
            );
            let message = rejection(ResourceNegotiator::default().negotiate(&c, launch(&client)));
            assert!(
                message.starts_with("Invalid bitfusion.io/gpu-percent request: invalid percent"),
                "unexpected message for {percent}: {message}"
            );
        }
    }

    #[test]
    fn percent_without_count_is_rejected() {
        let client = client();
        for requests in [
            vec![(GPU_PERCENT_RESOURCE, "50")],
            vec![(GPU_COUNT_RESOURCE, "0"), (GPU_PERCENT_RESOURCE, "50")],
        ] {
            let c = container(&["python"], &requests);
            assert_eq!(
                rejection(ResourceNegotiator::default().negotiate(&c, launch(&client))),
                "Invalid bitfusion.io/gpu-num request: gpu count missing"
            );
        }
    }

    #[test]
    fn containers_without_demand_or_command_are_skipped() {
        let client = client();
        let negotiator = ResourceNegotiator::default();

        let plain = container(&["nginx"], &[("cpu", "1")]);
        assert_eq!(
            negotiator.negotiate(&plain, launch(&client)).expect("should skip"),
            Negotiation::Skip
        );

        let zero = container(&["nginx"], &[(GPU_COUNT_RESOURCE, "0")]);
        assert_eq!(
            negotiator.negotiate(&zero, launch(&client)).expect("should skip"),
            Negotiation::Skip
        );

        let no_command = container(&[], &[(GPU_COUNT_RESOURCE, "1")]);
        assert_eq!(
            negotiator.negotiate(&no_command, launch(&client)).expect("should skip"),
            Negotiation::Skip
        );
    }

    #[test]
    fn manual_client_invocation_keeps_command() {
        let client = client();
        for command in [
            vec!["/bin/bash", "-c", "bitfusion run -n 1 -- python"],
            vec![BINARY, "run", "-n", "1"],
        ] {
            let c = container(&command, &[(GPU_COUNT_RESOURCE, "1")]);

            let result = negotiated(
                ResourceNegotiator::default()
                    .negotiate(&c, launch(&client))
                    .expect("should negotiate"),
            );

            assert_eq!(result.command, None);
            assert_eq!(result.share, 100);
        }
    }

    #[test]
    fn injection_only_negotiates_without_rewriting() {
        let client = client();
        let c = container(&["python"], &[(GPU_COUNT_RESOURCE, "1")]);

        let result = negotiated(
            ResourceNegotiator::default()
                .negotiate(
                    &c,
                    LaunchContext {
                        rewrite_command: false,
                        ..launch(&client)
                    },
                )
                .expect("should negotiate"),
        );

        assert_eq!(result.command, None);
        assert_eq!(result.share, 100);
    }

    #[test]
    fn internal_keys_are_replaced_by_share() {
        let client = client();
        let c = container(
            &["python"],
            &[
                (GPU_COUNT_RESOURCE, "1"),
                (GPU_PERCENT_RESOURCE, "50"),
                ("cpu", "2"),
            ],
        );

        let result = negotiated(
            ResourceNegotiator::default()
                .negotiate(&c, launch(&client))
                .expect("should negotiate"),
        );

        let expected = BTreeMap::from([
            (GPU_SHARE_RESOURCE.to_string(), Quantity("50".to_string())),
            ("cpu".to_string(), Quantity("2".to_string())),
        ]);
        assert_eq!(result.requests, expected);
        assert_eq!(result.limits, expected);
    }

    #[test]
    fn patch_writes_command_requests_then_limits() {
        let client = client();
        let c = container(&["python"], &[(GPU_COUNT_RESOURCE, "1")]);
        let result = negotiated(
            ResourceNegotiator::default()
                .negotiate(&c, launch(&client))
                .expect("should negotiate"),
        );

        let ops = result
            .patch("/spec/containers/0")
            .expect("should build patch");

        let shape: Vec<_> = ops.iter().map(|op| (op.op(), op.path())).collect();
        assert_eq!(
            shape,
            vec![
                ("replace", "/spec/containers/0/command"),
                ("replace", "/spec/containers/0/resources/requests"),
                ("add", "/spec/containers/0/resources/limits"),
            ]
        );
    }

    #[test]
    fn unparsable_quantity_names_the_resource() {
        let client = client();
        let c = container(&["python"], &[(GPU_COUNT_RESOURCE, "lots")]);
        assert_eq!(
            rejection(ResourceNegotiator::default().negotiate(&c, launch(&client))),
            "Invalid bitfusion.io/gpu-num request: \"lots\" is not a quantity"
        );
    }
}
