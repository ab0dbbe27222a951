use std::collections::BTreeMap;

use super::INJECT_ANNOTATION;
use super::STATUS_ANNOTATION;
use super::STATUS_INJECTED;

/// Namespaces whose pods are never mutated unless configured otherwise.
pub const DEFAULT_IGNORED_NAMESPACES: [&str; 2] = ["kube-system", "kube-public"];

/// Value of the inject annotation selecting [`InjectionDecision::InjectionOnly`].
pub const INJECTION_ONLY_VALUE: &str = "injection";

const FULL_INJECT_VALUES: [&str; 5] = ["y", "yes", "true", "on", "all"];

/// Why a pod is left untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum SkipReason {
    #[display("namespace is ignored")]
    IgnoredNamespace,
    #[display("pod is already injected")]
    AlreadyInjected,
    #[display("pod did not opt in")]
    NotRequested,
}

/// Outcome of [`InjectionPolicy::decide`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectionDecision {
    Skip(SkipReason),
    /// Negotiate resources and wrap the launch command.
    FullInject,
    /// Negotiate resources but leave the launch command alone.
    InjectionOnly,
}

impl InjectionDecision {
    pub fn rewrites_command(&self) -> bool {
        matches!(self, Self::FullInject)
    }
}

/// Decides from pod metadata whether a pod has to be mutated.
#[derive(Debug, Clone)]
pub struct InjectionPolicy {
    ignored_namespaces: Vec<String>,
}

impl Default for InjectionPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_IGNORED_NAMESPACES.iter().map(|ns| ns.to_string()))
    }
}

impl InjectionPolicy {
    pub fn new(ignored_namespaces: impl IntoIterator<Item = String>) -> Self {
        Self {
            ignored_namespaces: ignored_namespaces.into_iter().collect(),
        }
    }

    pub fn decide(
        &self,
        namespace: &str,
        annotations: Option<&BTreeMap<String, String>>,
    ) -> InjectionDecision {
        if self.ignored_namespaces.iter().any(|ns| ns == namespace) {
            return InjectionDecision::Skip(SkipReason::IgnoredNamespace);
        }

        let lookup = |key: &str| {
            annotations
                .and_then(|annotations| annotations.get(key))
                .map(|value| value.to_lowercase())
                .unwrap_or_default()
        };

        if lookup(STATUS_ANNOTATION) == STATUS_INJECTED {
            return InjectionDecision::Skip(SkipReason::AlreadyInjected);
        }

        let mode = lookup(INJECT_ANNOTATION);
        if FULL_INJECT_VALUES.contains(&mode.as_str()) {
            InjectionDecision::FullInject
        } else if mode == INJECTION_ONLY_VALUE {
            InjectionDecision::InjectionOnly
        } else {
            InjectionDecision::Skip(SkipReason::NotRequested)
        }
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    fn annotations(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn full_inject_values_are_case_insensitive() {
        let policy = InjectionPolicy::default();
        for value in ["y", "Yes", "TRUE", "on", "All"] {
            let annotations = annotations(&[(INJECT_ANNOTATION, value)]);
            assert_eq!(
                policy.decide("default", Some(&annotations)),
                InjectionDecision::FullInject,
                "value {value} should request full injection"
            );
        }
    }

    #[test]
    fn injection_value_selects_injection_only() {
        let policy = InjectionPolicy::default();
        let annotations = annotations(&[(INJECT_ANNOTATION, "injection")]);

        let decision = policy.decide("default", Some(&annotations));

        assert_eq!(decision, InjectionDecision::InjectionOnly);
        assert!(!decision.rewrites_command());
    }

    #[test]
    fn unknown_or_missing_inject_value_skips() {
        let policy = InjectionPolicy::default();
        let off = annotations(&[(INJECT_ANNOTATION, "no")]);

        assert_eq!(
            policy.decide("default", Some(&off)),
            InjectionDecision::Skip(SkipReason::NotRequested)
        );
        assert_eq!(
            policy.decide("default", None),
            InjectionDecision::Skip(SkipReason::NotRequested)
        );
    }

    #[test]
    fn ignored_namespace_wins_over_annotations() {
        let policy = InjectionPolicy::default();
        let on = annotations(&[(INJECT_ANNOTATION, "yes")]);

        for namespace in DEFAULT_IGNORED_NAMESPACES {
            assert_eq!(
                policy.decide(namespace, Some(&on)),
                InjectionDecision::Skip(SkipReason::IgnoredNamespace)
            );
        }
    }

    #[test]
    fn injected_status_is_never_mutated_again() {
        let policy = InjectionPolicy::default();
        for mode in ["yes", "all", "injection"] {
            let annotations =
                annotations(&[(INJECT_ANNOTATION, mode), (STATUS_ANNOTATION, "Injected")]);
            assert_eq!(
                policy.decide("default", Some(&annotations)),
                InjectionDecision::Skip(SkipReason::AlreadyInjected)
            );
        }
    }

    #[test]
    fn custom_ignore_list_replaces_defaults() {
        let policy = InjectionPolicy::new(["gpu-system".to_string()]);
        let on = annotations(&[(INJECT_ANNOTATION, "yes")]);

        assert_eq!(
            policy.decide("gpu-system", Some(&on)),
            InjectionDecision::Skip(SkipReason::IgnoredNamespace)
        );
        assert_eq!(
            policy.decide("kube-system", Some(&on)),
            InjectionDecision::FullInject
        );
    }
}
