//! Access-policy engine
//!
//! Pure rule evaluation: policies whose exporter selector matches a
//! candidate exporter contribute their rules, the union is ordered by
//! priority descending, and the first rule whose client selector matches
//! the requesting client's labels admits the request. No I/O happens here,
//! so results are cacheable per `(client, exporter set)`.

use std::collections::BTreeMap;

use crds::{Exporter, ExporterAccessPolicy};

/// Outcome of admission for one client on one exporter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub priority: i32,
    pub maximum_duration_seconds: Option<i64>,
    pub spot_access: bool,
}

impl Default for Admission {
    /// Admission used when no policy applies to the exporter at all:
    /// allowed, lowest priority, no cap, not preemptible.
    fn default() -> Self {
        Self {
            priority: 0,
            maximum_duration_seconds: None,
            spot_access: false,
        }
    }
}

/// Whether any policy selects this exporter.
pub fn applicable(policies: &[ExporterAccessPolicy], exporter: &Exporter) -> bool {
    let labels = exporter.labels();
    policies
        .iter()
        .any(|p| p.spec.exporter_selector.matches(&labels))
}

/// Evaluate admission for `client_labels` on `exporter`.
///
/// Returns `None` when at least one policy applies to the exporter but no
/// rule admits the client. Callers handle the policy-free case separately
/// via [`applicable`].
pub fn admit(
    policies: &[ExporterAccessPolicy],
    client_labels: &BTreeMap<String, String>,
    exporter: &Exporter,
) -> Option<Admission> {
    let exporter_labels = exporter.labels();

    // Union of rules from every policy selecting this exporter
    let mut rules: Vec<_> = policies
        .iter()
        .filter(|p| p.spec.exporter_selector.matches(&exporter_labels))
        .flat_map(|p| p.spec.rules.iter())
        .collect();

    rules.sort_by(|a, b| b.priority.cmp(&a.priority));

    rules
        .into_iter()
        .find(|rule| rule.client_selector.matches(client_labels))
        .map(|rule| Admission {
            priority: rule.priority,
            maximum_duration_seconds: rule.maximum_duration_seconds,
            spot_access: rule.spot_access,
        })
}

/// Effective duration after applying the admitted rule's cap.
pub fn effective_duration_seconds(requested: i64, admission: &Admission) -> i64 {
    match admission.maximum_duration_seconds {
        Some(cap) => requested.min(cap),
        None => requested,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crds::{AccessRule, ExporterAccessPolicySpec, ExporterSpec, LabelSelector};
    use kube::core::ObjectMeta;

    fn exporter_with(labels: &[(&str, &str)]) -> Exporter {
        Exporter {
            metadata: ObjectMeta {
                name: Some("exporter1".to_string()),
                namespace: Some("default".to_string()),
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            spec: ExporterSpec { username: None },
            status: None,
        }
    }

    fn policy(
        name: &str,
        exporter_selector: LabelSelector,
        rules: Vec<AccessRule>,
    ) -> ExporterAccessPolicy {
        ExporterAccessPolicy {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: ExporterAccessPolicySpec {
                exporter_selector,
                rules,
            },
        }
    }

    fn rule(priority: i32, client_selector: LabelSelector) -> AccessRule {
        AccessRule {
            priority,
            client_selector,
            maximum_duration_seconds: None,
            spot_access: false,
        }
    }

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_no_policy_is_not_applicable() {
        let exporter = exporter_with(&[("dut", "a")]);
        assert!(!applicable(&[], &exporter));
    }

    #[test]
    fn test_highest_priority_rule_wins() {
        let exporter = exporter_with(&[("dut", "a")]);
        let policies = vec![policy(
            "p1",
            LabelSelector::from_label("dut", "a"),
            vec![
                AccessRule {
                    priority: 10,
                    client_selector: LabelSelector::from_label("team", "qa"),
                    maximum_duration_seconds: Some(600),
                    spot_access: false,
                },
                AccessRule {
                    priority: 1,
                    client_selector: LabelSelector::default(),
                    maximum_duration_seconds: Some(60),
                    spot_access: true,
                },
            ],
        )];

        // QA client matches the priority-10 rule first
        let admission = admit(&policies, &labels(&[("team", "qa")]), &exporter).unwrap();
        assert_eq!(admission.priority, 10);
        assert_eq!(admission.maximum_duration_seconds, Some(600));
        assert!(!admission.spot_access);

        // Everyone else falls through to the catch-all spot rule
        let admission = admit(&policies, &labels(&[("team", "dev")]), &exporter).unwrap();
        assert_eq!(admission.priority, 1);
        assert!(admission.spot_access);
    }

    #[test]
    fn test_rules_unioned_across_policies() {
        let exporter = exporter_with(&[("dut", "a")]);
        let policies = vec![
            policy(
                "low",
                LabelSelector::from_label("dut", "a"),
                vec![rule(1, LabelSelector::default())],
            ),
            policy(
                "high",
                LabelSelector::default(),
                vec![rule(5, LabelSelector::from_label("team", "qa"))],
            ),
        ];

        let admission = admit(&policies, &labels(&[("team", "qa")]), &exporter).unwrap();
        assert_eq!(admission.priority, 5);
    }

    #[test]
    fn test_policy_for_other_exporters_is_ignored() {
        let exporter = exporter_with(&[("dut", "a")]);
        let policies = vec![policy(
            "other",
            LabelSelector::from_label("dut", "b"),
            vec![rule(5, LabelSelector::default())],
        )];

        assert!(!applicable(&policies, &exporter));
        assert!(admit(&policies, &labels(&[]), &exporter).is_none());
    }

    #[test]
    fn test_no_matching_rule_denies() {
        let exporter = exporter_with(&[("dut", "a")]);
        let policies = vec![policy(
            "strict",
            LabelSelector::from_label("dut", "a"),
            vec![rule(1, LabelSelector::from_label("team", "qa"))],
        )];

        assert!(applicable(&policies, &exporter));
        assert!(admit(&policies, &labels(&[("team", "dev")]), &exporter).is_none());
    }

    #[test]
    fn test_effective_duration_caps() {
        let admission = Admission {
            priority: 1,
            maximum_duration_seconds: Some(300),
            spot_access: false,
        };
        assert_eq!(effective_duration_seconds(600, &admission), 300);
        assert_eq!(effective_duration_seconds(120, &admission), 120);
        assert_eq!(
            effective_duration_seconds(600, &Admission::default()),
            600
        );
    }
}
