//! Conversions between stored resources and wire messages

use std::collections::HashMap;

use crds::{
    Condition, ConditionStatus, Device, Exporter, LabelSelector, LabelSelectorOperator,
    LabelSelectorRequirement, Lease,
};
use protocol::client as cpb;
use protocol::messages as pb;

use super::{RpcError, RpcResult};

pub fn selector_to_pb(selector: &LabelSelector) -> pb::LabelSelector {
    pb::LabelSelector {
        match_labels: selector
            .match_labels
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
        match_expressions: selector
            .match_expressions
            .iter()
            .map(|req| pb::LabelSelectorRequirement {
                key: req.key.clone(),
                operator: operator_to_str(req.operator).to_string(),
                values: req.values.clone(),
            })
            .collect(),
    }
}

pub fn selector_from_pb(selector: &pb::LabelSelector) -> RpcResult<LabelSelector> {
    Ok(LabelSelector {
        match_labels: selector
            .match_labels
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
        match_expressions: selector
            .match_expressions
            .iter()
            .map(|req| {
                Ok(LabelSelectorRequirement {
                    key: req.key.clone(),
                    operator: operator_from_str(&req.operator)?,
                    values: req.values.clone(),
                })
            })
            .collect::<RpcResult<Vec<_>>>()?,
    })
}

fn operator_to_str(operator: LabelSelectorOperator) -> &'static str {
    match operator {
        LabelSelectorOperator::In => "In",
        LabelSelectorOperator::NotIn => "NotIn",
        LabelSelectorOperator::Exists => "Exists",
        LabelSelectorOperator::DoesNotExist => "DoesNotExist",
    }
}

fn operator_from_str(operator: &str) -> RpcResult<LabelSelectorOperator> {
    match operator {
        "In" => Ok(LabelSelectorOperator::In),
        "NotIn" => Ok(LabelSelectorOperator::NotIn),
        "Exists" => Ok(LabelSelectorOperator::Exists),
        "DoesNotExist" => Ok(LabelSelectorOperator::DoesNotExist),
        other => Err(RpcError::invalid_argument(format!(
            "unknown selector operator {other:?}"
        ))),
    }
}

pub fn conditions_to_pb(conditions: &[Condition]) -> Vec<pb::Condition> {
    conditions
        .iter()
        .map(|c| pb::Condition {
            r#type: c.type_.clone(),
            status: match c.status {
                ConditionStatus::True => "True".to_string(),
                ConditionStatus::False => "False".to_string(),
                ConditionStatus::Unknown => "Unknown".to_string(),
            },
            reason: c.reason.clone(),
            message: c.message.clone(),
            last_transition_time: Some(pb::Timestamp::from(c.last_transition_time)),
        })
        .collect()
}

fn device_to_pb(device: &Device) -> cpb::Device {
    cpb::Device {
        uuid: device.uuid.clone(),
        parent_uuid: device.parent_uuid.clone(),
        labels: device
            .labels
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    }
}

pub fn exporter_to_pb(namespace: &str, exporter: &Exporter) -> cpb::Exporter {
    let name = exporter.metadata.name.as_deref().unwrap_or_default();
    cpb::Exporter {
        name: cpb::exporter_resource_name(namespace, name),
        labels: exporter
            .labels()
            .into_iter()
            .collect::<HashMap<String, String>>(),
        devices: exporter
            .status
            .as_ref()
            .map(|s| s.devices.iter().map(device_to_pb).collect())
            .unwrap_or_default(),
        online: exporter.is_online(),
    }
}

pub fn lease_to_pb(namespace: &str, lease: &Lease) -> cpb::Lease {
    let name = lease.metadata.name.as_deref().unwrap_or_default();
    let status = lease.status.as_ref();
    cpb::Lease {
        name: cpb::lease_resource_name(namespace, name),
        selector: Some(selector_to_pb(&lease.spec.selector)),
        duration_seconds: lease.spec.duration_seconds,
        begin_time: status
            .and_then(|s| s.begin_time)
            .map(pb::Timestamp::from),
        end_time: status.and_then(|s| s.end_time).map(pb::Timestamp::from),
        client: lease.spec.client_ref.name.clone(),
        exporter: status
            .and_then(|s| s.exporter_ref.as_ref())
            .map(|r| r.name.clone())
            .unwrap_or_default(),
        conditions: status
            .map(|s| conditions_to_pb(&s.conditions))
            .unwrap_or_default(),
        ended: status.is_some_and(|s| s.ended),
    }
}

/// Parse a label filter expression such as `dut=a,team!=qa,board,!legacy`.
pub fn parse_filter(filter: &str) -> RpcResult<LabelSelector> {
    let mut selector = LabelSelector::default();
    for term in filter.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        if let Some((key, value)) = term.split_once("!=") {
            selector
                .match_expressions
                .push(LabelSelectorRequirement {
                    key: key.trim().to_string(),
                    operator: LabelSelectorOperator::NotIn,
                    values: vec![value.trim().to_string()],
                });
        } else if let Some((key, value)) = term.split_once('=') {
            selector
                .match_labels
                .insert(key.trim().to_string(), value.trim().to_string());
        } else if let Some(key) = term.strip_prefix('!') {
            selector
                .match_expressions
                .push(LabelSelectorRequirement {
                    key: key.trim().to_string(),
                    operator: LabelSelectorOperator::DoesNotExist,
                    values: Vec::new(),
                });
        } else {
            selector.match_expressions.push(LabelSelectorRequirement {
                key: term.to_string(),
                operator: LabelSelectorOperator::Exists,
                values: Vec::new(),
            });
        }
    }
    Ok(selector)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_selector_roundtrip() {
        let selector = LabelSelector {
            match_labels: BTreeMap::from([("dut".to_string(), "a".to_string())]),
            match_expressions: vec![LabelSelectorRequirement {
                key: "board".to_string(),
                operator: LabelSelectorOperator::Exists,
                values: Vec::new(),
            }],
        };

        let wire = selector_to_pb(&selector);
        let back = selector_from_pb(&wire).unwrap();
        assert_eq!(back, selector);
    }

    #[test]
    fn test_unknown_operator_rejected() {
        let wire = pb::LabelSelector {
            match_labels: HashMap::new(),
            match_expressions: vec![pb::LabelSelectorRequirement {
                key: "dut".to_string(),
                operator: "Matches".to_string(),
                values: Vec::new(),
            }],
        };
        assert!(selector_from_pb(&wire).is_err());
    }

    #[test]
    fn test_parse_filter_terms() {
        let selector = parse_filter("dut=a, team!=qa, board, !legacy").unwrap();
        assert_eq!(selector.match_labels.get("dut"), Some(&"a".to_string()));
        assert_eq!(selector.match_expressions.len(), 3);

        let mut labels = BTreeMap::new();
        labels.insert("dut".to_string(), "a".to_string());
        labels.insert("board".to_string(), "rpi4".to_string());
        assert!(selector.matches(&labels));

        labels.insert("legacy".to_string(), "yes".to_string());
        assert!(!selector.matches(&labels));
    }

    #[test]
    fn test_parse_empty_filter_matches_all() {
        let selector = parse_filter("").unwrap();
        assert!(selector.is_empty());
    }
}
