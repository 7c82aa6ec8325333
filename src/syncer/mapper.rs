use std::collections::{BTreeMap, BTreeSet};

/// A single attribute condition: the user's attribute must equal the
/// expected value exactly, case-sensitively. A missing attribute never
/// matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeCondition {
    pub attribute_name: String,
    pub expected_value: String,
}

impl AttributeCondition {
    pub fn matches(&self, attributes: &BTreeMap<String, String>) -> bool {
        attributes.get(&self.attribute_name) == Some(&self.expected_value)
    }
}

/// Mapping rule for one group: AND over all conditions. A rule with no
/// conditions matches nobody.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeMappingRule {
    pub group_name: String,
    pub group_id: String,
    pub conditions: Vec<AttributeCondition>,
}

impl AttributeMappingRule {
    pub fn matches(&self, attributes: &BTreeMap<String, String>) -> bool {
        !self.conditions.is_empty() && self.conditions.iter().all(|c| c.matches(attributes))
    }

    /// The attribute values that satisfied this rule, recorded in audit
    /// rows for adds.
    pub fn matched_attributes(
        &self,
        attributes: &BTreeMap<String, String>,
    ) -> BTreeMap<String, String> {
        self.conditions
            .iter()
            .filter_map(|c| {
                attributes
                    .get(&c.attribute_name)
                    .map(|value| (c.attribute_name.clone(), value.clone()))
            })
            .collect()
    }
}

/// Evaluates users against the rule set.
#[derive(Debug, Clone, Default)]
pub struct AttributeMapper {
    rules: Vec<AttributeMappingRule>,
}

impl AttributeMapper {
    pub fn new(rules: Vec<AttributeMappingRule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[AttributeMappingRule] {
        &self.rules
    }

    /// Group ids the user should belong to.
    pub fn target_groups_for_user(
        &self,
        attributes: &BTreeMap<String, String>,
    ) -> BTreeSet<String> {
        self.rules
            .iter()
            .filter(|rule| rule.matches(attributes))
            .map(|rule| rule.group_id.clone())
            .collect()
    }

    pub fn rule_for_group(&self, group_id: &str) -> Option<&AttributeMappingRule> {
        self.rules.iter().find(|rule| rule.group_id == group_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn rule(group_id: &str, conditions: &[(&str, &str)]) -> AttributeMappingRule {
        AttributeMappingRule {
            group_name: format!("name-{group_id}"),
            group_id: group_id.to_string(),
            conditions: conditions
                .iter()
                .map(|(name, value)| AttributeCondition {
                    attribute_name: name.to_string(),
                    expected_value: value.to_string(),
                })
                .collect(),
        }
    }

    #[test]
    fn matching_is_exact_and_case_sensitive() {
        let rule = rule("g-1", &[("department", "Engineering")]);
        assert!(rule.matches(&attrs(&[("department", "Engineering")])));
        assert!(!rule.matches(&attrs(&[("department", "engineering")])));
        assert!(!rule.matches(&attrs(&[("department", "Engineering ")])));
    }

    #[test]
    fn missing_attributes_never_match() {
        let rule = rule("g-1", &[("department", "Engineering")]);
        assert!(!rule.matches(&attrs(&[("title", "SRE")])));
        assert!(!rule.matches(&BTreeMap::new()));
    }

    #[test]
    fn all_conditions_must_hold() {
        let rule = rule("g-1", &[("department", "Engineering"), ("title", "SRE")]);
        assert!(rule.matches(&attrs(&[("department", "Engineering"), ("title", "SRE")])));
        assert!(!rule.matches(&attrs(&[("department", "Engineering"), ("title", "Dev")])));
        assert!(!rule.matches(&attrs(&[("department", "Engineering")])));
    }

    #[test]
    fn empty_condition_sets_match_nobody() {
        let rule = rule("g-1", &[]);
        assert!(!rule.matches(&attrs(&[("department", "Engineering")])));
    }

    #[test]
    fn mapper_collects_all_matching_groups() {
        let mapper = AttributeMapper::new(vec![
            rule("g-1", &[("department", "Engineering")]),
            rule("g-2", &[("title", "SRE")]),
            rule("g-3", &[("department", "Sales")]),
        ]);
        let targets =
            mapper.target_groups_for_user(&attrs(&[("department", "Engineering"), ("title", "SRE")]));
        assert_eq!(
            targets,
            ["g-1", "g-2"].iter().map(|s| s.to_string()).collect::<BTreeSet<_>>()
        );
    }

    #[test]
    fn matched_attributes_capture_the_satisfying_values() {
        let rule = rule("g-1", &[("department", "Engineering")]);
        let matched =
            rule.matched_attributes(&attrs(&[("department", "Engineering"), ("title", "SRE")]));
        assert_eq!(matched, attrs(&[("department", "Engineering")]));
    }
}
