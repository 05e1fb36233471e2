//! Changelog filter expressions.
//!
//! A small filter AST matching what changelog backends accept: attribute
//! comparisons composed with `and` / `or` / `not`. The numbered feed builds
//! its "strictly after position X" window with these, and sources evaluate
//! them (or translate them to their native query language).
//!
//! Two window forms exist because some backends return boundary duplicates
//! for `>=`-style scans: the direct form `(changeNumber > X)` and the
//! compatibility form `(changeNumber >= X) AND NOT (changeNumber = X)`.
//! Both must select exactly the records with sequence strictly greater
//! than X — this equivalence is covered by property tests.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::record::Attributes;

/// Comparison operator in a filter leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompareOp {
    Eq,
    Ge,
    Gt,
    Le,
    Lt,
}

impl CompareOp {
    fn symbol(&self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Ge => ">=",
            CompareOp::Gt => ">",
            CompareOp::Le => "<=",
            CompareOp::Lt => "<",
        }
    }
}

/// Filter expression over raw record attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Filter {
    /// Compare one attribute against a value.
    ///
    /// Multi-valued attributes match if any value satisfies the comparison.
    Compare {
        attribute: String,
        op: CompareOp,
        value: String,
    },
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
}

impl Filter {
    pub fn compare(attribute: impl Into<String>, op: CompareOp, value: impl fmt::Display) -> Self {
        Filter::Compare {
            attribute: attribute.into(),
            op,
            value: value.to_string(),
        }
    }

    pub fn eq(attribute: impl Into<String>, value: impl fmt::Display) -> Self {
        Self::compare(attribute, CompareOp::Eq, value)
    }

    pub fn gt(attribute: impl Into<String>, value: impl fmt::Display) -> Self {
        Self::compare(attribute, CompareOp::Gt, value)
    }

    pub fn ge(attribute: impl Into<String>, value: impl fmt::Display) -> Self {
        Self::compare(attribute, CompareOp::Ge, value)
    }

    /// Direct window form: `(attribute > position)`.
    pub fn changes_after(attribute: impl Into<String>, position: u64) -> Self {
        Self::gt(attribute, position)
    }

    /// Compatibility window form: `(attribute >= position) AND NOT (attribute = position)`.
    ///
    /// Used where the backend may return boundary duplicates for `>=` scans.
    /// Selects exactly the same records as [`Filter::changes_after`].
    pub fn changes_after_compat(attribute: impl Into<String>, position: u64) -> Self {
        let attribute = attribute.into();
        Filter::And(vec![
            Self::ge(attribute.clone(), position),
            Filter::Not(Box::new(Self::eq(attribute, position))),
        ])
    }

    /// Evaluate this filter against a record's attributes.
    ///
    /// Values that parse as integers on both sides are compared numerically,
    /// otherwise lexicographically. An absent attribute never matches a
    /// comparison.
    pub fn matches(&self, attributes: &Attributes) -> bool {
        match self {
            Filter::Compare {
                attribute,
                op,
                value,
            } => attributes
                .get(attribute)
                .map(|values| values.iter().any(|v| compare_values(v, *op, value)))
                .unwrap_or(false),
            Filter::And(filters) => filters.iter().all(|f| f.matches(attributes)),
            Filter::Or(filters) => filters.iter().any(|f| f.matches(attributes)),
            Filter::Not(inner) => !inner.matches(attributes),
        }
    }
}

fn compare_values(actual: &str, op: CompareOp, expected: &str) -> bool {
    let ordering = match (actual.parse::<i64>(), expected.parse::<i64>()) {
        (Ok(a), Ok(b)) => a.cmp(&b),
        _ => actual.cmp(expected),
    };
    match op {
        CompareOp::Eq => ordering.is_eq(),
        CompareOp::Ge => ordering.is_ge(),
        CompareOp::Gt => ordering.is_gt(),
        CompareOp::Le => ordering.is_le(),
        CompareOp::Lt => ordering.is_lt(),
    }
}

impl fmt::Display for Filter {
    /// LDAP-style prefix rendering, e.g. `(&(changeNumber>=5)(!(changeNumber=5)))`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::Compare {
                attribute,
                op,
                value,
            } => write!(f, "({}{}{})", attribute, op.symbol(), value),
            Filter::And(filters) => {
                write!(f, "(&")?;
                for filter in filters {
                    write!(f, "{}", filter)?;
                }
                write!(f, ")")
            }
            Filter::Or(filters) => {
                write!(f, "(|")?;
                for filter in filters {
                    write!(f, "{}", filter)?;
                }
                write!(f, ")")
            }
            Filter::Not(inner) => write!(f, "(!{})", inner),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(change_number: u64) -> Attributes {
        let mut attrs = Attributes::new();
        attrs.set("changeNumber", change_number.to_string());
        attrs
    }

    #[test]
    fn test_direct_window_form() {
        let filter = Filter::changes_after("changeNumber", 5);
        assert!(!filter.matches(&row(4)));
        assert!(!filter.matches(&row(5)));
        assert!(filter.matches(&row(6)));
    }

    #[test]
    fn test_compat_window_form() {
        let filter = Filter::changes_after_compat("changeNumber", 5);
        assert!(!filter.matches(&row(4)));
        assert!(!filter.matches(&row(5)));
        assert!(filter.matches(&row(6)));
    }

    #[test]
    fn test_window_forms_agree_on_boundary() {
        for x in [0u64, 1, 5, 1000] {
            let direct = Filter::changes_after("changeNumber", x);
            let compat = Filter::changes_after_compat("changeNumber", x);
            for n in x.saturating_sub(2)..=x + 2 {
                assert_eq!(direct.matches(&row(n)), compat.matches(&row(n)), "at {}", n);
            }
        }
    }

    #[test]
    fn test_numeric_comparison_not_lexicographic() {
        // "10" > "9" numerically even though it sorts before it as a string.
        let filter = Filter::gt("changeNumber", 9);
        assert!(filter.matches(&row(10)));
    }

    #[test]
    fn test_absent_attribute_never_matches() {
        let filter = Filter::eq("changeType", "ADD");
        assert!(!filter.matches(&Attributes::new()));
        // But NOT of an absent attribute does match.
        let filter = Filter::Not(Box::new(filter));
        assert!(filter.matches(&Attributes::new()));
    }

    #[test]
    fn test_multi_valued_any_match() {
        let mut attrs = Attributes::new();
        attrs.add_value("objectClass", "top");
        attrs.add_value("objectClass", "person");
        assert!(Filter::eq("objectClass", "person").matches(&attrs));
        assert!(!Filter::eq("objectClass", "device").matches(&attrs));
    }

    #[test]
    fn test_display_ldap_style() {
        let filter = Filter::changes_after_compat("changeNumber", 7);
        assert_eq!(
            filter.to_string(),
            "(&(changeNumber>=7)(!(changeNumber=7)))"
        );
        assert_eq!(
            Filter::changes_after("changeNumber", 7).to_string(),
            "(changeNumber>7)"
        );
    }
}
