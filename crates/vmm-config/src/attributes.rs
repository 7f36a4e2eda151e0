//! Read-only driver defaults keyed by attribute name.
//!
//! Driver defaults come in two shapes: single attributes such as
//! `EMULATOR = /usr/bin/kvm`, and vector attributes that group several
//! values under a namespace such as `FEATURES = [ ACPI = "yes" ]`. Names are
//! case-insensitive and stored upper-cased.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Driver-specific defaults consumed when building commands.
///
/// # Example
///
/// ```
/// use vmm_config::DriverAttributes;
///
/// let attributes = DriverAttributes::new()
///     .with_value("emulator", "/usr/bin/kvm")
///     .with_vector_value("features", "acpi", "yes");
///
/// assert_eq!(attributes.get("EMULATOR"), Some("/usr/bin/kvm"));
/// assert_eq!(attributes.get_bool_in("Features", "ACPI"), Some(true));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "AttributeTable")]
pub struct DriverAttributes {
    single: BTreeMap<String, String>,
    vectors: BTreeMap<String, BTreeMap<String, String>>,
}

/// Serialised form accepted before names are normalised.
#[derive(Debug, Default, Deserialize)]
struct AttributeTable {
    #[serde(default)]
    single: BTreeMap<String, String>,
    #[serde(default)]
    vectors: BTreeMap<String, BTreeMap<String, String>>,
}

impl From<AttributeTable> for DriverAttributes {
    fn from(table: AttributeTable) -> Self {
        let mut attributes = Self::new();
        for (name, value) in table.single {
            attributes.insert_value(&name, value);
        }
        for (namespace, values) in table.vectors {
            for (name, value) in values {
                attributes.insert_vector_value(&namespace, &name, value);
            }
        }
        attributes
    }
}

impl DriverAttributes {
    /// Creates an empty attribute set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a single attribute, replacing any previous value.
    #[must_use]
    pub fn with_value(mut self, name: &str, value: impl Into<String>) -> Self {
        self.insert_value(name, value.into());
        self
    }

    /// Adds a value inside a vector attribute, replacing any previous value.
    #[must_use]
    pub fn with_vector_value(
        mut self,
        namespace: &str,
        name: &str,
        value: impl Into<String>,
    ) -> Self {
        self.insert_vector_value(namespace, name, value.into());
        self
    }

    fn insert_value(&mut self, name: &str, value: String) {
        self.single.insert(normalise(name), value);
    }

    fn insert_vector_value(&mut self, namespace: &str, name: &str, value: String) {
        self.vectors
            .entry(normalise(namespace))
            .or_default()
            .insert(normalise(name), value);
    }

    /// Looks up a single attribute.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.single.get(&normalise(name)).map(String::as_str)
    }

    /// Looks up a value inside a vector attribute.
    #[must_use]
    pub fn get_in(&self, namespace: &str, name: &str) -> Option<&str> {
        self.vectors
            .get(&normalise(namespace))
            .and_then(|values| values.get(&normalise(name)))
            .map(String::as_str)
    }

    /// Looks up a boolean inside a vector attribute.
    ///
    /// Accepts `yes`/`no` and `true`/`false` in any case. Returns `None` when
    /// the value is absent or not one of those words.
    #[must_use]
    pub fn get_bool_in(&self, namespace: &str, name: &str) -> Option<bool> {
        self.get_in(namespace, name).and_then(parse_flag)
    }

    /// Iterates over the vector attribute names.
    pub fn namespaces(&self) -> impl Iterator<Item = &str> {
        self.vectors.keys().map(String::as_str)
    }

    /// Returns `true` when no attribute is defined.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.single.is_empty() && self.vectors.is_empty()
    }
}

fn normalise(name: &str) -> String {
    name.trim().to_ascii_uppercase()
}

fn parse_flag(value: &str) -> Option<bool> {
    let trimmed = value.trim();
    if trimmed.eq_ignore_ascii_case("yes") || trimmed.eq_ignore_ascii_case("true") {
        Some(true)
    } else if trimmed.eq_ignore_ascii_case("no") || trimmed.eq_ignore_ascii_case("false") {
        Some(false)
    } else {
        None
    }
}
