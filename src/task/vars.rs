// Per-execution variable store and `{{name}}` expansion

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

/// Reserved placeholder bound to the current loop item
pub const ITEM: &str = "item";

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\{([A-Za-z0-9_]+)\}\}").expect("placeholder pattern is valid")
});

/// Variable bag shared by the tasks of one host run.
///
/// Holds string values (used for expansion), raw byte values (never
/// expanded) and the loop `item` slot. Expansion is a single pass: values
/// substituted into a template are not scanned again, and placeholders with
/// no matching variable are left untouched.
#[derive(Debug, Clone, Default)]
pub struct VarBag {
    strings: HashMap<String, String>,
    bytes: HashMap<String, Vec<u8>>,
    item: String,
}

impl VarBag {
    pub fn new() -> Self {
        VarBag::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.strings.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.strings.get(key).map(String::as_str)
    }

    pub fn set_bytes(&mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) {
        self.bytes.insert(key.into(), value.into());
    }

    pub fn get_bytes(&self, key: &str) -> Option<&[u8]> {
        self.bytes.get(key).map(Vec::as_slice)
    }

    /// Booleans are stored as the strings `"true"` / `"false"`
    pub fn set_bool(&mut self, key: impl Into<String>, value: bool) {
        self.set(key, if value { "true" } else { "false" });
    }

    pub fn get_bool(&self, key: &str) -> bool {
        self.get(key) == Some("true")
    }

    pub fn contains(&self, key: &str) -> bool {
        self.strings.contains_key(key) || self.bytes.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) {
        self.strings.remove(key);
        self.bytes.remove(key);
    }

    /// Drop every variable and the loop item
    pub fn clear(&mut self) {
        self.strings.clear();
        self.bytes.clear();
        self.item.clear();
    }

    pub fn set_item(&mut self, item: impl Into<String>) {
        self.item = item.into();
    }

    pub fn item(&self) -> &str {
        &self.item
    }

    pub fn clear_item(&mut self) {
        self.item.clear();
    }

    pub fn len(&self) -> usize {
        self.strings.len() + self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Expand `{{item}}` and `{{key}}` placeholders in one pass
    pub fn expand(&self, template: &str) -> String {
        if template.is_empty() || !template.contains("{{") {
            return template.to_string();
        }

        PLACEHOLDER
            .replace_all(template, |caps: &Captures| {
                let key = &caps[1];
                if key == ITEM {
                    return self.item.clone();
                }
                match self.strings.get(key) {
                    Some(value) => value.clone(),
                    None => caps[0].to_string(),
                }
            })
            .into_owned()
    }

    /// Placeholders in `template` with no value in this bag
    pub fn unresolved(&self, template: &str) -> Vec<String> {
        PLACEHOLDER
            .captures_iter(template)
            .map(|caps| caps[1].to_string())
            .filter(|key| key != ITEM && !self.strings.contains_key(key))
            .collect()
    }
}

impl<K, V> FromIterator<(K, V)> for VarBag
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut bag = VarBag::new();
        for (k, v) in iter {
            bag.set(k, v);
        }
        bag
    }
}
