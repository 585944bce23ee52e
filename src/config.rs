//! Test parameters.
//!
//! A test is driven entirely by a flat string map. Keys are scoped by
//! suffix: `image_size_image1` overrides `image_size` in the view returned by
//! [`Params::object_params`]`("image1")`. Lookups never fail on a missing key;
//! callers supply a default and parse explicitly at the boundary.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Application name for the default data directory.
const APP_NAME: &str = "vmfixture";

/// Flat, string-keyed configuration map.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Params(BTreeMap<String, String>);

impl Params {
    /// Create an empty parameter map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load parameters from a flat TOML table.
    ///
    /// Strings are taken verbatim, numbers are formatted, and booleans map to
    /// `"yes"`/`"no"`. Nested tables and arrays are rejected.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigLoad(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&text)
    }

    /// Parse parameters from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let table: toml::Table = text
            .parse()
            .map_err(|e: toml::de::Error| Error::ConfigLoad(e.to_string()))?;

        let mut params = Self::new();
        for (key, value) in table {
            let value = match value {
                toml::Value::String(s) => s,
                toml::Value::Integer(i) => i.to_string(),
                toml::Value::Float(f) => f.to_string(),
                toml::Value::Boolean(b) => if b { "yes" } else { "no" }.to_string(),
                other => {
                    return Err(Error::ConfigLoad(format!(
                        "key '{}' must be a scalar, got {}",
                        key,
                        other.type_str()
                    )))
                }
            };
            params.set(key, value);
        }
        Ok(params)
    }

    /// Get a raw value.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Get a value or a default.
    pub fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).unwrap_or(default)
    }

    /// Whether the key is present with a non-empty value.
    pub fn has(&self, key: &str) -> bool {
        self.get(key).is_some_and(|v| !v.is_empty())
    }

    /// Whether the key is set to `"yes"`.
    pub fn is_yes(&self, key: &str) -> bool {
        self.get(key) == Some("yes")
    }

    /// Like [`Params::is_yes`], falling back to `default` when the key is absent.
    pub fn is_yes_or(&self, key: &str, default: bool) -> bool {
        match self.get(key) {
            Some(v) => v == "yes",
            None => default,
        }
    }

    /// Parse a value, falling back to `default` when the key is absent or empty.
    pub fn get_parsed<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key).map(str::trim) {
            None | Some("") => Ok(default),
            Some(raw) => raw
                .parse()
                .map_err(|e| Error::config(format!("invalid value '{}' for {}: {}", raw, key, e))),
        }
    }

    /// Parse a duration given in (possibly fractional) seconds.
    pub fn get_secs(&self, key: &str, default: f64) -> Result<Duration> {
        let secs: f64 = self.get_parsed(key, default)?;
        Duration::try_from_secs_f64(secs)
            .map_err(|e| Error::config(format!("invalid duration '{}' for {}: {}", secs, key, e)))
    }

    /// Split a value on whitespace.
    pub fn objects(&self, key: &str) -> Vec<String> {
        self.get(key)
            .map(|v| v.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default()
    }

    /// Scoped view for one object: every `<key>_<name>` overrides `<key>`.
    pub fn object_params(&self, name: &str) -> Params {
        let mut scoped = self.clone();
        let suffix = format!("_{}", name);
        for (key, value) in &self.0 {
            if let Some(base) = key.strip_suffix(&suffix) {
                if !base.is_empty() {
                    scoped.0.insert(base.to_string(), value.clone());
                }
            }
        }
        scoped
    }

    /// Set a value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    /// Remove a value.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(key)
    }

    /// Overlay every entry of `other` onto this map.
    pub fn update(&mut self, other: &Params) {
        for (key, value) in &other.0 {
            self.0.insert(key.clone(), value.clone());
        }
    }

    /// Iterate over all entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the map is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Directory images are resolved against.
    ///
    /// `images_base_dir` wins; otherwise the per-user data directory is used.
    pub fn images_base_dir(&self) -> PathBuf {
        if let Some(dir) = self.get("images_base_dir").filter(|d| !d.is_empty()) {
            return PathBuf::from(dir);
        }
        dirs::data_local_dir()
            .or_else(dirs::data_dir)
            .unwrap_or_else(std::env::temp_dir)
            .join(APP_NAME)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Params {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut params = Params::new();
        for (k, v) in iter {
            params.set(k, v);
        }
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absent_key_uses_default() {
        let params = Params::new();
        assert_eq!(params.get("missing"), None);
        assert_eq!(params.get_or("missing", "fallback"), "fallback");
        assert!(!params.is_yes("missing"));
        assert!(params.is_yes_or("missing", true));
        assert_eq!(params.get_parsed("missing", 20u64).unwrap(), 20);
        assert!(params.objects("missing").is_empty());
    }

    #[test]
    fn test_objects_split_on_whitespace() {
        let params: Params = [("images", "  image1 stg\timage2 ")].into_iter().collect();
        assert_eq!(params.objects("images"), vec!["image1", "stg", "image2"]);
    }

    #[test]
    fn test_object_params_overrides_by_suffix() {
        let params: Params = [
            ("image_size", "10G"),
            ("image_size_stg", "1G"),
            ("image_format_image1", "raw"),
            ("remove_image", "no"),
        ]
        .into_iter()
        .collect();

        let stg = params.object_params("stg");
        assert_eq!(stg.get("image_size"), Some("1G"));
        assert_eq!(stg.get("image_format"), None);
        assert_eq!(stg.get("remove_image"), Some("no"));

        let image1 = params.object_params("image1");
        assert_eq!(image1.get("image_size"), Some("10G"));
        assert_eq!(image1.get("image_format"), Some("raw"));

        // The parent view is untouched.
        assert_eq!(params.get("image_size"), Some("10G"));
    }

    #[test]
    fn test_get_parsed_rejects_garbage() {
        let params: Params = [("vm_create_timeout", "soon")].into_iter().collect();
        let err = params.get_parsed("vm_create_timeout", 20u64).unwrap_err();
        assert!(err.to_string().contains("vm_create_timeout"));
    }

    #[test]
    fn test_get_secs_accepts_fractions() {
        let params: Params = [("screendump_delay", "0.25")].into_iter().collect();
        assert_eq!(
            params.get_secs("screendump_delay", 5.0).unwrap(),
            Duration::from_millis(250)
        );
        assert_eq!(
            params.get_secs("vm_register_delay", 5.0).unwrap(),
            Duration::from_secs(5)
        );
    }

    #[test]
    fn test_get_secs_rejects_out_of_range() {
        let params: Params = [
            ("screendump_delay", "1e30"),
            ("kill_vm_timeout", "-1"),
            ("vm_register_delay", "inf"),
        ]
        .into_iter()
        .collect();
        for key in ["screendump_delay", "kill_vm_timeout", "vm_register_delay"] {
            let err = params.get_secs(key, 5.0).unwrap_err();
            assert!(err.to_string().contains(key), "{}", err);
        }
    }

    #[test]
    fn test_from_toml_flattens_scalars() {
        let params = Params::from_toml_str(
            r#"
images = "image1 image2"
create_image = true
kill_vm = false
vm_create_timeout = 30
inactivity_treshold = 1.5
"#,
        )
        .unwrap();

        assert_eq!(params.get("images"), Some("image1 image2"));
        assert!(params.is_yes("create_image"));
        assert_eq!(params.get("kill_vm"), Some("no"));
        assert_eq!(params.get("vm_create_timeout"), Some("30"));
        assert_eq!(params.get("inactivity_treshold"), Some("1.5"));
    }

    #[test]
    fn test_from_toml_rejects_tables() {
        let err = Params::from_toml_str("[nested]\nkey = 'x'\n").unwrap_err();
        assert!(err.to_string().contains("nested"));
    }

    #[test]
    fn test_images_base_dir_prefers_param() {
        let params: Params = [("images_base_dir", "/srv/images")].into_iter().collect();
        assert_eq!(params.images_base_dir(), PathBuf::from("/srv/images"));
        assert!(Params::new().images_base_dir().ends_with(APP_NAME));
    }
}
