//! URL templates with `{name}` placeholders.

use super::Keys;
use serde::{Deserialize, Serialize};

/// Template for the NARR 3-hourly air temperature files on pressure levels.
pub const NARR_AIR_URL_TEMPLATE: &str =
    "https://psl.noaa.gov/thredds/dodsC/Datasets/NARR/pressure/air.{time}.nc";

/// Map a `YYYYMM` time label to its NARR OPeNDAP URL.
///
/// Any string is accepted; the result is not validated.
pub fn narr_air_url(time: &str) -> String {
    NARR_AIR_URL_TEMPLATE.replace("{time}", time)
}

/// A URL template such as `https://host/data/air.{time}.nc`.
///
/// Formatting never fails: placeholders without a matching key and unmatched
/// braces are copied through unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UrlTemplate(String);

impl UrlTemplate {
    pub fn new(template: impl Into<String>) -> Self {
        Self(template.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Names of all `{name}` placeholders, in order of appearance.
    pub fn placeholders(&self) -> Vec<&str> {
        let mut names = Vec::new();
        let mut rest = self.0.as_str();
        while let Some(open) = rest.find('{') {
            let after = &rest[open + 1..];
            match after.find('}') {
                Some(close) if is_placeholder_name(&after[..close]) => {
                    names.push(&after[..close]);
                    rest = &after[close + 1..];
                }
                _ => rest = after,
            }
        }
        names
    }

    /// Substitute every known placeholder.
    pub fn format(&self, keys: &Keys) -> String {
        let mut out = String::with_capacity(self.0.len() + 16);
        let mut rest = self.0.as_str();
        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            match after.find('}') {
                Some(close) if is_placeholder_name(&after[..close]) => {
                    let name = &after[..close];
                    match keys.get(name) {
                        Some(value) => out.push_str(value),
                        None => {
                            out.push('{');
                            out.push_str(name);
                            out.push('}');
                        }
                    }
                    rest = &after[close + 1..];
                }
                _ => {
                    out.push('{');
                    rest = after;
                }
            }
        }
        out.push_str(rest);
        out
    }
}

fn is_placeholder_name(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl From<&str> for UrlTemplate {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(pairs: &[(&str, &str)]) -> Keys {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_narr_air_url() {
        assert_eq!(
            narr_air_url("197901"),
            "https://psl.noaa.gov/thredds/dodsC/Datasets/NARR/pressure/air.197901.nc"
        );
    }

    #[test]
    fn test_narr_air_url_any_label() {
        for label in ["202312", "", "not-a-date", "a/b"] {
            let url = narr_air_url(label);
            let expected = format!(
                "https://psl.noaa.gov/thredds/dodsC/Datasets/NARR/pressure/air.{}.nc",
                label
            );
            assert_eq!(url, expected);
        }
    }

    #[test]
    fn test_template_matches_narr_formatter() {
        let template = UrlTemplate::new(NARR_AIR_URL_TEMPLATE);
        assert_eq!(
            template.format(&keys(&[("time", "197901")])),
            narr_air_url("197901")
        );
    }

    #[test]
    fn test_template_multiple_placeholders() {
        let template = UrlTemplate::new("https://host/{variable}/{time}/{variable}.nc");
        assert_eq!(template.placeholders(), vec!["variable", "time", "variable"]);
        assert_eq!(
            template.format(&keys(&[("time", "1981"), ("variable", "sst")])),
            "https://host/sst/1981/sst.nc"
        );
    }

    #[test]
    fn test_template_unknown_and_unmatched() {
        let template = UrlTemplate::new("a{missing}b{c");
        assert_eq!(template.format(&keys(&[])), "a{missing}b{c");

        let template = UrlTemplate::new("x{not valid}y{time}");
        assert_eq!(template.format(&keys(&[("time", "1")])), "x{not valid}y1");
    }
}
