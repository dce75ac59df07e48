/// String helpers for settings overrides and log output.
pub struct StringUtil;

impl StringUtil {
    /// Convert a string to a boolean.
    ///
    /// Valid true values: `"1"`, `"true"`, `"yes"`, `"on"` (case-insensitive).
    /// Valid false values: `"0"`, `"false"`, `"no"`, `"off"` (case-insensitive).
    /// Returns `None` for unrecognized values.
    pub fn convert_to_bool(value: &str) -> Option<bool> {
        match value.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" => Some(false),
            _ => None,
        }
    }

    /// Split a comma separated list, dropping empty items.
    pub fn split_list(value: &str) -> Vec<String> {
        value
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn convert_to_bool_values() {
        assert_eq!(StringUtil::convert_to_bool("TRUE"), Some(true));
        assert_eq!(StringUtil::convert_to_bool(" on "), Some(true));
        assert_eq!(StringUtil::convert_to_bool("0"), Some(false));
        assert_eq!(StringUtil::convert_to_bool("off"), Some(false));
        assert_eq!(StringUtil::convert_to_bool(""), None);
        assert_eq!(StringUtil::convert_to_bool("maybe"), None);
    }

    #[test]
    fn split_list_drops_empty() {
        assert_eq!(
            StringUtil::split_list("a:1, ,b:2,"),
            vec!["a:1".to_string(), "b:2".to_string()]
        );
        assert!(StringUtil::split_list("").is_empty());
    }
}
