//! QF-005: Placeholder interpolation.
//!
//! Resolves `{{key}}` placeholders against a [`ParameterMap`]. Substituted
//! values are not rescanned. A missing key or an unclosed `{{` is an error;
//! nothing is ever silently left in place.

use super::config::ParameterMap;
use super::error::TaskError;

/// Resolve all placeholders in `template`.
pub fn interpolate(template: &str, params: &ParameterMap) -> Result<String, TaskError> {
    let mut result = String::with_capacity(template.len());
    let mut rest = template;
    let mut offset = 0;

    while let Some(open) = rest.find("{{") {
        result.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        let close = after.find("}}").ok_or(TaskError::MalformedTemplate {
            position: offset + open,
        })?;
        let key = after[..close].trim();
        let value = params.get(key).ok_or_else(|| TaskError::Interpolation {
            key: key.to_string(),
        })?;
        result.push_str(&value.render());

        let consumed = open + 2 + close + 2;
        offset += consumed;
        rest = &rest[consumed..];
    }

    result.push_str(rest);
    Ok(result)
}

/// Resolve every template in `templates`, stopping at the first error.
pub fn interpolate_all(templates: &[String], params: &ParameterMap) -> Result<Vec<String>, TaskError> {
    templates.iter().map(|t| interpolate(t, params)).collect()
}

/// Keys referenced by `template`, in order of appearance.
pub fn placeholders(template: &str) -> Vec<String> {
    let mut keys = Vec::new();
    let mut rest = template;
    while let Some(open) = rest.find("{{") {
        let after = &rest[open + 2..];
        let Some(close) = after.find("}}") else {
            break;
        };
        keys.push(after[..close].trim().to_string());
        rest = &after[close + 2..];
    }
    keys
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::ParamValue;

    #[test]
    fn test_qf005_resolve_params() {
        let params = ParameterMap::from_pairs([("name", "world")]);
        assert_eq!(interpolate("hello {{name}}", &params).unwrap(), "hello world");
    }

    #[test]
    fn test_qf005_resolve_multiple_and_whitespace() {
        let params = ParameterMap::from_pairs([("a", "X"), ("b", "Y")]);
        assert_eq!(interpolate("{{a}}-{{ b }}", &params).unwrap(), "X-Y");
    }

    #[test]
    fn test_qf005_dotted_keys() {
        let params = ParameterMap::from_pairs([("run_mxqtl.outfile", "x.MxEQTL")]);
        assert_eq!(
            interpolate("{{run_mxqtl.outfile}}.cis", &params).unwrap(),
            "x.MxEQTL.cis"
        );
    }

    #[test]
    fn test_qf005_unknown_param() {
        let params = ParameterMap::default();
        let err = interpolate("run {{missing}}", &params).unwrap_err();
        assert!(matches!(err, TaskError::Interpolation { ref key } if key == "missing"));
    }

    #[test]
    fn test_qf005_unclosed() {
        let params = ParameterMap::from_pairs([("a", "1")]);
        let err = interpolate("{{a}} {{b", &params).unwrap_err();
        assert!(matches!(err, TaskError::MalformedTemplate { position: 6 }));
    }

    #[test]
    fn test_qf005_values_not_rescanned() {
        let params = ParameterMap::from_pairs([("a", "{{b}}")]);
        assert_eq!(interpolate("{{a}}", &params).unwrap(), "{{b}}");
    }

    #[test]
    fn test_qf005_single_braces_untouched() {
        let params = ParameterMap::default();
        let awk = "awk '{ freq[$1]++ } END { print }'";
        assert_eq!(interpolate(awk, &params).unwrap(), awk);
    }

    #[test]
    fn test_qf005_list_values() {
        let params = ParameterMap::from_pairs([(
            "covs",
            ParamValue::List(vec!["age".into(), "sex".into()]),
        )]);
        assert_eq!(interpolate("--cov {{covs}}", &params).unwrap(), "--cov age,sex");
    }

    #[test]
    fn test_qf005_placeholders() {
        assert_eq!(
            placeholders("{{a}} x {{ b.c }} {{unclosed"),
            vec!["a".to_string(), "b.c".to_string()]
        );
    }
}
