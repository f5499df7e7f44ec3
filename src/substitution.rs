//! The `${NAME}` / `$$` leaf-string substitution rule.
//!
//! This is deliberately a hand-written scanner rather than a general
//! templating engine (`tera` and friends): the rules are small, precise,
//! and include a type-preserving special case (a whole-string `${NAME}`
//! reference to a non-string value becomes that value, not its string
//! form) that generic template engines don't offer.

use std::collections::HashMap;

use serde_yaml::Value;

/// One segment of a scanned leaf string.
#[derive(Debug, PartialEq)]
enum Segment {
    Literal(String),
    Var(String),
}

/// Scans `s` left to right, honoring `$$` → `$`, `${NAME}` → variable
/// reference, and leaving a lone `$`/unterminated `${` as a literal.
///
/// A name is anything up to the next `}` (matching the original tool's
/// `VAR_PATTERN = re.compile(r'\${(.+?)}')`), not just identifier characters
/// — `${my.var}`/`${my-var}` are valid references.
fn scan(s: &str) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut literal = String::new();
    let chars: Vec<char> = s.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c == '$' && chars.get(i + 1) == Some(&'$') {
            literal.push('$');
            i += 2;
            continue;
        }
        if c == '$' && chars.get(i + 1) == Some(&'{') {
            // find closing brace
            if let Some(close) = chars[i + 2..].iter().position(|&c| c == '}') {
                let name: String = chars[i + 2..i + 2 + close].iter().collect();
                if !name.is_empty() {
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::Var(name));
                    i += 2 + close + 1;
                    continue;
                }
            }
            // no closing brace, or not a valid name: preserve literally
            literal.push(c);
            i += 1;
            continue;
        }
        literal.push(c);
        i += 1;
    }
    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }
    segments
}

fn value_to_plain_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Null => Some(String::new()),
        Value::Sequence(_) | Value::Mapping(_) | Value::Tagged(_) => None,
    }
}

#[derive(Debug)]
pub enum SubstitutionError {
    /// A non-string value was referenced inside a larger string instead of
    /// being the whole leaf value.
    NonStringInConcatenation { name: String },
}

/// The result of substituting one leaf string.
pub struct Substituted {
    pub value: Value,
    /// Names referenced in the leaf that were not present in `vars`.
    pub unresolved: Vec<String>,
}

/// Applies the substitution rule to one leaf string against `vars`.
pub fn substitute(s: &str, vars: &HashMap<String, Value>) -> Result<Substituted, SubstitutionError> {
    let segments = scan(s);
    let mut unresolved = Vec::new();

    if let [Segment::Var(name)] = segments.as_slice() {
        // Whole-string reference: type-preserving.
        return match vars.get(name) {
            Some(value) => Ok(Substituted {
                value: value.clone(),
                unresolved,
            }),
            None => {
                unresolved.push(name.clone());
                Ok(Substituted {
                    value: Value::String(format!("${{{name}}}")),
                    unresolved,
                })
            }
        };
    }

    let mut out = String::new();
    for segment in segments {
        match segment {
            Segment::Literal(lit) => out.push_str(&lit),
            Segment::Var(name) => match vars.get(&name) {
                Some(value) => match value_to_plain_string(value) {
                    Some(s) => out.push_str(&s),
                    None => return Err(SubstitutionError::NonStringInConcatenation { name }),
                },
                None => {
                    unresolved.push(name.clone());
                    out.push_str(&format!("${{{name}}}"));
                }
            },
        }
    }
    Ok(Substituted {
        value: Value::String(out),
        unresolved,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn double_dollar_escapes() {
        let v = vars(&[]);
        let r = substitute("price: $$5", &v).unwrap();
        assert_eq!(r.value, Value::String("price: $5".into()));
    }

    #[test]
    fn unterminated_brace_preserved() {
        let v = vars(&[]);
        let r = substitute("a ${b unterminated", &v).unwrap();
        assert_eq!(r.value, Value::String("a ${b unterminated".into()));
    }

    #[test]
    fn whole_string_reference_is_type_preserving() {
        let v = vars(&[("REPLICAS", Value::Number(3.into()))]);
        let r = substitute("${REPLICAS}", &v).unwrap();
        assert_eq!(r.value, Value::Number(3.into()));
    }

    #[test]
    fn non_string_in_concatenation_is_an_error() {
        let v = vars(&[("REPLICAS", Value::Number(3.into()))]);
        let err = substitute("replicas=${REPLICAS}!", &v).unwrap_err();
        matches!(err, SubstitutionError::NonStringInConcatenation { .. });
    }

    #[test]
    fn unresolved_variable_is_left_literal_and_reported() {
        let v = vars(&[]);
        let r = substitute("hello ${WORLD}", &v).unwrap();
        assert_eq!(r.value, Value::String("hello ${WORLD}".into()));
        assert_eq!(r.unresolved, vec!["WORLD".to_string()]);
    }

    #[test]
    fn name_with_dots_and_dashes_is_a_valid_reference() {
        let v = vars(&[("my.var-name", Value::String("ok".into()))]);
        let r = substitute("${my.var-name}", &v).unwrap();
        assert_eq!(r.value, Value::String("ok".into()));
    }

    #[test]
    fn lone_dollar_is_literal() {
        let v = vars(&[]);
        let r = substitute("cost: $ 5", &v).unwrap();
        assert_eq!(r.value, Value::String("cost: $ 5".into()));
    }
}
