//! Variable expansion and condition evaluation.
//!
//! Commands, arguments, directories and condition strings are expanded
//! against the node-visible environment: process env ∪ DAG env ∪ run
//! params ∪ ancestor outputs, plus `${STEP.outputs.KEY}` references that
//! address into a producing step's captured JSON.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use tracing::warn;

use crate::def::Condition;
use crate::errors::ExpandError;

static VAR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([^}]+)\}|\$([A-Za-z_][A-Za-z0-9_]*|[0-9]+)").unwrap()
});

/// The environment one node sees during expansion.
#[derive(Debug, Clone, Default)]
pub struct VarEnv {
    /// Flat variables (`KEY` → value).
    pub vars: BTreeMap<String, String>,
    /// Per-step output variables for `${STEP.outputs.KEY}` references.
    pub outputs: BTreeMap<String, BTreeMap<String, serde_json::Value>>,
}

impl VarEnv {
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(key.into(), value.into());
    }

    /// Substitute `$VAR`, `${VAR}` and `${STEP.outputs.KEY}` occurrences.
    /// Unknown references are left as written, the way a shell user would
    /// see them, so typos stay visible in logs.
    pub fn expand(&self, input: &str) -> String {
        VAR_RE
            .replace_all(input, |caps: &regex::Captures<'_>| {
                let name = caps
                    .get(1)
                    .or_else(|| caps.get(2))
                    .map(|m| m.as_str())
                    .unwrap_or_default();
                self.resolve(name)
                    .unwrap_or_else(|| caps.get(0).unwrap().as_str().to_string())
            })
            .into_owned()
    }

    fn resolve(&self, name: &str) -> Option<String> {
        if let Some((step, path)) = name.split_once(".outputs.") {
            let map = self.outputs.get(step)?;
            return lookup_json(map, path).map(value_to_string);
        }
        self.vars.get(name).cloned()
    }
}

/// Address into a step's output map: the first path segment picks the
/// output key, the rest descend into the captured JSON value.
fn lookup_json(
    map: &BTreeMap<String, serde_json::Value>,
    path: &str,
) -> Option<serde_json::Value> {
    let mut segments = path.split('.');
    let key = segments.next()?;
    let mut current = map.get(key)?.clone();
    for segment in segments {
        current = match current {
            serde_json::Value::Object(ref obj) => obj.get(segment)?.clone(),
            serde_json::Value::Array(ref arr) => {
                arr.get(segment.parse::<usize>().ok()?)?.clone()
            }
            _ => return None,
        };
    }
    Some(current)
}

fn value_to_string(value: serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    }
}

/// Match `text` against a pattern: `re:` prefix for a regex, substring
/// containment otherwise.
pub fn match_pattern(pattern: &str, text: &str) -> Result<bool, ExpandError> {
    if let Some(expr) = pattern.strip_prefix("re:") {
        let re =
            Regex::new(expr).map_err(|_| ExpandError::BadPattern(pattern.to_string()))?;
        Ok(re.is_match(text))
    } else {
        Ok(text.contains(pattern))
    }
}

/// Evaluate one precondition against the node environment.
///
/// The condition is expanded first. A backtick-wrapped condition is run as
/// a shell command and its trimmed stdout compared to `expected`; anything
/// else compares the expanded text directly. An empty `expected` means
/// "the command must exit 0" for command substitutions and "the expanded
/// text must be non-empty" otherwise.
pub async fn eval_condition(cond: &Condition, env: &VarEnv) -> Result<bool, ExpandError> {
    let expanded = env.expand(&cond.condition);
    let expected = env.expand(&cond.expected);

    let actual = match command_substitution(&expanded) {
        Some(command) => {
            let output = tokio::process::Command::new("sh")
                .arg("-c")
                .arg(&command)
                .envs(env.vars.iter())
                .output()
                .await
                .map_err(|source| ExpandError::Substitution {
                    command: command.clone(),
                    source,
                })?;
            if expected.is_empty() {
                return Ok(output.status.success());
            }
            String::from_utf8_lossy(&output.stdout).trim().to_string()
        }
        None => {
            if expected.is_empty() {
                return Ok(!expanded.is_empty());
            }
            expanded
        }
    };

    match_pattern_expected(&expected, &actual)
}

/// Expected values may be literal or `re:`-prefixed full-match regexes.
fn match_pattern_expected(expected: &str, actual: &str) -> Result<bool, ExpandError> {
    if let Some(expr) = expected.strip_prefix("re:") {
        let re = Regex::new(&format!("^(?:{expr})$"))
            .map_err(|_| ExpandError::BadPattern(expected.to_string()))?;
        Ok(re.is_match(actual))
    } else {
        Ok(expected == actual)
    }
}

fn command_substitution(text: &str) -> Option<String> {
    let trimmed = text.trim();
    if trimmed.len() >= 2 && trimmed.starts_with('`') && trimmed.ends_with('`') {
        return Some(trimmed[1..trimmed.len() - 1].to_string());
    }
    if trimmed.starts_with("$(") && trimmed.ends_with(')') {
        return Some(trimmed[2..trimmed.len() - 1].to_string());
    }
    None
}

/// Evaluate a whole precondition list; `Ok(None)` means all gates passed,
/// `Ok(Some(reason))` names the first unmet condition.
pub async fn eval_preconditions(
    conditions: &[Condition],
    env: &VarEnv,
) -> Result<Option<String>, ExpandError> {
    for cond in conditions {
        match eval_condition(cond, env).await {
            Ok(true) => {}
            Ok(false) => {
                return Ok(Some(format!(
                    "condition unmet: '{}' != '{}'",
                    cond.condition, cond.expected
                )));
            }
            Err(err) => {
                warn!(condition = %cond.condition, %err, "precondition evaluation failed");
                return Err(err);
            }
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env_with(pairs: &[(&str, &str)]) -> VarEnv {
        let mut env = VarEnv::default();
        for (k, v) in pairs {
            env.set(*k, *v);
        }
        env
    }

    #[test]
    fn expands_braced_and_bare_variables() {
        let env = env_with(&[("NAME", "world"), ("1", "first")]);
        assert_eq!(env.expand("hello $NAME"), "hello world");
        assert_eq!(env.expand("hello ${NAME}!"), "hello world!");
        assert_eq!(env.expand("positional $1"), "positional first");
        assert_eq!(env.expand("unknown $MISSING stays"), "unknown $MISSING stays");
    }

    #[test]
    fn expands_step_output_references() {
        let mut env = VarEnv::default();
        let mut outputs = BTreeMap::new();
        outputs.insert(
            "RESULT".to_string(),
            serde_json::json!({"count": 7, "items": ["x", "y"]}),
        );
        env.outputs.insert("fetch".to_string(), outputs);

        assert_eq!(env.expand("${fetch.outputs.RESULT.count}"), "7");
        assert_eq!(env.expand("${fetch.outputs.RESULT.items.1}"), "y");
        // Missing path stays as written.
        assert_eq!(
            env.expand("${fetch.outputs.RESULT.nope}"),
            "${fetch.outputs.RESULT.nope}"
        );
    }

    #[test]
    fn patterns_support_regex_prefix() {
        assert!(match_pattern("warn", "warning: low disk").unwrap());
        assert!(match_pattern("re:^exit [0-9]+$", "exit 42").unwrap());
        assert!(!match_pattern("re:^exit$", "exit 42").unwrap());
        assert!(match_pattern("re:(", "anything").is_err());
    }

    #[tokio::test]
    async fn literal_conditions_compare_expanded_text() {
        let env = env_with(&[("MODE", "prod")]);
        let cond = Condition {
            condition: "$MODE".into(),
            expected: "prod".into(),
        };
        assert!(eval_condition(&cond, &env).await.unwrap());

        let cond = Condition {
            condition: "$MODE".into(),
            expected: "staging".into(),
        };
        assert!(!eval_condition(&cond, &env).await.unwrap());
    }

    #[tokio::test]
    async fn backtick_conditions_run_commands() {
        let env = env_with(&[("GREETING", "hi")]);
        let cond = Condition {
            condition: "`echo $GREETING`".into(),
            expected: "hi".into(),
        };
        assert!(eval_condition(&cond, &env).await.unwrap());
    }

    #[tokio::test]
    async fn command_condition_without_expected_checks_exit_code() {
        let ok = Condition {
            condition: "`true`".into(),
            expected: String::new(),
        };
        assert!(eval_condition(&ok, &VarEnv::default()).await.unwrap());

        let bad = Condition {
            condition: "`false`".into(),
            expected: String::new(),
        };
        assert!(!eval_condition(&bad, &VarEnv::default()).await.unwrap());
    }

    #[tokio::test]
    async fn regex_expected_is_anchored() {
        let env = env_with(&[("V", "v1.2.3")]);
        let cond = Condition {
            condition: "$V".into(),
            expected: "re:v[0-9.]+".into(),
        };
        assert!(eval_condition(&cond, &env).await.unwrap());
    }
}
