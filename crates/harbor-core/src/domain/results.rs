//! Result extraction from operation logs

use regex::Regex;
use std::collections::BTreeMap;
use tracing::warn;

use super::job_definition::ResultRule;
use crate::types::{LogEntry, LogType};

/// Apply result rules to the logs of an operation
///
/// Rules are applied in declaration order. Each rule looks at the log entries
/// whose type it accepts (container output when the rule lists none) and keeps the
/// first capture group of the first match, or the whole match when the
/// pattern has no group. Rules without a match leave their key absent.
pub fn extract_results(rules: &[ResultRule], logs: &[LogEntry]) -> BTreeMap<String, String> {
    let mut results = BTreeMap::new();

    for rule in rules {
        let regex = match Regex::new(&rule.regex) {
            Ok(regex) => regex,
            Err(err) => {
                warn!(result = %rule.name, error = %err, "Skipping result rule with invalid regex");
                continue;
            }
        };

        let value = logs
            .iter()
            .filter(|entry| accepts(rule, entry.log_type))
            .find_map(|entry| {
                regex.captures(&entry.log).map(|caps| {
                    caps.get(1)
                        .or_else(|| caps.get(0))
                        .map(|m| m.as_str().to_string())
                        .unwrap_or_default()
                })
            });

        if let Some(value) = value {
            results.insert(rule.name.clone(), value);
        }
    }

    results
}

fn accepts(rule: &ResultRule, log_type: LogType) -> bool {
    if rule.log_type.is_empty() {
        matches!(log_type, LogType::Stdout | LogType::Stderr)
    } else {
        rule.log_type.contains(&log_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn rule(name: &str, regex: &str, log_type: Vec<LogType>) -> ResultRule {
        ResultRule {
            name: name.to_string(),
            regex: regex.to_string(),
            log_type,
        }
    }

    #[test]
    fn test_first_capture_group_of_first_match() {
        let logs = vec![
            LogEntry::stdout("starting\n"),
            LogEntry::stdout("RESULT=42\n"),
            LogEntry::stdout("RESULT=43\n"),
        ];

        let results = extract_results(&[rule("answer", r"RESULT=(\d+)", vec![LogType::Stdout])], &logs);

        assert_eq!(results.get("answer").map(String::as_str), Some("42"));
    }

    #[test]
    fn test_no_match_leaves_key_absent() {
        let logs = vec![LogEntry::stdout("nothing to see\n")];

        let results = extract_results(&[rule("answer", r"RESULT=(\d+)", vec![])], &logs);

        assert!(results.is_empty());
    }

    #[test]
    fn test_log_type_filter() {
        let logs = vec![LogEntry::stdout("RESULT=1\n"), LogEntry::stderr("RESULT=2\n")];

        let results = extract_results(
            &[
                rule("err", r"RESULT=(\d+)", vec![LogType::Stderr]),
                rule("any", r"RESULT=(\d+)", vec![]),
            ],
            &logs,
        );

        assert_eq!(results.get("err").map(String::as_str), Some("2"));
        assert_eq!(results.get("any").map(String::as_str), Some("1"));
    }

    #[test]
    fn test_whole_match_without_group_and_invalid_regex_skipped() {
        let logs = vec![LogEntry::stdout("done in 12ms\n")];

        let results = extract_results(
            &[rule("broken", r"(unclosed", vec![]), rule("timing", r"\d+ms", vec![])],
            &logs,
        );

        assert_eq!(results.len(), 1);
        assert_eq!(results.get("timing").map(String::as_str), Some("12ms"));
    }

    #[test]
    fn test_untyped_rule_ignores_engine_lines() {
        let logs = vec![
            LogEntry::container("Pulling image ubuntu:22.04"),
            LogEntry::stderr("using image alpine\n"),
        ];

        let results = extract_results(&[rule("image", r"image (\S+)", vec![])], &logs);

        assert_eq!(results.get("image").map(String::as_str), Some("alpine"));
    }
}
