//! IntentRouter — deterministic classification of untrusted text.
//!
//! A single ordered table of rules. Each rule has a *trigger* (does this
//! input belong to me?) and an optional *extractor* (pull literal parameters
//! out of it). Rules are tried in table order and the first trigger that
//! fires owns the input:
//!
//! - extractor succeeds (or there is none) → the rule's outcome;
//! - extractor fails → `Deny` as a malformed privileged request. No later
//!   rule is consulted, so a failed `read` is never retried as anything else.
//!
//! No trigger fires → `NoMatch`, which the orchestrator treats as a
//! non-privileged turn for the generative fallback.
//!
//! Matching is case-insensitive over the trimmed input. Captured parameters
//! are byte-for-byte slices of that trimmed input: the router never decodes,
//! normalizes, or resolves them. That is the gate's job.
//!
//! The router has no side effects and never consults the generative responder.

use std::collections::BTreeMap;

use regex::Regex;

use super::types::{RouteVerdict, RoutingDecision, RoutingKey};

// ─── Rule Table ─────────────────────────────────────────────────────────────

/// What a rule yields once its extractor succeeds.
#[derive(Debug, Clone, Copy)]
enum RuleOutcome {
    Route(RoutingKey),
    Deny,
}

/// Static description of one rule, compiled by [`IntentRouter::new`].
struct RuleSpec {
    name: &'static str,
    trigger: &'static str,
    extractor: Option<&'static str>,
    params: &'static [&'static str],
    outcome: RuleOutcome,
}

/// The routing table, in priority order.
///
/// 1. `list-resources`: fixed phrasings asking what can be read.
/// 2. `deny-destructive`: destructive or execution verbs are refused outright.
/// 3. `write-report`: `write report <name>: <content>`.
/// 4. `summarize-resource`: `summarize <name>`.
/// 5. `read-resource`: `read|open|cat <name>`.
const RULES: &[RuleSpec] = &[
    RuleSpec {
        name: "list-resources",
        trigger: r"(?i)^(?:(?:what|which)\s+(?:files|documents|resources)\s+(?:can|could)\s+you\s+(?:read|access|see|open)|what\s+(?:files|documents|resources)\s+(?:are\s+available|do\s+you\s+have)|(?:list|show)(?:\s+me)?(?:\s+the)?(?:\s+(?:available|allowed|readable))?\s+(?:files|documents|resources))\s*[?.!]*$",
        extractor: None,
        params: &[],
        outcome: RuleOutcome::Route(RoutingKey::ListResources),
    },
    RuleSpec {
        name: "deny-destructive",
        trigger: r"(?i)^(?:delete|remove|rm|erase|unlink|truncate|run|exec|execute|sudo|chmod|chown|mv|move)\b",
        extractor: None,
        params: &[],
        outcome: RuleOutcome::Deny,
    },
    RuleSpec {
        name: "write-report",
        trigger: r"(?i)^(?:write|save|create)\s+(?:a\s+)?report\b",
        extractor: Some(
            r"(?is)^(?:write|save|create)\s+(?:a\s+)?report\s+(?:named\s+|called\s+|to\s+|as\s+)?(?P<name>[^\s:]+)\s*(?::|\s+with\s+|\s+containing\s+)\s*(?P<content>\S.*)$",
        ),
        params: &["name", "content"],
        outcome: RuleOutcome::Route(RoutingKey::WriteReport),
    },
    RuleSpec {
        name: "summarize-resource",
        trigger: r"(?i)^summari[sz]e\b",
        extractor: Some(
            r"(?i)^summari[sz]e\s+(?:the\s+)?(?:file\s+|document\s+)?(?P<name>\S+?)[?!]?$",
        ),
        params: &["name"],
        outcome: RuleOutcome::Route(RoutingKey::SummarizeResource),
    },
    RuleSpec {
        name: "read-resource",
        trigger: r"(?i)^(?:read|open|cat)\b",
        extractor: Some(
            r"(?i)^(?:read|open|cat)\s+(?:me\s+)?(?:the\s+)?(?:contents?\s+of\s+)?(?:file\s+|document\s+)?(?P<name>\S+?)[?!]?$",
        ),
        params: &["name"],
        outcome: RuleOutcome::Route(RoutingKey::ReadResource),
    },
];

/// A compiled rule.
struct Rule {
    name: &'static str,
    trigger: Regex,
    extractor: Option<Regex>,
    params: &'static [&'static str],
    outcome: RuleOutcome,
}

// ─── IntentRouter ───────────────────────────────────────────────────────────

/// Compiled, immutable routing table.
pub struct IntentRouter {
    rules: Vec<Rule>,
}

impl IntentRouter {
    /// Compile the routing table.
    ///
    /// Fails only if a built-in pattern is invalid, which is a start-up error.
    pub fn new() -> Result<Self, regex::Error> {
        let rules = RULES
            .iter()
            .map(|spec| {
                Ok(Rule {
                    name: spec.name,
                    trigger: Regex::new(spec.trigger)?,
                    extractor: spec.extractor.map(Regex::new).transpose()?,
                    params: spec.params,
                    outcome: spec.outcome,
                })
            })
            .collect::<Result<Vec<_>, regex::Error>>()?;
        Ok(Self { rules })
    }

    /// Rule names in priority order.
    pub fn rule_names(&self) -> Vec<&'static str> {
        self.rules.iter().map(|r| r.name).collect()
    }

    /// Classify one input. Total and deterministic.
    pub fn route(&self, text: &str) -> RoutingDecision {
        let input = text.trim();

        for rule in &self.rules {
            if !rule.trigger.is_match(input) {
                continue;
            }

            let Some(extractor) = &rule.extractor else {
                return RoutingDecision::new(
                    verdict_for(rule.outcome),
                    Some(rule.name),
                    BTreeMap::new(),
                    text,
                );
            };

            return match extractor.captures(input) {
                Some(caps) => {
                    let params = rule
                        .params
                        .iter()
                        .filter_map(|p| {
                            caps.name(p)
                                .map(|m| ((*p).to_string(), m.as_str().to_string()))
                        })
                        .collect();
                    RoutingDecision::new(verdict_for(rule.outcome), Some(rule.name), params, text)
                }
                None => {
                    tracing::debug!(rule = rule.name, "router: trigger fired, extraction failed");
                    RoutingDecision::new(RouteVerdict::Deny, Some(rule.name), BTreeMap::new(), text)
                }
            };
        }

        RoutingDecision::new(RouteVerdict::NoMatch, None, BTreeMap::new(), text)
    }
}

fn verdict_for(outcome: RuleOutcome) -> RouteVerdict {
    match outcome {
        RuleOutcome::Route(key) => RouteVerdict::Matched(key),
        RuleOutcome::Deny => RouteVerdict::Deny,
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn router() -> IntentRouter {
        IntentRouter::new().unwrap()
    }

    #[test]
    fn test_priority_order_is_fixed() {
        assert_eq!(
            router().rule_names(),
            vec![
                "list-resources",
                "deny-destructive",
                "write-report",
                "summarize-resource",
                "read-resource",
            ]
        );
    }

    #[test]
    fn test_list_phrasings() {
        let r = router();
        for text in [
            "what files can you read",
            "What files can you read?",
            "  which documents could you access ",
            "list files",
            "show me the available files",
            "what resources are available?",
        ] {
            let d = r.route(text);
            assert_eq!(d.key(), Some(RoutingKey::ListResources), "{text}");
        }
    }

    #[test]
    fn test_read_extracts_literal_name() {
        let d = router().route("read public_info.txt");
        assert!(d.matched());
        assert_eq!(d.key(), Some(RoutingKey::ReadResource));
        assert_eq!(d.param("name"), Some("public_info.txt"));
        assert_eq!(d.rule(), Some("read-resource"));
    }

    #[test]
    fn test_extraction_preserves_case_and_encoding() {
        let r = router();
        assert_eq!(
            r.route("READ Public_Info.TXT").param("name"),
            Some("Public_Info.TXT")
        );
        assert_eq!(
            r.route("read %2e%2e%2fpasswd").param("name"),
            Some("%2e%2e%2fpasswd")
        );
        assert_eq!(
            r.route("read ../../etc/passwd").param("name"),
            Some("../../etc/passwd")
        );
    }

    #[test]
    fn test_read_variants() {
        let r = router();
        for text in [
            "open faq.md",
            "cat the file faq.md",
            "read me the contents of faq.md",
            "read faq.md?",
        ] {
            let d = r.route(text);
            assert_eq!(d.key(), Some(RoutingKey::ReadResource), "{text}");
            assert_eq!(d.param("name"), Some("faq.md"), "{text}");
        }
    }

    #[test]
    fn test_summarize_routes_to_its_own_key() {
        let d = router().route("summarize public_info.txt");
        assert_eq!(d.key(), Some(RoutingKey::SummarizeResource));
        assert_eq!(d.param("name"), Some("public_info.txt"));
        assert_eq!(
            router().route("Summarise the document faq.md").key(),
            Some(RoutingKey::SummarizeResource)
        );
    }

    #[test]
    fn test_write_report_extracts_name_and_content() {
        let d = router().route("write report incident.md: Server rebooted at 02:00.\nNo data lost.");
        assert_eq!(d.key(), Some(RoutingKey::WriteReport));
        assert_eq!(d.param("name"), Some("incident.md"));
        assert_eq!(
            d.param("content"),
            Some("Server rebooted at 02:00.\nNo data lost.")
        );

        let d = router().route("save a report called notes.txt with all clear");
        assert_eq!(d.param("name"), Some("notes.txt"));
        assert_eq!(d.param("content"), Some("all clear"));
    }

    #[test]
    fn test_destructive_verbs_are_denied() {
        let r = router();
        for text in ["delete public_info.txt", "rm -rf /", "run ls", "sudo cat x"] {
            let d = r.route(text);
            assert_eq!(d.verdict(), RouteVerdict::Deny, "{text}");
            assert_eq!(d.rule(), Some("deny-destructive"));
        }
    }

    #[test]
    fn test_failed_extraction_denies_without_trying_later_rules() {
        let r = router();

        let d = r.route("summarize");
        assert_eq!(d.verdict(), RouteVerdict::Deny);
        assert_eq!(d.rule(), Some("summarize-resource"));

        let d = r.route("read me a story about dragons");
        assert_eq!(d.verdict(), RouteVerdict::Deny);
        assert_eq!(d.rule(), Some("read-resource"));

        let d = r.route("write report without a body");
        assert_eq!(d.verdict(), RouteVerdict::Deny);
        assert_eq!(d.rule(), Some("write-report"));
    }

    #[test]
    fn test_no_match_for_chat() {
        let r = router();
        for text in ["tell me a joke", "", "   ", "what is a sandbox?", "readme please"] {
            let d = r.route(text);
            assert_eq!(d.verdict(), RouteVerdict::NoMatch, "{text:?}");
            assert!(d.params().is_empty());
            assert_eq!(d.rule(), None);
        }
    }

    #[test]
    fn test_routing_is_deterministic() {
        let r = router();
        for text in [
            "what files can you read",
            "read public_info.txt",
            "read ../../etc/passwd",
            "tell me a joke",
            "write report a.md: b",
        ] {
            assert_eq!(r.route(text), r.route(text));
            assert_eq!(r.route(text), router().route(text));
        }
    }

    #[test]
    fn test_raw_input_is_kept_verbatim() {
        let d = router().route("  read faq.md  ");
        assert_eq!(d.raw_input(), "  read faq.md  ");
    }

    #[test]
    fn test_pathological_input_does_not_panic() {
        let r = router();
        let long = "read ".to_string() + &"a".repeat(100_000);
        let _ = r.route(&long);
        let _ = r.route("\u{0}\u{feff}read\u{202e}txt.exe");
    }
}
