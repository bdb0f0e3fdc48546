//! Typed deliverables and the agent→required-type mapping.
//!
//! Deliverables are the durable artifacts the kernel demands from an agent
//! before it may terminate. Each type tag maps to a filename inside
//! `workspace/deliverables/`; the coercion table rewrites whatever type the
//! model asked for into the one its agent actually owes, so an agent can
//! never mis-file an artifact.

use std::path::{Path, PathBuf};

/// Broad families a deliverable type belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliverableKind {
    Analysis,
    Queue,
    Evidence,
    FinalReport,
    Notes,
}

impl DeliverableKind {
    /// File extension for the family.
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Analysis | Self::FinalReport | Self::Notes => "md",
            Self::Queue | Self::Evidence => "json",
        }
    }
}

/// Classify a type tag into its family from the suffix convention.
pub fn kind_of(type_tag: &str) -> DeliverableKind {
    if type_tag == "FINAL_REPORT" || type_tag.ends_with("_REPORT") {
        DeliverableKind::FinalReport
    } else if type_tag.ends_with("_QUEUE") {
        DeliverableKind::Queue
    } else if type_tag.ends_with("_EVIDENCE") {
        DeliverableKind::Evidence
    } else if type_tag.ends_with("_ANALYSIS") {
        DeliverableKind::Analysis
    } else {
        DeliverableKind::Notes
    }
}

/// Filename for a deliverable type inside `deliverables/`.
pub fn filename_for(type_tag: &str) -> String {
    format!(
        "{}.{}",
        type_tag.to_lowercase(),
        kind_of(type_tag).extension()
    )
}

/// Absolute path for a deliverable type under a workspace.
pub fn path_for(workspace: &Path, type_tag: &str) -> PathBuf {
    workspace.join("deliverables").join(filename_for(type_tag))
}

/// Vulnerability family detection for agent names and requested types.
///
/// ORDER MATTERS: the specific injection families (`sqli`, `codei`, `ssti`,
/// `pathi`) must be checked before the generic `injection` substring, which
/// would otherwise swallow all four. The table is evaluated top to bottom
/// and the first match wins.
const FAMILY_CHECKS: &[(&str, &str)] = &[
    ("sqli", "SQLI"),
    ("codei", "CODEI"),
    ("ssti", "SSTI"),
    ("pathi", "PATHI"),
    ("injection", "SQLI"),
    ("xss", "XSS"),
    ("ssrf", "SSRF"),
    ("idor", "IDOR"),
    ("auth", "AUTH"),
];

/// Resolve the vulnerability family prefix for an agent name, if any.
pub fn family_prefix(agent: &str) -> Option<&'static str> {
    let lower = agent.to_lowercase();
    FAMILY_CHECKS
        .iter()
        .find(|(needle, _)| lower.contains(needle))
        .map(|(_, prefix)| *prefix)
}

/// Required deliverable type tags for an agent, or empty when the kernel
/// does not gate the agent's completion on deliverables.
pub fn required_types(agent: &str) -> Vec<String> {
    if agent == "report" || agent == "re-report" || agent == "osv-report" {
        return vec!["FINAL_REPORT".to_string()];
    }
    if let Some(prefix) = family_prefix(agent) {
        if agent.ends_with("-vuln") {
            return vec![format!("{prefix}_ANALYSIS"), format!("{prefix}_QUEUE")];
        }
        if agent.ends_with("-exploit") {
            return vec![format!("{prefix}_EVIDENCE")];
        }
    }
    match agent {
        "recon" => vec!["RECON_ANALYSIS".to_string()],
        "api-fuzzer" => vec!["FUZZING_ANALYSIS".to_string()],
        "re-static" => vec!["RE_ANALYSIS".to_string(), "RE_QUEUE".to_string()],
        "re-dynamic" => vec!["RE_EVIDENCE".to_string()],
        "osv-scan" => vec!["OSV_SCAN_ANALYSIS".to_string()],
        "osv-vuln" => vec!["OSV_ANALYSIS".to_string(), "OSV_QUEUE".to_string()],
        _ => Vec::new(),
    }
}

/// Coerce a requested deliverable type to one the agent actually owes.
///
/// The family prefix always comes from the agent; the kind is taken from
/// the request when the agent owes a deliverable of that kind, otherwise
/// the first still-owed required type wins. Agents without required types
/// keep whatever they asked for.
pub fn coerce_type(agent: &str, requested: &str) -> String {
    let required = required_types(agent);
    if required.is_empty() {
        return requested.to_string();
    }
    let requested_kind = kind_of(requested);
    if let Some(matching) = required.iter().find(|t| kind_of(t) == requested_kind) {
        return matching.clone();
    }
    required[0].clone()
}

/// Missing required types given the set already saved this run.
pub fn missing_types(agent: &str, saved: &std::collections::BTreeSet<String>) -> Vec<String> {
    required_types(agent)
        .into_iter()
        .filter(|t| !saved.contains(t))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn test_kind_classification() {
        assert_eq!(kind_of("SQLI_ANALYSIS"), DeliverableKind::Analysis);
        assert_eq!(kind_of("SQLI_QUEUE"), DeliverableKind::Queue);
        assert_eq!(kind_of("XSS_EVIDENCE"), DeliverableKind::Evidence);
        assert_eq!(kind_of("FINAL_REPORT"), DeliverableKind::FinalReport);
        assert_eq!(kind_of("SCRATCH"), DeliverableKind::Notes);
    }

    #[test]
    fn test_filenames_follow_family_extension() {
        assert_eq!(filename_for("SQLI_ANALYSIS"), "sqli_analysis.md");
        assert_eq!(filename_for("SQLI_QUEUE"), "sqli_queue.json");
        assert_eq!(filename_for("FINAL_REPORT"), "final_report.md");
    }

    #[test]
    fn test_path_for_lands_in_deliverables() {
        let p = path_for(Path::new("/work/app"), "AUTH_EVIDENCE");
        assert_eq!(p, Path::new("/work/app/deliverables/auth_evidence.json"));
    }

    #[test]
    fn test_family_specific_checks_precede_generic_injection() {
        // These all contain "i" patterns that the generic "injection" check
        // must not be allowed to swallow.
        assert_eq!(family_prefix("sqli-vuln"), Some("SQLI"));
        assert_eq!(family_prefix("codei-vuln"), Some("CODEI"));
        assert_eq!(family_prefix("ssti-vuln"), Some("SSTI"));
        assert_eq!(family_prefix("pathi-vuln"), Some("PATHI"));
        // A generic "injection" agent coerces to the SQLI family.
        assert_eq!(family_prefix("injection-vuln"), Some("SQLI"));
    }

    #[test]
    fn test_family_prefix_other_families() {
        assert_eq!(family_prefix("xss-exploit"), Some("XSS"));
        assert_eq!(family_prefix("ssrf-vuln"), Some("SSRF"));
        assert_eq!(family_prefix("idor-vuln"), Some("IDOR"));
        assert_eq!(family_prefix("auth-vuln"), Some("AUTH"));
        assert_eq!(family_prefix("recon"), None);
    }

    #[test]
    fn test_required_types_vuln_agents_owe_analysis_and_queue() {
        assert_eq!(required_types("sqli-vuln"), vec!["SQLI_ANALYSIS", "SQLI_QUEUE"]);
        assert_eq!(required_types("ssti-vuln"), vec!["SSTI_ANALYSIS", "SSTI_QUEUE"]);
    }

    #[test]
    fn test_required_types_exploit_agents_owe_evidence() {
        assert_eq!(required_types("xss-exploit"), vec!["XSS_EVIDENCE"]);
        assert_eq!(required_types("pathi-exploit"), vec!["PATHI_EVIDENCE"]);
    }

    #[test]
    fn test_required_types_reporting_agents() {
        assert_eq!(required_types("report"), vec!["FINAL_REPORT"]);
        assert_eq!(required_types("re-report"), vec!["FINAL_REPORT"]);
        assert_eq!(required_types("osv-report"), vec!["FINAL_REPORT"]);
    }

    #[test]
    fn test_required_types_ungated_agents_are_empty() {
        assert!(required_types("pre-recon").is_empty());
        assert!(required_types("login-check").is_empty());
        assert!(required_types("recon-verify").is_empty());
    }

    #[test]
    fn test_coerce_rewrites_wrong_family() {
        // The model tried to file an XSS analysis from the SQLI agent.
        assert_eq!(coerce_type("sqli-vuln", "XSS_ANALYSIS"), "SQLI_ANALYSIS");
        assert_eq!(coerce_type("sqli-vuln", "XSS_QUEUE"), "SQLI_QUEUE");
    }

    #[test]
    fn test_coerce_keeps_kind_when_owed() {
        assert_eq!(coerce_type("codei-vuln", "WHATEVER_QUEUE"), "CODEI_QUEUE");
        assert_eq!(coerce_type("report", "SQLI_ANALYSIS"), "FINAL_REPORT");
    }

    #[test]
    fn test_coerce_defaults_to_first_required() {
        // Evidence is not owed by an analysis agent; fall back to analysis.
        assert_eq!(coerce_type("sqli-vuln", "SQLI_EVIDENCE"), "SQLI_ANALYSIS");
    }

    #[test]
    fn test_coerce_passes_through_for_ungated_agents() {
        assert_eq!(coerce_type("pre-recon", "NOTES"), "NOTES");
    }

    #[test]
    fn test_missing_types_tracks_progress() {
        let mut saved = BTreeSet::new();
        assert_eq!(
            missing_types("sqli-vuln", &saved),
            vec!["SQLI_ANALYSIS", "SQLI_QUEUE"]
        );
        saved.insert("SQLI_ANALYSIS".to_string());
        assert_eq!(missing_types("sqli-vuln", &saved), vec!["SQLI_QUEUE"]);
        saved.insert("SQLI_QUEUE".to_string());
        assert!(missing_types("sqli-vuln", &saved).is_empty());
    }
}
