//! Static agent and phase definitions for the assessment pipelines.
//!
//! This module provides:
//! - `PhaseKind` and the fixed `PHASE_ORDER`
//! - `AgentSpec` descriptors for every agent in the three pipelines
//! - Lookup functions used by the scheduler and CLI
//!
//! The pipeline graph is fixed by design; nothing here is loaded from disk.

use serde::{Deserialize, Serialize};

/// The six phases of the main assessment pipeline, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PhaseKind {
    PreReconnaissance,
    Reconnaissance,
    ApiFuzzing,
    VulnerabilityAnalysis,
    Exploitation,
    Reporting,
}

impl PhaseKind {
    /// Stable kebab-case name used on the CLI and in audit events.
    pub fn name(&self) -> &'static str {
        match self {
            Self::PreReconnaissance => "pre-reconnaissance",
            Self::Reconnaissance => "reconnaissance",
            Self::ApiFuzzing => "api-fuzzing",
            Self::VulnerabilityAnalysis => "vulnerability-analysis",
            Self::Exploitation => "exploitation",
            Self::Reporting => "reporting",
        }
    }

    /// Parse a phase name as given on the CLI.
    pub fn parse(name: &str) -> Option<Self> {
        PHASE_ORDER.iter().copied().find(|p| p.name() == name)
    }

    /// Fan-out phases run their agents under the concurrency semaphore;
    /// all others run strictly in order.
    pub fn is_fan_out(&self) -> bool {
        matches!(self, Self::VulnerabilityAnalysis | Self::Exploitation)
    }
}

impl std::fmt::Display for PhaseKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Fixed phase execution order for the main pipeline.
pub const PHASE_ORDER: [PhaseKind; 6] = [
    PhaseKind::PreReconnaissance,
    PhaseKind::Reconnaissance,
    PhaseKind::ApiFuzzing,
    PhaseKind::VulnerabilityAnalysis,
    PhaseKind::Exploitation,
    PhaseKind::Reporting,
];

/// Which pipeline a run belongs to. The reverse-engineering and
/// open-source-vulnerability pipelines are standalone agent sets selected
/// at the CLI level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Pipeline {
    #[default]
    Main,
    ReverseEngineering,
    OpenSourceVuln,
}

/// Static descriptor for one agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentSpec {
    /// Canonical agent name (kebab-case, unique across pipelines).
    pub name: &'static str,
    /// Human-readable display name.
    pub display_name: &'static str,
    /// Phase this agent belongs to.
    pub phase: PhaseKind,
    /// Position within the pipeline; rollback removes all later agents.
    pub order: u32,
    /// Agents that must be completed before this one is eligible.
    pub prerequisites: &'static [&'static str],
}

/// The main web-assessment pipeline.
static MAIN_AGENTS: &[AgentSpec] = &[
    AgentSpec {
        name: "pre-recon",
        display_name: "Pre-Reconnaissance",
        phase: PhaseKind::PreReconnaissance,
        order: 1,
        prerequisites: &[],
    },
    AgentSpec {
        name: "login-check",
        display_name: "Login Verification",
        phase: PhaseKind::PreReconnaissance,
        order: 2,
        prerequisites: &["pre-recon"],
    },
    AgentSpec {
        name: "recon",
        display_name: "Reconnaissance",
        phase: PhaseKind::Reconnaissance,
        order: 3,
        prerequisites: &["pre-recon"],
    },
    AgentSpec {
        name: "recon-verify",
        display_name: "Reconnaissance Verification",
        phase: PhaseKind::Reconnaissance,
        order: 4,
        prerequisites: &["recon"],
    },
    AgentSpec {
        name: "api-fuzzer",
        display_name: "API Fuzzing",
        phase: PhaseKind::ApiFuzzing,
        order: 5,
        prerequisites: &["recon"],
    },
    AgentSpec {
        name: "sqli-vuln",
        display_name: "SQL Injection Analysis",
        phase: PhaseKind::VulnerabilityAnalysis,
        order: 6,
        prerequisites: &["recon"],
    },
    AgentSpec {
        name: "xss-vuln",
        display_name: "Cross-Site Scripting Analysis",
        phase: PhaseKind::VulnerabilityAnalysis,
        order: 7,
        prerequisites: &["recon"],
    },
    AgentSpec {
        name: "ssrf-vuln",
        display_name: "Server-Side Request Forgery Analysis",
        phase: PhaseKind::VulnerabilityAnalysis,
        order: 8,
        prerequisites: &["recon"],
    },
    AgentSpec {
        name: "idor-vuln",
        display_name: "Authorization Bypass Analysis",
        phase: PhaseKind::VulnerabilityAnalysis,
        order: 9,
        prerequisites: &["recon"],
    },
    AgentSpec {
        name: "auth-vuln",
        display_name: "Authentication Weakness Analysis",
        phase: PhaseKind::VulnerabilityAnalysis,
        order: 10,
        prerequisites: &["recon"],
    },
    AgentSpec {
        name: "codei-vuln",
        display_name: "Code Injection Analysis",
        phase: PhaseKind::VulnerabilityAnalysis,
        order: 11,
        prerequisites: &["recon"],
    },
    AgentSpec {
        name: "ssti-vuln",
        display_name: "Template Injection Analysis",
        phase: PhaseKind::VulnerabilityAnalysis,
        order: 12,
        prerequisites: &["recon"],
    },
    AgentSpec {
        name: "pathi-vuln",
        display_name: "Path Traversal Analysis",
        phase: PhaseKind::VulnerabilityAnalysis,
        order: 13,
        prerequisites: &["recon"],
    },
    AgentSpec {
        name: "sqli-exploit",
        display_name: "SQL Injection Exploitation",
        phase: PhaseKind::Exploitation,
        order: 14,
        prerequisites: &["sqli-vuln"],
    },
    AgentSpec {
        name: "xss-exploit",
        display_name: "Cross-Site Scripting Exploitation",
        phase: PhaseKind::Exploitation,
        order: 15,
        prerequisites: &["xss-vuln"],
    },
    AgentSpec {
        name: "ssrf-exploit",
        display_name: "Server-Side Request Forgery Exploitation",
        phase: PhaseKind::Exploitation,
        order: 16,
        prerequisites: &["ssrf-vuln"],
    },
    AgentSpec {
        name: "idor-exploit",
        display_name: "Authorization Bypass Exploitation",
        phase: PhaseKind::Exploitation,
        order: 17,
        prerequisites: &["idor-vuln"],
    },
    AgentSpec {
        name: "auth-exploit",
        display_name: "Authentication Weakness Exploitation",
        phase: PhaseKind::Exploitation,
        order: 18,
        prerequisites: &["auth-vuln"],
    },
    AgentSpec {
        name: "codei-exploit",
        display_name: "Code Injection Exploitation",
        phase: PhaseKind::Exploitation,
        order: 19,
        prerequisites: &["codei-vuln"],
    },
    AgentSpec {
        name: "ssti-exploit",
        display_name: "Template Injection Exploitation",
        phase: PhaseKind::Exploitation,
        order: 20,
        prerequisites: &["ssti-vuln"],
    },
    AgentSpec {
        name: "pathi-exploit",
        display_name: "Path Traversal Exploitation",
        phase: PhaseKind::Exploitation,
        order: 21,
        prerequisites: &["pathi-vuln"],
    },
    AgentSpec {
        name: "report",
        display_name: "Final Report",
        phase: PhaseKind::Reporting,
        order: 22,
        prerequisites: &[],
    },
];

/// The standalone reverse-engineering pipeline over a binary path.
static RE_AGENTS: &[AgentSpec] = &[
    AgentSpec {
        name: "re-triage",
        display_name: "Binary Triage",
        phase: PhaseKind::PreReconnaissance,
        order: 1,
        prerequisites: &[],
    },
    AgentSpec {
        name: "re-static",
        display_name: "Static Analysis",
        phase: PhaseKind::VulnerabilityAnalysis,
        order: 2,
        prerequisites: &["re-triage"],
    },
    AgentSpec {
        name: "re-dynamic",
        display_name: "Dynamic Analysis",
        phase: PhaseKind::VulnerabilityAnalysis,
        order: 3,
        prerequisites: &["re-triage"],
    },
    AgentSpec {
        name: "re-report",
        display_name: "Reverse-Engineering Report",
        phase: PhaseKind::Reporting,
        order: 4,
        prerequisites: &[],
    },
];

/// The standalone open-source-vulnerability pipeline over a repository.
static OSV_AGENTS: &[AgentSpec] = &[
    AgentSpec {
        name: "osv-scan",
        display_name: "Dependency Scan",
        phase: PhaseKind::PreReconnaissance,
        order: 1,
        prerequisites: &[],
    },
    AgentSpec {
        name: "osv-vuln",
        display_name: "Open-Source Vulnerability Analysis",
        phase: PhaseKind::VulnerabilityAnalysis,
        order: 2,
        prerequisites: &["osv-scan"],
    },
    AgentSpec {
        name: "osv-report",
        display_name: "Open-Source Vulnerability Report",
        phase: PhaseKind::Reporting,
        order: 3,
        prerequisites: &[],
    },
];

/// All agents in a pipeline, ordered by `order`.
pub fn agents_for(pipeline: Pipeline) -> &'static [AgentSpec] {
    match pipeline {
        Pipeline::Main => MAIN_AGENTS,
        Pipeline::ReverseEngineering => RE_AGENTS,
        Pipeline::OpenSourceVuln => OSV_AGENTS,
    }
}

/// Look up an agent by name across a specific pipeline.
pub fn get_agent(pipeline: Pipeline, name: &str) -> Option<&'static AgentSpec> {
    agents_for(pipeline).iter().find(|a| a.name == name)
}

/// Look up an agent by name across all pipelines.
pub fn find_agent(name: &str) -> Option<&'static AgentSpec> {
    [
        Pipeline::Main,
        Pipeline::ReverseEngineering,
        Pipeline::OpenSourceVuln,
    ]
    .into_iter()
    .find_map(|p| get_agent(p, name))
}

/// Agents of a pipeline belonging to a phase, ordered by `order`.
pub fn agents_in_phase(pipeline: Pipeline, phase: PhaseKind) -> Vec<&'static AgentSpec> {
    agents_for(pipeline)
        .iter()
        .filter(|a| a.phase == phase)
        .collect()
}

/// Names of every agent in a pipeline.
pub fn agent_names(pipeline: Pipeline) -> Vec<&'static str> {
    agents_for(pipeline).iter().map(|a| a.name).collect()
}

/// Agents with order strictly greater than the named agent's order.
/// Used by rollback to clear downstream checkpoints.
pub fn agents_after(pipeline: Pipeline, name: &str) -> Vec<&'static AgentSpec> {
    let Some(anchor) = get_agent(pipeline, name) else {
        return Vec::new();
    };
    agents_for(pipeline)
        .iter()
        .filter(|a| a.order > anchor.order)
        .collect()
}

/// True when an agent performs deep source analysis and gets the wider
/// redundant-search allowance in loop detection.
pub fn is_deep_analysis_agent(name: &str) -> bool {
    name.ends_with("-vuln") || name == "re-static" || name == "osv-vuln"
}

/// True when an agent performs exploitation and gets the wider recent
/// window during history compression.
pub fn is_exploitation_agent(name: &str) -> bool {
    name.ends_with("-exploit") || name == "re-dynamic"
}

/// True when an agent writes the final report.
pub fn is_reporting_agent(name: &str) -> bool {
    matches!(name, "report" | "re-report" | "osv-report")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_phase_order_is_fixed() {
        assert_eq!(PHASE_ORDER.len(), 6);
        assert_eq!(PHASE_ORDER[0], PhaseKind::PreReconnaissance);
        assert_eq!(PHASE_ORDER[5], PhaseKind::Reporting);
    }

    #[test]
    fn test_phase_parse_round_trips() {
        for phase in PHASE_ORDER {
            assert_eq!(PhaseKind::parse(phase.name()), Some(phase));
        }
        assert_eq!(PhaseKind::parse("warp-core"), None);
    }

    #[test]
    fn test_fan_out_phases() {
        assert!(PhaseKind::VulnerabilityAnalysis.is_fan_out());
        assert!(PhaseKind::Exploitation.is_fan_out());
        assert!(!PhaseKind::Reconnaissance.is_fan_out());
        assert!(!PhaseKind::Reporting.is_fan_out());
    }

    #[test]
    fn test_agent_names_unique_within_pipeline() {
        for pipeline in [
            Pipeline::Main,
            Pipeline::ReverseEngineering,
            Pipeline::OpenSourceVuln,
        ] {
            let names: Vec<_> = agent_names(pipeline);
            let set: HashSet<_> = names.iter().collect();
            assert_eq!(names.len(), set.len(), "duplicate agent in {pipeline:?}");
        }
    }

    #[test]
    fn test_orders_strictly_increasing() {
        for pipeline in [
            Pipeline::Main,
            Pipeline::ReverseEngineering,
            Pipeline::OpenSourceVuln,
        ] {
            let agents = agents_for(pipeline);
            for pair in agents.windows(2) {
                assert!(
                    pair[0].order < pair[1].order,
                    "orders not increasing in {pipeline:?}"
                );
            }
        }
    }

    #[test]
    fn test_prerequisites_reference_known_earlier_agents() {
        for pipeline in [
            Pipeline::Main,
            Pipeline::ReverseEngineering,
            Pipeline::OpenSourceVuln,
        ] {
            for agent in agents_for(pipeline) {
                for prereq in agent.prerequisites {
                    let dep = get_agent(pipeline, prereq)
                        .unwrap_or_else(|| panic!("{} depends on unknown {prereq}", agent.name));
                    assert!(
                        dep.order < agent.order,
                        "{} depends on later agent {prereq}",
                        agent.name
                    );
                }
            }
        }
    }

    #[test]
    fn test_every_exploit_agent_requires_its_analysis() {
        for agent in agents_for(Pipeline::Main) {
            if let Some(family) = agent.name.strip_suffix("-exploit") {
                assert_eq!(agent.prerequisites.len(), 1);
                assert_eq!(
                    agent.prerequisites[0],
                    format!("{family}-vuln"),
                    "{} must require its analysis agent",
                    agent.name
                );
            }
        }
    }

    #[test]
    fn test_reporting_agent_has_no_prerequisites() {
        // The report always runs, even after upstream failures.
        let report = get_agent(Pipeline::Main, "report").unwrap();
        assert!(report.prerequisites.is_empty());
        assert_eq!(report.phase, PhaseKind::Reporting);
    }

    #[test]
    fn test_agents_after_recon() {
        let later = agents_after(Pipeline::Main, "recon");
        assert!(later.iter().any(|a| a.name == "recon-verify"));
        assert!(later.iter().any(|a| a.name == "report"));
        assert!(later.iter().all(|a| a.name != "pre-recon"));
    }

    #[test]
    fn test_agents_after_unknown_is_empty() {
        assert!(agents_after(Pipeline::Main, "nope").is_empty());
    }

    #[test]
    fn test_agents_in_phase_vuln_analysis_is_fan_out_set() {
        let vuln = agents_in_phase(Pipeline::Main, PhaseKind::VulnerabilityAnalysis);
        assert_eq!(vuln.len(), 8);
        assert!(vuln.iter().all(|a| a.name.ends_with("-vuln")));
    }

    #[test]
    fn test_find_agent_across_pipelines() {
        assert_eq!(find_agent("recon").unwrap().phase, PhaseKind::Reconnaissance);
        assert_eq!(
            find_agent("re-triage").unwrap().display_name,
            "Binary Triage"
        );
        assert_eq!(find_agent("osv-scan").unwrap().order, 1);
        assert!(find_agent("missing").is_none());
    }

    #[test]
    fn test_agent_kind_classification() {
        assert!(is_deep_analysis_agent("sqli-vuln"));
        assert!(is_exploitation_agent("sqli-exploit"));
        assert!(is_reporting_agent("report"));
        assert!(!is_deep_analysis_agent("recon"));
        assert!(!is_exploitation_agent("report"));
        assert!(!is_reporting_agent("api-fuzzer"));
    }

    #[test]
    fn test_standalone_pipelines_are_disjoint_from_main() {
        let main: HashSet<_> = agent_names(Pipeline::Main).into_iter().collect();
        for name in agent_names(Pipeline::ReverseEngineering)
            .into_iter()
            .chain(agent_names(Pipeline::OpenSourceVuln))
        {
            assert!(!main.contains(name), "{name} overlaps the main pipeline");
        }
    }
}
