//! Read-only aggregation over the `runs` table.

pub mod domains;

use crate::db::{Database, MethodCount};
use crate::errors::{AppError, AppResult};
use crate::models::{BypassMethod, RunRecord};
use clap::ValueEnum;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// TLS failure messages whose occurrence is counted per method.
pub const TRACKED_TLS_ERRORS: [&str; 4] = [
    "The client disconnected during the handshake",
    domains::UNTRUSTED_CERTIFICATE_MARKER,
    "connection closed early",
    "Client and mitmproxy cannot agree on a TLS version to use",
];

/// How a domain counts as solved by a bypass method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum SolvedDomainPolicy {
    /// Pinned under the baseline run of an app and not under that app's run with the method.
    #[default]
    PerApp,
    /// Pinned in any baseline run and in no run with the method.
    AcrossRuns,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetComparison {
    /// In the second set only.
    pub added: Vec<String>,
    /// In the first set only.
    pub removed: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    pub crashes: Vec<MethodCount>,
    pub tls_error_counts: Vec<(String, Vec<MethodCount>)>,
    pub any_tls_error: Vec<MethodCount>,
    pub baseline_domains: BTreeSet<String>,
    pub unsolved_domains: BTreeSet<String>,
    pub solved: BTreeMap<BypassMethod, BTreeSet<String>>,
    pub comparison: SetComparison,
}

/// Fails when an app lacks a run for one of the methods.
pub fn ensure_complete(db: &Database) -> AppResult<()> {
    let incomplete = db.incomplete_apps()?;
    if incomplete.is_empty() {
        return Ok(());
    }
    Err(AppError::Invariant(format!(
        "The following apps don't have results for all methods: {}",
        incomplete.join(", ")
    )))
}

/// Domains whose certificate the app refused during this run.
pub fn untrusted_domains(run: &RunRecord) -> BTreeSet<String> {
    run.tls_errors
        .iter()
        .filter(|event| event.is_untrusted_certificate())
        .filter_map(|event| event.server_domain())
        .map(str::to_string)
        .collect()
}

pub fn solved_domains(
    runs: &[RunRecord],
    policy: SolvedDomainPolicy,
) -> AppResult<BTreeMap<BypassMethod, BTreeSet<String>>> {
    let mut solved: BTreeMap<BypassMethod, BTreeSet<String>> = BypassMethod::ALL
        .iter()
        .filter(|method| !method.is_baseline())
        .map(|method| (*method, BTreeSet::new()))
        .collect();

    match policy {
        SolvedDomainPolicy::PerApp => {
            let baselines: BTreeMap<&str, BTreeSet<String>> = runs
                .iter()
                .filter(|run| run.method.is_baseline())
                .map(|run| (run.app_id.as_str(), untrusted_domains(run)))
                .collect();

            for run in runs.iter().filter(|run| !run.method.is_baseline()) {
                let baseline = baselines.get(run.app_id.as_str()).ok_or_else(|| {
                    AppError::Invariant(format!("No run without bypass found for {}", run.app_id))
                })?;
                let remaining = untrusted_domains(run);
                solved
                    .entry(run.method)
                    .or_default()
                    .extend(baseline.difference(&remaining).cloned());
            }
        }
        SolvedDomainPolicy::AcrossRuns => {
            let baseline = domains_for(runs, |method| method.is_baseline());
            for (method, domains) in solved.iter_mut() {
                let remaining = domains_for(runs, |candidate| candidate == *method);
                domains.extend(baseline.difference(&remaining).cloned());
            }
        }
    }
    Ok(solved)
}

fn domains_for(runs: &[RunRecord], include: impl Fn(BypassMethod) -> bool) -> BTreeSet<String> {
    runs.iter()
        .filter(|run| include(run.method))
        .flat_map(untrusted_domains)
        .collect()
}

pub fn compare_sets(first: &BTreeSet<String>, second: &BTreeSet<String>) -> SetComparison {
    SetComparison {
        added: second.difference(first).cloned().collect(),
        removed: first.difference(second).cloned().collect(),
    }
}

pub fn build_report(db: &Database, policy: SolvedDomainPolicy) -> AppResult<Report> {
    ensure_complete(db)?;

    let mut tls_error_counts = Vec::with_capacity(TRACKED_TLS_ERRORS.len());
    for needle in TRACKED_TLS_ERRORS {
        tls_error_counts.push((needle.to_string(), db.apps_with_tls_error(needle)?));
    }

    let runs = db.list_runs()?;
    let solved = solved_domains(&runs, policy)?;
    let empty = BTreeSet::new();
    let comparison = compare_sets(
        solved.get(&BypassMethod::Objection).unwrap_or(&empty),
        solved.get(&BypassMethod::Httptoolkit).unwrap_or(&empty),
    );

    Ok(Report {
        crashes: db.crashes_per_method()?,
        tls_error_counts,
        any_tls_error: db.apps_with_any_tls_error()?,
        baseline_domains: domains_for(&runs, |method| method.is_baseline()),
        unsolved_domains: domains_for(&runs, |method| !method.is_baseline()),
        solved,
        comparison,
    })
}

fn write_counts(f: &mut fmt::Formatter<'_>, counts: &[MethodCount]) -> fmt::Result {
    if counts.is_empty() {
        return writeln!(f, "  (none)");
    }
    for count in counts {
        writeln!(f, "  {:<12} {}", count.method, count.count)?;
    }
    Ok(())
}

fn write_domains(f: &mut fmt::Formatter<'_>, domains: &BTreeSet<String>) -> fmt::Result {
    if domains.is_empty() {
        return writeln!(f, "  (none)");
    }
    for domain in domains {
        writeln!(f, "  {}", domain)?;
    }
    Ok(())
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Crashes per method:")?;
        write_counts(f, &self.crashes)?;
        for (needle, counts) in &self.tls_error_counts {
            writeln!(f, "Apps per method with TLS error \"{}\":", needle)?;
            write_counts(f, counts)?;
        }
        writeln!(f, "Apps per method with any TLS error:")?;
        write_counts(f, &self.any_tls_error)?;
        writeln!(f, "Domains with untrusted certificate without bypass ({}):", self.baseline_domains.len())?;
        write_domains(f, &self.baseline_domains)?;
        writeln!(f, "Unsolved domains despite bypass ({}):", self.unsolved_domains.len())?;
        write_domains(f, &self.unsolved_domains)?;
        writeln!(f, "Solved domains per method:")?;
        for (method, domains) in &self.solved {
            writeln!(f, "  {:<12} {}", method.as_str(), domains.len())?;
        }
        writeln!(f, "Comparing solved domains between objection and httptoolkit:")?;
        writeln!(f, "  added:   {}", self.comparison.added.join(", "))?;
        writeln!(f, "  removed: {}", self.comparison.removed.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::{build_report, compare_sets, ensure_complete, solved_domains, SolvedDomainPolicy};
    use crate::db::Database;
    use crate::errors::AppError;
    use crate::models::{BypassMethod, RunRecord, TlsFailureEvent};
    use std::collections::BTreeSet;

    fn untrusted(domain: &str) -> TlsFailureEvent {
        TlsFailureEvent::new(format!(
            "The client does not trust the proxy's certificate for {} (tlsv1 alert unknown ca)",
            domain
        ))
    }

    fn run(app_id: &str, method: BypassMethod, tls_errors: Vec<TlsFailureEvent>) -> RunRecord {
        RunRecord {
            app_id: app_id.to_string(),
            version: "1.0".to_string(),
            method,
            request_count: 0,
            tls_errors,
            app_crashed: false,
        }
    }

    fn set(values: &[&str]) -> BTreeSet<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn baseline_domain_missing_under_method_is_solved() {
        let runs = vec![
            run("A", BypassMethod::None, vec![untrusted("x.example.com")]),
            run("A", BypassMethod::Objection, Vec::new()),
            run("A", BypassMethod::Httptoolkit, vec![untrusted("x.example.com")]),
        ];
        let solved = solved_domains(&runs, SolvedDomainPolicy::PerApp).expect("solved");
        assert_eq!(solved[&BypassMethod::Objection], set(&["x.example.com"]));
        assert!(solved[&BypassMethod::Httptoolkit].is_empty());
    }

    #[test]
    fn policies_differ_when_domain_fails_in_another_app() {
        let runs = vec![
            run("A", BypassMethod::None, vec![untrusted("cdn.example.net")]),
            run("A", BypassMethod::Objection, Vec::new()),
            run("B", BypassMethod::None, Vec::new()),
            run("B", BypassMethod::Objection, vec![untrusted("cdn.example.net")]),
        ];
        let per_app = solved_domains(&runs, SolvedDomainPolicy::PerApp).expect("per app");
        assert_eq!(per_app[&BypassMethod::Objection], set(&["cdn.example.net"]));
        let across = solved_domains(&runs, SolvedDomainPolicy::AcrossRuns).expect("across");
        assert!(across[&BypassMethod::Objection].is_empty());
    }

    #[test]
    fn per_app_policy_needs_baseline_run() {
        let runs = vec![run("A", BypassMethod::Objection, Vec::new())];
        assert!(matches!(
            solved_domains(&runs, SolvedDomainPolicy::PerApp),
            Err(AppError::Invariant(_))
        ));
    }

    #[test]
    fn other_failures_do_not_count_as_pinning() {
        let runs = vec![
            run(
                "A",
                BypassMethod::None,
                vec![TlsFailureEvent::new(
                    "The client disconnected during the handshake. If this happens consistently for api.example.org, this may indicate pinning.",
                )],
            ),
            run("A", BypassMethod::Objection, Vec::new()),
        ];
        let solved = solved_domains(&runs, SolvedDomainPolicy::PerApp).expect("solved");
        assert!(solved[&BypassMethod::Objection].is_empty());
    }

    #[test]
    fn compare_sets_reports_both_directions() {
        let comparison = compare_sets(&set(&["a", "b"]), &set(&["b", "c"]));
        assert_eq!(comparison.added, vec!["c"]);
        assert_eq!(comparison.removed, vec!["a"]);
    }

    #[test]
    fn report_fails_fast_naming_incomplete_apps() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::new(&dir.path().join("results.db")).expect("db");
        db.insert_run(&run("com.complete", BypassMethod::None, Vec::new())).expect("insert");
        db.insert_run(&run("com.complete", BypassMethod::Objection, Vec::new())).expect("insert");
        db.insert_run(&run("com.complete", BypassMethod::Httptoolkit, Vec::new())).expect("insert");
        ensure_complete(&db).expect("complete");

        db.insert_run(&run("com.partial", BypassMethod::None, Vec::new())).expect("insert");
        match build_report(&db, SolvedDomainPolicy::PerApp) {
            Err(AppError::Invariant(message)) => {
                assert!(message.contains("com.partial"));
                assert!(!message.contains("com.complete"));
            }
            other => panic!("expected invariant violation, got {:?}", other),
        }
    }

    #[test]
    fn report_counts_tls_errors_and_renders() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::new(&dir.path().join("results.db")).expect("db");
        let mut crashed = run("A", BypassMethod::Objection, Vec::new());
        crashed.app_crashed = true;
        db.insert_run(&run("A", BypassMethod::None, vec![untrusted("x.example.com")])).expect("insert");
        db.insert_run(&crashed).expect("insert");
        db.insert_run(&run(
            "A",
            BypassMethod::Httptoolkit,
            vec![untrusted("x.example.com"), TlsFailureEvent::new("connection closed early")],
        ))
        .expect("insert");

        let report = build_report(&db, SolvedDomainPolicy::PerApp).expect("report");
        let untrusted_counts = &report.tls_error_counts[1].1;
        assert_eq!(untrusted_counts.len(), 2);
        assert_eq!(untrusted_counts[0].method, "httptoolkit");
        let closed_early = &report.tls_error_counts[2].1;
        assert_eq!(closed_early.len(), 1);
        assert_eq!(report.any_tls_error.len(), 2);
        let objection_crashes = report
            .crashes
            .iter()
            .find(|count| count.method == "objection")
            .expect("objection crashes");
        assert_eq!(objection_crashes.count, 1);
        assert_eq!(report.baseline_domains, set(&["x.example.com"]));
        assert_eq!(report.unsolved_domains, set(&["x.example.com"]));
        assert_eq!(report.comparison.removed, vec!["x.example.com"]);
        assert!(report.comparison.added.is_empty());

        let rendered = report.to_string();
        assert!(rendered.contains("Crashes per method:"));
        assert!(rendered.contains("x.example.com"));
    }
}
