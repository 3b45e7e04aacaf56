//! Output validation: run candidate templates, keep the best score.

pub mod scoring;
pub mod textfsm;

use serde::Serialize;
use tracing::{debug, trace};

use crate::db::entities::template::Template;
use crate::db::enums::ValidationStatus;
use crate::db::template_service;
use crate::db::{SqlitePool, StoreError};
use textfsm::{Record, TextFsmTemplate};

#[derive(Debug, Clone, Serialize)]
pub struct ValidationOutcome {
    pub status: ValidationStatus,
    pub template: Option<String>,
    pub records: Option<Vec<Record>>,
    pub score: f64,
}

impl ValidationOutcome {
    pub fn passed(&self) -> bool {
        self.status == ValidationStatus::Passed
    }

    fn no_template() -> Self {
        Self {
            status: ValidationStatus::NoTemplate,
            template: None,
            records: None,
            score: 0.0,
        }
    }
}

/// Validation engine over the read-only template store. Each call checks
/// its own connection out of the pool.
#[derive(Clone)]
pub struct ValidationEngine {
    pool: SqlitePool,
}

impl ValidationEngine {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn validate(
        &self,
        output: String,
        filter: String,
        min_score: f64,
    ) -> Result<ValidationOutcome, StoreError> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || -> Result<ValidationOutcome, StoreError> {
            let conn = pool.get()?;
            let candidates = template_service::candidates_blocking(&conn, &filter)?;
            drop(conn);
            Ok(evaluate(&candidates, &output, min_score))
        })
        .await?
    }
}

/// Pure selection + scoring over an already-fetched candidate set.
pub fn evaluate(candidates: &[Template], output: &str, min_score: f64) -> ValidationOutcome {
    if candidates.is_empty() {
        return ValidationOutcome::no_template();
    }

    let mut best: Option<(String, Vec<Record>, f64)> = None;
    for candidate in candidates {
        let template = match TextFsmTemplate::parse(&candidate.content) {
            Ok(t) => t,
            Err(e) => {
                trace!(template = %candidate.identifier, error = %e, "unparseable template skipped");
                continue;
            }
        };
        let records = match template.run(output) {
            Ok(r) => r,
            Err(e) => {
                trace!(template = %candidate.identifier, error = %e, "template run failed");
                continue;
            }
        };
        let score = scoring::score_match(&candidate.identifier, &records);
        trace!(
            template = %candidate.identifier,
            score,
            records = records.len(),
            "candidate scored"
        );
        if score > best.as_ref().map_or(0.0, |(_, _, s)| *s) {
            best = Some((candidate.identifier.clone(), records, score));
        }
    }

    match best {
        Some((identifier, records, score)) => {
            let status = if score >= min_score {
                ValidationStatus::Passed
            } else {
                ValidationStatus::Failed
            };
            debug!(template = %identifier, score, %status, "validation complete");
            ValidationOutcome {
                status,
                template: Some(identifier),
                records: Some(records),
                score,
            }
        }
        None => ValidationOutcome::no_template(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::template_service::testutil::seed_template;
    use crate::db::testutil::open_test_stores;

    const ARP_TEMPLATE: &str = "\
Value ADDRESS (\\d+\\.\\d+\\.\\d+\\.\\d+)
Value AGE (\\d+|-)
Value MAC ([0-9a-f.]+)
Value INTERFACE (\\S+)

Start
  ^Internet\\s+${ADDRESS}\\s+${AGE}\\s+${MAC}\\s+ARPA\\s+${INTERFACE} -> Record
";

    const VERSION_TEMPLATE: &str = "\
Value VERSION (\\S+)
Value HOSTNAME (\\S+)

Start
  ^${HOSTNAME}\\s+uptime
  ^Cisco IOS Software.*Version ${VERSION},
";

    const ARP_OUTPUT: &str = "\
Protocol  Address          Age (min)  Hardware Addr   Type   Interface
Internet  10.0.0.1         12         aabb.cc00.0100  ARPA   Gi0/1
Internet  10.0.0.2         33         aabb.cc00.0200  ARPA   Gi0/2
Internet  10.0.0.3         -          aabb.cc00.0300  ARPA   Gi0/3
";

    fn template(identifier: &str, content: &str) -> Template {
        Template {
            id: 0,
            identifier: identifier.into(),
            content: content.into(),
            content_hash: None,
        }
    }

    #[test]
    fn picks_the_best_scoring_candidate() {
        let candidates = vec![
            template("cisco_ios_show_version", VERSION_TEMPLATE),
            template("cisco_ios_show_ip_arp", ARP_TEMPLATE),
        ];
        let outcome = evaluate(&candidates, ARP_OUTPUT, 10.0);
        assert!(outcome.passed());
        assert_eq!(outcome.template.as_deref(), Some("cisco_ios_show_ip_arp"));
        assert_eq!(outcome.records.as_ref().unwrap().len(), 3);
        assert!(outcome.score > 40.0);
    }

    #[test]
    fn score_below_threshold_fails() {
        let candidates = vec![template("cisco_ios_show_ip_arp", ARP_TEMPLATE)];
        let outcome = evaluate(&candidates, ARP_OUTPUT, 99.0);
        assert_eq!(outcome.status, ValidationStatus::Failed);
        assert!(outcome.template.is_some());
        assert!(outcome.score < 99.0);
    }

    #[test]
    fn no_candidates_means_no_template() {
        let outcome = evaluate(&[], ARP_OUTPUT, 10.0);
        assert_eq!(outcome.status, ValidationStatus::NoTemplate);
        assert_eq!(outcome.score, 0.0);
        assert!(outcome.template.is_none());
    }

    #[test]
    fn non_matching_output_scores_zero() {
        let candidates = vec![template("cisco_ios_show_ip_arp", ARP_TEMPLATE)];
        let outcome = evaluate(&candidates, "% Invalid input detected\n", 10.0);
        assert_eq!(outcome.status, ValidationStatus::NoTemplate);
        assert_eq!(outcome.score, 0.0);
    }

    #[test]
    fn unparseable_candidates_are_skipped() {
        let candidates = vec![
            template("broken_template", "Value Bogus Flag ("),
            template("cisco_ios_show_ip_arp", ARP_TEMPLATE),
        ];
        let outcome = evaluate(&candidates, ARP_OUTPUT, 10.0);
        assert!(outcome.passed());
        assert_eq!(outcome.template.as_deref(), Some("cisco_ios_show_ip_arp"));
    }

    #[tokio::test]
    async fn engine_reads_candidates_from_the_store() {
        let stores = open_test_stores();
        seed_template(&stores.templates, "cisco_ios_show_ip_arp", ARP_TEMPLATE);
        seed_template(&stores.templates, "cisco_ios_show_version", VERSION_TEMPLATE);

        let engine = ValidationEngine::new(stores.templates.clone());
        let outcome = engine
            .validate(
                ARP_OUTPUT.to_string(),
                "cisco_ios_show_ip_arp".to_string(),
                30.0,
            )
            .await
            .unwrap();
        assert!(outcome.passed());
        assert_eq!(outcome.template.as_deref(), Some("cisco_ios_show_ip_arp"));

        let outcome = engine
            .validate(
                "garbage".to_string(),
                "juniper_junos_show_route".to_string(),
                30.0,
            )
            .await
            .unwrap();
        assert_eq!(outcome.status, ValidationStatus::NoTemplate);
    }
}
