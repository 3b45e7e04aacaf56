//! Match-quality scoring for template output, on a 0-100 scale. The factor
//! weights are a contract relied on by stored `min_score` thresholds; do
//! not tune them silently.

use std::collections::BTreeSet;

use super::textfsm::Record;

pub fn score_match(identifier: &str, records: &[Record]) -> f64 {
    if records.is_empty() {
        return 0.0;
    }

    let record_count = records.len();
    let field_count = records[0].len();

    let record_score = score_record_count(identifier, record_count);
    let field_score = score_field_richness(field_count);
    let population_score = score_population(records, field_count);
    let consistency_score = score_consistency(records);

    (record_score + field_score + population_score + consistency_score).clamp(0.0, 100.0)
}

fn score_record_count(identifier: &str, count: usize) -> f64 {
    if identifier.to_lowercase().contains("version") {
        // Version commands describe one box; exactly one record is the
        // strongest possible signal.
        if count == 1 {
            return 30.0;
        }
        return (15.0 - (count as f64 - 1.0) * 5.0).max(0.0);
    }

    match count {
        0 => 0.0,
        c if c >= 10 => 30.0,
        c if c >= 3 => 20.0 + (c as f64 - 3.0) * (10.0 / 7.0),
        c => c as f64 * 10.0,
    }
}

fn score_field_richness(fields: usize) -> f64 {
    match fields {
        f if f >= 10 => 30.0,
        f if f >= 6 => 20.0 + (f as f64 - 6.0) * 2.5,
        f if f >= 3 => 10.0 + (f as f64 - 3.0) * (10.0 / 3.0),
        f => f as f64 * 5.0,
    }
}

fn score_population(records: &[Record], field_count: usize) -> f64 {
    let total_cells = records.len() * field_count;
    if total_cells == 0 {
        return 0.0;
    }
    let populated = records
        .iter()
        .flat_map(|r| r.values())
        .filter(|v| !v.is_empty())
        .count();
    populated as f64 / total_cells as f64 * 25.0
}

/// Share of records whose populated-field set matches the dominant one.
fn score_consistency(records: &[Record]) -> f64 {
    let mut shapes: Vec<(BTreeSet<&str>, usize)> = Vec::new();
    for record in records {
        let shape: BTreeSet<&str> = record
            .iter()
            .filter(|(_, v)| !v.is_empty())
            .map(|(k, _)| k.as_str())
            .collect();
        match shapes.iter_mut().find(|(s, _)| *s == shape) {
            Some((_, count)) => *count += 1,
            None => shapes.push((shape, 1)),
        }
    }
    let dominant = shapes.iter().map(|(_, count)| *count).max().unwrap_or(0);
    dominant as f64 / records.len() as f64 * 15.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validate::textfsm::FieldValue;

    fn record(cells: &[(&str, &str)]) -> Record {
        cells
            .iter()
            .map(|(k, v)| (k.to_string(), FieldValue::Scalar(v.to_string())))
            .collect()
    }

    fn full_record(fields: usize, index: usize) -> Record {
        (0..fields)
            .map(|f| {
                (
                    format!("F{f}"),
                    FieldValue::Scalar(format!("v{index}-{f}")),
                )
            })
            .collect()
    }

    #[test]
    fn empty_parse_scores_zero() {
        assert_eq!(score_match("cisco_ios_show_ip_arp", &[]), 0.0);
    }

    #[test]
    fn version_command_wants_exactly_one_record() {
        let one = vec![full_record(4, 0)];
        let three: Vec<Record> = (0..3).map(|i| full_record(4, i)).collect();

        let single = score_match("cisco_ios_show_version", &one);
        let multi = score_match("cisco_ios_show_version", &three);
        assert!(single > multi);

        // Record-count factor alone: 30 for one, 15 - 5*(n-1) after.
        assert_eq!(score_record_count("show_version", 1), 30.0);
        assert_eq!(score_record_count("show_version", 2), 10.0);
        assert_eq!(score_record_count("show_version", 5), 0.0);
    }

    #[test]
    fn record_count_scale_for_table_commands() {
        assert_eq!(score_record_count("show_ip_arp", 0), 0.0);
        assert_eq!(score_record_count("show_ip_arp", 1), 10.0);
        assert_eq!(score_record_count("show_ip_arp", 2), 20.0);
        assert_eq!(score_record_count("show_ip_arp", 3), 20.0);
        assert!((score_record_count("show_ip_arp", 9) - 28.571).abs() < 0.01);
        assert_eq!(score_record_count("show_ip_arp", 10), 30.0);
        assert_eq!(score_record_count("show_ip_arp", 500), 30.0);
    }

    #[test]
    fn field_richness_scale() {
        assert_eq!(score_field_richness(1), 5.0);
        assert_eq!(score_field_richness(2), 10.0);
        assert_eq!(score_field_richness(3), 10.0);
        assert!((score_field_richness(5) - 16.666).abs() < 0.01);
        assert_eq!(score_field_richness(6), 20.0);
        assert_eq!(score_field_richness(9), 27.5);
        assert_eq!(score_field_richness(10), 30.0);
    }

    #[test]
    fn population_rate_is_proportional() {
        let records = vec![
            record(&[("A", "x"), ("B", "y")]),
            record(&[("A", "x"), ("B", "")]),
        ];
        // 3 of 4 cells populated.
        assert!((score_population(&records, 2) - 18.75).abs() < f64::EPSILON);
    }

    #[test]
    fn consistency_rewards_uniform_shapes() {
        let uniform = vec![
            record(&[("A", "1"), ("B", "2")]),
            record(&[("A", "3"), ("B", "4")]),
        ];
        assert_eq!(score_consistency(&uniform), 15.0);

        let ragged = vec![
            record(&[("A", "1"), ("B", "2")]),
            record(&[("A", "3"), ("B", "")]),
            record(&[("A", "5"), ("B", "6")]),
        ];
        assert!((score_consistency(&ragged) - 10.0).abs() < f64::EPSILON);

        let single = vec![record(&[("A", "1")])];
        assert_eq!(score_consistency(&single), 15.0);
    }

    #[test]
    fn score_stays_in_bounds_and_rewards_rich_tables() {
        let records: Vec<Record> = (0..12).map(|i| full_record(11, i)).collect();
        let score = score_match("cisco_ios_show_ip_route", &records);
        assert_eq!(score, 100.0);

        let thin = vec![record(&[("A", "")])];
        let score = score_match("x_y_z", &thin);
        assert!(score >= 0.0 && score <= 100.0);
    }

    #[test]
    fn known_composite_value() {
        // 2 records, 2 fields, fully populated, uniform:
        // records 20 + fields 10 + population 25 + consistency 15 = 70.
        let records = vec![
            record(&[("A", "1"), ("B", "2")]),
            record(&[("A", "3"), ("B", "4")]),
        ];
        assert!((score_match("show_ip_arp", &records) - 70.0).abs() < f64::EPSILON);
    }
}
