use crate::engine::Detection;
use crate::signature::Severity;
use crate::{ScanOutcome, ScanReport};

/// Render a report as plain console output, grouped by severity then file path.
pub fn render(report: &ScanReport) -> String {
    let summary = &report.summary;
    let mut output = String::new();

    let profile = &report.profile;
    output.push_str(&format!(
        "\n  Profile: {} ({} signatures, {} pinned packages)\n",
        profile.title.as_deref().unwrap_or(&profile.id),
        profile.signature_count,
        profile.package_pin_count,
    ));
    if profile.profile_ids.len() > 1 {
        output.push_str(&format!("  Packs:   {}\n", profile.profile_ids.join(", ")));
    }

    if summary.detections.is_empty() {
        output.push_str("\n  No indicators of compromise detected.\n");
    } else {
        // Sort by severity (critical first), then by file path
        let mut sorted: Vec<&Detection> = summary.detections.iter().collect();
        sorted.sort_by(|a, b| b.severity.cmp(&a.severity).then_with(|| a.path.cmp(&b.path)));

        output.push_str(&format!(
            "\n  {} detection(s):\n\n",
            summary.detections.len()
        ));

        for d in &sorted {
            let severity_tag = match d.severity {
                Severity::Critical => "[CRITICAL]",
                Severity::High => "[HIGH]    ",
                Severity::Medium => "[MEDIUM]  ",
                Severity::Low => "[LOW]     ",
            };
            output.push_str(&format!("  {} {} {}\n", severity_tag, d.signature_id, d.title));
            output.push_str(&format!("           at {}\n", d.path.display()));
            output.push_str(&format!(
                "           matched {} {}\n",
                d.indicator_type, d.indicator_value
            ));
            if !d.threats.is_empty() {
                output.push_str(&format!("           threat: {}\n", d.threats.join(", ")));
            }
            output.push('\n');
        }
    }

    if !summary.errors.is_empty() {
        output.push_str(&format!("\n  {} path(s) could not be scanned:\n", summary.errors.len()));
        for e in &summary.errors {
            output.push_str(&format!("    {}: {}\n", e.path.display(), e.message));
        }
    }

    let status = match report.outcome() {
        ScanOutcome::Clean => "CLEAN",
        ScanOutcome::Detections => "COMPROMISED",
        ScanOutcome::Errors => "INCOMPLETE",
    };
    output.push_str(&format!(
        "\n  Result: {} ({} files, {} bytes read, {:.2}s)\n\n",
        status,
        summary.files_scanned,
        summary.bytes_read,
        summary.duration.as_secs_f64(),
    ));

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::{IndicatorKind, ProfileSummary};
    use crate::{ScanErrorRecord, ScanSummary};
    use chrono::Utc;
    use std::path::PathBuf;
    use uuid::Uuid;

    fn report(detections: Vec<Detection>, errors: Vec<ScanErrorRecord>) -> ScanReport {
        ScanReport {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            roots: vec![PathBuf::from(".")],
            profile: ProfileSummary {
                id: "default".into(),
                title: Some("Default".into()),
                profile_ids: vec!["shai-hulud".into(), "default".into()],
                sources: Vec::new(),
                signature_count: 3,
                package_pin_count: 10,
                threats: Vec::new(),
            },
            summary: ScanSummary {
                files_scanned: 2,
                detections,
                errors,
                ..Default::default()
            },
        }
    }

    fn detection(path: &str, severity: Severity) -> Detection {
        Detection {
            path: PathBuf::from(path),
            signature_id: format!("sig-{severity}"),
            severity,
            title: "Title".into(),
            description: String::new(),
            indicator_type: IndicatorKind::String,
            indicator_value: "evil".into(),
            threats: vec!["shai-hulud".into()],
        }
    }

    #[test]
    fn clean_report() {
        let out = render(&report(Vec::new(), Vec::new()));
        assert!(out.contains("No indicators of compromise detected"));
        assert!(out.contains("Result: CLEAN"));
        assert!(out.contains("Packs:   shai-hulud, default"));
    }

    #[test]
    fn critical_detections_come_first() {
        let out = render(&report(
            vec![detection("a.js", Severity::Low), detection("b.js", Severity::Critical)],
            Vec::new(),
        ));
        let critical = out.find("[CRITICAL]").unwrap();
        let low = out.find("[LOW]").unwrap();
        assert!(critical < low);
        assert!(out.contains("matched string evil"));
        assert!(out.contains("threat: shai-hulud"));
        assert!(out.contains("Result: COMPROMISED"));
    }

    #[test]
    fn errors_are_listed() {
        let out = render(&report(
            Vec::new(),
            vec![ScanErrorRecord {
                path: PathBuf::from("gone.js"),
                message: "file disappeared".into(),
            }],
        ));
        assert!(out.contains("gone.js: file disappeared"));
        assert!(out.contains("Result: INCOMPLETE"));
    }
}
