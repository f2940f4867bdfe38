// src/formatting.rs

use crate::core::{Alert, Notification};
use crate::verification::VerificationReport;

/// A trait for formatting a notification into a single message.
pub trait TextFormatter: Send + Sync {
    fn format(&self, notification: &Notification) -> String;
}

/// One line per notification, for terminals and log files.
pub struct PlainTextFormatter;

impl PlainTextFormatter {
    fn format_alert(&self, alert: &Alert) -> String {
        let ip = alert
            .resolved_ip
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| "unresolved".to_string());
        let issuer = alert.issuer_org.as_deref().unwrap_or("unknown issuer");
        let verify = if alert.requires_verification {
            " [needs verification]"
        } else {
            ""
        };
        format!(
            "[{}/{}] {} -> {} (matched on {}, {}){} [{}]",
            alert.match_type,
            alert.confidence,
            alert.domain,
            ip,
            alert.matched_on,
            issuer,
            verify,
            alert.timestamp.to_rfc3339()
        )
    }

    fn format_report(&self, report: &VerificationReport) -> String {
        let tier = report
            .extracted_via
            .map(|t| t.as_str())
            .unwrap_or("no tier");
        format!(
            "[VERIFY/{}] {} via {} (dom {}, css {}, scripts {}, markers {}) [{}]",
            report.verdict(),
            report.domain,
            tier,
            if report.dna.dom_hash_match { "match" } else { "differs" },
            report.dna.shared_css_variables.len(),
            report.dna.shared_script_hashes.len(),
            report.dna.shared_template_markers.len(),
            report.timestamp.to_rfc3339()
        )
    }
}

impl TextFormatter for PlainTextFormatter {
    fn format(&self, notification: &Notification) -> String {
        match notification {
            Notification::Alert(alert) => self.format_alert(alert),
            Notification::Verification(report) => self.format_report(report),
        }
    }
}

/// A formatter for Slack that creates a rich, readable, and actionable message.
pub struct SlackTextFormatter;

impl SlackTextFormatter {
    fn domain_link(domain: &str) -> String {
        format!("<https://urlscan.io/search/#page.domain%3A{}|{}>", domain, domain)
    }

    fn format_alert(&self, alert: &Alert) -> String {
        let ip_part = match alert.resolved_ip {
            Some(ip) => format!("<https://urlscan.io/search/#page.ip%3A{}|{}>", ip, ip),
            None => "No IP info".to_string(),
        };
        let mut line = format!(
            "*{}* [{}] {} -> {} (matched on `{}`)",
            alert.confidence,
            alert.match_type,
            Self::domain_link(&alert.domain),
            ip_part,
            alert.matched_on
        );
        if let Some(issuer) = &alert.issuer_org {
            line.push_str(&format!(" issuer: {}", issuer));
        }
        if alert.requires_verification {
            line.push_str(" _needs verification_");
        }
        line
    }

    fn format_report(&self, report: &VerificationReport) -> String {
        format!(
            "*{}* [VERIFY] {} dom hash {}, {} shared CSS variables, {} shared scripts",
            report.verdict(),
            Self::domain_link(&report.domain),
            if report.dna.dom_hash_match { "matches" } else { "differs" },
            report.dna.shared_css_variables.len(),
            report.dna.shared_script_hashes.len()
        )
    }
}

impl TextFormatter for SlackTextFormatter {
    fn format(&self, notification: &Notification) -> String {
        match notification {
            Notification::Alert(alert) => self.format_alert(alert),
            Notification::Verification(report) => self.format_report(report),
        }
    }
}
