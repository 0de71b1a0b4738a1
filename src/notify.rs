//! Operator notification via the SendGrid v3 mail API.
//!
//! Exactly one email goes out per run: the success summary, or the
//! token-limit alert when the run halted. Delivery failure is the
//! caller's problem to log; it never changes the exit code.

use crate::config::SendGridCredentials;
use crate::sync::RunSummary;
use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::Local;
use std::path::{Path, PathBuf};

const SENDGRID_URL: &str = "https://api.sendgrid.com/v3/mail/send";

pub struct Notifier<'a> {
    agent: &'a ureq::Agent,
    credentials: &'a SendGridCredentials,
}

impl<'a> Notifier<'a> {
    pub fn new(agent: &'a ureq::Agent, credentials: &'a SendGridCredentials) -> Self {
        Notifier { agent, credentials }
    }

    pub fn send_success_summary(
        &self,
        summary: &RunSummary,
        crash_errors: usize,
        attachments: &[PathBuf],
    ) -> Result<()> {
        self.send(
            "Stock Update - Completed",
            &summary_body(
                "The stock update run has completed.",
                summary,
                crash_errors,
            ),
            attachments,
        )
    }

    pub fn send_token_limit_alert(
        &self,
        summary: &RunSummary,
        crash_errors: usize,
        attachments: &[PathBuf],
    ) -> Result<()> {
        self.send(
            "Stock Update - Stopped (Token Limit Exceeded)",
            &summary_body(
                "The stock update run was stopped: the CLF token generation limit was exceeded.",
                summary,
                crash_errors,
            ),
            attachments,
        )
    }

    fn send(&self, subject: &str, body: &str, attachments: &[PathBuf]) -> Result<()> {
        let to: Vec<serde_json::Value> = self
            .credentials
            .to_emails
            .iter()
            .filter(|addr| !addr.trim().is_empty())
            .map(|addr| serde_json::json!({ "email": addr }))
            .collect();

        let mut message = serde_json::json!({
            "personalizations": [{ "to": to }],
            "from": { "email": self.credentials.from_email },
            "subject": subject,
            "content": [{ "type": "text/plain", "value": body }],
        });
        let encoded = encode_attachments(attachments);
        if !encoded.is_empty() {
            message["attachments"] = serde_json::Value::Array(encoded);
        }

        let mut response = self
            .agent
            .post(SENDGRID_URL)
            .header(
                "Authorization",
                format!("Bearer {}", self.credentials.api_key).as_str(),
            )
            .send_json(message)
            .context("send notification email")?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.body_mut().read_to_string().unwrap_or_default();
            return Err(anyhow!(
                "SendGrid rejected the notification: status {status}: {}",
                detail.trim()
            ));
        }
        tracing::info!(subject, "notification email sent");
        Ok(())
    }
}

fn summary_body(lead: &str, summary: &RunSummary, crash_errors: usize) -> String {
    let mut body = format!(
        "{lead}\n\n\
         Summary:\n\
         - Products considered: {}\n\
         - Products updated: {}\n\
         - Products skipped: {}\n\
         - Products failed: {}\n\
         - Crash log errors: {crash_errors}\n\
         - Finished at: {}\n",
        summary.total_considered,
        summary.updated,
        summary.skipped,
        summary.failed,
        Local::now().format("%Y-%m-%d %H:%M:%S"),
    );
    if !summary.errors.is_empty() {
        body.push_str("\nErrors:\n");
        for (sku, message) in &summary.errors {
            body.push_str(&format!("- {sku}: {message}\n"));
        }
    }
    body.push_str("\nPlease find the detailed logs attached.\n");
    body
}

fn encode_attachments(paths: &[PathBuf]) -> Vec<serde_json::Value> {
    let mut encoded = Vec::new();
    for path in paths {
        match std::fs::read(path) {
            Ok(bytes) => encoded.push(serde_json::json!({
                "content": STANDARD.encode(bytes),
                "filename": file_name(path),
                "type": "text/plain",
                "disposition": "attachment",
            })),
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "skipping unreadable log attachment");
            }
        }
    }
    encoded
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary_with_errors() -> RunSummary {
        RunSummary {
            total_considered: 4,
            updated: 2,
            skipped: 1,
            failed: 1,
            halted: false,
            errors: vec![("A1".to_string(), "product not found".to_string())],
        }
    }

    #[test]
    fn body_carries_counts_and_error_lines() {
        let body = summary_body("Done.", &summary_with_errors(), 3);
        assert!(body.contains("Products considered: 4"));
        assert!(body.contains("Products updated: 2"));
        assert!(body.contains("Crash log errors: 3"));
        assert!(body.contains("- A1: product not found"));
    }

    #[test]
    fn body_omits_error_section_when_clean() {
        let summary = RunSummary {
            total_considered: 1,
            updated: 1,
            ..RunSummary::default()
        };
        let body = summary_body("Done.", &summary, 0);
        assert!(!body.contains("Errors:"));
    }

    #[test]
    fn unreadable_attachments_are_skipped() {
        let encoded = encode_attachments(&[PathBuf::from("/nonexistent/log.txt")]);
        assert!(encoded.is_empty());
    }

    #[test]
    fn attachments_are_base64_encoded() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        std::io::Write::write_all(&mut file, b"log line\n").expect("write");
        let encoded = encode_attachments(&[file.path().to_path_buf()]);
        assert_eq!(encoded.len(), 1);
        assert_eq!(encoded[0]["content"], STANDARD.encode(b"log line\n"));
        assert_eq!(encoded[0]["disposition"], "attachment");
    }
}
