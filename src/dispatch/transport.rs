//! Mail transport seam and outbound message composition.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use crate::collector::SupplierTask;
use crate::config::{DispatchConfig, SmtpEndpoint, layout};
use crate::error::MailError;

/// A fully composed email, independent of the transport library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundEmail {
    pub from: String,
    pub to: Vec<String>,
    pub cc: Option<String>,
    pub subject: String,
    /// Plain-text body with the signature appended.
    pub text_body: String,
    /// Rendered body: `text_body` with line breaks as `<br>`.
    pub html_body: String,
    /// Attached by basename.
    pub attachments: Vec<PathBuf>,
}

impl OutboundEmail {
    /// Compose the email for one supplier task. The authenticating account
    /// sends and is copied on every message.
    pub fn compose(task: &SupplierTask, account: &str, signature: &str) -> Self {
        let text_body = format!(
            "供应商，你好：\n\n\
             附件是{project}零件《供货方式确认表》，烦请核对信息\n\n\
             如无问题，请在三个工作日内签字盖章回传，谢谢！\n\n\
             {signature}",
            project = task.project_folder,
        );
        let html_body = text_body.replace('\n', "<br>");

        Self {
            from: account.to_string(),
            to: task.recipients().into_iter().map(String::from).collect(),
            cc: (!account.is_empty()).then(|| account.to_string()),
            subject: subject_for(task),
            text_body,
            html_body,
            attachments: task.files.clone(),
        }
    }

    /// Attachment basenames, in attachment order.
    pub fn attachment_names(&self) -> Vec<String> {
        self.attachments
            .iter()
            .map(|p| {
                p.file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| p.display().to_string())
            })
            .collect()
    }
}

/// `{project}{suffix}_{code}`
pub fn subject_for(task: &SupplierTask) -> String {
    format!(
        "{}{}_{}",
        task.project_folder,
        layout::SUBJECT_SUFFIX,
        task.supplier_code
    )
}

/// Delivers composed emails. One instance lives for one run.
#[async_trait]
pub trait MailTransport: Send + Sync {
    /// Deliver one email. Any error counts as a failed attempt.
    async fn send(&self, email: &OutboundEmail) -> Result<(), MailError>;

    /// Release the connection. Called once on every exit path of a run.
    async fn shutdown(&self) {}
}

/// Opens a transport for a run.
pub trait Connector: Send + Sync {
    fn connect(
        &self,
        endpoint: &SmtpEndpoint,
        config: &DispatchConfig,
    ) -> Result<Arc<dyn MailTransport>, MailError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> SupplierTask {
        SupplierTask {
            project_folder: "X1项目".into(),
            supplier_code: "12345".into(),
            files: vec![
                PathBuf::from("/w/X1项目/待外发/a_12345_1.xlsx"),
                PathBuf::from("/w/X1项目/待外发/a_12345_2.xlsx"),
            ],
            to_addresses: "a@x.com; b@x.com;".into(),
        }
    }

    #[test]
    fn subject_format() {
        assert_eq!(subject_for(&task()), "X1项目零件供货方式确认_12345");
    }

    #[test]
    fn compose_recipients_and_cc() {
        let email = OutboundEmail::compose(&task(), "me@corp.com", "-- Me");
        assert_eq!(email.from, "me@corp.com");
        assert_eq!(email.to, vec!["a@x.com", "b@x.com"]);
        assert_eq!(email.cc.as_deref(), Some("me@corp.com"));
    }

    #[test]
    fn compose_body_appends_signature_and_renders_breaks() {
        let email = OutboundEmail::compose(&task(), "me@corp.com", "Regards\nMe");
        assert!(email.text_body.contains("X1项目零件《供货方式确认表》"));
        assert!(email.text_body.ends_with("Regards\nMe"));
        assert!(!email.html_body.contains('\n'));
        assert!(email.html_body.ends_with("Regards<br>Me"));
    }

    #[test]
    fn attachments_by_basename() {
        let email = OutboundEmail::compose(&task(), "me@corp.com", "");
        assert_eq!(
            email.attachment_names(),
            vec!["a_12345_1.xlsx", "a_12345_2.xlsx"]
        );
    }
}
