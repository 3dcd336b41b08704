//! Email templates for notifications

use consultdesk_shared::SubjectRef;
use time::{OffsetDateTime, UtcOffset};

use crate::email::OutgoingEmail;

/// Rendered subject and bodies for one email
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailContent {
    pub subject: String,
    pub text: String,
    pub html: String,
}

impl EmailContent {
    /// Address the content to a recipient
    pub fn to(self, address: &str) -> OutgoingEmail {
        OutgoingEmail {
            to: address.to_string(),
            subject: self.subject,
            html: self.html,
            text: self.text,
        }
    }

    /// Warning that a tracked deadline is close
    pub fn sla_warning(
        subject: SubjectRef,
        target_date: OffsetDateTime,
        hours_left: f64,
        link: &str,
    ) -> Self {
        let what = format!("{} {}", subject.kind(), subject.id());
        let due = format_utc(target_date);
        let remaining = format!("{:.1} hours", hours_left.max(0.0));

        Self {
            subject: format!("SLA warning: {} is due in {}", subject.kind(), remaining),
            text: format!(
                "The deadline for {} is approaching.\n\nDue: {}\nTime remaining: {}\n\nOpen it in the dashboard: {}",
                what, due, remaining, link
            ),
            html: layout(
                "Deadline approaching",
                &format!(
                    "<p>The deadline for <strong>{}</strong> is approaching.</p>\
                     <p>Due: {}<br>Time remaining: <strong>{}</strong></p>",
                    escape_html(&what),
                    due,
                    remaining
                ),
                link,
                "Open in dashboard",
            ),
        }
    }

    pub fn task_assignment(
        task_title: &str,
        project_name: Option<&str>,
        due_date: Option<OffsetDateTime>,
        link: &str,
    ) -> Self {
        let mut details = Vec::new();
        if let Some(project) = project_name {
            details.push(format!("Project: {}", project));
        }
        if let Some(due) = due_date {
            details.push(format!("Due: {}", format_utc(due)));
        }

        Self {
            subject: format!("New task assigned: {}", task_title),
            text: format!(
                "You have been assigned a new task: {}\n\n{}\n\nView the task: {}",
                task_title,
                details.join("\n"),
                link
            ),
            html: layout(
                "New task assigned",
                &format!(
                    "<p>You have been assigned a new task: <strong>{}</strong></p><p>{}</p>",
                    escape_html(task_title),
                    details
                        .iter()
                        .map(|line| escape_html(line))
                        .collect::<Vec<_>>()
                        .join("<br>")
                ),
                link,
                "View task",
            ),
        }
    }

    pub fn project_update(project_name: &str, summary: &str, link: &str) -> Self {
        Self {
            subject: format!("Project update: {}", project_name),
            text: format!(
                "There is an update on {}:\n\n{}\n\nView the project: {}",
                project_name, summary, link
            ),
            html: layout(
                "Project update",
                &format!(
                    "<p>There is an update on <strong>{}</strong>:</p><p>{}</p>",
                    escape_html(project_name),
                    escape_html(summary)
                ),
                link,
                "View project",
            ),
        }
    }

    pub fn ticket_created(ticket_title: &str, priority: Option<&str>, link: &str) -> Self {
        let priority_line = priority
            .map(|p| format!("Priority: {}", p))
            .unwrap_or_default();

        Self {
            subject: format!("New ticket: {}", ticket_title),
            text: format!(
                "A new ticket was created: {}\n{}\n\nView the ticket: {}",
                ticket_title, priority_line, link
            ),
            html: layout(
                "New ticket",
                &format!(
                    "<p>A new ticket was created: <strong>{}</strong></p><p>{}</p>",
                    escape_html(ticket_title),
                    escape_html(&priority_line)
                ),
                link,
                "View ticket",
            ),
        }
    }
}

fn layout(heading: &str, body: &str, link: &str, link_label: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="utf-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
</head>
<body style="font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif; line-height: 1.6; color: #333; max-width: 600px; margin: 0 auto; padding: 20px;">
    <h2 style="color: #1a1a1a;">{}</h2>
    {}
    <p><a href="{}" style="display: inline-block; background: #2563eb; color: white; padding: 10px 20px; border-radius: 6px; text-decoration: none;">{}</a></p>
    <hr style="border: none; border-top: 1px solid #eee; margin: 30px 0;">
    <p style="color: #999; font-size: 12px;">You are receiving this because of your notification settings in ConsultDesk.</p>
</body>
</html>"#,
        escape_html(heading),
        body,
        escape_html(link),
        escape_html(link_label)
    )
}

/// `2026-03-14 09:30 UTC`
fn format_utc(at: OffsetDateTime) -> String {
    let at = at.to_offset(UtcOffset::UTC);
    format!(
        "{:04}-{:02}-{:02} {:02}:{:02} UTC",
        at.year(),
        u8::from(at.month()),
        at.day(),
        at.hour(),
        at.minute()
    )
}

fn escape_html(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_sla_warning_mentions_deadline() {
        let due = OffsetDateTime::from_unix_timestamp(1_773_480_600).unwrap();
        let content = EmailContent::sla_warning(
            SubjectRef::Ticket(Uuid::nil()),
            due,
            2.0,
            "https://app.test/tickets/1",
        );

        assert_eq!(content.subject, "SLA warning: ticket is due in 2.0 hours");
        assert!(content.text.contains("2026-03-14 09:30 UTC"));
        assert!(content.html.contains("https://app.test/tickets/1"));
    }

    #[test]
    fn test_user_text_is_escaped_in_html() {
        let content = EmailContent::project_update(
            "<script>alert(1)</script>",
            "Tom & Jerry",
            "https://app.test",
        );

        assert!(!content.html.contains("<script>"));
        assert!(content.html.contains("&lt;script&gt;"));
        assert!(content.html.contains("Tom &amp; Jerry"));
        // Plain text keeps the original characters
        assert!(content.text.contains("Tom & Jerry"));
    }

    #[test]
    fn test_task_assignment_optional_details() {
        let bare = EmailContent::task_assignment("Write report", None, None, "https://app.test");
        assert!(!bare.text.contains("Project:"));

        let full = EmailContent::task_assignment(
            "Write report",
            Some("Apollo"),
            None,
            "https://app.test",
        );
        assert!(full.text.contains("Project: Apollo"));
    }
}
