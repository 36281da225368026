//! The notification message model and its webhook payload.

use fleetup_core::UpdateRequest;
use serde::Serialize;
use serde_json::{json, Value};

/// What kind of transition a notification reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Info,
    Success,
    Failure,
}

impl Category {
    /// Attachment color understood by Slack-compatible webhooks.
    pub fn color(self) -> &'static str {
        match self {
            Category::Info => "#439FE0",
            Category::Success => "good",
            Category::Failure => "danger",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Field {
    pub title: String,
    pub value: String,
    pub short: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub category: Category,
    pub title: String,
    pub text: String,
    pub fields: Vec<Field>,
}

impl Notification {
    /// A notification about `request`, with its version, node order and
    /// start time as fields.
    pub fn for_request(
        category: Category,
        title: &str,
        text: &str,
        request: &UpdateRequest,
    ) -> Self {
        let fields = vec![
            Field {
                title: "version".into(),
                value: request.version.clone(),
                short: true,
            },
            Field {
                title: "started".into(),
                value: request.started_at.to_string(),
                short: true,
            },
            Field {
                title: "nodes".into(),
                value: request.nodes.join(", "),
                short: false,
            },
        ];
        Self {
            category,
            title: title.to_string(),
            text: text.to_string(),
            fields,
        }
    }

    /// Chat-webhook attachment payload.
    pub fn to_payload(&self) -> Value {
        json!({
            "attachments": [{
                "color": self.category.color(),
                "fallback": format!("{}: {}", self.title, self.text),
                "title": self.title,
                "text": self.text,
                "fields": self.fields,
            }]
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> UpdateRequest {
        UpdateRequest::new("2.0.0", vec!["n1".into(), "n2".into()], 1_700_000_000)
    }

    #[test]
    fn fields_describe_the_request() {
        let n = Notification::for_request(Category::Info, "rollout started", "", &request());
        let version = n.fields.iter().find(|f| f.title == "version").unwrap();
        assert_eq!(version.value, "2.0.0");
        let nodes = n.fields.iter().find(|f| f.title == "nodes").unwrap();
        assert_eq!(nodes.value, "n1, n2");
        assert!(!nodes.short);
    }

    #[test]
    fn payload_uses_category_color() {
        let n =
            Notification::for_request(Category::Failure, "rollout failed", "disk full", &request());
        let payload = n.to_payload();
        let attachment = &payload["attachments"][0];
        assert_eq!(attachment["color"], "danger");
        assert_eq!(attachment["text"], "disk full");
        assert_eq!(attachment["fields"].as_array().unwrap().len(), 3);
        assert_eq!(attachment["fields"][0]["title"], "version");
    }
}
