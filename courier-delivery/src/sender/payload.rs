//! Request bodies posted to HTTP endpoints.

use base64::{Engine, engine::general_purpose::STANDARD};
use mailparse::{DispositionType, MailHeaderMap, ParsedMail};
use serde_json::{Map, Value, json};
use tracing::warn;

use crate::{
    model::{HttpEncoding, HttpEndpoint, Message, PayloadFormat},
    reply_separator,
};

/// A body ready to hand to the HTTP client.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Json(Value),
    Form(Vec<(String, String)>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Attachment {
    filename: Option<String>,
    content_type: String,
    data: Vec<u8>,
}

/// Bodies and attachments pulled out of a parsed message.
#[derive(Debug, Default)]
struct Content {
    plain_body: Option<String>,
    html_body: Option<String>,
    attachments: Vec<Attachment>,
}

impl Content {
    fn collect(&mut self, part: &ParsedMail<'_>) {
        if !part.subparts.is_empty() {
            for subpart in &part.subparts {
                self.collect(subpart);
            }
            return;
        }

        let disposition = part.get_content_disposition();
        let filename = disposition
            .params
            .get("filename")
            .or_else(|| part.ctype.params.get("name"))
            .cloned();

        if matches!(disposition.disposition, DispositionType::Attachment) || filename.is_some() {
            self.attachments.push(Attachment {
                filename,
                content_type: part.ctype.mimetype.clone(),
                data: part.get_body_raw().unwrap_or_default(),
            });
            return;
        }

        let slot = match part.ctype.mimetype.as_str() {
            "text/plain" => &mut self.plain_body,
            "text/html" => &mut self.html_body,
            _ => return,
        };
        if slot.is_none() {
            *slot = part.get_body().ok();
        }
    }
}

/// Builds the body for `endpoint` from `message`.
#[must_use]
pub fn build(message: &Message, endpoint: &HttpEndpoint) -> Payload {
    let fields = match endpoint.format {
        PayloadFormat::Hash => hash_fields(message, endpoint),
        PayloadFormat::RawMessage => raw_fields(message),
    };

    match endpoint.encoding {
        HttpEncoding::BodyAsJson => Payload::Json(Value::Object(fields)),
        HttpEncoding::FormData => Payload::Form(flatten(fields)),
    }
}

fn raw_fields(message: &Message) -> Map<String, Value> {
    let raw = message.raw_message.as_deref().unwrap_or_default();

    let Value::Object(fields) = json!({
        "id": message.id,
        "rcpt_to": message.rcpt_to,
        "mail_from": message.mail_from,
        "message": STANDARD.encode(raw),
        "base64": true,
        "size": message.size,
    }) else {
        return Map::new();
    };
    fields
}

fn hash_fields(message: &Message, endpoint: &HttpEndpoint) -> Map<String, Value> {
    let raw = message.raw_message.as_deref().unwrap_or_default();
    let parsed = mailparse::parse_mail(raw)
        .inspect_err(|err| warn!(message_id = message.id, "Cannot parse message for HTTP payload: {err}"))
        .ok();

    let header = |name: &str| -> Value {
        parsed
            .as_ref()
            .and_then(|parsed| parsed.get_headers().get_all_values(name).pop())
            .map_or(Value::Null, Value::String)
    };

    // Every occurrence, comma separated.
    let all_headers = |name: &str| -> Value {
        let values = parsed
            .as_ref()
            .map(|parsed| parsed.get_headers().get_all_values(name))
            .unwrap_or_default();
        if values.is_empty() {
            Value::Null
        } else {
            Value::String(values.join(", "))
        }
    };

    let mut content = Content::default();
    if let Some(parsed) = &parsed {
        content.collect(parsed);
    }

    #[allow(clippy::cast_precision_loss)]
    let timestamp = message.timestamp.timestamp_micros() as f64 / 1_000_000.0;

    let Value::Object(mut fields) = json!({
        "id": message.id,
        "rcpt_to": message.rcpt_to,
        "mail_from": message.mail_from,
        "token": message.token,
        "subject": message.subject,
        "message_id": message.message_id,
        "timestamp": timestamp,
        "size": message.size,
        "spam_status": message.spam_status,
        "bounce": message.bounce,
        "received_with_ssl": message.received_with_ssl,
        "to": header("To"),
        "cc": header("Cc"),
        "from": header("From"),
        "date": header("Date"),
        "in_reply_to": header("In-Reply-To"),
        "references": header("References"),
        "html_body": content.html_body,
        "attachment_quantity": content.attachments.len(),
        "auto_submitted": header("Auto-Submitted"),
        "reply_to": all_headers("Reply-To"),
    }) else {
        return Map::new();
    };

    match (&content.plain_body, endpoint.strip_replies) {
        (Some(plain_body), true) => {
            let (body, replies) = reply_separator::separate(plain_body);
            fields.insert("plain_body".to_string(), Value::String(body));
            fields.insert(
                "replies_from_plain_body".to_string(),
                replies.map_or(Value::Null, Value::String),
            );
        }
        (plain_body, _) => {
            fields.insert(
                "plain_body".to_string(),
                plain_body.clone().map_or(Value::Null, Value::String),
            );
        }
    }

    if endpoint.include_attachments {
        let attachments = content
            .attachments
            .iter()
            .map(|attachment| {
                json!({
                    "filename": attachment.filename,
                    "content_type": attachment.content_type,
                    "size": attachment.data.len(),
                    "data": STANDARD.encode(&attachment.data),
                })
            })
            .collect();
        fields.insert("attachments".to_string(), Value::Array(attachments));
    }

    fields
}

/// Form fields, with attachments spread over `attachments[i][key]`.
fn flatten(fields: Map<String, Value>) -> Vec<(String, String)> {
    let mut pairs = Vec::with_capacity(fields.len());

    for (key, value) in fields {
        match value {
            Value::Array(items) if key == "attachments" => {
                for (index, item) in items.into_iter().enumerate() {
                    let Value::Object(item) = item else {
                        continue;
                    };
                    for (field, value) in item {
                        pairs.push((format!("attachments[{index}][{field}]"), form_value(value)));
                    }
                }
            }
            value => pairs.push((key, form_value(value))),
        }
    }

    pairs
}

fn form_value(value: Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(value) => value,
        other => other.to_string(),
    }
}
