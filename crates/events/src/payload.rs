//! Webhook body encodings.
//!
//! The same [`JobEvent`] is rendered as JSON, as a flat
//! `application/x-www-form-urlencoded` body, or as a `<webhook>` XML
//! document depending on the subscription's [`ContentType`].

use chrono::SecondsFormat;
use docjobs_core::ContentType;
use quick_xml::escape::escape;
use serde_json::Value;

use crate::bus::JobEvent;

/// Encode `event` for delivery with `content_type`.
pub fn encode(event: &JobEvent, content_type: ContentType) -> Result<Vec<u8>, serde_json::Error> {
    match content_type {
        ContentType::Json => serde_json::to_vec(event),
        ContentType::Form => Ok(encode_form(event).into_bytes()),
        ContentType::Xml => Ok(encode_xml(event).into_bytes()),
    }
}

/// Flat `(key, value)` pairs shared by the FORM and XML encodings, in
/// payload order. Result entries are reported separately.
fn scalar_fields(event: &JobEvent) -> Vec<(&'static str, String)> {
    let mut fields = vec![
        ("event", event.kind.as_str().to_string()),
        ("jobId", event.job_id.clone()),
        ("toolName", event.tool_name.clone()),
        ("status", event.status.as_str().to_string()),
        ("progress", event.progress.to_string()),
    ];
    if let Some(message) = &event.message {
        fields.push(("message", message.clone()));
    }
    fields.push((
        "timestamp",
        event.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
    ));
    if let Some(code) = event.error_code {
        fields.push(("errorCode", code.as_str().to_string()));
    }
    if let Some(message) = &event.error_message {
        fields.push(("errorMessage", message.clone()));
    }
    fields
}

/// Strings are sent raw; everything else as compact JSON.
fn flatten(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn encode_form(event: &JobEvent) -> String {
    let mut form = url::form_urlencoded::Serializer::new(String::new());
    for (key, value) in scalar_fields(event) {
        form.append_pair(key, &value);
    }
    if let Some(result) = &event.result {
        for (key, value) in result {
            form.append_pair(&format!("result.{key}"), &flatten(value));
        }
    }
    form.finish()
}

fn encode_xml(event: &JobEvent) -> String {
    let mut xml = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<webhook>");
    for (key, value) in scalar_fields(event) {
        xml.push_str(&format!("<{key}>{}</{key}>", escape(value.as_str())));
    }
    if let Some(result) = &event.result {
        xml.push_str("<result>");
        for (key, value) in result {
            xml.push_str(&format!(
                "<entry key=\"{}\">{}</entry>",
                escape(key.as_str()),
                escape(flatten(value).as_str())
            ));
        }
        xml.push_str("</result>");
    }
    xml.push_str("</webhook>");
    xml
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
