//! Render Engine - merges templates with substitution data into MIME

use lettre::message::header::ContentType;
use lettre::message::{Mailbox, MultiPart, SinglePart};
use lettre::Message;
use outpost_common::types::{Destination, MessageId};
use outpost_common::{Error, Result};
use outpost_storage::{Template, TemplateRepository};
use regex::{Captures, Regex};
use serde_json::Value;
use std::sync::Arc;

/// Rendered subject and body parts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedContent {
    pub subject: String,
    pub html: Option<String>,
    pub text: Option<String>,
}

/// Headers of an outgoing message
#[derive(Debug, Clone)]
pub struct MimeHeaders<'a> {
    pub from: &'a str,
    pub destination: &'a Destination,
    pub reply_to: &'a [String],
    pub message_id: &'a str,
}

/// Template renderer
pub struct RenderEngine {
    templates: Arc<dyn TemplateRepository>,
    token: Regex,
    hostname: String,
}

impl RenderEngine {
    pub fn new(templates: Arc<dyn TemplateRepository>, hostname: impl Into<String>) -> Result<Self> {
        let token = Regex::new(r"\{\{\s*([A-Za-z0-9_\-]+(?:\.[A-Za-z0-9_\-]+)*)\s*\}\}")
            .map_err(|e| Error::Internal(format!("invalid token pattern: {}", e)))?;
        Ok(Self {
            templates,
            token,
            hostname: hostname.into(),
        })
    }

    /// `Message-ID` value for a message
    pub fn message_id(&self, id: MessageId) -> String {
        format!("<{}@{}>", id, self.hostname)
    }

    /// Look up a template and render all of its parts
    pub async fn render(
        &self,
        template_name: &str,
        substitutions: &Value,
        defaults: &Value,
    ) -> Result<RenderedContent> {
        let template = self
            .templates
            .get(template_name)
            .await?
            .ok_or_else(|| Error::TemplateDoesNotExist(template_name.to_string()))?;
        self.render_template(&template, substitutions, defaults)
    }

    /// Render every part of `template`; the first unresolved token fails
    pub fn render_template(
        &self,
        template: &Template,
        substitutions: &Value,
        defaults: &Value,
    ) -> Result<RenderedContent> {
        let render = |part: &str| self.substitute(part, substitutions, defaults);
        Ok(RenderedContent {
            subject: render(&template.subject_part)?,
            html: template.html_part.as_deref().map(render).transpose()?,
            text: template.text_part.as_deref().map(render).transpose()?,
        })
    }

    /// Replace every `{{token}}` in `input`
    pub fn substitute(&self, input: &str, substitutions: &Value, defaults: &Value) -> Result<String> {
        let mut missing: Option<String> = None;
        let output = self.token.replace_all(input, |caps: &Captures| {
            let token = &caps[1];
            match lookup(substitutions, token).or_else(|| lookup(defaults, token)) {
                Some(value) => value_to_string(value),
                None => {
                    missing.get_or_insert_with(|| token.to_string());
                    String::new()
                }
            }
        });

        match missing {
            Some(token) => Err(Error::MissingRenderingAttribute(token)),
            None => Ok(output.into_owned()),
        }
    }

    /// Assemble a complete message from rendered content
    pub fn build_mime(&self, headers: &MimeHeaders<'_>, content: &RenderedContent) -> Result<Vec<u8>> {
        let mut builder = Message::builder()
            .from(parse_mailbox(headers.from)?)
            .subject(content.subject.as_str())
            .message_id(Some(headers.message_id.to_string()));

        for to in &headers.destination.to {
            builder = builder.to(parse_mailbox(to)?);
        }
        for cc in &headers.destination.cc {
            builder = builder.cc(parse_mailbox(cc)?);
        }
        // Envelope only; lettre drops the Bcc header when formatting
        for bcc in &headers.destination.bcc {
            builder = builder.bcc(parse_mailbox(bcc)?);
        }
        for reply_to in headers.reply_to {
            builder = builder.reply_to(parse_mailbox(reply_to)?);
        }

        let message = match body_part(content)? {
            Body::Single(part) => builder.singlepart(part),
            Body::Multi(part) => builder.multipart(part),
        }
        .map_err(|e| Error::Render(format!("failed to build message: {}", e)))?;

        Ok(message.formatted())
    }

    /// Render a template for preview; errors surface synchronously
    pub async fn preview(&self, template_name: &str, substitutions: &Value) -> Result<String> {
        let content = self.render(template_name, substitutions, &Value::Null).await?;
        let body = match body_part(&content)? {
            Body::Single(part) => part.formatted(),
            Body::Multi(part) => part.formatted(),
        };
        Ok(format!(
            "Subject: {}\r\nMIME-Version: 1.0\r\n{}",
            content.subject,
            String::from_utf8_lossy(&body)
        ))
    }
}

enum Body {
    Single(SinglePart),
    Multi(MultiPart),
}

fn body_part(content: &RenderedContent) -> Result<Body> {
    match (&content.html, &content.text) {
        (Some(html), Some(text)) => Ok(Body::Multi(
            MultiPart::alternative()
                .singlepart(SinglePart::plain(text.clone()))
                .singlepart(SinglePart::html(html.clone())),
        )),
        (Some(html), None) => Ok(Body::Single(
            SinglePart::builder()
                .header(ContentType::TEXT_HTML)
                .body(html.clone()),
        )),
        (None, Some(text)) => Ok(Body::Single(
            SinglePart::builder()
                .header(ContentType::TEXT_PLAIN)
                .body(text.clone()),
        )),
        (None, None) => Err(Error::Render("message has neither HTML nor text body".into())),
    }
}

fn parse_mailbox(address: &str) -> Result<Mailbox> {
    address
        .trim()
        .parse::<Mailbox>()
        .map_err(|e| Error::Render(format!("invalid address {}: {}", address, e)))
}

/// Resolve `a.b.c`, preferring a literal key with dots over the path
fn lookup<'a>(data: &'a Value, token: &str) -> Option<&'a Value> {
    let object = data.as_object()?;
    if let Some(value) = object.get(token) {
        return Some(value);
    }
    let mut current = data;
    for segment in token.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => other.to_string(),
    }
}
