use anyhow::{anyhow, Context, Result};
use rand::Rng;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use super::{ClipSink, Delivery};

pub const DEFAULT_API_BASE: &str = "https://api.telegram.org";

const UPLOAD_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Deserialize)]
struct ApiReply {
    ok: bool,
    description: Option<String>,
}

/// Sends clips with the Bot API `sendVideo` method.
pub struct TelegramSink {
    agent: ureq::Agent,
    endpoint: String,
    chat_id: String,
}

impl TelegramSink {
    pub fn new(api_base: &str, token: String, chat_id: String) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(10))
            .timeout(UPLOAD_TIMEOUT)
            .build();
        Self {
            agent,
            endpoint: format!("{}/bot{}/sendVideo", api_base.trim_end_matches('/'), token),
            chat_id,
        }
    }
}

impl ClipSink for TelegramSink {
    fn name(&self) -> &'static str {
        "telegram"
    }

    fn deliver(&mut self, path: &Path, caption: &str) -> Result<Delivery> {
        let video = std::fs::read(path)
            .with_context(|| format!("failed to read clip {}", path.display()))?;
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("clip.mp4");
        let form = MultipartForm::new()
            .text("chat_id", &self.chat_id)
            .text("caption", caption)
            .file("video", file_name, content_type_for(path), &video);

        // The endpoint carries the bot token and must not appear in errors.
        let reply = match self
            .agent
            .post(&self.endpoint)
            .set("Content-Type", &form.content_type())
            .send_bytes(&form.finish())
        {
            Ok(response) => response.into_string().context("read sendVideo reply")?,
            Err(ureq::Error::Status(code, response)) => {
                let body = response.into_string().unwrap_or_default();
                return Err(anyhow!(
                    "sendVideo returned HTTP {}: {}",
                    code,
                    reply_description(&body).unwrap_or(body)
                ));
            }
            Err(ureq::Error::Transport(e)) => {
                return Err(anyhow!("sendVideo request failed: {}", e.kind()));
            }
        };
        let parsed: ApiReply =
            serde_json::from_str(&reply).context("sendVideo reply is not valid JSON")?;
        if !parsed.ok {
            return Err(anyhow!(
                "sendVideo rejected the clip: {}",
                parsed.description.unwrap_or_else(|| "no description".into())
            ));
        }
        Ok(Delivery::Sent)
    }
}

fn reply_description(body: &str) -> Option<String> {
    serde_json::from_str::<ApiReply>(body)
        .ok()
        .and_then(|reply| reply.description)
}

fn content_type_for(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("mp4") => "video/mp4",
        _ => "application/octet-stream",
    }
}

/// Minimal `multipart/form-data` body builder.
struct MultipartForm {
    boundary: String,
    body: Vec<u8>,
}

impl MultipartForm {
    fn new() -> Self {
        let token: u64 = rand::thread_rng().gen();
        Self::with_boundary(format!("clipwatch-{:016x}", token))
    }

    fn with_boundary(boundary: String) -> Self {
        Self {
            boundary,
            body: Vec::new(),
        }
    }

    fn text(mut self, name: &str, value: &str) -> Self {
        self.part_header(name, None, None);
        self.body.extend_from_slice(value.as_bytes());
        self.body.extend_from_slice(b"\r\n");
        self
    }

    fn file(mut self, name: &str, file_name: &str, content_type: &str, data: &[u8]) -> Self {
        self.part_header(name, Some(file_name), Some(content_type));
        self.body.extend_from_slice(data);
        self.body.extend_from_slice(b"\r\n");
        self
    }

    fn part_header(&mut self, name: &str, file_name: Option<&str>, content_type: Option<&str>) {
        let mut header = format!(
            "--{}\r\nContent-Disposition: form-data; name=\"{}\"",
            self.boundary, name
        );
        if let Some(file_name) = file_name {
            header.push_str(&format!("; filename=\"{}\"", file_name.replace('"', "")));
        }
        header.push_str("\r\n");
        if let Some(content_type) = content_type {
            header.push_str(&format!("Content-Type: {}\r\n", content_type));
        }
        header.push_str("\r\n");
        self.body.extend_from_slice(header.as_bytes());
    }

    fn content_type(&self) -> String {
        format!("multipart/form-data; boundary={}", self.boundary)
    }

    fn finish(mut self) -> Vec<u8> {
        self.body
            .extend_from_slice(format!("--{}--\r\n", self.boundary).as_bytes());
        self.body
    }
}
