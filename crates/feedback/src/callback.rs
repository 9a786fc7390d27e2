use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use reqwest::header::ACCEPT;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackOutcome {
    /// No url configured.
    Skipped,
    /// The endpoint answered; any status counts.
    Delivered(u16),
    Failed(String),
}

/// Single-shot, best-effort POST of lifecycle outcomes to an external url.
/// Never retries and never returns an error.
#[derive(Clone)]
pub struct CallbackNotifier {
    http: reqwest::Client,
    timeout: Duration,
}

impl CallbackNotifier {
    pub fn new(timeout: Duration) -> Self {
        Self { http: reqwest::Client::new(), timeout }
    }

    pub fn with_client(http: reqwest::Client, timeout: Duration) -> Self {
        Self { http, timeout }
    }

    pub async fn notify_callback(&self, url: &str, kind: &str, messages: &Value, params: &Value) -> CallbackOutcome {
        if url.trim().is_empty() {
            debug!(kind = %kind, "no callback url; skipping");
            return CallbackOutcome::Skipped;
        }
        let form = callback_form(kind, messages, params);
        let started = Instant::now();
        let res = self
            .http
            .post(url)
            .header(ACCEPT, "application/json")
            .timeout(self.timeout)
            .form(&form)
            .send()
            .await;
        histogram!("callback_ms", started.elapsed().as_secs_f64() * 1000.0);
        match res {
            Ok(resp) => {
                let status = resp.status();
                counter!("callback_delivered_total", 1u64);
                if status.is_success() {
                    info!(url = %url, kind = %kind, status = status.as_u16(), "callback delivered");
                } else {
                    warn!(url = %url, kind = %kind, status = status.as_u16(), "callback rejected");
                }
                CallbackOutcome::Delivered(status.as_u16())
            }
            Err(e) => {
                counter!("callback_failed_total", 1u64);
                warn!(url = %url, kind = %kind, error = %e, "callback failed");
                CallbackOutcome::Failed(e.to_string())
            }
        }
    }
}

/// Form body `{type, data[..], messages[..]}`; `messages[logs]` is always present.
pub(crate) fn callback_form(kind: &str, messages: &Value, params: &Value) -> Vec<(String, String)> {
    let mut out = vec![("type".to_string(), kind.to_string())];
    flatten_into("data", params, &mut out);
    let mut messages = match messages {
        Value::Object(m) => m.clone(),
        Value::Null => Map::new(),
        other => {
            let mut m = Map::new();
            m.insert("logs".into(), other.clone());
            m
        }
    };
    messages.entry("logs").or_insert_with(|| Value::String(String::new()));
    flatten_into("messages", &Value::Object(messages), &mut out);
    out
}

fn flatten_into(prefix: &str, v: &Value, out: &mut Vec<(String, String)>) {
    match v {
        Value::Object(m) => {
            for (k, v) in m {
                flatten_into(&format!("{}[{}]", prefix, k), v, out);
            }
        }
        Value::Array(items) => {
            for (i, v) in items.iter().enumerate() {
                flatten_into(&format!("{}[{}]", prefix, i), v, out);
            }
        }
        Value::Null => out.push((prefix.to_string(), String::new())),
        Value::Bool(b) => out.push((prefix.to_string(), if *b { "1" } else { "0" }.to_string())),
        Value::Number(n) => out.push((prefix.to_string(), n.to_string())),
        Value::String(s) => out.push((prefix.to_string(), s.clone())),
    }
}
