//! ADDRESS command dispatch.
//!
//! An ADDRESS target is anything implementing [`AddressTarget`]: an external
//! command environment the program routes text at. Targets live in a
//! case-insensitive registry; the interpreter snapshots which target is
//! current per call frame. Three payload shapes reach a handler: a single
//! command line, a HEREDOC block (interpolated), and parsed JSON for
//! HEREDOCs whose delimiter names JSON.
//!
//! Handler-reported failure and exceptional failure are different things. A
//! handler that runs and reports a problem comes back as a [`HandlerOutcome`]
//! with a nonzero `rc` and an error text; the interpreter surfaces that
//! through the RC / RESULT / ERRORTEXT variables and execution continues.
//! A handler that cannot run at all (unreachable host, malformed response)
//! returns a `Dispatch` diagnostic, which is fatal unless trapped.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use tracing::debug;

use crate::env::Environment;
use crate::error::{Diagnostic, ErrorKind, RexxResult};
use crate::value::Value;

/// What the interpreter hands to a target.
#[derive(Debug, Clone)]
pub enum DispatchPayload {
    /// A single command line: `ADDRESS target "..."` or a MATCHING capture.
    Command(String),
    /// A HEREDOC block, `{name}` placeholders already interpolated.
    Block(String),
    /// A HEREDOC whose delimiter contains "JSON", parsed before dispatch.
    Json(Value),
}

impl DispatchPayload {
    /// Flat text rendering, for targets that only understand strings.
    pub fn text(&self) -> String {
        match self {
            Self::Command(s) | Self::Block(s) => s.clone(),
            Self::Json(v) => v.to_string(),
        }
    }
}

/// The result a handler reports. `rc` 0 means success; nonzero carries the
/// handler's own failure code with `error` as ERRORTEXT.
#[derive(Debug, Clone)]
pub struct HandlerOutcome {
    pub rc: i64,
    pub result: Value,
    pub error: Option<String>,
}

impl HandlerOutcome {
    pub fn success(result: Value) -> Self {
        Self {
            rc: 0,
            result,
            error: None,
        }
    }

    pub fn failure(rc: i64, error: impl Into<String>) -> Self {
        Self {
            rc: if rc == 0 { 1 } else { rc },
            result: Value::empty(),
            error: Some(error.into()),
        }
    }
}

pub trait AddressTarget {
    fn handle(&mut self, payload: &DispatchPayload) -> RexxResult<HandlerOutcome>;
}

/// Named targets, looked up case-insensitively.
#[derive(Default)]
pub struct AddressRegistry {
    targets: HashMap<String, Box<dyn AddressTarget>>,
}

impl AddressRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str, target: Box<dyn AddressTarget>) {
        self.targets.insert(name.to_uppercase(), target);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.targets.contains_key(&name.to_uppercase())
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Box<dyn AddressTarget>> {
        self.targets.get_mut(&name.to_uppercase())
    }
}

/// Replace `{name}` placeholders with variable values. An unset name follows
/// the unset-symbol rule and renders as its own uppercased name; anything
/// that is not a well-formed `{identifier}` passes through untouched.
pub fn interpolate(template: &str, env: &Environment) -> String {
    let chars: Vec<char> = template.chars().collect();
    let mut out = String::with_capacity(template.len());
    let mut i = 0;
    while i < chars.len() {
        if chars[i] == '{' {
            let mut j = i + 1;
            while j < chars.len()
                && (chars[j].is_ascii_alphanumeric() || chars[j] == '_' || chars[j] == '.')
            {
                j += 1;
            }
            if j > i + 1 && j < chars.len() && chars[j] == '}' {
                let name: String = chars[i + 1..j].iter().collect();
                match env.get(&name) {
                    Some(val) => out.push_str(&val.to_string()),
                    None => out.push_str(&name.to_uppercase()),
                }
                i = j + 1;
                continue;
            }
        }
        out.push(chars[i]);
        i += 1;
    }
    out
}

/// An HTTP-backed target registered with `ADDRESS "url" [AUTH token] AS name`.
///
/// Command payloads post `{"command": first-word, "params": rest}`; JSON
/// payloads post as-is. An HTTP error status is a handler-reported failure
/// (the status becomes RC), except 401, which is fatal and names the AUTH
/// clause so the failing credential is identifiable without printing it.
pub struct HttpTarget {
    url: String,
    auth: Option<String>,
    agent: ureq::Agent,
}

impl HttpTarget {
    pub fn new(url: impl Into<String>, auth: Option<String>) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(10))
            .build();
        Self {
            url: url.into(),
            auth,
            agent,
        }
    }

    fn request_body(payload: &DispatchPayload) -> serde_json::Value {
        match payload {
            DispatchPayload::Json(v) => v.to_json(),
            DispatchPayload::Command(text) | DispatchPayload::Block(text) => {
                let mut words = text.splitn(2, char::is_whitespace);
                let command = words.next().unwrap_or("").to_string();
                let params = words.next().unwrap_or("").trim().to_string();
                serde_json::json!({ "command": command, "params": params })
            }
        }
    }

    fn outcome_from_response(body: serde_json::Value) -> HandlerOutcome {
        // A well-behaved endpoint replies {"rc": n, "result": ..,
        // "errortext": ..}; anything else becomes the RESULT wholesale.
        if let serde_json::Value::Object(map) = &body {
            let rc = map
                .get("rc")
                .and_then(serde_json::Value::as_i64)
                .unwrap_or(0);
            let result = map
                .get("result")
                .map_or_else(|| Value::from_json(&body), Value::from_json);
            let error = map
                .get("errortext")
                .and_then(serde_json::Value::as_str)
                .map(String::from);
            return HandlerOutcome { rc, result, error };
        }
        HandlerOutcome::success(Value::from_json(&body))
    }
}

impl AddressTarget for HttpTarget {
    fn handle(&mut self, payload: &DispatchPayload) -> RexxResult<HandlerOutcome> {
        debug!(url = %self.url, "dispatching to remote target");
        let mut request = self
            .agent
            .post(&self.url)
            .set("Content-Type", "application/json");
        if let Some(token) = &self.auth {
            request = request.set("Authorization", &format!("Bearer {token}"));
        }

        match request.send_json(Self::request_body(payload)) {
            Ok(response) => {
                let body: serde_json::Value = response.into_json().map_err(|e| {
                    Diagnostic::new(
                        ErrorKind::Dispatch,
                        format!("remote target '{}' returned a malformed response: {e}", self.url),
                    )
                })?;
                Ok(Self::outcome_from_response(body))
            }
            Err(ureq::Error::Status(401, _)) => Err(Diagnostic::new(
                ErrorKind::Dispatch,
                format!(
                    "remote target '{}' rejected the AUTH credential (HTTP 401)",
                    self.url
                ),
            )),
            Err(ureq::Error::Status(code, response)) => {
                let text = response.into_string().unwrap_or_default();
                Ok(HandlerOutcome::failure(
                    i64::from(code),
                    format!("remote target '{}' replied HTTP {code}: {text}", self.url),
                ))
            }
            Err(ureq::Error::Transport(t)) => Err(Diagnostic::new(
                ErrorKind::Dispatch,
                format!("remote target '{}' is unreachable: {t}", self.url),
            )),
        }
    }
}

/// In-process target that records every payload it receives and replies with
/// a scripted outcome. Used throughout the test suites; also the shape an
/// embedding application implements to receive routed commands.
pub struct RecordingTarget {
    pub received: Rc<RefCell<Vec<String>>>,
    reply: Value,
    fail_with: Option<(i64, String)>,
}

impl RecordingTarget {
    pub fn new() -> (Self, Rc<RefCell<Vec<String>>>) {
        let received = Rc::new(RefCell::new(Vec::new()));
        (
            Self {
                received: Rc::clone(&received),
                reply: Value::empty(),
                fail_with: None,
            },
            received,
        )
    }

    pub fn replying(mut self, value: Value) -> Self {
        self.reply = value;
        self
    }

    pub fn failing(mut self, rc: i64, error: impl Into<String>) -> Self {
        self.fail_with = Some((rc, error.into()));
        self
    }
}

impl AddressTarget for RecordingTarget {
    fn handle(&mut self, payload: &DispatchPayload) -> RexxResult<HandlerOutcome> {
        self.received.borrow_mut().push(payload.text());
        if let Some((rc, error)) = &self.fail_with {
            Ok(HandlerOutcome::failure(*rc, error.clone()))
        } else {
            Ok(HandlerOutcome::success(self.reply.clone()))
        }
    }
}
