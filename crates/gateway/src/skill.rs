//! Voice request envelope parsing and intent routing.
//!
//! Only reached after the request has been authenticated. Every outcome,
//! including an unreadable envelope, is a spoken response with HTTP 200.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::dispatcher::TaskDispatcher;

pub const RUN_TASK_INTENT: &str = "RunTaskIntent";
pub const GET_STATUS_INTENT: &str = "GetStatusIntent";
const HELP_INTENT: &str = "AMAZON.HelpIntent";
const CANCEL_INTENT: &str = "AMAZON.CancelIntent";
const STOP_INTENT: &str = "AMAZON.StopIntent";
const TASK_SLOT: &str = "task";

const LAUNCH_SPEECH: &str = "Codex is ready. Tell me what you need.";
const TASK_REPROMPT: &str = "What task should Codex handle?";
const TASK_ACCEPTED: &str = "Got it. I'll let you know when Codex finishes.";
const TASK_MISSING: &str = "I did not catch the task. Please say it again.";
const NO_STATUS: &str = "I do not have any recent updates yet.";
const HELP_SPEECH: &str =
    "Ask Codex to handle a task, for example, \"run the nightly deployment\".";
const HELP_REPROMPT: &str = "What task do you want Codex to run?";
const GOODBYE: &str = "Goodbye.";
const FAILURE_SPEECH: &str = "Sorry, I had trouble doing that. Please try again.";
const FAILURE_REPROMPT: &str = "Please try again.";

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestEnvelope {
    #[serde(default)]
    pub session: Option<Session>,
    #[serde(default)]
    pub context: Option<Context>,
    pub request: Request,
}

#[derive(Debug, Default, Deserialize)]
pub struct Session {
    #[serde(default)]
    pub user: Option<User>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Context {
    #[serde(default)]
    pub system: Option<SystemContext>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SystemContext {
    #[serde(default)]
    pub user: Option<User>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    #[serde(default)]
    pub access_token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct Request {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub intent: Option<Intent>,
}

#[derive(Debug, Default, Deserialize)]
pub struct Intent {
    pub name: String,
    #[serde(default)]
    pub slots: HashMap<String, Slot>,
}

#[derive(Debug, Default, Deserialize)]
pub struct Slot {
    #[serde(default)]
    pub value: Option<String>,
}

impl RequestEnvelope {
    /// Linked-account token, preferring the per-request system context.
    pub fn access_token(&self) -> Option<String> {
        let from_context = self
            .context
            .as_ref()
            .and_then(|ctx| ctx.system.as_ref())
            .and_then(|system| system.user.as_ref())
            .and_then(|user| user.access_token.clone());
        let from_session = || {
            self.session
                .as_ref()
                .and_then(|session| session.user.as_ref())
                .and_then(|user| user.access_token.clone())
        };
        from_context.or_else(from_session).filter(|token| !token.is_empty())
    }

    pub fn slot_value(&self, name: &str) -> Option<&str> {
        self.request
            .intent
            .as_ref()?
            .slots
            .get(name)?
            .value
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkillResponse {
    pub version: &'static str,
    pub response: ResponseBody,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseBody {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_speech: Option<OutputSpeech>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reprompt: Option<Reprompt>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub should_end_session: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Reprompt {
    pub output_speech: OutputSpeech,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutputSpeech {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub ssml: String,
}

impl OutputSpeech {
    fn ssml(text: &str) -> Self {
        Self {
            kind: "SSML",
            ssml: format!("<speak>{}</speak>", escape_ssml(text)),
        }
    }
}

impl SkillResponse {
    fn empty() -> Self {
        Self {
            version: "1.0",
            response: ResponseBody::default(),
        }
    }

    fn speak(text: &str) -> Self {
        let mut response = Self::empty();
        response.response.output_speech = Some(OutputSpeech::ssml(text));
        response
    }

    fn reprompt(mut self, text: &str) -> Self {
        self.response.reprompt = Some(Reprompt {
            output_speech: OutputSpeech::ssml(text),
        });
        self.response.should_end_session = Some(false);
        self
    }

    fn end_session(mut self) -> Self {
        self.response.should_end_session = Some(true);
        self
    }

    /// Spoken text without the SSML wrapper.
    pub fn speech_text(&self) -> Option<String> {
        let ssml = &self.response.output_speech.as_ref()?.ssml;
        let inner = ssml
            .strip_prefix("<speak>")
            .and_then(|rest| rest.strip_suffix("</speak>"))
            .unwrap_or(ssml);
        Some(unescape_ssml(inner))
    }
}

pub struct SkillHandler {
    dispatcher: Arc<TaskDispatcher>,
}

impl SkillHandler {
    pub fn new(dispatcher: Arc<TaskDispatcher>) -> Self {
        Self { dispatcher }
    }

    pub fn handle(&self, body: &[u8]) -> SkillResponse {
        let envelope: RequestEnvelope = match serde_json::from_slice(body) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(error = %err, "unreadable skill request envelope");
                return SkillResponse::speak(FAILURE_SPEECH).reprompt(FAILURE_REPROMPT);
            }
        };

        debug!(request_type = %envelope.request.kind, "routing skill request");
        match envelope.request.kind.as_str() {
            "LaunchRequest" => SkillResponse::speak(LAUNCH_SPEECH).reprompt(TASK_REPROMPT),
            "IntentRequest" => self.handle_intent(&envelope),
            "SessionEndedRequest" => SkillResponse::empty(),
            other => {
                warn!(request_type = other, "unsupported skill request type");
                SkillResponse::speak(FAILURE_SPEECH).reprompt(FAILURE_REPROMPT)
            }
        }
    }

    fn handle_intent(&self, envelope: &RequestEnvelope) -> SkillResponse {
        let name = envelope
            .request
            .intent
            .as_ref()
            .map(|intent| intent.name.as_str())
            .unwrap_or_default();

        match name {
            RUN_TASK_INTENT => match envelope.slot_value(TASK_SLOT) {
                Some(task) => {
                    info!(task, "voice task accepted");
                    // Fire and forget: the response must not wait on the runner.
                    drop(self.dispatcher.enqueue(
                        task,
                        RUN_TASK_INTENT,
                        envelope.access_token(),
                    ));
                    SkillResponse::speak(TASK_ACCEPTED).end_session()
                }
                None => SkillResponse::speak(TASK_MISSING).reprompt(TASK_REPROMPT),
            },
            GET_STATUS_INTENT => {
                let speech = match self.dispatcher.store().latest() {
                    Some(entry) if !entry.summary.trim().is_empty() => entry.summary,
                    Some(entry) => format!("Last task {}: {}", entry.status, entry.task),
                    None => NO_STATUS.to_string(),
                };
                SkillResponse::speak(&speech).end_session()
            }
            HELP_INTENT => SkillResponse::speak(HELP_SPEECH).reprompt(HELP_REPROMPT),
            CANCEL_INTENT | STOP_INTENT => SkillResponse::speak(GOODBYE).end_session(),
            other => SkillResponse::speak(&format!("You just triggered {other}.")),
        }
    }
}

fn escape_ssml(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

fn unescape_ssml(text: &str) -> String {
    text.replace("&apos;", "'")
        .replace("&quot;", "\"")
        .replace("&gt;", ">")
        .replace("&lt;", "<")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkerConfig;
    use crate::errors::NotifyError;
    use crate::notifications::Notifier;
    use crate::status_store::{StatusEntry, StatusStore};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use codelexa_common::SystemClock;
    use serde_json::json;
    use tempfile::{tempdir, TempDir};

    struct SilentNotifier;

    #[async_trait]
    impl Notifier for SilentNotifier {
        async fn notify(&self, _message: &str) -> Result<(), NotifyError> {
            Ok(())
        }
    }

    fn handler() -> (TempDir, SkillHandler) {
        let dir = tempdir().unwrap();
        let dispatcher = TaskDispatcher::new(
            WorkerConfig {
                runner: dir.path().join("absent-runner"),
                interpreter: None,
                args: vec![],
                max_concurrent: None,
            },
            StatusStore::new(dir.path().join("status.json")),
            Arc::new(SilentNotifier),
            Arc::new(SystemClock),
        );
        (dir, SkillHandler::new(Arc::new(dispatcher)))
    }

    fn intent(name: &str, slots: serde_json::Value) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "version": "1.0",
            "session": {"user": {"userId": "u-1", "accessToken": "session-token"}},
            "context": {"System": {"user": {"userId": "u-1", "accessToken": "context-token"}}},
            "request": {"type": "IntentRequest", "intent": {"name": name, "slots": slots}}
        }))
        .unwrap()
    }

    #[test]
    fn access_token_prefers_system_context() {
        let envelope: RequestEnvelope = serde_json::from_slice(&intent("X", json!({}))).unwrap();
        assert_eq!(envelope.access_token().as_deref(), Some("context-token"));

        let session_only: RequestEnvelope = serde_json::from_value(json!({
            "session": {"user": {"accessToken": "session-token"}},
            "request": {"type": "LaunchRequest"}
        }))
        .unwrap();
        assert_eq!(session_only.access_token().as_deref(), Some("session-token"));
    }

    #[test]
    fn launch_greets_and_keeps_session_open() {
        let (_dir, handler) = handler();
        let body = serde_json::to_vec(&json!({"request": {"type": "LaunchRequest"}})).unwrap();

        let response = handler.handle(&body);

        assert_eq!(response.speech_text().as_deref(), Some(LAUNCH_SPEECH));
        assert_eq!(response.response.should_end_session, Some(false));
        assert!(response.response.reprompt.is_some());
    }

    #[tokio::test]
    async fn run_task_without_slot_reprompts_and_dispatches_nothing() {
        let (dir, handler) = handler();

        let response = handler.handle(&intent(RUN_TASK_INTENT, json!({"task": {"name": "task"}})));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert_eq!(response.speech_text().as_deref(), Some(TASK_MISSING));
        assert!(!dir.path().join("status.json").exists());
    }

    #[tokio::test]
    async fn run_task_acknowledges_and_ends_session() {
        let (_dir, handler) = handler();

        let response = handler.handle(&intent(
            RUN_TASK_INTENT,
            json!({"task": {"name": "task", "value": "deploy service X"}}),
        ));

        assert_eq!(response.speech_text().as_deref(), Some(TASK_ACCEPTED));
        assert_eq!(response.response.should_end_session, Some(true));
    }

    #[test]
    fn status_intent_speaks_latest_entry() {
        let (_dir, handler) = handler();
        let body = intent(GET_STATUS_INTENT, json!({}));
        assert_eq!(handler.handle(&body).speech_text().as_deref(), Some(NO_STATUS));

        let store = handler.dispatcher.store();
        let mut entry = StatusEntry {
            timestamp: DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap(),
            task: "rotate keys".into(),
            status: "error".into(),
            summary: String::new(),
            session: None,
            recipients: vec![],
            intent: RUN_TASK_INTENT.into(),
        };
        store.record(entry.clone()).unwrap();
        assert_eq!(
            handler.handle(&body).speech_text().as_deref(),
            Some("Last task error: rotate keys")
        );

        entry.summary = "Keys rotated & deployed.".into();
        store.record(entry).unwrap();
        assert_eq!(
            handler.handle(&body).speech_text().as_deref(),
            Some("Keys rotated & deployed.")
        );
    }

    #[test]
    fn builtin_and_unknown_intents() {
        let (_dir, handler) = handler();

        let help = handler.handle(&intent(HELP_INTENT, json!({})));
        assert_eq!(help.speech_text().as_deref(), Some(HELP_SPEECH));

        let stop = handler.handle(&intent(STOP_INTENT, json!({})));
        assert_eq!(stop.speech_text().as_deref(), Some(GOODBYE));
        assert_eq!(stop.response.should_end_session, Some(true));

        let other = handler.handle(&intent("OrderPizzaIntent", json!({})));
        assert_eq!(
            other.speech_text().as_deref(),
            Some("You just triggered OrderPizzaIntent.")
        );
    }

    #[test]
    fn session_end_and_garbage() {
        let (_dir, handler) = handler();

        let ended = handler.handle(br#"{"request":{"type":"SessionEndedRequest"}}"#);
        let json = serde_json::to_value(&ended).unwrap();
        assert_eq!(json, json!({"version": "1.0", "response": {}}));

        let garbage = handler.handle(b"not json at all");
        assert_eq!(garbage.speech_text().as_deref(), Some(FAILURE_SPEECH));
    }

    #[test]
    fn response_uses_platform_shape() {
        let response = SkillResponse::speak("Goodbye.").end_session();
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["version"], "1.0");
        assert_eq!(json["response"]["outputSpeech"]["type"], "SSML");
        assert_eq!(json["response"]["outputSpeech"]["ssml"], "<speak>Goodbye.</speak>");
        assert_eq!(json["response"]["shouldEndSession"], true);
    }
}
