//! Interactive login against the upstream's onboarding task flow. The flow
//! is server-driven: every POST to `/1.1/onboarding/task.json` returns a
//! rolling `flow_token` plus at most one next subtask, until the upstream
//! terminates the flow with success or denial.

use crate::guest::{install_guest_headers, GuestAuth, BEARER_TOKEN};
use crate::jar::SessionJar;
use crate::mail::MailCodeFetcher;
use crate::store::AccountCredential;
use crate::totp;
use crate::transport::UpstreamTransport;
use crate::txid::TransactionIdProvider;
use crate::upstream::{graphql_url, ops};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, COOKIE};
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

const ONBOARDING_TASK_PATH: &str = "/1.1/onboarding/task.json";
// Initial attempt plus three retries, backing off 2s/4s/6s between them.
const TWO_FACTOR_MAX_ATTEMPTS: u32 = 4;
// Upstream flows are short; anything past this is a loop.
const MAX_FLOW_STEPS: usize = 20;

#[derive(Debug, Error)]
pub enum LoginError {
    /// Network blip; the caller decides whether to try again.
    #[error("network failure during login: {0}")]
    Transient(String),
    /// The upstream answered but rejected the step.
    #[error("upstream rejected the login flow: {0}")]
    Protocol(String),
    /// Terminal: denied, unknown subtask, or an exhausted challenge.
    #[error("login failed: {0}")]
    Fatal(String),
}

impl LoginError {
    /// Arkose challenges poison subsequent attempts from the same address
    /// for a short while; the pool paces candidates when it sees one.
    pub fn is_arkose(&self) -> bool {
        match self {
            LoginError::Transient(msg) | LoginError::Protocol(msg) | LoginError::Fatal(msg) => {
                msg.contains("Arkose") || msg.contains("arkose")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subtask {
    JsInstrumentation,
    EnterUserIdentifier,
    EnterAlternateIdentifier,
    EnterPassword,
    AccountDuplicationCheck,
    TwoFactorChallenge,
    Acid,
    Success,
    Deny,
    Unknown(String),
}

impl From<&str> for Subtask {
    fn from(s: &str) -> Self {
        match s {
            "LoginJsInstrumentationSubtask" => Self::JsInstrumentation,
            "LoginEnterUserIdentifierSSO" => Self::EnterUserIdentifier,
            "LoginEnterAlternateIdentifierSubtask" => Self::EnterAlternateIdentifier,
            "LoginEnterPassword" => Self::EnterPassword,
            "AccountDuplicationCheck" => Self::AccountDuplicationCheck,
            "LoginTwoFactorAuthChallenge" => Self::TwoFactorChallenge,
            "LoginAcid" => Self::Acid,
            "LoginSuccessSubtask" => Self::Success,
            "DenyLoginSubtask" => Self::Deny,
            other => Self::Unknown(other.to_string()),
        }
    }
}

struct FlowStep {
    flow_token: String,
    subtask: Option<(Subtask, Value)>,
}

pub struct LoginFlow<'a> {
    pub base_url: &'a str,
    pub transport: &'a UpstreamTransport,
    pub jar: &'a SessionJar,
    pub guest: &'a GuestAuth,
    pub mail: &'a dyn MailCodeFetcher,
    pub txid: &'a dyn TransactionIdProvider,
}

impl<'a> LoginFlow<'a> {
    /// Drive the interactive flow to completion. On success the jar holds
    /// a fresh `auth_token` session cookie.
    pub async fn run(&self, credential: &AccountCredential) -> Result<(), LoginError> {
        self.jar.clear_transient();
        self.guest.invalidate().await;

        let mut step = self.init_flow().await?;
        for _ in 0..MAX_FLOW_STEPS {
            let Some((subtask, raw)) = step.subtask.take() else {
                // No next subtask and no explicit success: the upstream
                // considers the flow finished.
                return self.require_session_cookie();
            };
            debug!(subtask = ?subtask, username = %credential.username, "login flow step");
            step = match subtask {
                Subtask::Success => return self.require_session_cookie(),
                Subtask::Deny => {
                    return Err(LoginError::Fatal("upstream denied the login".into()))
                }
                Subtask::Unknown(id) => {
                    return Err(LoginError::Fatal(format!("unknown_subtask: {id}")))
                }
                Subtask::JsInstrumentation => {
                    self.execute(step.flow_token, js_instrumentation_input()).await?
                }
                Subtask::EnterUserIdentifier => {
                    self.execute(step.flow_token, identifier_input(&credential.username))
                        .await?
                }
                Subtask::EnterAlternateIdentifier => {
                    if credential.email.is_empty() {
                        return Err(LoginError::Fatal(
                            "alternate identifier requested but account has no email".into(),
                        ));
                    }
                    self.execute(step.flow_token, alternate_identifier_input(&credential.email))
                        .await?
                }
                Subtask::EnterPassword => {
                    self.execute(step.flow_token, password_input(&credential.password))
                        .await?
                }
                Subtask::AccountDuplicationCheck => {
                    self.execute(step.flow_token, duplication_check_input()).await?
                }
                Subtask::TwoFactorChallenge => {
                    self.two_factor_challenge(step.flow_token, credential).await?
                }
                Subtask::Acid => self.acid_challenge(step.flow_token, credential, &raw).await?,
            };
        }
        Err(LoginError::Protocol(
            "login flow did not terminate".to_string(),
        ))
    }

    /// Shortcut path for accounts imported with a pre-seeded session
    /// cookie: install it, pick up a csrf cookie from the home page, then
    /// probe an authenticated endpoint to confirm the cookie still works.
    pub async fn login_with_token(&self, auth_token: &str) -> Result<(), LoginError> {
        self.jar.set("auth_token", auth_token);

        let mut headers = HeaderMap::new();
        if let Ok(value) = HeaderValue::from_str(&format!("Bearer {BEARER_TOKEN}")) {
            headers.insert(AUTHORIZATION, value);
        }
        if let Some(cookie_header) = self.jar.header_value() {
            if let Ok(value) = HeaderValue::from_str(&cookie_header) {
                headers.insert(COOKIE, value);
            }
        }
        let home = self
            .transport
            .send_with_jar(
                self.transport
                    .client()
                    .get(format!("{}/home", self.base_url))
                    .headers(headers),
                self.jar,
            )
            .await
            .map_err(|e| LoginError::Transient(e.to_string()))?;
        if home.status().is_server_error() {
            return Err(LoginError::Transient(format!(
                "home page returned {}",
                home.status()
            )));
        }

        let probe_url = graphql_url(self.base_url, ops::VIEWER, &json!({}), &json!({}));
        let mut headers = HeaderMap::new();
        if let Ok(value) = HeaderValue::from_str(&format!("Bearer {BEARER_TOKEN}")) {
            headers.insert(AUTHORIZATION, value);
        }
        if let Some(cookie_header) = self.jar.header_value() {
            if let Ok(value) = HeaderValue::from_str(&cookie_header) {
                headers.insert(COOKIE, value);
            }
        }
        if let Some(csrf) = self.jar.get("ct0") {
            if let Ok(value) = HeaderValue::from_str(&csrf) {
                headers.insert("x-csrf-token", value);
            }
        }
        let probe = self
            .transport
            .send_with_jar(
                self.transport.client().get(probe_url).headers(headers),
                self.jar,
            )
            .await
            .map_err(|e| LoginError::Transient(e.to_string()))?;
        let status = probe.status();
        if !status.is_success() {
            return Err(LoginError::Protocol(format!(
                "session cookie probe returned {status}"
            )));
        }
        let body: Value = probe
            .json()
            .await
            .map_err(|e| LoginError::Protocol(format!("session probe body unreadable: {e}")))?;
        if let Some(message) = first_error_message(&body) {
            return Err(LoginError::Protocol(format!(
                "session cookie rejected: {message}"
            )));
        }
        Ok(())
    }

    fn require_session_cookie(&self) -> Result<(), LoginError> {
        if self.jar.get("auth_token").is_some() {
            Ok(())
        } else {
            Err(LoginError::Protocol(
                "flow finished without a session cookie".into(),
            ))
        }
    }

    async fn init_flow(&self) -> Result<FlowStep, LoginError> {
        let body = json!({
            "flow_name": "login",
            "input_flow_data": {
                "flow_context": {
                    "debug_overrides": {},
                    "start_location": { "location": "splash_screen" }
                }
            }
        });
        self.post_flow(format!("{}{}?flow_name=login", self.base_url, ONBOARDING_TASK_PATH), body)
            .await
    }

    async fn execute(&self, flow_token: String, subtask_input: Value) -> Result<FlowStep, LoginError> {
        let body = json!({
            "flow_token": flow_token,
            "subtask_inputs": [subtask_input],
        });
        self.post_flow(format!("{}{}", self.base_url, ONBOARDING_TASK_PATH), body)
            .await
    }

    async fn post_flow(&self, url: String, body: Value) -> Result<FlowStep, LoginError> {
        let mut headers = HeaderMap::new();
        let guest_token = self
            .guest
            .token(self.transport.client())
            .await
            .map_err(|e| LoginError::Transient(e.to_string()))?;
        install_guest_headers(&mut headers, &guest_token, self.jar);
        if let Some(txid) = self.txid.transaction_id("POST", ONBOARDING_TASK_PATH).await {
            if let Ok(value) = HeaderValue::from_str(&txid) {
                headers.insert("X-Client-Transaction-Id", value);
            }
        }

        let response = self
            .transport
            .send_with_jar(
                self.transport.client().post(&url).headers(headers).json(&body),
                self.jar,
            )
            .await
            .map_err(|e| LoginError::Transient(e.to_string()))?;

        let status = response.status();
        let body: Value = response
            .json()
            .await
            .map_err(|e| LoginError::Protocol(format!("flow response unreadable: {e}")))?;
        if let Some(message) = first_error_message(&body) {
            return Err(LoginError::Protocol(message));
        }
        if !status.is_success() {
            return Err(LoginError::Protocol(format!(
                "flow step returned {status}"
            )));
        }

        let flow_token = body
            .get("flow_token")
            .and_then(|t| t.as_str())
            .ok_or_else(|| LoginError::Protocol("flow response missing flow_token".into()))?
            .to_string();
        let subtask = body
            .get("subtasks")
            .and_then(|s| s.as_array())
            .and_then(|subtasks| subtasks.first())
            .and_then(|raw| {
                raw.get("subtask_id")
                    .and_then(|id| id.as_str())
                    .map(|id| (Subtask::from(id), raw.clone()))
            });
        Ok(FlowStep { flow_token, subtask })
    }

    async fn two_factor_challenge(
        &self,
        flow_token: String,
        credential: &AccountCredential,
    ) -> Result<FlowStep, LoginError> {
        let Some(secret) = credential.two_factor_secret.as_deref() else {
            return Err(LoginError::Fatal(
                "two-factor challenge requested but account has no secret".into(),
            ));
        };
        let token = flow_token;
        for attempt in 1..=TWO_FACTOR_MAX_ATTEMPTS {
            let code = totp::generate_code(secret).map_err(|e| LoginError::Fatal(e.to_string()))?;
            match self.execute(token.clone(), two_factor_input(&code)).await {
                Ok(step) => return Ok(step),
                Err(LoginError::Protocol(message))
                    if message.to_lowercase().contains("verification code is invalid")
                        && attempt < TWO_FACTOR_MAX_ATTEMPTS =>
                {
                    // Flow token does not advance on a rejected code.
                    let backoff = Duration::from_secs(2 * attempt as u64);
                    warn!(attempt, "two-factor code rejected; backing off");
                    tokio::time::sleep(backoff).await;
                }
                Err(LoginError::Protocol(message))
                    if message.to_lowercase().contains("verification code is invalid") =>
                {
                    return Err(LoginError::Fatal(
                        "two-factor verification attempts exhausted".into(),
                    ));
                }
                Err(other) => return Err(other),
            }
        }
        Err(LoginError::Fatal(
            "two-factor verification attempts exhausted".into(),
        ))
    }

    async fn acid_challenge(
        &self,
        flow_token: String,
        credential: &AccountCredential,
        raw_subtask: &Value,
    ) -> Result<FlowStep, LoginError> {
        if credential.email.is_empty() {
            return Err(LoginError::Fatal(
                "acid challenge requested but account has no email".into(),
            ));
        }
        let prompt = primary_text(raw_subtask).unwrap_or_default().to_lowercase();
        let answer = if prompt.contains("code") || prompt.contains("verification") {
            self.mail
                .fetch_latest_code(&credential.email, &credential.email_password)
                .await
                .map_err(|e| LoginError::Fatal(format!("confirmation code unavailable: {e}")))?
        } else {
            credential.email.clone()
        };
        self.execute(flow_token, acid_input(&answer)).await
    }
}

/// Non-empty `errors[]` in an otherwise parseable body.
pub fn first_error_message(body: &Value) -> Option<String> {
    body.get("errors")
        .and_then(|e| e.as_array())
        .filter(|errors| !errors.is_empty())
        .map(|errors| {
            errors
                .first()
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
                .unwrap_or("unknown upstream error")
                .to_string()
        })
}

/// Best-effort extraction of the human-facing prompt of a subtask; the
/// shape varies between challenge kinds so this walks for the first
/// `primary_text` node.
fn primary_text(subtask: &Value) -> Option<String> {
    fn walk(value: &Value) -> Option<String> {
        match value {
            Value::Object(map) => {
                if let Some(text) = map.get("primary_text") {
                    if let Some(s) = text.as_str() {
                        return Some(s.to_string());
                    }
                    if let Some(s) = text.get("text").and_then(|t| t.as_str()) {
                        return Some(s.to_string());
                    }
                }
                map.values().find_map(walk)
            }
            Value::Array(items) => items.iter().find_map(walk),
            _ => None,
        }
    }
    walk(subtask)
}

fn js_instrumentation_input() -> Value {
    json!({
        "subtask_id": "LoginJsInstrumentationSubtask",
        "js_instrumentation": { "response": "{}", "link": "next_link" }
    })
}

fn identifier_input(username: &str) -> Value {
    json!({
        "subtask_id": "LoginEnterUserIdentifierSSO",
        "settings_list": {
            "setting_responses": [{
                "key": "user_identifier",
                "response_data": { "text_data": { "result": username } }
            }],
            "link": "next_link"
        }
    })
}

fn alternate_identifier_input(email: &str) -> Value {
    json!({
        "subtask_id": "LoginEnterAlternateIdentifierSubtask",
        "enter_text": { "text": email, "link": "next_link" }
    })
}

fn password_input(password: &str) -> Value {
    json!({
        "subtask_id": "LoginEnterPassword",
        "enter_password": { "password": password, "link": "next_link" }
    })
}

fn duplication_check_input() -> Value {
    json!({
        "subtask_id": "AccountDuplicationCheck",
        "check_logged_in_account": { "link": "AccountDuplicationCheck_false" }
    })
}

fn two_factor_input(code: &str) -> Value {
    json!({
        "subtask_id": "LoginTwoFactorAuthChallenge",
        "enter_text": { "text": code, "link": "next_link" }
    })
}

fn acid_input(answer: &str) -> Value {
    json!({
        "subtask_id": "LoginAcid",
        "enter_text": { "text": answer, "link": "next_link" }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subtask_ids_round_trip() {
        assert_eq!(Subtask::from("LoginEnterPassword"), Subtask::EnterPassword);
        assert_eq!(Subtask::from("DenyLoginSubtask"), Subtask::Deny);
        assert_eq!(
            Subtask::from("SomethingNew"),
            Subtask::Unknown("SomethingNew".into())
        );
    }

    #[test]
    fn first_error_message_requires_non_empty_array() {
        assert_eq!(first_error_message(&json!({"errors": []})), None);
        assert_eq!(
            first_error_message(&json!({"errors": [{"message": "bad"}]})),
            Some("bad".to_string())
        );
        assert_eq!(
            first_error_message(&json!({"errors": [{}]})),
            Some("unknown upstream error".to_string())
        );
    }

    #[test]
    fn primary_text_walks_nested_shapes() {
        let subtask = json!({
            "subtask_id": "LoginAcid",
            "enter_text": {
                "header": { "primary_text": { "text": "Check your email for a code" } }
            }
        });
        assert_eq!(
            primary_text(&subtask).as_deref(),
            Some("Check your email for a code")
        );
        assert_eq!(primary_text(&json!({"subtask_id": "LoginAcid"})), None);
    }

    #[test]
    fn arkose_errors_are_recognized() {
        let err = LoginError::Fatal("unknown_subtask: ArkoseLogin".into());
        assert!(err.is_arkose());
        let err = LoginError::Protocol("something else".into());
        assert!(!err.is_arkose());
    }
}
