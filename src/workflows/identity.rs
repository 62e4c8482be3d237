//! Identity verification with an external face-verification provider.
//!
//! The applicant fills in a form, leaves the application for the provider and
//! comes back through a redirect carrying the provider's verdict. Because the
//! round trip can be interrupted by a reload at any point, the redirect
//! parameters are persisted in the [`CallbackStore`] the moment they are seen
//! and replayed into the machine on the next start.

use regex::Regex;
use std::sync::{Arc, LazyLock};
use thiserror::Error;
use tracing::{debug, error, info, warn, Instrument};

use crate::api::{IdentityApi, IdentityStatusReport, VerificationResult};
use crate::machine::{Context, Machine, TransitionTable};
use crate::platform::{Navigator, NoticeLevel, Notifier};
use crate::store::{CallbackStore, PendingCallback};
use crate::telemetry::{create_workflow_span, generate_correlation_id};
use crate::timer::Liveness;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdentityState {
    Idle,
    Loading,
    Form,
    Verifying,
    Processing,
    Submitting,
    Success,
    Pending,
    Error,
}

impl IdentityState {
    pub const ALL: [IdentityState; 9] = [
        IdentityState::Idle,
        IdentityState::Loading,
        IdentityState::Form,
        IdentityState::Verifying,
        IdentityState::Processing,
        IdentityState::Submitting,
        IdentityState::Success,
        IdentityState::Pending,
        IdentityState::Error,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdentityEvent {
    Load,
    StatusVerified,
    StatusPending,
    StatusUnsubmitted,
    LoadFailed,
    Submit,
    StartFailed,
    VerifyCallback,
    VerifyPassed,
    VerifyFailed,
    TokenRestored,
    SubmitSucceeded,
    SubmitFailed,
    Retry,
    Reload,
}

impl IdentityEvent {
    pub const ALL: [IdentityEvent; 15] = [
        IdentityEvent::Load,
        IdentityEvent::StatusVerified,
        IdentityEvent::StatusPending,
        IdentityEvent::StatusUnsubmitted,
        IdentityEvent::LoadFailed,
        IdentityEvent::Submit,
        IdentityEvent::StartFailed,
        IdentityEvent::VerifyCallback,
        IdentityEvent::VerifyPassed,
        IdentityEvent::VerifyFailed,
        IdentityEvent::TokenRestored,
        IdentityEvent::SubmitSucceeded,
        IdentityEvent::SubmitFailed,
        IdentityEvent::Retry,
        IdentityEvent::Reload,
    ];
}

/// Where the account stands according to the status endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityStatus {
    Verified,
    PendingReview,
    NotSubmitted,
}

impl IdentityStatus {
    pub fn classify(report: &IdentityStatusReport) -> Self {
        if report.verified {
            IdentityStatus::Verified
        } else if report.under_review {
            IdentityStatus::PendingReview
        } else {
            IdentityStatus::NotSubmitted
        }
    }
}

/// Which phase produced the current error; decides where `retry` goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePhase {
    Loading,
    Start,
    Callback,
    Submission,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentityContext {
    pub status: Option<IdentityStatus>,
    pub error: Option<String>,
    pub real_name: Option<String>,
    pub id_card: Option<String>,
    pub auth_token: Option<String>,
    pub callback_code: Option<String>,
    pub callback_success: Option<bool>,
    pub failed_during: Option<FailurePhase>,
}

#[derive(Debug, Default)]
pub struct IdentityPatch {
    pub status: Option<IdentityStatus>,
    pub error: Option<Option<String>>,
    pub real_name: Option<String>,
    pub id_card: Option<String>,
    pub auth_token: Option<Option<String>>,
    pub callback_code: Option<Option<String>>,
    pub callback_success: Option<Option<bool>>,
    pub failed_during: Option<Option<FailurePhase>>,
}

impl IdentityPatch {
    fn failure(phase: FailurePhase, message: impl Into<String>) -> Self {
        Self {
            error: Some(Some(message.into())),
            failed_during: Some(Some(phase)),
            ..Default::default()
        }
    }

    fn cleared_error() -> Self {
        Self {
            error: Some(None),
            failed_during: Some(None),
            ..Default::default()
        }
    }
}

impl Context for IdentityContext {
    type Patch = IdentityPatch;

    fn merge(&mut self, patch: IdentityPatch) {
        if let Some(status) = patch.status {
            self.status = Some(status);
        }
        if let Some(error) = patch.error {
            self.error = error;
        }
        if let Some(real_name) = patch.real_name {
            self.real_name = Some(real_name);
        }
        if let Some(id_card) = patch.id_card {
            self.id_card = Some(id_card);
        }
        if let Some(auth_token) = patch.auth_token {
            self.auth_token = auth_token;
        }
        if let Some(callback_code) = patch.callback_code {
            self.callback_code = callback_code;
        }
        if let Some(callback_success) = patch.callback_success {
            self.callback_success = callback_success;
        }
        if let Some(failed_during) = patch.failed_during {
            self.failed_during = failed_during;
        }
    }
}

static IDENTITY_TABLE: LazyLock<Arc<TransitionTable<IdentityState, IdentityEvent>>> = LazyLock::new(|| {
    use IdentityEvent as E;
    use IdentityState as S;
    Arc::new(
        TransitionTable::new()
            .on(S::Idle, E::Load, S::Loading)
            .on(S::Loading, E::StatusVerified, S::Success)
            .on(S::Loading, E::StatusPending, S::Pending)
            .on(S::Loading, E::StatusUnsubmitted, S::Form)
            .on(S::Loading, E::LoadFailed, S::Error)
            .on(S::Form, E::Submit, S::Verifying)
            .on(S::Verifying, E::StartFailed, S::Error)
            .on_any(&[S::Idle, S::Loading, S::Form], E::VerifyCallback, S::Processing)
            .on(S::Processing, E::VerifyPassed, S::Submitting)
            .on(S::Processing, E::VerifyFailed, S::Error)
            .on(S::Submitting, E::TokenRestored, S::Submitting)
            .on(S::Submitting, E::SubmitSucceeded, S::Success)
            .on(S::Submitting, E::SubmitFailed, S::Error)
            .on(S::Error, E::Retry, S::Form)
            .on(S::Error, E::Reload, S::Loading),
    )
});

pub fn identity_table() -> Arc<TransitionTable<IdentityState, IdentityEvent>> {
    Arc::clone(&IDENTITY_TABLE)
}

/// Status string the result endpoint uses for an accepted verification.
pub const RESULT_PASSED: &str = "PASSED";

const EXPLICIT_FAILURE_MESSAGE: &str = "认证未通过，请重新认证";
const MISSING_TOKEN_MESSAGE: &str = "认证凭证缺失，请重新认证";

/// Message for a non-zero error code reported on the provider redirect.
pub fn provider_error_message(code: &str) -> String {
    match code {
        "1" => "用户取消认证".to_string(),
        "2" => "认证超时，请重新认证".to_string(),
        "3" => "身份信息与证件不符".to_string(),
        "4" => "活体检测不通过".to_string(),
        "5" => "人脸比对不通过".to_string(),
        "6" => "认证次数过多，请稍后再试".to_string(),
        "7" => "证件信息无法识别".to_string(),
        other => format!("认证失败（错误码：{other}）"),
    }
}

fn reason_message(reason_code: &str) -> Option<&'static str> {
    match reason_code {
        "FACE_MISMATCH" => Some("人脸比对不通过"),
        "LIVENESS_FAILED" => Some("活体检测不通过"),
        "ID_MISMATCH" => Some("身份信息与证件不符"),
        "UNDERAGE" => Some("未满18周岁，无法完成认证"),
        _ => None,
    }
}

/// Message for a verification result that was not accepted.
pub fn verification_failure_message(result: &VerificationResult) -> String {
    if let Some(message) = result.reason_code.as_deref().and_then(reason_message) {
        return message.to_string();
    }
    match result.status.as_str() {
        RESULT_PASSED => "人脸比对不通过",
        "PROCESSING" => "认证结果处理中，请稍后重试",
        "EXPIRED" => "认证已过期，请重新认证",
        "REJECTED" | "FAILED" => EXPLICIT_FAILURE_MESSAGE,
        _ => "认证结果异常，请重新认证",
    }
    .to_string()
}

/// Parse the provider's free-form `success` flag.
pub fn parse_success_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "y" | "success" => Some(true),
        "false" | "0" | "no" | "n" | "fail" | "failed" | "error" => Some(false),
        _ => None,
    }
}

fn is_failure_code(code: &str) -> bool {
    let code = code.trim();
    !code.is_empty() && code != "0"
}

/// Parameters the provider appends when redirecting back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectCallback {
    pub auth_token: Option<String>,
    pub code: Option<String>,
    pub success: Option<bool>,
}

impl RedirectCallback {
    /// `None` unless the location carries a provider token or error code.
    pub fn from_navigator(navigator: &dyn Navigator) -> Option<Self> {
        let auth_token = navigator
            .query_param("authToken")
            .or_else(|| navigator.query_param("auth_token"))
            .filter(|token| !token.is_empty());
        let code = navigator.query_param("code").filter(|code| !code.is_empty());
        if auth_token.is_none() && code.is_none() {
            return None;
        }
        let success = navigator.query_param("success").as_deref().and_then(parse_success_flag);
        Some(Self {
            auth_token,
            code,
            success,
        })
    }

    fn into_patch(self) -> IdentityPatch {
        IdentityPatch {
            auth_token: Some(self.auth_token),
            callback_code: Some(self.code),
            callback_success: Some(self.success),
            ..IdentityPatch::cleared_error()
        }
    }
}

impl From<PendingCallback> for IdentityPatch {
    fn from(record: PendingCallback) -> Self {
        IdentityPatch {
            auth_token: Some(Some(record.auth_token)),
            callback_code: Some(record.callback_code),
            callback_success: Some(record.callback_success),
            ..IdentityPatch::cleared_error()
        }
    }
}

/// Form validation failures. Reported inline; the machine does not move.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("请输入真实姓名")]
    MissingRealName,
    #[error("请输入身份证号")]
    MissingIdCard,
    #[error("身份证号格式不正确")]
    InvalidIdCard,
    #[error("当前无法提交认证信息")]
    NotAcceptingForm,
    #[error("身份证号校验规则无效")]
    PatternUnavailable,
}

static ID_CARD_PATTERN: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"^(\d{15}|\d{17}[\dXx])$"));

pub fn validate_form(real_name: &str, id_card: &str) -> Result<(), IdentityError> {
    if real_name.trim().is_empty() {
        return Err(IdentityError::MissingRealName);
    }
    let id_card = id_card.trim();
    if id_card.is_empty() {
        return Err(IdentityError::MissingIdCard);
    }
    let pattern = match ID_CARD_PATTERN.as_ref() {
        Ok(pattern) => pattern,
        Err(e) => {
            error!(error = %e, "Id card pattern failed to compile");
            return Err(IdentityError::PatternUnavailable);
        }
    };
    if !pattern.is_match(id_card) {
        return Err(IdentityError::InvalidIdCard);
    }
    Ok(())
}

pub struct IdentityVerificationController {
    machine: Machine<IdentityState, IdentityEvent, IdentityContext>,
    api: Arc<dyn IdentityApi>,
    navigator: Arc<dyn Navigator>,
    notifier: Arc<dyn Notifier>,
    store: CallbackStore,
    liveness: Liveness,
    return_url: String,
    initialized: bool,
    span: tracing::Span,
}

impl std::fmt::Debug for IdentityVerificationController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityVerificationController")
            .field("machine", &self.machine)
            .field("store", &self.store)
            .field("alive", &self.liveness.is_alive())
            .field("initialized", &self.initialized)
            .finish()
    }
}

impl IdentityVerificationController {
    pub fn new(
        api: Arc<dyn IdentityApi>,
        navigator: Arc<dyn Navigator>,
        notifier: Arc<dyn Notifier>,
        store: CallbackStore,
    ) -> Self {
        Self {
            machine: Machine::new("identity", IdentityState::Idle, identity_table()),
            api,
            navigator,
            notifier,
            store,
            liveness: Liveness::new(),
            return_url: String::new(),
            initialized: false,
            span: create_workflow_span("identity", &generate_correlation_id()),
        }
    }

    /// Where the provider should send the applicant back to.
    pub fn with_return_url(mut self, return_url: impl Into<String>) -> Self {
        self.return_url = return_url.into();
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.machine.set_debug(debug);
        self
    }

    pub fn state(&self) -> IdentityState {
        self.machine.state()
    }

    pub fn context(&self) -> &IdentityContext {
        self.machine.context()
    }

    pub fn error(&self) -> Option<&str> {
        self.machine.context().error.as_deref()
    }

    pub fn machine(&self) -> &Machine<IdentityState, IdentityEvent, IdentityContext> {
        &self.machine
    }

    /// Handle for disposing the controller from outside while a call is pending.
    pub fn liveness(&self) -> Liveness {
        self.liveness.clone()
    }

    /// Pick the starting path. Runs once per controller.
    ///
    /// A callback on the current location wins over a persisted record,
    /// which wins over a plain status load.
    pub async fn init(&mut self) {
        if self.initialized {
            return;
        }
        self.initialized = true;

        let entered = if let Some(callback) = RedirectCallback::from_navigator(self.navigator.as_ref()) {
            if let Some(token) = &callback.auth_token {
                self.store.save(&PendingCallback::new(
                    token.clone(),
                    callback.code.clone(),
                    callback.success,
                    self.store.now_ms(),
                ));
            }
            self.navigator.replace_url_without_params();
            info!(parent: &self.span, has_token = callback.auth_token.is_some(), "Provider callback received");
            self.apply(IdentityEvent::VerifyCallback, callback.into_patch())
        } else if let Some(record) = self.store.read() {
            info!(parent: &self.span, created_at = record.created_at, "Resuming verification from pending callback");
            self.apply(IdentityEvent::VerifyCallback, record.into())
        } else {
            self.apply(IdentityEvent::Load, IdentityPatch::default())
        };

        self.drive(entered).await;
    }

    /// Validate the form and hand the applicant over to the provider.
    pub async fn submit_form(&mut self, real_name: &str, id_card: &str) -> Result<(), IdentityError> {
        if !self.machine.is(IdentityState::Form) {
            return Err(IdentityError::NotAcceptingForm);
        }
        validate_form(real_name, id_card)?;

        let entered = self.apply(
            IdentityEvent::Submit,
            IdentityPatch {
                real_name: Some(real_name.trim().to_string()),
                id_card: Some(id_card.trim().to_ascii_uppercase()),
                ..IdentityPatch::cleared_error()
            },
        );
        self.drive(entered).await;
        Ok(())
    }

    /// Supply the provider token when submission is waiting on it.
    pub async fn restore_token(&mut self, auth_token: impl Into<String>) {
        let entered = self.apply(
            IdentityEvent::TokenRestored,
            IdentityPatch {
                auth_token: Some(Some(auth_token.into())),
                ..Default::default()
            },
        );
        self.drive(entered).await;
    }

    /// Leave `Error` for the form, or reload the status if that is what failed.
    pub async fn retry(&mut self) {
        let event = match self.machine.context().failed_during {
            Some(FailurePhase::Loading) => IdentityEvent::Reload,
            _ => IdentityEvent::Retry,
        };
        let entered = self.apply(
            event,
            IdentityPatch {
                auth_token: Some(None),
                callback_code: Some(None),
                callback_success: Some(None),
                ..IdentityPatch::cleared_error()
            },
        );
        self.drive(entered).await;
    }

    /// Start over from `Idle`. `init` may run again afterwards.
    pub fn reset(&mut self) {
        self.machine.reset();
        self.initialized = false;
    }

    pub fn teardown(&mut self) {
        self.liveness.dispose();
        debug!(parent: &self.span, state = ?self.machine.state(), "Identity controller torn down");
    }

    fn apply(&mut self, event: IdentityEvent, patch: IdentityPatch) -> Option<IdentityState> {
        if !self.liveness.is_alive() {
            debug!(parent: &self.span, event = ?event, "Dropping event for disposed controller");
            return None;
        }
        self.machine.send_with(event, patch).entered()
    }

    async fn drive(&mut self, entered: Option<IdentityState>) {
        let span = self.span.clone();
        self.run_entry_effects(entered).instrument(span).await;
    }

    async fn run_entry_effects(&mut self, mut entered: Option<IdentityState>) {
        while let Some(state) = entered {
            debug!(state = ?state, "Entered identity state");
            entered = match state {
                IdentityState::Loading => self.load_status().await,
                IdentityState::Verifying => self.start_provider().await,
                IdentityState::Processing => self.process_callback().await,
                IdentityState::Submitting => self.submit_result().await,
                IdentityState::Form | IdentityState::Pending | IdentityState::Success | IdentityState::Error => {
                    // the recovery window is over once the workflow settles
                    self.store.clear();
                    None
                }
                IdentityState::Idle => None,
            };
        }
    }

    async fn load_status(&mut self) -> Option<IdentityState> {
        match self.api.fetch_status().await {
            Ok(report) => {
                let status = IdentityStatus::classify(&report);
                info!(status = ?status, "Identity status loaded");
                let event = match status {
                    IdentityStatus::Verified => IdentityEvent::StatusVerified,
                    IdentityStatus::PendingReview => IdentityEvent::StatusPending,
                    IdentityStatus::NotSubmitted => IdentityEvent::StatusUnsubmitted,
                };
                self.apply(
                    event,
                    IdentityPatch {
                        status: Some(status),
                        ..Default::default()
                    },
                )
            }
            Err(e) => {
                warn!(error = %e, "Failed to load identity status");
                self.notify_error(e.message());
                self.apply(IdentityEvent::LoadFailed, IdentityPatch::failure(FailurePhase::Loading, e.message))
            }
        }
    }

    async fn start_provider(&mut self) -> Option<IdentityState> {
        let context = self.machine.context();
        let real_name = context.real_name.clone().unwrap_or_default();
        let id_card = context.id_card.clone().unwrap_or_default();

        match self.api.start_verification(&real_name, &id_card, &self.return_url).await {
            Ok(provider_url) => {
                if self.liveness.is_alive() {
                    self.navigator.redirect_to(&provider_url);
                }
                None
            }
            Err(e) => {
                warn!(error = %e, "Failed to start provider verification");
                self.notify_error(e.message());
                self.apply(IdentityEvent::StartFailed, IdentityPatch::failure(FailurePhase::Start, e.message))
            }
        }
    }

    async fn process_callback(&mut self) -> Option<IdentityState> {
        let context = self.machine.context().clone();

        if let Some(code) = context.callback_code.as_deref().filter(|code| is_failure_code(code)) {
            info!(code = %code, "Provider reported failure code");
            return self.fail_callback(provider_error_message(code.trim()));
        }
        if context.callback_success == Some(false) {
            return self.fail_callback(EXPLICIT_FAILURE_MESSAGE);
        }
        let Some(token) = context.auth_token.filter(|token| !token.is_empty()) else {
            return self.fail_callback(MISSING_TOKEN_MESSAGE);
        };

        match self.api.fetch_verification_result(&token).await {
            Ok(result) if result.status == RESULT_PASSED && result.face_matched => {
                info!("Provider verification passed");
                self.apply(IdentityEvent::VerifyPassed, IdentityPatch::cleared_error())
            }
            Ok(result) => {
                info!(status = %result.status, face_matched = result.face_matched, "Provider verification rejected");
                self.fail_callback(verification_failure_message(&result))
            }
            Err(e) => {
                warn!(error = %e, "Failed to fetch verification result");
                self.notify_error(e.message());
                self.fail_callback(e.message)
            }
        }
    }

    fn fail_callback(&mut self, message: impl Into<String>) -> Option<IdentityState> {
        if !self.liveness.is_alive() {
            return None;
        }
        self.store.clear();
        self.apply(IdentityEvent::VerifyFailed, IdentityPatch::failure(FailurePhase::Callback, message))
    }

    async fn submit_result(&mut self) -> Option<IdentityState> {
        let Some(token) = self.machine.context().auth_token.clone().filter(|t| !t.is_empty()) else {
            debug!("Submission waiting for provider token");
            return None;
        };

        match self.api.submit_verification(&token).await {
            Ok(()) => {
                info!("Identity verification completed");
                if self.liveness.is_alive() {
                    self.notifier.notify(NoticeLevel::Success, "实名认证成功");
                }
                self.apply(
                    IdentityEvent::SubmitSucceeded,
                    IdentityPatch {
                        status: Some(IdentityStatus::Verified),
                        ..IdentityPatch::cleared_error()
                    },
                )
            }
            Err(e) => {
                warn!(error = %e, "Failed to submit verification");
                if self.liveness.is_alive() {
                    self.store.clear();
                }
                self.notify_error(e.message());
                self.apply(IdentityEvent::SubmitFailed, IdentityPatch::failure(FailurePhase::Submission, e.message))
            }
        }
    }

    fn notify_error(&self, message: &str) {
        if self.liveness.is_alive() {
            self.notifier.notify(NoticeLevel::Error, message);
        }
    }
}

impl Drop for IdentityVerificationController {
    fn drop(&mut self) {
        self.liveness.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ApiError, MockIdentityApi};
    use crate::clock::ManualClock;
    use crate::platform::HeadlessBrowser;
    use crate::store::MemoryStorage;
    use proptest::prelude::*;

    const T0: i64 = 1_700_000_000_000;

    struct Harness {
        browser: Arc<HeadlessBrowser>,
        storage: Arc<MemoryStorage>,
        store: CallbackStore,
        clock: ManualClock,
    }

    impl Harness {
        fn at(location: &str) -> Self {
            let clock = ManualClock::from_millis(T0);
            let storage = Arc::new(MemoryStorage::new());
            let store = CallbackStore::new(storage.clone()).with_clock(Arc::new(clock.clone()));
            Self {
                browser: Arc::new(HeadlessBrowser::new(location).unwrap()),
                storage,
                store,
                clock,
            }
        }

        fn controller(&self, api: MockIdentityApi) -> IdentityVerificationController {
            IdentityVerificationController::new(
                Arc::new(api),
                self.browser.clone(),
                self.browser.clone(),
                self.store.clone(),
            )
            .with_return_url("https://app.test/verify")
            .with_debug(true)
        }
    }

    fn passed() -> VerificationResult {
        VerificationResult {
            status: RESULT_PASSED.to_string(),
            face_matched: true,
            reason_code: None,
        }
    }

    #[tokio::test]
    async fn test_first_visit_lands_on_form() {
        let h = Harness::at("https://app.test/verify");
        let mut api = MockIdentityApi::new();
        api.expect_fetch_status().times(1).returning(|| Ok(IdentityStatusReport::default()));

        let mut c = h.controller(api);
        c.init().await;

        assert_eq!(c.state(), IdentityState::Form);
        assert_eq!(c.context().status, Some(IdentityStatus::NotSubmitted));
    }

    #[tokio::test]
    async fn test_status_classification() {
        for (report, expected) in [
            (IdentityStatusReport { verified: true, under_review: true }, IdentityState::Success),
            (IdentityStatusReport { verified: false, under_review: true }, IdentityState::Pending),
        ] {
            let h = Harness::at("https://app.test/verify");
            let mut api = MockIdentityApi::new();
            api.expect_fetch_status().returning(move || Ok(report));
            let mut c = h.controller(api);
            c.init().await;
            assert_eq!(c.state(), expected);
        }
    }

    #[tokio::test]
    async fn test_init_runs_once() {
        let h = Harness::at("https://app.test/verify");
        let mut api = MockIdentityApi::new();
        api.expect_fetch_status().times(1).returning(|| Ok(IdentityStatusReport::default()));
        let mut c = h.controller(api);
        c.init().await;
        c.init().await;
        assert_eq!(c.state(), IdentityState::Form);
    }

    #[tokio::test]
    async fn test_callback_code_four_fails_with_liveness_message() {
        let h = Harness::at("https://app.test/verify?authToken=tok-1&code=4&success=false");
        let mut api = MockIdentityApi::new();
        api.expect_fetch_verification_result().never();
        api.expect_fetch_status().never();

        let mut c = h.controller(api);
        c.init().await;

        assert_eq!(c.state(), IdentityState::Error);
        assert_eq!(c.error(), Some("活体检测不通过"));
        assert_eq!(h.store.read(), None);
        assert!(h.storage.is_empty());
        assert_eq!(h.browser.location(), "https://app.test/verify");
    }

    #[tokio::test]
    async fn test_successful_callback_completes_and_clears_record() {
        let h = Harness::at("https://app.test/verify?auth_token=tok-2&code=0&success=yes");
        let mut api = MockIdentityApi::new();
        api.expect_fetch_verification_result()
            .withf(|token| token == "tok-2")
            .times(1)
            .returning(|_| Ok(passed()));
        api.expect_submit_verification()
            .withf(|token| token == "tok-2")
            .times(1)
            .returning(|_| Ok(()));

        let mut c = h.controller(api);
        c.init().await;

        assert_eq!(c.state(), IdentityState::Success);
        assert!(h.storage.is_empty());
        assert!(h
            .browser
            .notices()
            .iter()
            .any(|(level, _)| *level == NoticeLevel::Success));
    }

    #[tokio::test]
    async fn test_explicit_failure_without_code() {
        let h = Harness::at("https://app.test/verify?authToken=tok&success=failed");
        let mut c = h.controller(MockIdentityApi::new());
        c.init().await;
        assert_eq!(c.state(), IdentityState::Error);
        assert_eq!(c.error(), Some(EXPLICIT_FAILURE_MESSAGE));
    }

    #[tokio::test]
    async fn test_code_without_token_fails() {
        let h = Harness::at("https://app.test/verify?code=0");
        let mut c = h.controller(MockIdentityApi::new());
        c.init().await;
        assert_eq!(c.state(), IdentityState::Error);
        assert_eq!(c.error(), Some(MISSING_TOKEN_MESSAGE));
    }

    #[tokio::test]
    async fn test_result_without_face_match_fails() {
        let h = Harness::at("https://app.test/verify?authToken=tok");
        let mut api = MockIdentityApi::new();
        api.expect_fetch_verification_result().returning(|_| {
            Ok(VerificationResult {
                status: RESULT_PASSED.to_string(),
                face_matched: false,
                reason_code: None,
            })
        });
        api.expect_submit_verification().never();

        let mut c = h.controller(api);
        c.init().await;
        assert_eq!(c.state(), IdentityState::Error);
        assert_eq!(c.error(), Some("人脸比对不通过"));
    }

    #[tokio::test]
    async fn test_reload_recovers_from_pending_record() {
        let h = Harness::at("https://app.test/verify");
        h.store.save(&PendingCallback::new("tok-3", Some("0".to_string()), Some(true), T0));
        h.clock.advance(chrono::Duration::minutes(10));

        let mut api = MockIdentityApi::new();
        api.expect_fetch_status().never();
        api.expect_fetch_verification_result().returning(|_| Ok(passed()));
        api.expect_submit_verification().returning(|_| Ok(()));

        let mut c = h.controller(api);
        c.init().await;
        assert_eq!(c.state(), IdentityState::Success);
        assert_eq!(c.context().auth_token.as_deref(), Some("tok-3"));
        assert!(h.storage.is_empty());
    }

    #[tokio::test]
    async fn test_expired_record_falls_back_to_load() {
        let h = Harness::at("https://app.test/verify");
        h.store.save(&PendingCallback::new("tok", None, None, T0));
        h.clock.advance(chrono::Duration::minutes(31));

        let mut api = MockIdentityApi::new();
        api.expect_fetch_status().times(1).returning(|| Ok(IdentityStatusReport::default()));

        let mut c = h.controller(api);
        c.init().await;
        assert_eq!(c.state(), IdentityState::Form);
    }

    #[tokio::test]
    async fn test_form_submission_redirects_to_provider() {
        let h = Harness::at("https://app.test/verify");
        let mut api = MockIdentityApi::new();
        api.expect_fetch_status().returning(|| Ok(IdentityStatusReport::default()));
        api.expect_start_verification()
            .withf(|name, id, ret| name == "张三" && id == "11010519491231002X" && ret == "https://app.test/verify")
            .times(1)
            .returning(|_, _, _| Ok("https://provider.test/face?biz=1".to_string()));

        let mut c = h.controller(api);
        c.init().await;
        c.submit_form(" 张三 ", "11010519491231002x").await.unwrap();

        assert_eq!(c.state(), IdentityState::Verifying);
        assert_eq!(h.browser.redirects(), vec!["https://provider.test/face?biz=1".to_string()]);
    }

    #[test]
    fn test_id_card_pattern_accepts_both_lengths() {
        assert!(ID_CARD_PATTERN.is_ok());
        assert_eq!(validate_form("张三", "110105491231002"), Ok(()));
        assert_eq!(validate_form("张三", "11010519491231002X"), Ok(()));
        assert_eq!(validate_form("张三", "11010519491231002x"), Ok(()));
        assert_eq!(validate_form("张三", "1101051949123100"), Err(IdentityError::InvalidIdCard));
        assert_eq!(validate_form("张三", "11010519491231002Y"), Err(IdentityError::InvalidIdCard));
    }

    #[tokio::test]
    async fn test_form_validation_does_not_transition() {
        let h = Harness::at("https://app.test/verify");
        let mut api = MockIdentityApi::new();
        api.expect_fetch_status().returning(|| Ok(IdentityStatusReport::default()));
        api.expect_start_verification().never();

        let mut c = h.controller(api);
        c.init().await;

        assert_eq!(c.submit_form("", "110105194912310021").await, Err(IdentityError::MissingRealName));
        assert_eq!(c.submit_form("张三", "  ").await, Err(IdentityError::MissingIdCard));
        assert_eq!(c.submit_form("张三", "12345").await, Err(IdentityError::InvalidIdCard));
        assert_eq!(c.state(), IdentityState::Form);
        assert_eq!(c.error(), None);
    }

    #[tokio::test]
    async fn test_load_failure_retries_with_reload() {
        let h = Harness::at("https://app.test/verify");
        let mut api = MockIdentityApi::new();
        let mut calls = 0;
        api.expect_fetch_status().times(2).returning(move || {
            calls += 1;
            if calls == 1 {
                Err(ApiError::new("网络异常"))
            } else {
                Ok(IdentityStatusReport { verified: false, under_review: true })
            }
        });

        let mut c = h.controller(api);
        c.init().await;
        assert_eq!(c.state(), IdentityState::Error);
        assert_eq!(c.context().failed_during, Some(FailurePhase::Loading));
        assert_eq!(h.browser.notices(), vec![(NoticeLevel::Error, "网络异常".to_string())]);

        c.retry().await;
        assert_eq!(c.state(), IdentityState::Pending);
        assert_eq!(c.error(), None);
    }

    #[tokio::test]
    async fn test_callback_failure_retries_to_form() {
        let h = Harness::at("https://app.test/verify?authToken=tok&code=5");
        let mut c = h.controller(MockIdentityApi::new());
        c.init().await;
        assert_eq!(c.state(), IdentityState::Error);

        c.retry().await;
        assert_eq!(c.state(), IdentityState::Form);
        assert_eq!(c.context().auth_token, None);
        assert_eq!(c.context().callback_code, None);
    }

    #[tokio::test]
    async fn test_submission_waits_for_token() {
        let h = Harness::at("https://app.test/verify");
        let mut api = MockIdentityApi::new();
        api.expect_submit_verification()
            .withf(|token| token == "late-token")
            .times(1)
            .returning(|_| Ok(()));

        let mut c = h.controller(api);
        // a submitting machine that lost its token
        c.machine = Machine::new("identity", IdentityState::Submitting, identity_table());
        c.initialized = true;
        c.run_entry_effects(Some(IdentityState::Submitting)).await;
        assert_eq!(c.state(), IdentityState::Submitting);

        c.restore_token("late-token").await;
        assert_eq!(c.state(), IdentityState::Success);
    }

    #[tokio::test]
    async fn test_disposed_controller_ignores_late_completion() {
        let h = Harness::at("https://app.test/verify");
        let mut api = MockIdentityApi::new();
        let liveness_slot: Arc<std::sync::Mutex<Option<Liveness>>> = Arc::default();
        let slot = liveness_slot.clone();
        api.expect_fetch_status().returning(move || {
            if let Some(liveness) = slot.lock().unwrap().as_ref() {
                liveness.dispose();
            }
            Err(ApiError::new("late"))
        });

        let mut c = h.controller(api);
        *liveness_slot.lock().unwrap() = Some(c.liveness());
        c.init().await;

        assert_eq!(c.state(), IdentityState::Loading);
        assert!(h.browser.notices().is_empty());
    }

    #[test]
    fn test_success_flag_tokens() {
        for raw in ["true", "1", "YES", "y", "success"] {
            assert_eq!(parse_success_flag(raw), Some(true), "{raw}");
        }
        for raw in ["false", "0", "no", "N", "fail", "failed", "error"] {
            assert_eq!(parse_success_flag(raw), Some(false), "{raw}");
        }
        assert_eq!(parse_success_flag("maybe"), None);
    }

    #[test]
    fn test_failure_message_tables() {
        assert_eq!(provider_error_message("4"), "活体检测不通过");
        assert_eq!(provider_error_message("99"), "认证失败（错误码：99）");

        let result = VerificationResult {
            status: "FAILED".to_string(),
            face_matched: false,
            reason_code: Some("UNDERAGE".to_string()),
        };
        assert_eq!(verification_failure_message(&result), "未满18周岁，无法完成认证");
    }

    proptest! {
        #[test]
        fn prop_unlisted_events_are_noops(
            state in prop::sample::select(IdentityState::ALL.to_vec()),
            event in prop::sample::select(IdentityEvent::ALL.to_vec()),
        ) {
            let table = identity_table();
            prop_assume!(!table.handles(state, event));

            let before = IdentityContext {
                error: Some("kept".to_string()),
                auth_token: Some("tok".to_string()),
                ..Default::default()
            };
            let mut m: Machine<IdentityState, IdentityEvent, IdentityContext> =
                Machine::new("identity", state, table).with_context(before.clone());
            m.send_with(event, IdentityPatch { auth_token: Some(None), error: Some(None), ..Default::default() });

            prop_assert_eq!(m.state(), state);
            prop_assert_eq!(m.context(), &before);
        }
    }
}
