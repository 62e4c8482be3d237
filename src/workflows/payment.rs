//! Hand-off to an external payment page.
//!
//! The page is opened in a second window which is polled until it closes.
//! A closed window only means the user is done with it, so the session moves
//! to `Checking` and waits for the user to attest the payment. The link has
//! its own wall-clock lifetime that runs independently of the step.

use std::sync::{Arc, LazyLock, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn, Instrument};

use crate::api::{PaymentApi, PaymentLink};
use crate::machine::{loading_machine, Context, LoadEvent, LoadingMachine, Machine, TransitionTable};
use crate::platform::{Navigator, NoticeLevel, Notifier};
use crate::telemetry::{create_workflow_span, generate_correlation_id};
use crate::timer::{spawn_poller, Countdown, Liveness, PollControl, TimerSlot};

pub const DEFAULT_LINK_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

const COUNTDOWN_TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PaymentStep {
    Ready,
    Paying,
    Checking,
    Blocked,
}

impl PaymentStep {
    pub const ALL: [PaymentStep; 4] = [
        PaymentStep::Ready,
        PaymentStep::Paying,
        PaymentStep::Checking,
        PaymentStep::Blocked,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PaymentEvent {
    OpenSucceeded,
    OpenBlocked,
    WindowClosed,
    Attest,
    Refresh,
}

impl PaymentEvent {
    pub const ALL: [PaymentEvent; 5] = [
        PaymentEvent::OpenSucceeded,
        PaymentEvent::OpenBlocked,
        PaymentEvent::WindowClosed,
        PaymentEvent::Attest,
        PaymentEvent::Refresh,
    ];
}

static PAYMENT_TABLE: LazyLock<Arc<TransitionTable<PaymentStep, PaymentEvent>>> = LazyLock::new(|| {
    use PaymentEvent as E;
    use PaymentStep as S;
    Arc::new(
        TransitionTable::new()
            .on_any(&[S::Ready, S::Blocked, S::Checking], E::OpenSucceeded, S::Paying)
            .on_any(&[S::Ready, S::Blocked, S::Checking], E::OpenBlocked, S::Blocked)
            .on(S::Paying, E::WindowClosed, S::Checking)
            .on(S::Checking, E::Attest, S::Checking)
            .on_any(&PaymentStep::ALL, E::Refresh, S::Ready),
    )
});

pub fn payment_table() -> Arc<TransitionTable<PaymentStep, PaymentEvent>> {
    Arc::clone(&PAYMENT_TABLE)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PaymentContext {
    pub link: Option<String>,
    /// The user stated the payment went through.
    pub attested: bool,
    pub error: Option<String>,
}

#[derive(Debug, Default)]
pub struct PaymentPatch {
    pub link: Option<Option<String>>,
    pub attested: Option<bool>,
    pub error: Option<Option<String>>,
}

impl Context for PaymentContext {
    type Patch = PaymentPatch;

    fn merge(&mut self, patch: PaymentPatch) {
        if let Some(link) = patch.link {
            self.link = link;
        }
        if let Some(attested) = patch.attested {
            self.attested = attested;
        }
        if let Some(error) = patch.error {
            self.error = error;
        }
    }
}

type PaymentMachine = Machine<PaymentStep, PaymentEvent, PaymentContext>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PaymentError {
    #[error("支付链接尚未获取")]
    NoLink,
    #[error("支付链接已过期，请刷新")]
    LinkExpired,
    #[error("当前无需确认支付")]
    NotAwaitingConfirmation,
    #[error("复制失败，请手动复制链接")]
    ClipboardUnavailable,
    #[error("{0}")]
    LinkUnavailable(String),
    #[error("支付会话已结束")]
    Disposed,
}

fn lock(machine: &Mutex<PaymentMachine>) -> MutexGuard<'_, PaymentMachine> {
    machine.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct PaymentHandoffController {
    machine: Arc<Mutex<PaymentMachine>>,
    link: LoadingMachine<PaymentLink>,
    api: Arc<dyn PaymentApi>,
    navigator: Arc<dyn Navigator>,
    notifier: Arc<dyn Notifier>,
    order_id: String,
    link_timeout: Duration,
    poll_interval: Duration,
    countdown: Option<Countdown>,
    poll_slot: TimerSlot,
    liveness: Liveness,
    span: tracing::Span,
}

impl std::fmt::Debug for PaymentHandoffController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaymentHandoffController")
            .field("order_id", &self.order_id)
            .field("step", &self.step())
            .field("remaining", &self.remaining_time())
            .field("polling", &self.poll_slot.is_active())
            .finish()
    }
}

impl PaymentHandoffController {
    pub fn new(
        api: Arc<dyn PaymentApi>,
        navigator: Arc<dyn Navigator>,
        notifier: Arc<dyn Notifier>,
        order_id: impl Into<String>,
    ) -> Self {
        let order_id = order_id.into();
        let span = create_workflow_span("payment", &generate_correlation_id());
        span.record("subject", order_id.as_str());
        Self {
            machine: Arc::new(Mutex::new(Machine::new("payment", PaymentStep::Ready, payment_table()))),
            link: loading_machine("payment-link"),
            api,
            navigator,
            notifier,
            order_id,
            link_timeout: DEFAULT_LINK_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            countdown: None,
            poll_slot: TimerSlot::new("payment-window"),
            liveness: Liveness::new(),
            span,
        }
    }

    pub fn with_link_timeout(mut self, timeout: Duration) -> Self {
        self.link_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        lock(&self.machine).set_debug(debug);
        self.link.set_debug(debug);
        self
    }

    pub fn step(&self) -> PaymentStep {
        lock(&self.machine).state()
    }

    pub fn context(&self) -> PaymentContext {
        lock(&self.machine).context().clone()
    }

    pub fn link(&self) -> Option<&PaymentLink> {
        self.link.data()
    }

    /// Whole seconds left on the current link; zero without a session.
    pub fn remaining_time(&self) -> u64 {
        self.countdown.as_ref().map_or(0, Countdown::remaining)
    }

    pub fn is_expired(&self) -> bool {
        self.countdown.as_ref().is_some_and(Countdown::is_finished)
    }

    /// Whether the step's main button may be used.
    pub fn primary_action_enabled(&self) -> bool {
        self.link.data().is_some() && !self.is_expired()
    }

    pub fn liveness(&self) -> Liveness {
        self.liveness.clone()
    }

    /// Start a session with a link that was issued elsewhere.
    pub fn begin(&mut self, link: PaymentLink) {
        if !self.liveness.is_alive() {
            return;
        }
        self.poll_slot.clear();
        if let Some(mut previous) = self.countdown.take() {
            previous.stop();
        }

        self.link.send(LoadEvent::Reset);
        self.link.begin();
        let url = link.url.clone();
        self.link.resolve(link);
        self.countdown = Some(Countdown::start("payment-link", self.link_timeout.as_secs(), COUNTDOWN_TICK));

        lock(&self.machine).send_with(
            PaymentEvent::Refresh,
            PaymentPatch {
                link: Some(Some(url)),
                attested: Some(false),
                error: Some(None),
            },
        );
        info!(
            parent: &self.span,
            timeout_secs = self.link_timeout.as_secs(),
            "Payment session started"
        );
    }

    /// Fetch a new link, restart the countdown and go back to `Ready`.
    ///
    /// Fails with [`PaymentError::Disposed`] when the controller was torn down
    /// before or during the fetch; the session is left as it was.
    pub async fn refresh(&mut self) -> Result<(), PaymentError> {
        if !self.liveness.is_alive() {
            return Err(PaymentError::Disposed);
        }
        self.link.send(LoadEvent::Reset);
        self.link.begin();

        let result = self
            .api
            .fetch_payment_link(&self.order_id)
            .instrument(self.span.clone())
            .await;
        if !self.liveness.is_alive() {
            debug!(parent: &self.span, "Discarding payment link for disposed controller");
            return Err(PaymentError::Disposed);
        }

        match result {
            Ok(link) => {
                self.begin(link);
                Ok(())
            }
            Err(e) => {
                warn!(parent: &self.span, error = %e, "Failed to fetch payment link");
                self.link.reject(e.message.clone());
                lock(&self.machine).send_with(
                    PaymentEvent::Refresh,
                    PaymentPatch {
                        error: Some(Some(e.message.clone())),
                        ..Default::default()
                    },
                );
                self.notifier.notify(NoticeLevel::Error, e.message());
                Err(PaymentError::LinkUnavailable(e.message))
            }
        }
    }

    /// Open the payment page in a new window and watch for it to close.
    pub fn open_payment(&mut self) -> Result<PaymentStep, PaymentError> {
        let url = self.link.data().map(|link| link.url.clone()).ok_or(PaymentError::NoLink)?;
        if self.is_expired() {
            return Err(PaymentError::LinkExpired);
        }
        if !lock(&self.machine).can(PaymentEvent::OpenSucceeded) {
            return Ok(self.step());
        }

        let window = self.navigator.open_window(&url).filter(|window| !window.is_closed());
        let Some(window) = window else {
            warn!(parent: &self.span, "Payment window blocked");
            lock(&self.machine).send(PaymentEvent::OpenBlocked);
            self.notifier
                .notify(NoticeLevel::Info, "支付窗口被拦截，请复制链接在浏览器中完成支付");
            return Ok(PaymentStep::Blocked);
        };

        lock(&self.machine).send(PaymentEvent::OpenSucceeded);
        info!(parent: &self.span, "Payment window opened");

        let machine = Arc::clone(&self.machine);
        let span = self.span.clone();
        self.poll_slot.replace(spawn_poller(self.poll_interval, self.liveness.clone(), move || {
            let mut machine = lock(&machine);
            if !machine.is(PaymentStep::Paying) {
                return PollControl::Stop;
            }
            if window.is_closed() {
                info!(parent: &span, "Payment window closed");
                machine.send(PaymentEvent::WindowClosed);
                return PollControl::Stop;
            }
            PollControl::Continue
        }));

        Ok(PaymentStep::Paying)
    }

    /// Record the user's statement that the payment completed.
    pub fn confirm_payment(&mut self) -> Result<(), PaymentError> {
        if self.is_expired() {
            return Err(PaymentError::LinkExpired);
        }
        let outcome = lock(&self.machine).send_with(
            PaymentEvent::Attest,
            PaymentPatch {
                attested: Some(true),
                ..Default::default()
            },
        );
        if !outcome.is_transition() {
            return Err(PaymentError::NotAwaitingConfirmation);
        }
        info!(parent: &self.span, "Payment attested by user");
        Ok(())
    }

    pub fn copy_link(&self) -> Result<(), PaymentError> {
        let link = self.link.data().ok_or(PaymentError::NoLink)?;
        if self.navigator.copy_to_clipboard(&link.url) {
            self.notifier.notify(NoticeLevel::Success, "支付链接已复制");
            Ok(())
        } else {
            self.notifier.notify(NoticeLevel::Error, "复制失败，请手动复制链接");
            Err(PaymentError::ClipboardUnavailable)
        }
    }

    pub fn teardown(&mut self) {
        self.liveness.dispose();
        self.poll_slot.clear();
        if let Some(mut countdown) = self.countdown.take() {
            countdown.stop();
        }
    }
}

impl Drop for PaymentHandoffController {
    fn drop(&mut self) {
        self.liveness.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ApiError, MockPaymentApi};
    use crate::platform::HeadlessBrowser;
    use chrono::Utc;
    use proptest::prelude::*;

    fn link(url: &str) -> PaymentLink {
        PaymentLink {
            url: url.to_string(),
            issued_at: Utc::now(),
        }
    }

    fn controller(api: MockPaymentApi) -> (PaymentHandoffController, Arc<HeadlessBrowser>) {
        let browser = Arc::new(HeadlessBrowser::new("https://app.test/orders/42").unwrap());
        let c = PaymentHandoffController::new(Arc::new(api), browser.clone(), browser.clone(), "42")
            .with_link_timeout(Duration::from_secs(5))
            .with_debug(true);
        (c, browser)
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_window_moves_to_checking() {
        let (mut c, browser) = controller(MockPaymentApi::new());
        c.begin(link("https://pay.test/42"));

        assert_eq!(c.open_payment(), Ok(PaymentStep::Paying));
        tokio::time::sleep(Duration::from_millis(1_200)).await;
        assert_eq!(c.step(), PaymentStep::Paying);

        browser.last_window().unwrap().close();
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(c.step(), PaymentStep::Checking);

        c.confirm_payment().unwrap();
        assert!(c.context().attested);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocked_popup_offers_copy() {
        let (mut c, browser) = controller(MockPaymentApi::new());
        browser.set_block_popups(true);
        c.begin(link("https://pay.test/42"));

        assert_eq!(c.open_payment(), Ok(PaymentStep::Blocked));
        assert_eq!(c.step(), PaymentStep::Blocked);
        c.copy_link().unwrap();
        assert_eq!(browser.clipboard().as_deref(), Some("https://pay.test/42"));

        browser.set_clipboard_available(false);
        assert_eq!(c.copy_link(), Err(PaymentError::ClipboardUnavailable));

        browser.set_block_popups(false);
        assert_eq!(c.open_payment(), Ok(PaymentStep::Paying));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_disables_primary_action() {
        let (mut c, _) = controller(MockPaymentApi::new());
        c.begin(link("https://pay.test/42"));
        assert!(c.primary_action_enabled());

        tokio::time::sleep(Duration::from_millis(5_500)).await;
        assert_eq!(c.remaining_time(), 0);
        assert!(c.is_expired());
        assert!(!c.primary_action_enabled());
        assert_eq!(c.open_payment(), Err(PaymentError::LinkExpired));
        assert_eq!(c.step(), PaymentStep::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_resets_countdown_and_step() {
        let mut api = MockPaymentApi::new();
        api.expect_fetch_payment_link()
            .withf(|order| order == "42")
            .times(1)
            .returning(|_| Ok(link("https://pay.test/42?v=2")));
        let (mut c, _) = controller(api);
        c.begin(link("https://pay.test/42"));
        c.open_payment().unwrap();

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(c.is_expired());

        c.refresh().await.unwrap();
        assert_eq!(c.step(), PaymentStep::Ready);
        assert_eq!(c.remaining_time(), 5);
        assert!(!c.is_expired());
        assert_eq!(c.context().link.as_deref(), Some("https://pay.test/42?v=2"));
    }

    #[tokio::test]
    async fn test_refresh_failure_is_reported() {
        let mut api = MockPaymentApi::new();
        api.expect_fetch_payment_link().returning(|_| Err(ApiError::new("订单已关闭")));
        let (mut c, browser) = controller(api);

        assert_eq!(c.refresh().await, Err(PaymentError::LinkUnavailable("订单已关闭".to_string())));
        assert_eq!(c.open_payment(), Err(PaymentError::NoLink));
        assert_eq!(browser.notices(), vec![(NoticeLevel::Error, "订单已关闭".to_string())]);
    }

    #[tokio::test]
    async fn test_refresh_racing_teardown_reports_disposed() {
        let in_flight: Arc<Mutex<Option<Liveness>>> = Arc::new(Mutex::new(None));
        let slot = in_flight.clone();
        let mut api = MockPaymentApi::new();
        api.expect_fetch_payment_link().times(1).returning(move |_| {
            if let Some(liveness) = slot.lock().unwrap().as_ref() {
                liveness.dispose();
            }
            Ok(link("https://pay.test/42?v=2"))
        });
        let (mut c, _) = controller(api);
        *in_flight.lock().unwrap() = Some(c.liveness());

        assert_eq!(c.refresh().await, Err(PaymentError::Disposed));
        assert!(c.link().is_none());
        assert!(c.context().link.is_none());
        assert_eq!(c.remaining_time(), 0);

        // no second fetch once disposed
        assert_eq!(c.refresh().await, Err(PaymentError::Disposed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirm_outside_checking_is_rejected() {
        let (mut c, _) = controller(MockPaymentApi::new());
        c.begin(link("https://pay.test/42"));
        assert_eq!(c.confirm_payment(), Err(PaymentError::NotAwaitingConfirmation));
        assert!(!c.context().attested);
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_stops_polling() {
        let (mut c, browser) = controller(MockPaymentApi::new());
        c.begin(link("https://pay.test/42"));
        c.open_payment().unwrap();
        c.teardown();

        browser.last_window().unwrap().close();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(c.step(), PaymentStep::Paying);
    }

    proptest! {
        #[test]
        fn prop_unlisted_events_are_noops(
            step in prop::sample::select(PaymentStep::ALL.to_vec()),
            event in prop::sample::select(PaymentEvent::ALL.to_vec()),
        ) {
            let table = payment_table();
            prop_assume!(!table.handles(step, event));

            let before = PaymentContext { link: Some("l".to_string()), ..Default::default() };
            let mut m: PaymentMachine = Machine::new("payment", step, table).with_context(before.clone());
            m.send_with(event, PaymentPatch { attested: Some(true), ..Default::default() });

            prop_assert_eq!(m.state(), step);
            prop_assert_eq!(m.context(), &before);
        }
    }
}
