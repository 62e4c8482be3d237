//! Delivery and consignment of a held item.
//!
//! Both actions share one `Submitting` state so at most one request is ever
//! in flight. Delivery is gated locally by the holding window; consignment is
//! gated by the server, with a per-second countdown mirroring the server's
//! remaining lock time while the panel is open.

use std::sync::{Arc, LazyLock};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn, Instrument};

use crate::api::{ConsignmentRequest, DeliveryRequest, DispositionApi, ServerConsignmentEligibility};
use crate::clock::{Clock, SystemClock};
use crate::machine::{loading_machine, Context, LoadingMachine, Machine, TransitionTable};
use crate::platform::{NoticeLevel, Notifier};
use crate::telemetry::{create_workflow_span, generate_correlation_id};
use crate::timer::{Countdown, Liveness};

pub const DEFAULT_HOLDING_HOURS: u32 = 48;
pub const DEFAULT_COUNTDOWN_TICK: Duration = Duration::from_secs(1);

const MS_PER_HOUR: i64 = 3_600_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DispositionState {
    Closed,
    OpenDelivery,
    OpenConsignment,
    Submitting,
}

impl DispositionState {
    pub const ALL: [DispositionState; 4] = [
        DispositionState::Closed,
        DispositionState::OpenDelivery,
        DispositionState::OpenConsignment,
        DispositionState::Submitting,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DispositionEvent {
    OpenDelivery,
    OpenConsignment,
    Close,
    Submit,
    SubmitSucceeded,
    DeliveryFailed,
    ConsignmentFailed,
}

impl DispositionEvent {
    pub const ALL: [DispositionEvent; 7] = [
        DispositionEvent::OpenDelivery,
        DispositionEvent::OpenConsignment,
        DispositionEvent::Close,
        DispositionEvent::Submit,
        DispositionEvent::SubmitSucceeded,
        DispositionEvent::DeliveryFailed,
        DispositionEvent::ConsignmentFailed,
    ];
}

static DISPOSITION_TABLE: LazyLock<Arc<TransitionTable<DispositionState, DispositionEvent>>> = LazyLock::new(|| {
    use DispositionEvent as E;
    use DispositionState as S;
    Arc::new(
        TransitionTable::new()
            .on_any(&[S::Closed, S::OpenConsignment], E::OpenDelivery, S::OpenDelivery)
            .on_any(&[S::Closed, S::OpenDelivery], E::OpenConsignment, S::OpenConsignment)
            .on_any(&[S::OpenDelivery, S::OpenConsignment], E::Close, S::Closed)
            .on_any(&[S::OpenDelivery, S::OpenConsignment], E::Submit, S::Submitting)
            .on(S::Submitting, E::SubmitSucceeded, S::Closed)
            .on(S::Submitting, E::DeliveryFailed, S::OpenDelivery)
            .on(S::Submitting, E::ConsignmentFailed, S::OpenConsignment),
    )
});

pub fn disposition_table() -> Arc<TransitionTable<DispositionState, DispositionEvent>> {
    Arc::clone(&DISPOSITION_TABLE)
}

/// Lifecycle flags that block or complicate delivery.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ItemFlags {
    pub in_consignment: bool,
    pub consignment_sold: bool,
    pub delivered: bool,
    /// Entered consignment at some point, even if since cancelled.
    pub ever_consigned: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AssetItem {
    pub id: String,
    /// Epoch milliseconds.
    pub purchased_at: i64,
    pub buy_price: f64,
    pub appreciation_rate: f64,
    /// Market reference price, when the backend supplies one.
    pub reference_price: Option<f64>,
    pub flags: ItemFlags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispositionAction {
    Delivery,
    Consignment,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DispositionContext {
    pub item: Option<AssetItem>,
    pub action: Option<DispositionAction>,
    pub price: Option<f64>,
    pub error: Option<String>,
}

#[derive(Debug, Default)]
pub struct DispositionPatch {
    pub item: Option<AssetItem>,
    pub action: Option<Option<DispositionAction>>,
    pub price: Option<Option<f64>>,
    pub error: Option<Option<String>>,
}

impl Context for DispositionContext {
    type Patch = DispositionPatch;

    fn merge(&mut self, patch: DispositionPatch) {
        if let Some(item) = patch.item {
            self.item = Some(item);
        }
        if let Some(action) = patch.action {
            self.action = action;
        }
        if let Some(price) = patch.price {
            self.price = price;
        }
        if let Some(error) = patch.error {
            self.error = error;
        }
    }
}

/// Local holding-window check for delivery.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeliveryEligibility {
    pub passed: bool,
    pub hours_elapsed: f64,
    pub hours_left: u64,
}

pub fn delivery_eligibility(purchased_at_ms: i64, now_ms: i64, holding_hours: u32) -> DeliveryEligibility {
    // a purchase stamped in the future counts as just bought
    let elapsed_ms = now_ms.saturating_sub(purchased_at_ms).max(0);
    let holding_ms = i64::from(holding_hours) * MS_PER_HOUR;
    let hours_elapsed = elapsed_ms as f64 / MS_PER_HOUR as f64;
    let hours_left = (f64::from(holding_hours) - hours_elapsed).ceil().max(0.0) as u64;
    DeliveryEligibility {
        passed: elapsed_ms >= holding_ms,
        hours_elapsed,
        hours_left,
    }
}

/// What the consignment panel shows and allows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsignmentEligibility {
    pub unlocked: bool,
    pub remaining_seconds: Option<u64>,
    pub remaining_text: Option<String>,
    pub can_consign: bool,
}

impl ConsignmentEligibility {
    /// Combine the server's verdict with the local ticket precondition.
    ///
    /// The server decides; `local` only phrases the wait when the lock is
    /// the holding window itself.
    pub fn derive(server: &ServerConsignmentEligibility, ticket_count: u32, local: &DeliveryEligibility) -> Self {
        let remaining_text = if server.unlocked {
            None
        } else if server.time_locked {
            Some(format!("还需约{}小时可寄售", local.hours_left.max(1)))
        } else {
            Some(server.message.clone().unwrap_or_else(|| "暂不可寄售".to_string()))
        };
        Self {
            unlocked: server.unlocked,
            remaining_seconds: server.remaining_seconds,
            remaining_text,
            can_consign: server.unlocked && ticket_count > 0,
        }
    }
}

fn round_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn usable_price(price: f64) -> Option<f64> {
    (price.is_finite() && price > 0.0).then_some(price)
}

/// Consignment price for `item`.
///
/// The reference price is preferred; a missing, non-positive or non-finite
/// one falls back to `buy_price * (1 + appreciation_rate)`.
pub fn resolve_consign_price(item: &AssetItem) -> Result<f64, DispositionError> {
    if let Some(price) = item.reference_price.map(round_cents).and_then(usable_price) {
        return Ok(price);
    }
    let fallback = round_cents(item.buy_price * (1.0 + item.appreciation_rate));
    debug!(item_id = %item.id, fallback, "Using fallback consignment price");
    usable_price(fallback).ok_or(DispositionError::InvalidPrice)
}

/// Reasons a submission is refused before any request is made.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DispositionError {
    #[error("请先选择藏品")]
    NoItemSelected,
    #[error("该藏品正在寄售中，无法提货")]
    InConsignment,
    #[error("该藏品已寄售售出，无法提货")]
    ConsignmentSold,
    #[error("该藏品已提货")]
    AlreadyDelivered,
    #[error("持有满{holding_hours}小时后可提货，还需约{hours_left}小时")]
    HoldingPeriod { holding_hours: u32, hours_left: u64 },
    #[error("缺少道具")]
    MissingTicket,
    #[error("{0}")]
    ConsignmentLocked(String),
    #[error("寄售价格异常")]
    InvalidPrice,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Submitted,
    /// Another submission is in flight or no panel is open.
    Ignored,
    /// The item was consigned before; delivery must be confirmed explicitly.
    ConfirmationRequired,
    Failed(String),
}

pub struct AssetDispositionController {
    machine: Machine<DispositionState, DispositionEvent, DispositionContext>,
    eligibility: LoadingMachine<ConsignmentEligibility>,
    countdown: Option<Countdown>,
    api: Arc<dyn DispositionApi>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    ticket_count: u32,
    holding_hours: u32,
    countdown_tick: Duration,
    liveness: Liveness,
    span: tracing::Span,
}

impl std::fmt::Debug for AssetDispositionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssetDispositionController")
            .field("machine", &self.machine)
            .field("eligibility", &self.eligibility.state())
            .field("countdown", &self.countdown_remaining())
            .field("ticket_count", &self.ticket_count)
            .finish()
    }
}

impl AssetDispositionController {
    pub fn new(api: Arc<dyn DispositionApi>, notifier: Arc<dyn Notifier>, ticket_count: u32) -> Self {
        Self {
            machine: Machine::new("disposition", DispositionState::Closed, disposition_table()),
            eligibility: loading_machine("consignment-eligibility"),
            countdown: None,
            api,
            notifier,
            clock: Arc::new(SystemClock),
            ticket_count,
            holding_hours: DEFAULT_HOLDING_HOURS,
            countdown_tick: DEFAULT_COUNTDOWN_TICK,
            liveness: Liveness::new(),
            span: create_workflow_span("disposition", &generate_correlation_id()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.machine.set_clock(Arc::clone(&clock));
        self.eligibility.set_clock(Arc::clone(&clock));
        self.clock = clock;
        self
    }

    pub fn with_holding_hours(mut self, holding_hours: u32) -> Self {
        self.holding_hours = holding_hours;
        self
    }

    pub fn with_countdown_tick(mut self, tick: Duration) -> Self {
        self.countdown_tick = tick;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.machine.set_debug(debug);
        self.eligibility.set_debug(debug);
        self
    }

    pub fn state(&self) -> DispositionState {
        self.machine.state()
    }

    pub fn context(&self) -> &DispositionContext {
        self.machine.context()
    }

    pub fn is_submitting(&self) -> bool {
        self.machine.is(DispositionState::Submitting)
    }

    pub fn ticket_count(&self) -> u32 {
        self.ticket_count
    }

    pub fn set_ticket_count(&mut self, ticket_count: u32) {
        self.ticket_count = ticket_count;
    }

    pub fn liveness(&self) -> Liveness {
        self.liveness.clone()
    }

    /// Holding-window check for the selected item at the current time.
    pub fn delivery_eligibility(&self) -> Option<DeliveryEligibility> {
        let item = self.machine.context().item.as_ref()?;
        Some(delivery_eligibility(item.purchased_at, self.clock.now_ms(), self.holding_hours))
    }

    /// Last server verdict, re-evaluated against the current ticket count.
    pub fn consignment_eligibility(&self) -> Option<ConsignmentEligibility> {
        self.eligibility.data().map(|e| ConsignmentEligibility {
            can_consign: e.unlocked && self.ticket_count > 0,
            ..e.clone()
        })
    }

    pub fn eligibility_error(&self) -> Option<&str> {
        self.eligibility.error()
    }

    /// Seconds left on the consignment lock while the panel is open.
    pub fn countdown_remaining(&self) -> Option<u64> {
        self.countdown.as_ref().map(Countdown::remaining)
    }

    pub fn open_delivery(&mut self, item: AssetItem) -> Option<DeliveryEligibility> {
        let entered = self.apply(
            DispositionEvent::OpenDelivery,
            DispositionPatch {
                item: Some(item),
                action: Some(Some(DispositionAction::Delivery)),
                price: Some(None),
                error: Some(None),
            },
        );
        self.on_enter(entered);
        entered.and_then(|_| self.delivery_eligibility())
    }

    /// Open the consignment panel and fetch the server's unlock signal.
    pub async fn open_consignment(&mut self, item: AssetItem) {
        let entered = self.apply(
            DispositionEvent::OpenConsignment,
            DispositionPatch {
                item: Some(item),
                action: Some(Some(DispositionAction::Consignment)),
                price: Some(None),
                error: Some(None),
            },
        );
        self.on_enter(entered);
        if entered.is_some() {
            self.refresh_eligibility().await;
        }
    }

    /// Re-query the server while the consignment panel is open.
    pub async fn refresh_eligibility(&mut self) {
        if !self.machine.is(DispositionState::OpenConsignment) {
            return;
        }
        let Some(item) = self.machine.context().item.clone() else {
            return;
        };
        // a new fetch never inherits the previous item's verdict
        self.eligibility.reset();
        self.stop_countdown();
        self.eligibility.begin();

        let span = self.span.clone();
        let result = self.api.consignment_eligibility(&item.id).instrument(span.clone()).await;
        let _guard = span.enter();

        if !self.liveness.is_alive() || !self.panel_shows(DispositionState::OpenConsignment, &item.id) {
            debug!(item_id = %item.id, "Discarding stale consignment eligibility");
            return;
        }

        match result {
            Ok(server) => {
                let local = delivery_eligibility(item.purchased_at, self.clock.now_ms(), self.holding_hours);
                let eligibility = ConsignmentEligibility::derive(&server, self.ticket_count, &local);
                info!(
                    item_id = %item.id,
                    unlocked = eligibility.unlocked,
                    remaining_seconds = ?eligibility.remaining_seconds,
                    "Consignment eligibility loaded"
                );
                self.countdown = match eligibility.remaining_seconds {
                    Some(seconds) if !eligibility.unlocked && seconds > 0 => {
                        Some(Countdown::start("consignment", seconds, self.countdown_tick))
                    }
                    _ => None,
                };
                self.eligibility.resolve(eligibility);
            }
            Err(e) => {
                warn!(item_id = %item.id, error = %e, "Failed to load consignment eligibility");
                self.stop_countdown();
                self.notify(NoticeLevel::Error, e.message());
                self.eligibility.reject(e.message);
            }
        }
    }

    pub fn close(&mut self) {
        let entered = self.apply(DispositionEvent::Close, DispositionPatch::default());
        self.on_enter(entered);
    }

    pub async fn submit_delivery_action(&mut self, confirmed: bool) -> Result<SubmitOutcome, DispositionError> {
        if self.is_submitting() || !self.machine.is(DispositionState::OpenDelivery) {
            debug!(state = ?self.state(), "Delivery submission ignored");
            return Ok(SubmitOutcome::Ignored);
        }
        let item = self.machine.context().item.clone().ok_or(DispositionError::NoItemSelected)?;

        if let Err(rejection) = self.check_delivery(&item) {
            self.notify(NoticeLevel::Error, &rejection.to_string());
            return Err(rejection);
        }
        if item.flags.ever_consigned && !confirmed {
            return Ok(SubmitOutcome::ConfirmationRequired);
        }

        self.apply(DispositionEvent::Submit, DispositionPatch::default());
        let request = DeliveryRequest {
            item_id: item.id.clone(),
            forced: item.flags.ever_consigned,
        };
        let span = self.span.clone();
        let result = self.api.request_delivery(request).instrument(span.clone()).await;
        let _guard = span.enter();

        match result {
            Ok(()) => {
                info!(item_id = %item.id, forced = item.flags.ever_consigned, "Delivery requested");
                let delivered = AssetItem {
                    flags: ItemFlags {
                        delivered: true,
                        ..item.flags
                    },
                    ..item
                };
                let entered = self.apply(
                    DispositionEvent::SubmitSucceeded,
                    DispositionPatch {
                        item: Some(delivered),
                        ..Default::default()
                    },
                );
                self.on_enter(entered);
                self.notify(NoticeLevel::Success, "提货申请已提交");
                Ok(SubmitOutcome::Submitted)
            }
            Err(e) => {
                warn!(item_id = %item.id, error = %e, "Delivery request failed");
                self.notify(NoticeLevel::Error, e.message());
                let entered = self.apply(
                    DispositionEvent::DeliveryFailed,
                    DispositionPatch {
                        error: Some(Some(e.message.clone())),
                        ..Default::default()
                    },
                );
                self.on_enter(entered);
                Ok(SubmitOutcome::Failed(e.message))
            }
        }
    }

    pub async fn submit_consignment_action(&mut self) -> Result<SubmitOutcome, DispositionError> {
        if self.is_submitting() || !self.machine.is(DispositionState::OpenConsignment) {
            debug!(state = ?self.state(), "Consignment submission ignored");
            return Ok(SubmitOutcome::Ignored);
        }
        let item = self.machine.context().item.clone().ok_or(DispositionError::NoItemSelected)?;

        let price = match self.check_consignment(&item) {
            Ok(price) => price,
            Err(rejection) => {
                self.notify(NoticeLevel::Error, &rejection.to_string());
                return Err(rejection);
            }
        };

        self.apply(
            DispositionEvent::Submit,
            DispositionPatch {
                price: Some(Some(price)),
                ..Default::default()
            },
        );
        let request = ConsignmentRequest {
            item_id: item.id.clone(),
            price,
        };
        let span = self.span.clone();
        let result = self.api.request_consignment(request).instrument(span.clone()).await;
        let _guard = span.enter();

        match result {
            Ok(()) => {
                info!(item_id = %item.id, price, "Consignment requested");
                if self.liveness.is_alive() {
                    self.ticket_count = self.ticket_count.saturating_sub(1);
                }
                let consigned = AssetItem {
                    flags: ItemFlags {
                        in_consignment: true,
                        ever_consigned: true,
                        ..item.flags
                    },
                    ..item
                };
                let entered = self.apply(
                    DispositionEvent::SubmitSucceeded,
                    DispositionPatch {
                        item: Some(consigned),
                        ..Default::default()
                    },
                );
                self.on_enter(entered);
                self.notify(NoticeLevel::Success, "寄售已提交");
                Ok(SubmitOutcome::Submitted)
            }
            Err(e) => {
                warn!(item_id = %item.id, error = %e, "Consignment request failed");
                self.notify(NoticeLevel::Error, e.message());
                let entered = self.apply(
                    DispositionEvent::ConsignmentFailed,
                    DispositionPatch {
                        error: Some(Some(e.message.clone())),
                        ..Default::default()
                    },
                );
                self.on_enter(entered);
                Ok(SubmitOutcome::Failed(e.message))
            }
        }
    }

    pub fn teardown(&mut self) {
        self.liveness.dispose();
        self.stop_countdown();
    }

    fn check_delivery(&self, item: &AssetItem) -> Result<(), DispositionError> {
        if item.flags.in_consignment {
            return Err(DispositionError::InConsignment);
        }
        if item.flags.consignment_sold {
            return Err(DispositionError::ConsignmentSold);
        }
        if item.flags.delivered {
            return Err(DispositionError::AlreadyDelivered);
        }
        let window = delivery_eligibility(item.purchased_at, self.clock.now_ms(), self.holding_hours);
        if !window.passed {
            return Err(DispositionError::HoldingPeriod {
                holding_hours: self.holding_hours,
                hours_left: window.hours_left,
            });
        }
        Ok(())
    }

    fn check_consignment(&self, item: &AssetItem) -> Result<f64, DispositionError> {
        if self.ticket_count == 0 {
            return Err(DispositionError::MissingTicket);
        }
        match self.eligibility.data() {
            Some(eligibility) if eligibility.unlocked => {}
            Some(eligibility) => {
                let reason = eligibility
                    .remaining_text
                    .clone()
                    .unwrap_or_else(|| "暂不可寄售".to_string());
                return Err(DispositionError::ConsignmentLocked(reason));
            }
            None => {
                let reason = self.eligibility.error().unwrap_or("寄售资格校验中，请稍后");
                return Err(DispositionError::ConsignmentLocked(reason.to_string()));
            }
        }
        resolve_consign_price(item)
    }

    fn panel_shows(&self, state: DispositionState, item_id: &str) -> bool {
        self.machine.is(state) && self.machine.context().item.as_ref().is_some_and(|i| i.id == item_id)
    }

    fn apply(&mut self, event: DispositionEvent, patch: DispositionPatch) -> Option<DispositionState> {
        if !self.liveness.is_alive() {
            debug!(parent: &self.span, event = ?event, "Dropping event for disposed controller");
            return None;
        }
        self.machine.send_with(event, patch).entered()
    }

    fn on_enter(&mut self, entered: Option<DispositionState>) {
        match entered {
            Some(DispositionState::OpenConsignment) | Some(DispositionState::Submitting) | None => {}
            Some(DispositionState::Closed) | Some(DispositionState::OpenDelivery) => self.stop_countdown(),
        }
    }

    fn stop_countdown(&mut self) {
        if let Some(mut countdown) = self.countdown.take() {
            countdown.stop();
        }
    }

    fn notify(&self, level: NoticeLevel, message: &str) {
        if self.liveness.is_alive() {
            self.notifier.notify(level, message);
        }
    }
}

impl Drop for AssetDispositionController {
    fn drop(&mut self) {
        self.liveness.dispose();
    }
}
