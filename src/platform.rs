//! Host platform interface used by the workflow controllers.
//!
//! Controllers never touch a page, window or clipboard directly; they go
//! through [`Navigator`] and [`Notifier`]. [`HeadlessBrowser`] is an
//! in-process implementation used by the CLI and by tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{error, info};
use url::Url;

/// Handle to a window opened by [`Navigator::open_window`].
pub trait WindowHandle: Send + Sync {
    fn is_closed(&self) -> bool;
}

pub trait Navigator: Send + Sync {
    /// Value of a query parameter on the current location.
    fn query_param(&self, name: &str) -> Option<String>;

    /// Drop the query string from the visible location without navigating.
    fn replace_url_without_params(&self);

    /// Open `url` in a new window. `None` when the host refused.
    fn open_window(&self, url: &str) -> Option<Arc<dyn WindowHandle>>;

    /// Leave the application for `url`.
    fn redirect_to(&self, url: &str);

    fn copy_to_clipboard(&self, text: &str) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Success,
    Error,
}

/// Transient user notifications.
pub trait Notifier: Send + Sync {
    fn notify(&self, level: NoticeLevel, message: &str);
}

/// Notifier that only writes to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, level: NoticeLevel, message: &str) {
        match level {
            NoticeLevel::Error => error!(notice = %message, "User notice"),
            _ => info!(notice = %message, level = ?level, "User notice"),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone)]
pub struct HeadlessWindow {
    url: String,
    closed: Arc<AtomicBool>,
}

impl HeadlessWindow {
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Simulate the user closing the window.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

impl WindowHandle for HeadlessWindow {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// In-process browser stand-in that records everything asked of it.
#[derive(Debug)]
pub struct HeadlessBrowser {
    location: Mutex<Url>,
    redirects: Mutex<Vec<String>>,
    windows: Mutex<Vec<HeadlessWindow>>,
    notices: Mutex<Vec<(NoticeLevel, String)>>,
    clipboard: Mutex<Option<String>>,
    block_popups: AtomicBool,
    clipboard_available: AtomicBool,
}

impl HeadlessBrowser {
    pub fn new(location: &str) -> Result<Self, url::ParseError> {
        Ok(Self {
            location: Mutex::new(Url::parse(location)?),
            redirects: Mutex::new(Vec::new()),
            windows: Mutex::new(Vec::new()),
            notices: Mutex::new(Vec::new()),
            clipboard: Mutex::new(None),
            block_popups: AtomicBool::new(false),
            clipboard_available: AtomicBool::new(true),
        })
    }

    pub fn location(&self) -> String {
        lock(&self.location).to_string()
    }

    /// Simulate arriving at `location`, e.g. a provider redirecting back.
    pub fn navigate(&self, location: &str) -> Result<(), url::ParseError> {
        *lock(&self.location) = Url::parse(location)?;
        Ok(())
    }

    pub fn set_block_popups(&self, blocked: bool) {
        self.block_popups.store(blocked, Ordering::SeqCst);
    }

    pub fn set_clipboard_available(&self, available: bool) {
        self.clipboard_available.store(available, Ordering::SeqCst);
    }

    pub fn redirects(&self) -> Vec<String> {
        lock(&self.redirects).clone()
    }

    pub fn windows(&self) -> Vec<HeadlessWindow> {
        lock(&self.windows).clone()
    }

    pub fn last_window(&self) -> Option<HeadlessWindow> {
        lock(&self.windows).last().cloned()
    }

    pub fn notices(&self) -> Vec<(NoticeLevel, String)> {
        lock(&self.notices).clone()
    }

    pub fn clipboard(&self) -> Option<String> {
        lock(&self.clipboard).clone()
    }
}

impl Navigator for HeadlessBrowser {
    fn query_param(&self, name: &str) -> Option<String> {
        lock(&self.location)
            .query_pairs()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.into_owned())
    }

    fn replace_url_without_params(&self) {
        lock(&self.location).set_query(None);
    }

    fn open_window(&self, url: &str) -> Option<Arc<dyn WindowHandle>> {
        if self.block_popups.load(Ordering::SeqCst) {
            return None;
        }
        let window = HeadlessWindow {
            url: url.to_string(),
            closed: Arc::new(AtomicBool::new(false)),
        };
        lock(&self.windows).push(window.clone());
        Some(Arc::new(window))
    }

    fn redirect_to(&self, url: &str) {
        info!(target_url = %url, "Redirecting away from application");
        lock(&self.redirects).push(url.to_string());
    }

    fn copy_to_clipboard(&self, text: &str) -> bool {
        if !self.clipboard_available.load(Ordering::SeqCst) {
            return false;
        }
        *lock(&self.clipboard) = Some(text.to_string());
        true
    }
}

impl Notifier for HeadlessBrowser {
    fn notify(&self, level: NoticeLevel, message: &str) {
        lock(&self.notices).push((level, message.to_string()));
    }
}
