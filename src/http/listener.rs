use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio_rustls::TlsAcceptor;

use crate::errors::{HttpError, PrefixError, WsError};
use crate::tls::TlsIdentity;

use super::auth::{self, AuthScheme, CredentialLookup, Principal};
use super::context::HttpContext;
use super::endpoint;
use super::prefix::ListenerPrefix;
use super::request::HttpRequest;

/// what the connection should do with a request after the listener's
/// authentication policy ran
pub(crate) enum AuthDecision {
    /// let it through, with the authenticated principal if any
    Allow(Option<Principal>),
    /// answer 401 carrying this `WWW-Authenticate` value
    Challenge(String),
    /// answer 403
    Forbid,
}

enum AuthSelect {
    Static(AuthScheme),
    Dynamic(Arc<dyn Fn(&HttpRequest) -> AuthScheme + Send + Sync>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListenerState {
    Stopped,
    Started,
    Closed,
}

struct ListenerInner {
    prefixes: Mutex<Vec<ListenerPrefix>>,
    realm: Mutex<String>,
    auth: Mutex<AuthSelect>,
    credentials: Mutex<Option<CredentialLookup>>,
    tls: Mutex<Option<TlsIdentity>>,
    cert_folder: Mutex<Option<PathBuf>>,
    state: Mutex<ListenerState>,
    queue_tx: mpsc::UnboundedSender<HttpContext>,
    queue_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<HttpContext>>,
    running: watch::Sender<bool>,
}

/// an HTTP listener serving one or more URI prefixes
///
/// requests routed to it queue as [`HttpContext`]s handed out by
/// [`get_context`](Self::get_context); each context is either answered
/// or upgraded to a websocket session
#[derive(Clone)]
pub struct HttpListener {
    inner: Arc<ListenerInner>,
}

impl Default for HttpListener {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpListener {
    /// a stopped listener with no prefixes
    pub fn new() -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (running, _) = watch::channel(false);
        Self {
            inner: Arc::new(ListenerInner {
                prefixes: Mutex::new(vec![]),
                realm: Mutex::new("SECRET AREA".to_string()),
                auth: Mutex::new(AuthSelect::Static(AuthScheme::Anonymous)),
                credentials: Mutex::new(None),
                tls: Mutex::new(None),
                cert_folder: Mutex::new(None),
                state: Mutex::new(ListenerState::Stopped),
                queue_tx,
                queue_rx: tokio::sync::Mutex::new(queue_rx),
                running,
            }),
        }
    }

    pub(crate) fn same_as(&self, other: &HttpListener) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// add a URI prefix; takes effect immediately on a started
    /// listener
    pub fn add_prefix(&self, prefix: &str) -> Result<(), PrefixError> {
        let prefix = ListenerPrefix::parse(prefix)?;
        if *self.inner.state.lock() == ListenerState::Started {
            endpoint::add_prefix(&prefix, self)?;
        }
        self.inner.prefixes.lock().push(prefix);
        Ok(())
    }

    /// remove a previously added prefix
    pub fn remove_prefix(&self, prefix: &str) -> Result<(), PrefixError> {
        let parsed = ListenerPrefix::parse(prefix)?;
        let mut prefixes = self.inner.prefixes.lock();
        let before = prefixes.len();
        prefixes.retain(|p| p != &parsed);
        if before != prefixes.len() && *self.inner.state.lock() == ListenerState::Started {
            endpoint::remove_prefix(&parsed, self);
        }
        Ok(())
    }

    /// realm announced in authentication challenges
    pub fn set_realm(&self, realm: impl Into<String>) {
        *self.inner.realm.lock() = realm.into();
    }

    /// fixed authentication scheme for every request
    pub fn set_auth_scheme(&self, scheme: AuthScheme) {
        *self.inner.auth.lock() = AuthSelect::Static(scheme);
    }

    /// per-request authentication scheme selector
    pub fn set_auth_selector<F>(&self, selector: F)
    where
        F: Fn(&HttpRequest) -> AuthScheme + Send + Sync + 'static,
    {
        *self.inner.auth.lock() = AuthSelect::Dynamic(Arc::new(selector));
    }

    /// resolver from username to stored credentials
    pub fn set_credentials<F>(&self, lookup: F)
    where
        F: Fn(&str) -> Option<auth::Credentials> + Send + Sync + 'static,
    {
        *self.inner.credentials.lock() = Some(Arc::new(lookup));
    }

    /// certificate and key for https prefixes
    pub fn set_tls_identity(&self, identity: TlsIdentity) {
        *self.inner.tls.lock() = Some(identity);
    }

    /// folder holding `<port>.cer` / `<port>.key` DER pairs
    pub fn set_cert_folder(&self, folder: impl Into<PathBuf>) {
        *self.inner.cert_folder.lock() = Some(folder.into());
    }

    pub(crate) fn tls_acceptor(&self, port: u16) -> Result<TlsAcceptor, WsError> {
        if let Some(identity) = self.inner.tls.lock().clone() {
            return identity.into_acceptor();
        }
        if let Some(folder) = self.inner.cert_folder.lock().clone() {
            return TlsIdentity::from_der_files(folder, port)?.into_acceptor();
        }
        Err(WsError::CertFileNotFound(
            "no tls identity configured".to_string(),
        ))
    }

    /// register every prefix and start accepting
    ///
    /// must be called inside a tokio runtime; fails without having
    /// registered anything if any prefix is unusable
    pub fn start(&self) -> Result<(), PrefixError> {
        {
            let mut state = self.inner.state.lock();
            match *state {
                ListenerState::Started => return Ok(()),
                ListenerState::Closed => {
                    return Err(PrefixError::InvalidPrefix(
                        String::new(),
                        "listener is closed",
                    ))
                }
                ListenerState::Stopped => *state = ListenerState::Started,
            }
        }
        let prefixes = self.inner.prefixes.lock().clone();
        let mut registered: Vec<ListenerPrefix> = vec![];
        for prefix in &prefixes {
            match endpoint::add_prefix(prefix, self) {
                Ok(()) => registered.push(prefix.clone()),
                Err(e) => {
                    for done in &registered {
                        endpoint::remove_prefix(done, self);
                    }
                    *self.inner.state.lock() = ListenerState::Stopped;
                    return Err(e);
                }
            }
        }
        let _ = self.inner.running.send(true);
        tracing::debug!(prefixes = prefixes.len(), "listener started");
        Ok(())
    }

    /// stop accepting; queued contexts are answered with 503
    pub fn stop(&self) {
        self.teardown(true);
    }

    /// stop accepting and drop queued contexts without answering
    pub fn abort(&self) {
        self.teardown(false);
    }

    /// stop permanently; a closed listener cannot restart
    pub fn close(&self) {
        self.teardown(true);
        *self.inner.state.lock() = ListenerState::Closed;
    }

    fn teardown(&self, answer_queued: bool) {
        {
            let mut state = self.inner.state.lock();
            if *state != ListenerState::Started {
                return;
            }
            *state = ListenerState::Stopped;
        }
        for prefix in self.inner.prefixes.lock().iter() {
            endpoint::remove_prefix(prefix, self);
        }
        let _ = self.inner.running.send(false);
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut rx = inner.queue_rx.lock().await;
            while let Ok(context) = rx.try_recv() {
                if answer_queued {
                    tokio::spawn(context.reject_unavailable());
                }
                // otherwise dropping the context drops its transport
            }
        });
        tracing::debug!("listener stopped");
    }

    /// wait for the next routed request
    ///
    /// resolves with `Err(ListenerClosed)` when the listener stops
    pub async fn get_context(&self) -> Result<HttpContext, HttpError> {
        let mut running = self.inner.running.subscribe();
        if !*running.borrow() {
            return Err(HttpError::ListenerClosed);
        }
        let mut rx = self.inner.queue_rx.lock().await;
        loop {
            tokio::select! {
                context = rx.recv() => {
                    return context.ok_or(HttpError::ListenerClosed);
                }
                changed = running.changed() => {
                    if changed.is_err() || !*running.borrow() {
                        return Err(HttpError::ListenerClosed);
                    }
                }
            }
        }
    }

    pub(crate) fn enqueue(&self, context: HttpContext) -> Result<(), HttpContext> {
        if *self.inner.state.lock() != ListenerState::Started {
            return Err(context);
        }
        self.inner.queue_tx.send(context).map_err(|e| e.0)
    }

    /// run the listener's authentication policy over a request
    pub(crate) fn check_auth(&self, request: &HttpRequest) -> AuthDecision {
        let scheme = match &*self.inner.auth.lock() {
            AuthSelect::Static(scheme) => *scheme,
            AuthSelect::Dynamic(selector) => selector(request),
        };
        match scheme {
            AuthScheme::None => AuthDecision::Forbid,
            AuthScheme::Anonymous => AuthDecision::Allow(None),
            AuthScheme::Basic | AuthScheme::Digest => {
                let realm = self.inner.realm.lock().clone();
                let lookup = self.inner.credentials.lock().clone();
                let Some(lookup) = lookup else {
                    // nobody can authenticate without a resolver
                    return AuthDecision::Challenge(match scheme {
                        AuthScheme::Basic => auth::basic_challenge(&realm),
                        _ => auth::digest_challenge(&realm),
                    });
                };
                match auth::authenticate(
                    request.headers().get("Authorization"),
                    request.method(),
                    scheme,
                    &realm,
                    &lookup,
                ) {
                    Ok(principal) => AuthDecision::Allow(Some(principal)),
                    Err(challenge) => AuthDecision::Challenge(challenge),
                }
            }
        }
    }
}
