use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, OnceLock};

use parking_lot::{Mutex, RwLock};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio_rustls::TlsAcceptor;

use crate::errors::PrefixError;
use crate::tls::MaybeTlsStream;

use super::connection;
use super::listener::HttpListener;
use super::prefix::{ListenerPrefix, PrefixHost};

#[derive(Clone)]
pub(crate) struct PrefixEntry {
    pub prefix: ListenerPrefix,
    pub listener: HttpListener,
}

/// the three match tiers: specific host, `*`, `+`
#[derive(Clone, Default)]
pub(crate) struct PrefixLists {
    pub specific: Vec<PrefixEntry>,
    pub wildcard: Vec<PrefixEntry>,
    pub all: Vec<PrefixEntry>,
}

impl PrefixLists {
    fn is_empty(&self) -> bool {
        self.specific.is_empty() && self.wildcard.is_empty() && self.all.is_empty()
    }
}

/// one accept socket per (address, port); prefixes published as
/// copy-on-write snapshots so routing never takes the write lock
pub(crate) struct EndpointBinding {
    pub addr: SocketAddr,
    pub secure: bool,
    pub acceptor: Option<TlsAcceptor>,
    prefixes: RwLock<Arc<PrefixLists>>,
    shutdown: tokio::sync::Notify,
}

impl EndpointBinding {
    fn add(&self, prefix: &ListenerPrefix, listener: &HttpListener) -> Result<(), PrefixError> {
        let mut guard = self.prefixes.write();
        let mut lists = PrefixLists::clone(&guard);
        let list = match prefix.host() {
            PrefixHost::Dns(_) | PrefixHost::Ip(_) => &mut lists.specific,
            PrefixHost::Wildcard => &mut lists.wildcard,
            PrefixHost::Any => &mut lists.all,
        };
        match list
            .iter_mut()
            .find(|e| e.prefix.host() == prefix.host() && e.prefix.path() == prefix.path())
        {
            Some(entry) => {
                if !entry.listener.same_as(listener) {
                    return Err(PrefixError::PrefixInUse(prefix.as_str().to_string()));
                }
                entry.prefix = prefix.clone();
                entry.listener = listener.clone();
            }
            None => list.push(PrefixEntry {
                prefix: prefix.clone(),
                listener: listener.clone(),
            }),
        }
        *guard = Arc::new(lists);
        Ok(())
    }

    /// remove a prefix, reporting whether the binding is now empty
    fn remove(&self, prefix: &ListenerPrefix, listener: &HttpListener) -> bool {
        let mut guard = self.prefixes.write();
        let mut lists = PrefixLists::clone(&guard);
        for list in [&mut lists.specific, &mut lists.wildcard, &mut lists.all] {
            list.retain(|e| {
                !(e.prefix.host() == prefix.host()
                    && e.prefix.path() == prefix.path()
                    && e.listener.same_as(listener))
            });
        }
        let empty = lists.is_empty();
        *guard = Arc::new(lists);
        empty
    }

    /// host-aware longest-path match, then `*`, then `+`
    ///
    /// a request path missing its trailing slash is retried with one
    /// appended
    pub(crate) fn search(&self, host: Option<&str>, path: &str) -> Option<HttpListener> {
        let lists = self.prefixes.read().clone();
        let matches_path = |prefix: &ListenerPrefix| {
            path.starts_with(prefix.path()) || format!("{path}/").starts_with(prefix.path())
        };
        let best = |list: &[PrefixEntry], check_host: bool| {
            list.iter()
                .filter(|e| {
                    (!check_host
                        || host.map(|h| e.prefix.matches_host(h)).unwrap_or(false))
                        && matches_path(&e.prefix)
                })
                .max_by_key(|e| e.prefix.path().len())
                .map(|e| e.listener.clone())
        };
        best(&lists.specific, true)
            .or_else(|| best(&lists.wildcard, false))
            .or_else(|| best(&lists.all, false))
    }
}

type Registry = Mutex<HashMap<IpAddr, HashMap<u16, Arc<EndpointBinding>>>>;

/// the only static mutable state in the crate, initialized lazily and
/// pruned as the last prefix on an endpoint goes away
fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(Default::default)
}

/// register a prefix, creating the endpoint binding and its accept
/// loop on first use
///
/// must run inside a tokio runtime
pub(crate) fn add_prefix(
    prefix: &ListenerPrefix,
    listener: &HttpListener,
) -> Result<(), PrefixError> {
    let ip = prefix.bind_addr();
    let port = prefix.port();
    let mut registry = registry().lock();
    let ports = registry.entry(ip).or_default();
    let binding = match ports.get(&port) {
        Some(binding) => {
            if binding.secure != prefix.secure() {
                return Err(PrefixError::PrefixInUse(prefix.as_str().to_string()));
            }
            binding.clone()
        }
        None => {
            let acceptor = if prefix.secure() {
                Some(listener.tls_acceptor(port).map_err(|e| {
                    tracing::debug!(%e, "no tls identity for secure prefix");
                    PrefixError::InvalidPrefix(
                        prefix.as_str().to_string(),
                        "no server certificate for https prefix",
                    )
                })?)
            } else {
                None
            };
            let addr = SocketAddr::new(ip, port);
            let socket = bind_socket(addr).map_err(|e| {
                tracing::debug!(%e, %addr, "bind failed");
                PrefixError::InvalidPrefix(prefix.as_str().to_string(), "address not bindable")
            })?;
            let binding = Arc::new(EndpointBinding {
                addr,
                secure: prefix.secure(),
                acceptor,
                prefixes: RwLock::new(Arc::new(PrefixLists::default())),
                shutdown: tokio::sync::Notify::new(),
            });
            tokio::spawn(accept_loop(binding.clone(), socket));
            tracing::debug!(%addr, secure = prefix.secure(), "endpoint binding created");
            ports.insert(port, binding.clone());
            binding
        }
    };
    let added = binding.add(prefix, listener);
    if added.is_err() && binding.prefixes.read().is_empty() {
        ports.remove(&port);
        if ports.is_empty() {
            registry.remove(&ip);
        }
        // notify_one leaves a permit if the loop is mid-accept
        binding.shutdown.notify_one();
    }
    added
}

/// unregister a prefix; the binding is torn down with its last prefix
pub(crate) fn remove_prefix(prefix: &ListenerPrefix, listener: &HttpListener) {
    let ip = prefix.bind_addr();
    let port = prefix.port();
    let mut registry = registry().lock();
    let Some(ports) = registry.get_mut(&ip) else {
        return;
    };
    let Some(binding) = ports.get(&port) else {
        return;
    };
    if binding.remove(prefix, listener) {
        binding.shutdown.notify_one();
        ports.remove(&port);
        if ports.is_empty() {
            registry.remove(&ip);
        }
        tracing::debug!(addr = %SocketAddr::new(ip, port), "endpoint binding removed");
    }
}

fn bind_socket(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(1024)
}

/// one cooperative task per binding, re-armed after every accept
async fn accept_loop(binding: Arc<EndpointBinding>, socket: TcpListener) {
    loop {
        tokio::select! {
            _ = binding.shutdown.notified() => {
                tracing::debug!(addr = %binding.addr, "accept loop shutting down");
                return;
            }
            accepted = socket.accept() => match accepted {
                Ok((stream, peer)) => {
                    let binding = binding.clone();
                    tokio::spawn(async move {
                        handle_accepted(binding, stream, peer).await;
                    });
                }
                Err(e) => {
                    // transient errors (EMFILE and friends) re-arm
                    tracing::warn!(%e, addr = %binding.addr, "accept failed");
                }
            }
        }
    }
}

async fn handle_accepted(binding: Arc<EndpointBinding>, stream: TcpStream, peer: SocketAddr) {
    let transport = match &binding.acceptor {
        Some(acceptor) => match acceptor.accept(stream).await {
            Ok(tls) => MaybeTlsStream::ServerTls(tls),
            Err(e) => {
                // a failed handshake closes the transport without
                // registering a connection
                tracing::debug!(%e, %peer, "tls handshake failed");
                return;
            }
        },
        None => MaybeTlsStream::Plain(stream),
    };
    connection::handle(binding, transport, peer).await;
}
