//! Libvirt-backed implementation of the hypervisor capability.
//!
//! The `virt` binding types stay on one dedicated thread that owns the
//! connection for its whole life; async callers talk to it over channels.
//! Enabled with the `libvirt` feature so the workspace builds without the
//! libvirt system libraries.

use crate::{GuestListing, Hypervisor, HypervisorConnection, SharedConnection};
use async_trait::async_trait;
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use virt::connect::Connect;
use virt::domain::Domain;
use virt::sys;
use virtray_core::{BackendError, GuestId};

pub struct LibvirtHypervisor {
    uri: String,
}

impl LibvirtHypervisor {
    pub fn new(uri: impl Into<String>) -> Self {
        Self { uri: uri.into() }
    }
}

#[async_trait]
impl Hypervisor for LibvirtHypervisor {
    async fn open(&self) -> Result<SharedConnection, BackendError> {
        let uri = self.uri.clone();
        let (ready_tx, ready_rx) = oneshot::channel();
        let (request_tx, request_rx) = std_mpsc::channel::<Request>();

        std::thread::Builder::new()
            .name("virtray-libvirt".to_string())
            .spawn(move || worker(uri, ready_tx, request_rx))
            .map_err(|err| BackendError::Open(format!("worker spawn failed: {err}")))?;

        match ready_rx.await {
            Ok(Ok(())) => Ok(Arc::new(LibvirtConnection {
                requests: Mutex::new(Some(request_tx)),
            })),
            Ok(Err(reason)) => Err(BackendError::Open(reason)),
            Err(_) => Err(BackendError::Open("worker exited before ready".to_string())),
        }
    }
}

enum Request {
    List(oneshot::Sender<Result<Vec<GuestListing>, BackendError>>),
    Start(GuestId, oneshot::Sender<Result<(), BackendError>>),
    Stop(GuestId, oneshot::Sender<Result<(), BackendError>>),
    Close,
}

struct LibvirtConnection {
    requests: Mutex<Option<std_mpsc::Sender<Request>>>,
}

impl LibvirtConnection {
    fn sender(&self) -> Result<std_mpsc::Sender<Request>, BackendError> {
        self.requests
            .lock()
            .expect("libvirt request channel poisoned")
            .clone()
            .ok_or(BackendError::Closed)
    }

    async fn roundtrip<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T, BackendError>>) -> Request,
    ) -> Result<T, BackendError> {
        let sender = self.sender()?;
        let (reply_tx, reply_rx) = oneshot::channel();
        sender
            .send(build(reply_tx))
            .map_err(|_| BackendError::Closed)?;
        reply_rx.await.map_err(|_| BackendError::Closed)?
    }
}

#[async_trait]
impl HypervisorConnection for LibvirtConnection {
    async fn list_guests(&self) -> Result<Vec<GuestListing>, BackendError> {
        self.roundtrip(Request::List).await
    }

    async fn start(&self, id: &GuestId) -> Result<(), BackendError> {
        let id = id.clone();
        self.roundtrip(move |reply| Request::Start(id, reply)).await
    }

    async fn stop(&self, id: &GuestId) -> Result<(), BackendError> {
        let id = id.clone();
        self.roundtrip(move |reply| Request::Stop(id, reply)).await
    }

    async fn close(&self) {
        let sender = self
            .requests
            .lock()
            .expect("libvirt request channel poisoned")
            .take();
        if let Some(sender) = sender {
            let _ = sender.send(Request::Close);
        }
    }
}

fn worker(
    uri: String,
    ready_tx: oneshot::Sender<Result<(), String>>,
    requests: std_mpsc::Receiver<Request>,
) {
    let mut conn = match Connect::open(&uri) {
        Ok(conn) => {
            info!(event = "libvirt_connected", uri = %uri);
            let _ = ready_tx.send(Ok(()));
            conn
        }
        Err(err) => {
            let _ = ready_tx.send(Err(err.to_string()));
            return;
        }
    };

    while let Ok(request) = requests.recv() {
        match request {
            Request::List(reply) => {
                let _ = reply.send(list_domains(&conn));
            }
            Request::Start(id, reply) => {
                let _ = reply.send(domain_action(&conn, &id, |domain| {
                    domain.create().map(|_| ())
                }));
            }
            Request::Stop(id, reply) => {
                let _ = reply.send(domain_action(&conn, &id, |domain| domain.destroy()));
            }
            Request::Close => break,
        }
    }

    if let Err(err) = conn.close() {
        warn!(event = "libvirt_close_failed", error = %err);
    } else {
        debug!(event = "libvirt_closed", uri = %uri);
    }
}

fn list_domains(conn: &Connect) -> Result<Vec<GuestListing>, BackendError> {
    let domains = conn
        .list_all_domains(0)
        .map_err(|err| BackendError::List(err.to_string()))?;
    let mut listings = Vec::with_capacity(domains.len());
    for domain in domains {
        let name = match domain.get_name() {
            Ok(name) => name,
            Err(err) => {
                warn!(event = "domain_name_unreadable", error = %err);
                continue;
            }
        };
        let id = domain
            .get_uuid_string()
            .map(GuestId::from)
            .unwrap_or_else(|_| GuestId::from(name.clone()));
        // An unreadable state degrades that one guest, never the whole list.
        let raw_status = match domain.get_state() {
            Ok((state, _reason)) => state_label(state).to_string(),
            Err(err) => {
                warn!(event = "domain_state_unreadable", guest = %id, error = %err);
                "unreadable".to_string()
            }
        };
        listings.push(GuestListing {
            id,
            name,
            raw_status,
        });
    }
    Ok(listings)
}

fn domain_action(
    conn: &Connect,
    id: &GuestId,
    action: impl FnOnce(&Domain) -> Result<(), virt::error::Error>,
) -> Result<(), BackendError> {
    let domain = lookup(conn, id)?;
    action(&domain).map_err(|err| BackendError::Action {
        guest: id.clone(),
        reason: err.to_string(),
    })
}

fn lookup(conn: &Connect, id: &GuestId) -> Result<Domain, BackendError> {
    Domain::lookup_by_uuid_string(conn, id.as_str())
        .or_else(|_| Domain::lookup_by_name(conn, id.as_str()))
        .map_err(|_| BackendError::UnknownGuest(id.clone()))
}

fn state_label(state: sys::virDomainState) -> &'static str {
    match state {
        sys::VIR_DOMAIN_RUNNING => "running",
        sys::VIR_DOMAIN_SHUTOFF => "shut off",
        sys::VIR_DOMAIN_SHUTDOWN => "shutdown",
        sys::VIR_DOMAIN_PMSUSPENDED => "pmsuspended",
        sys::VIR_DOMAIN_PAUSED => "paused",
        sys::VIR_DOMAIN_BLOCKED => "blocked",
        sys::VIR_DOMAIN_CRASHED => "crashed",
        _ => "nostate",
    }
}
