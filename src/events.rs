//! Event subscription engine (§4.I). Subscribers and notify jobs live in
//! two parallel arenas with stable `usize` identities so the
//! subscriber↔notify cross-reference can be a plain index instead of a
//! reference-counted cycle, per the design notes.
//!
//! The state machine (`Created → Connecting → Sending →
//! WaitingForResponse → Finished/Error`) is preserved as the source of
//! truth for each job's status, but is driven by a spawned task using
//! `tokio::net::TcpStream::connect` + a timeout rather than a raw
//! non-blocking fd the main loop `select`s on directly: tokio does not
//! expose a non-blocking connect/select primitive to build on, so the
//! task reports its state transitions back to the main loop over a
//! channel instead. This is recorded as a design decision, not a
//! semantic change: the enum, the skip-zero sequence rule, and the
//! nulled back-pointer behaviour on teardown are all unchanged.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::util::mime::all_protocol_infos;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Service {
    ContentDirectory,
    ConnectionManager,
    MediaReceiverRegistrar,
}

impl Service {
    pub fn from_path(path: &str) -> Option<Self> {
        match path {
            "/evt/ContentDir" => Some(Service::ContentDirectory),
            "/evt/ConnectionMgr" => Some(Service::ConnectionManager),
            "/evt/X_MS_MediaReceiverRegistrar" => Some(Service::MediaReceiverRegistrar),
            _ => None,
        }
    }

}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NotifyState {
    Created = 0,
    Connecting = 1,
    Sending = 2,
    WaitingForResponse = 3,
    Finished = 4,
    Error = 5,
}

impl From<u8> for NotifyState {
    fn from(v: u8) -> Self {
        match v {
            0 => NotifyState::Created,
            1 => NotifyState::Connecting,
            2 => NotifyState::Sending,
            3 => NotifyState::WaitingForResponse,
            4 => NotifyState::Finished,
            _ => NotifyState::Error,
        }
    }
}

pub struct Subscriber {
    pub sid: String,
    pub service: Service,
    pub callback_url: String,
    /// `None` means infinite (timeout == 0 in the original C model).
    pub expiry: Option<Instant>,
    pub seq: u32,
    pub notify: Option<usize>,
}

struct NotifyJob {
    subscriber: Option<usize>,
    state_cell: Arc<AtomicU8>,
}

pub enum NotifyOutcome {
    Finished(usize),
    Error(usize),
}

pub struct EventEngine {
    subscribers: Vec<Option<Subscriber>>,
    notifies: Vec<Option<NotifyJob>>,
    device_uuid: Uuid,
    results_tx: mpsc::UnboundedSender<NotifyOutcome>,
}

fn parse_callback(url: &str) -> Option<(String, u16, String)> {
    let trimmed = url.trim().trim_start_matches('<').trim_end_matches('>');
    let rest = trimmed.strip_prefix("http://")?;
    let (authority, path) = rest.split_once('/').map(|(a, p)| (a, format!("/{p}"))).unwrap_or((rest, "/".to_string()));
    let (host, port) = match authority.split_once(':') {
        Some((h, p)) => (h.to_string(), p.parse().ok()?),
        None => (authority.to_string(), 80),
    };
    Some((host, port, path))
}

fn random_sid(device_uuid: &Uuid) -> String {
    let base = device_uuid.to_string();
    let mut rng = rand::rng();
    let suffix: String = (0..4).map(|_| std::char::from_digit(rng.random_range(0..16), 16).unwrap()).collect();
    format!("uuid:{}{}", &base[..base.len() - 4], suffix)
}

fn notify_body(service: Service) -> String {
    match service {
        Service::ContentDirectory => {
            "<e:propertyset xmlns:e=\"urn:schemas-upnp-org:event-1-0\">\
             <e:property><SystemUpdateID>0</SystemUpdateID></e:property>\
             <e:property><TransferIDs></TransferIDs></e:property>\
             </e:propertyset>"
                .to_string()
        }
        Service::ConnectionManager => {
            let source = all_protocol_infos().join(",");
            format!(
                "<e:propertyset xmlns:e=\"urn:schemas-upnp-org:event-1-0\">\
                 <e:property><SourceProtocolInfo>{source}</SourceProtocolInfo></e:property>\
                 <e:property><SinkProtocolInfo></SinkProtocolInfo></e:property>\
                 <e:property><CurrentConnectionIDs>0</CurrentConnectionIDs></e:property>\
                 </e:propertyset>"
            )
        }
        Service::MediaReceiverRegistrar => {
            "<e:propertyset xmlns:e=\"urn:schemas-upnp-org:event-1-0\">\
             <e:property><AuthorizationGrantedUpdateID>0</AuthorizationGrantedUpdateID></e:property>\
             </e:propertyset>"
                .to_string()
        }
    }
}

impl EventEngine {
    pub fn new(device_uuid: Uuid) -> (Self, mpsc::UnboundedReceiver<NotifyOutcome>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self { subscribers: Vec::new(), notifies: Vec::new(), device_uuid, results_tx: tx },
            rx,
        )
    }

    fn insert_subscriber(&mut self, sub: Subscriber) -> usize {
        for (i, slot) in self.subscribers.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(sub);
                return i;
            }
        }
        self.subscribers.push(Some(sub));
        self.subscribers.len() - 1
    }

    fn insert_notify(&mut self, job: NotifyJob) -> usize {
        for (i, slot) in self.notifies.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(job);
                return i;
            }
        }
        self.notifies.push(Some(job));
        self.notifies.len() - 1
    }

    /// `SUBSCRIBE` with no `SID`: creates a subscriber, issues a SID, and
    /// kicks off the initial NOTIFY. Returns the issued SID.
    pub fn subscribe(&mut self, service: Service, callback_url: String, timeout_secs: u64) -> String {
        let sid = random_sid(&self.device_uuid);
        let expiry = if timeout_secs == 0 { None } else { Some(Instant::now() + Duration::from_secs(timeout_secs)) };
        let sub_idx = self.insert_subscriber(Subscriber {
            sid: sid.clone(),
            service,
            callback_url,
            expiry,
            seq: 0,
            notify: None,
        });
        self.enqueue_notify(sub_idx);
        sid
    }

    /// Renewal: `SID` present, no `Callback`/`NT`. Returns `false` for an
    /// unknown SID (caller responds 412).
    pub fn renew(&mut self, sid: &str, timeout_secs: u64) -> bool {
        let forced = 300; // DLNA renewal timeout is forced to 300s
        let _ = timeout_secs;
        for slot in self.subscribers.iter_mut().flatten() {
            if slot.sid == sid {
                slot.expiry = Some(Instant::now() + Duration::from_secs(forced));
                return true;
            }
        }
        false
    }

    /// `UNSUBSCRIBE`: finds by SID, removes the subscriber, and nulls the
    /// back-pointer of any in-flight notify job that still references it
    /// so the job self-destructs on its next state step.
    pub fn unsubscribe(&mut self, sid: &str) -> bool {
        let Some(idx) = self.subscribers.iter().position(|s| s.as_ref().map(|s| s.sid.as_str()) == Some(sid)) else {
            return false;
        };
        self.subscribers[idx] = None;
        for job in self.notifies.iter_mut().flatten() {
            if job.subscriber == Some(idx) {
                job.subscriber = None;
            }
        }
        true
    }

    fn enqueue_notify(&mut self, sub_idx: usize) {
        let Some(sub) = self.subscribers[sub_idx].as_ref() else { return };
        let Some((host, port, path)) = parse_callback(&sub.callback_url) else {
            warn!("malformed callback URL, dropping notify");
            return;
        };
        let sid = sub.sid.clone();
        let seq = sub.seq;
        let body = notify_body(sub.service);

        let state_cell = Arc::new(AtomicU8::new(NotifyState::Created as u8));
        let job_idx = self.insert_notify(NotifyJob { subscriber: Some(sub_idx), state_cell: state_cell.clone() });
        self.subscribers[sub_idx].as_mut().unwrap().notify = Some(job_idx);

        let tx = self.results_tx.clone();
        tokio::spawn(async move {
            let outcome = run_notify_job(&host, port, &path, &sid, seq, &body, &state_cell).await;
            let _ = tx.send(match outcome {
                Ok(()) => NotifyOutcome::Finished(job_idx),
                Err(()) => NotifyOutcome::Error(job_idx),
            });
        });
    }

    /// Reaps a finished/errored job: clears the subscriber's `notify`
    /// pointer and, on success, bumps its sequence number (skipping 0 on
    /// wrap).
    pub fn reap(&mut self, job_idx: usize, ok: bool) {
        let Some(job) = self.notifies.get(job_idx).and_then(|j| j.as_ref()) else { return };
        if let Some(sub_idx) = job.subscriber {
            if let Some(sub) = self.subscribers.get_mut(sub_idx).and_then(|s| s.as_mut()) {
                sub.notify = None;
                if ok {
                    sub.seq = sub.seq.wrapping_add(1);
                    if sub.seq == 0 {
                        sub.seq = 1;
                    }
                }
            }
        }
        self.notifies[job_idx] = None;
    }

    /// Expiry sweep, run once per main-loop tick after processing notify
    /// I/O: removes subscribers whose timeout elapsed and who have no
    /// in-flight notify.
    pub fn sweep_expired(&mut self) {
        let now = Instant::now();
        for slot in self.subscribers.iter_mut() {
            let expired = matches!(slot, Some(s) if s.expiry.is_some_and(|e| e <= now) && s.notify.is_none());
            if expired {
                *slot = None;
            }
        }
    }

    /// Current state of a notify job, for introspection and tests.
    pub fn job_state(&self, job_idx: usize) -> Option<NotifyState> {
        self.notifies.get(job_idx)?.as_ref().map(|j| NotifyState::from(j.state_cell.load(Ordering::SeqCst)))
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.iter().filter(|s| s.is_some()).count()
    }

    /// Sends `ssdp:byebye`-adjacent teardown: drops all subscribers and
    /// in-flight jobs immediately (used on shutdown).
    pub fn teardown(&mut self) {
        self.subscribers.clear();
        self.notifies.clear();
    }
}

/// GENA's `NT` header on a NOTIFY is always the literal `upnp:event`,
/// unlike the service-type URN carried by `NT` on the initial SUBSCRIBE.
const NOTIFY_NT: &str = "upnp:event";

async fn run_notify_job(
    host: &str,
    port: u16,
    path: &str,
    sid: &str,
    seq: u32,
    body: &str,
    state_cell: &Arc<AtomicU8>,
) -> Result<(), ()> {
    state_cell.store(NotifyState::Connecting as u8, Ordering::SeqCst);
    let connect = tokio::time::timeout(Duration::from_secs(5), TcpStream::connect((host, port))).await;
    let mut stream = match connect {
        Ok(Ok(s)) => s,
        _ => {
            state_cell.store(NotifyState::Error as u8, Ordering::SeqCst);
            return Err(());
        }
    };

    state_cell.store(NotifyState::Sending as u8, Ordering::SeqCst);
    let request = format!(
        "NOTIFY {path} HTTP/1.1\r\n\
         HOST: {host}:{port}\r\n\
         CONTENT-TYPE: text/xml; charset=\"utf-8\"\r\n\
         CONTENT-LENGTH: {len}\r\n\
         NT: {nt}\r\n\
         NTS: upnp:propchange\r\n\
         SID: {sid}\r\n\
         SEQ: {seq}\r\n\
         CONNECTION: close\r\n\r\n{body}",
        len = body.len(),
        nt = NOTIFY_NT,
    );
    if stream.write_all(request.as_bytes()).await.is_err() {
        state_cell.store(NotifyState::Error as u8, Ordering::SeqCst);
        return Err(());
    }

    state_cell.store(NotifyState::WaitingForResponse as u8, Ordering::SeqCst);
    let mut discard = [0u8; 512];
    let _ = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut discard)).await;

    state_cell.store(NotifyState::Finished as u8, Ordering::SeqCst);
    Ok(())
}

pub struct SubscribeRequest<'a> {
    pub path: &'a str,
    pub callback: Option<&'a str>,
    pub nt: Option<&'a str>,
    pub sid: Option<&'a str>,
    pub timeout_secs: Option<u64>,
}

pub enum SubscribeResult {
    Subscribed { sid: String, timeout_secs: u64 },
    Renewed { timeout_secs: u64 },
    PreconditionFailed,
}

/// Implements the branching described in §4.I's `SUBSCRIBE` handler.
pub fn handle_subscribe(engine: &mut EventEngine, req: &SubscribeRequest) -> SubscribeResult {
    let Some(service) = Service::from_path(req.path) else {
        return SubscribeResult::PreconditionFailed;
    };

    match (req.sid, req.callback, req.nt) {
        (None, Some(callback), Some(nt)) if nt == "upnp:event" => {
            let timeout = req.timeout_secs.unwrap_or(300);
            let sid = engine.subscribe(service, callback.to_string(), timeout);
            SubscribeResult::Subscribed { sid, timeout_secs: timeout }
        }
        (Some(sid), None, None) => {
            if engine.renew(sid, req.timeout_secs.unwrap_or(300)) {
                SubscribeResult::Renewed { timeout_secs: 300 }
            } else {
                SubscribeResult::PreconditionFailed
            }
        }
        _ => SubscribeResult::PreconditionFailed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_from_path() {
        assert_eq!(Service::from_path("/evt/ContentDir"), Some(Service::ContentDirectory));
        assert_eq!(Service::from_path("/evt/Nope"), None);
    }

    #[tokio::test]
    async fn notify_nt_header_is_literal_upnp_event() {
        use tokio::io::AsyncReadExt;
        use tokio::net::TcpListener;

        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state_cell = Arc::new(AtomicU8::new(NotifyState::Created as u8));

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let n = stream.read(&mut buf).await.unwrap();
            String::from_utf8_lossy(&buf[..n]).into_owned()
        });

        run_notify_job("127.0.0.1", addr.port(), "/cb", "uuid:test", 1, "<e:propertyset/>", &state_cell)
            .await
            .unwrap();

        let received = server.await.unwrap();
        assert!(received.contains("NT: upnp:event\r\n"));
        assert!(!received.contains("ContentDirectory"));
    }

    #[test]
    fn sid_has_canonical_shape_and_device_prefix() {
        let uuid = Uuid::nil();
        let sid = random_sid(&uuid);
        assert!(sid.starts_with("uuid:"));
        assert_eq!(sid.len(), 5 + 36);
        assert!(sid.starts_with(&format!("uuid:{}", &uuid.to_string()[..32])));
    }

    #[test]
    fn unsubscribe_unknown_sid_fails() {
        let (mut engine, _rx) = EventEngine::new(Uuid::nil());
        assert!(!engine.unsubscribe("uuid:doesnotexist"));
    }

    #[test]
    fn handle_subscribe_requires_nt_event() {
        let (mut engine, _rx) = EventEngine::new(Uuid::nil());
        let req = SubscribeRequest {
            path: "/evt/ContentDir",
            callback: Some("<http://1.2.3.4:9999/cb>"),
            nt: Some("upnp:somethingelse"),
            sid: None,
            timeout_secs: None,
        };
        assert!(matches!(handle_subscribe(&mut engine, &req), SubscribeResult::PreconditionFailed));
    }

    #[test]
    fn handle_subscribe_unknown_path_is_precondition_failed() {
        let (mut engine, _rx) = EventEngine::new(Uuid::nil());
        let req = SubscribeRequest {
            path: "/evt/Bogus",
            callback: Some("<http://1.2.3.4:9999/cb>"),
            nt: Some("upnp:event"),
            sid: None,
            timeout_secs: None,
        };
        assert!(matches!(handle_subscribe(&mut engine, &req), SubscribeResult::PreconditionFailed));
    }

    #[test]
    fn parse_callback_splits_host_port_path() {
        let (host, port, path) = parse_callback("<http://1.2.3.4:9999/cb>").unwrap();
        assert_eq!(host, "1.2.3.4");
        assert_eq!(port, 9999);
        assert_eq!(path, "/cb");
    }

    #[test]
    fn sequence_skips_zero_on_wrap() {
        let (mut engine, _rx) = EventEngine::new(Uuid::nil());
        let sub_idx = engine.insert_subscriber(Subscriber {
            sid: "uuid:test".into(),
            service: Service::ContentDirectory,
            callback_url: "http://x/y".into(),
            expiry: None,
            seq: u32::MAX,
            notify: None,
        });
        let job_idx = engine.insert_notify(NotifyJob {
            subscriber: Some(sub_idx),
            state_cell: Arc::new(AtomicU8::new(0)),
        });
        engine.subscribers[sub_idx].as_mut().unwrap().notify = Some(job_idx);
        engine.reap(job_idx, true);
        assert_eq!(engine.subscribers[sub_idx].as_ref().unwrap().seq, 1);
    }
}
