//! Requests parked while a realm's challenge cycle runs.
//!
//! One FIFO per realm. Items are replayed in the order they were parked once
//! the cycle succeeds, or rejected all at once when it fails.

use std::collections::{HashMap, VecDeque};
use std::future::Future;

use tokio::sync::oneshot;

use crate::challenges::core::{ResourceRequest, ResourceResponse};
use crate::client::{WlClientError, WlClientResult};

pub type PendingResponder = oneshot::Sender<WlClientResult<ResourceResponse>>;

/// A parked request plus the channel its caller is waiting on.
#[derive(Debug)]
pub struct PendingRequest {
    id: u64,
    request: ResourceRequest,
    responder: PendingResponder,
}

impl PendingRequest {
    pub fn new(id: u64, request: ResourceRequest, responder: PendingResponder) -> Self {
        Self {
            id,
            request,
            responder,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn request(&self) -> &ResourceRequest {
        &self.request
    }

    /// The caller stopped waiting (cancelled or timed out).
    pub fn is_cancelled(&self) -> bool {
        self.responder.is_closed()
    }

    /// Deliver the final result. Returns false when nobody was listening.
    pub fn complete(self, result: WlClientResult<ResourceResponse>) -> bool {
        self.responder.send(result).is_ok()
    }
}

/// Counts reported after a drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub replayed: usize,
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Debug, Default)]
pub struct PendingRequestQueue {
    realms: HashMap<String, VecDeque<PendingRequest>>,
}

impl PendingRequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park `pending` behind everything already queued for `realm`. Returns
    /// the queue length afterwards.
    pub fn enqueue(&mut self, realm: &str, pending: PendingRequest) -> usize {
        let queue = self.realms.entry(realm.to_string()).or_default();
        queue.push_back(pending);
        queue.len()
    }

    /// Remove one parked request, e.g. after its caller timed out.
    pub fn remove(&mut self, realm: &str, id: u64) -> Option<PendingRequest> {
        let queue = self.realms.get_mut(realm)?;
        let index = queue.iter().position(|pending| pending.id == id)?;
        let removed = queue.remove(index);
        if queue.is_empty() {
            self.realms.remove(realm);
        }
        removed
    }

    /// Take every request parked for `realm`, oldest first.
    pub fn take(&mut self, realm: &str) -> Vec<PendingRequest> {
        self.realms
            .remove(realm)
            .map(Vec::from)
            .unwrap_or_default()
    }

    /// Take the requests parked for `realm` that match `select`, oldest
    /// first. The others keep their order.
    pub fn take_where<P>(&mut self, realm: &str, mut select: P) -> Vec<PendingRequest>
    where
        P: FnMut(&ResourceRequest) -> bool,
    {
        let Some(queue) = self.realms.remove(realm) else {
            return Vec::new();
        };
        let (taken, kept): (Vec<_>, Vec<_>) =
            queue.into_iter().partition(|pending| select(&pending.request));
        let kept: VecDeque<_> = kept.into();
        if !kept.is_empty() {
            self.realms.insert(realm.to_string(), kept);
        }
        taken
    }

    /// Reject everything parked for `realm` with `error`.
    pub fn drain_failure(&mut self, realm: &str, error: &WlClientError) -> usize {
        let pending = self.take(realm);
        let count = pending.len();
        for item in pending {
            item.complete(Err(error.clone()));
        }
        count
    }

    pub fn len(&self, realm: &str) -> usize {
        self.realms.get(realm).map(VecDeque::len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.realms.values().all(VecDeque::is_empty)
    }
}

/// Replay `pending` one after another through `replay`.
///
/// Items whose caller is gone are skipped. When a replay fails because the
/// transport is unreachable, the drain stops and every remaining item gets the
/// same error.
pub async fn drain_success<F, Fut>(pending: Vec<PendingRequest>, mut replay: F) -> DrainReport
where
    F: FnMut(ResourceRequest) -> Fut,
    Fut: Future<Output = WlClientResult<ResourceResponse>>,
{
    let mut report = DrainReport::default();
    let mut remaining = pending.into_iter();

    while let Some(item) = remaining.next() {
        if item.is_cancelled() {
            report.skipped += 1;
            continue;
        }

        let result = replay(item.request.clone()).await;
        let unreachable = match &result {
            Err(WlClientError::Request(err)) if err.is_unreachable() => Some(err.clone()),
            _ => None,
        };

        if result.is_ok() {
            report.replayed += 1;
        } else {
            report.failed += 1;
        }
        item.complete(result);

        if let Some(err) = unreachable {
            for rest in remaining.by_ref() {
                report.failed += 1;
                rest.complete(Err(WlClientError::Request(err.clone())));
            }
            break;
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::challenges::core::{RawResponse, TransportError};
    use bytes::Bytes;
    use http::HeaderMap;
    use std::sync::{Arc, Mutex};
    use url::Url;

    fn ok_response(path: &str) -> ResourceResponse {
        ResourceResponse::from_raw(RawResponse {
            status: 200,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            url: Url::parse("https://mfp.example.com/").unwrap().join(path).unwrap(),
        })
    }

    fn park(
        queue: &mut PendingRequestQueue,
        realm: &str,
        id: u64,
        path: &str,
    ) -> oneshot::Receiver<WlClientResult<ResourceResponse>> {
        let (tx, rx) = oneshot::channel();
        let request = ResourceRequest::get(path).unwrap();
        queue.enqueue(realm, PendingRequest::new(id, request, tx));
        rx
    }

    #[tokio::test]
    async fn replays_in_parking_order() {
        let mut queue = PendingRequestQueue::new();
        let first = park(&mut queue, "R", 1, "/a");
        let second = park(&mut queue, "R", 2, "/b");
        let third = park(&mut queue, "R", 3, "/c");

        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = seen.clone();
        let report = drain_success(queue.take("R"), move |request| {
            recorder.lock().unwrap().push(request.url().to_string());
            let path = request.url().to_string();
            async move { Ok(ok_response(&path)) }
        })
        .await;

        assert_eq!(report.replayed, 3);
        assert_eq!(*seen.lock().unwrap(), vec!["/a", "/b", "/c"]);
        assert!(first.await.unwrap().is_ok());
        assert!(second.await.unwrap().is_ok());
        assert!(third.await.unwrap().is_ok());
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn stops_drain_when_transport_is_unreachable() {
        let mut queue = PendingRequestQueue::new();
        let first = park(&mut queue, "R", 1, "/a");
        let second = park(&mut queue, "R", 2, "/b");
        let calls = Arc::new(Mutex::new(0));
        let counter = calls.clone();

        let report = drain_success(queue.take("R"), move |_request| {
            *counter.lock().unwrap() += 1;
            async { Err(WlClientError::Request(TransportError::Unreachable)) }
        })
        .await;

        assert_eq!(*calls.lock().unwrap(), 1);
        assert_eq!(report.failed, 2);
        assert!(matches!(
            second.await.unwrap(),
            Err(WlClientError::Request(TransportError::Unreachable))
        ));
        assert!(first.await.unwrap().is_err());
    }

    #[test]
    fn take_where_keeps_the_rest_in_order() {
        let mut queue = PendingRequestQueue::new();
        let _a = park(&mut queue, "R", 1, "/a");
        let _token = park(&mut queue, "R", 2, "/token");
        let _b = park(&mut queue, "R", 3, "/b");

        let taken = queue.take_where("R", |request| request.url() == "/token");
        assert_eq!(taken.iter().map(PendingRequest::id).collect::<Vec<_>>(), vec![2]);
        let rest = queue.take("R");
        assert_eq!(rest.iter().map(PendingRequest::id).collect::<Vec<_>>(), vec![1, 3]);

        assert!(queue.take_where("R", |_| true).is_empty());
    }

    #[tokio::test]
    async fn response_errors_do_not_stop_the_drain() {
        let mut queue = PendingRequestQueue::new();
        let first = park(&mut queue, "R", 1, "/a");
        let second = park(&mut queue, "R", 2, "/b");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = seen.clone();

        let report = drain_success(queue.take("R"), move |request| {
            let path = request.url().to_string();
            recorder.lock().unwrap().push(path.clone());
            async move {
                if path == "/a" {
                    Err(WlClientError::Request(TransportError::Transport(
                        "error decoding response body".into(),
                    )))
                } else {
                    Ok(ok_response(&path))
                }
            }
        })
        .await;

        assert_eq!(*seen.lock().unwrap(), vec!["/a", "/b"]);
        assert_eq!(report, DrainReport { replayed: 1, skipped: 0, failed: 1 });
        assert!(matches!(
            first.await.unwrap(),
            Err(WlClientError::Request(TransportError::Transport(_)))
        ));
        assert!(second.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn skips_cancelled_and_removed_requests() {
        let mut queue = PendingRequestQueue::new();
        let cancelled = park(&mut queue, "R", 1, "/a");
        let _removed = park(&mut queue, "R", 2, "/b");
        let kept = park(&mut queue, "R", 3, "/c");
        drop(cancelled);
        assert!(queue.remove("R", 2).is_some());
        assert_eq!(queue.len("R"), 2);

        let report = drain_success(queue.take("R"), |request| {
            let path = request.url().to_string();
            async move { Ok(ok_response(&path)) }
        })
        .await;

        assert_eq!(report, DrainReport { replayed: 1, skipped: 1, failed: 0 });
        assert!(kept.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn failure_rejects_everything() {
        let mut queue = PendingRequestQueue::new();
        let first = park(&mut queue, "R", 1, "/a");
        let other = park(&mut queue, "Other", 2, "/b");
        let error = WlClientError::AuthenticationFailed("bad creds".into());

        assert_eq!(queue.drain_failure("R", &error), 1);
        assert!(matches!(
            first.await.unwrap(),
            Err(WlClientError::AuthenticationFailed(reason)) if reason == "bad creds"
        ));
        assert_eq!(queue.len("Other"), 1);
        drop(other);
    }
}
