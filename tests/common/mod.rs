#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use hastream::client::{
    AdminClient, ClientFactory, CreatedTarget, FetchBatch, Message, ServiceResult, StreamClient,
};
use hastream::{CursorPosition, Error, ServiceError, TargetRef};

pub const PRIMARY_ENDPOINT: &str = "https://primary.example";
pub const SECONDARY_ENDPOINT: &str = "https://secondary.example";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub endpoint: String,
    pub op: &'static str,
    pub stream_id: String,
    pub detail: String,
}

#[derive(Default)]
struct Inner {
    calls: Vec<Call>,
    failures: HashMap<(String, &'static str), VecDeque<ServiceError>>,
    down: HashSet<String>,
    streams: HashMap<(String, String), Vec<Vec<u8>>>,
    connects: Vec<String>,
    created: Vec<TargetRef>,
    listable: Vec<(String, TargetRef)>,
    listing_lags: bool,
    omit_identifiers: bool,
    admin_failure: Option<ServiceError>,
    next_id: u32,
}

/// In-memory stand-in for the log service with scripted faults. Clones share
/// state, so a test can keep a handle while the controller owns the factory.
#[derive(Clone, Default)]
pub struct FakeService {
    inner: Arc<Mutex<Inner>>,
}

impl FakeService {
    pub fn new() -> Self {
        let svc = Self::default();
        svc.add_stream(&primary());
        svc
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("fake service mutex")
    }

    pub fn add_stream(&self, target: &TargetRef) {
        self.lock()
            .streams
            .entry((target.endpoint.clone(), target.id.clone()))
            .or_default();
    }

    pub fn push_message(&self, target: &TargetRef, value: &str) {
        self.lock()
            .streams
            .entry((target.endpoint.clone(), target.id.clone()))
            .or_default()
            .push(value.as_bytes().to_vec());
    }

    pub fn messages(&self, target: &TargetRef) -> Vec<String> {
        self.lock()
            .streams
            .get(&(target.endpoint.clone(), target.id.clone()))
            .map(|values| {
                values
                    .iter()
                    .map(|v| String::from_utf8_lossy(v).into_owned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Fail the next calls of `op` on `endpoint` with `errors`, in order.
    pub fn fail_next(&self, endpoint: &str, op: &'static str, errors: Vec<ServiceError>) {
        self.lock()
            .failures
            .entry((endpoint.to_string(), op))
            .or_default()
            .extend(errors);
    }

    pub fn set_down(&self, endpoint: &str, down: bool) {
        let mut inner = self.lock();
        if down {
            inner.down.insert(endpoint.to_string());
        } else {
            inner.down.remove(endpoint);
        }
    }

    pub fn omit_identifiers(&self, omit: bool) {
        self.lock().omit_identifiers = omit;
    }

    /// Keep freshly created streams out of listings, as an eventually
    /// consistent control plane may.
    pub fn listing_lags(&self, lags: bool) {
        self.lock().listing_lags = lags;
    }

    pub fn fail_admin(&self, err: Option<ServiceError>) {
        self.lock().admin_failure = err;
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub fn calls_of(&self, op: &str) -> Vec<Call> {
        self.calls().into_iter().filter(|c| c.op == op).collect()
    }

    pub fn connects(&self) -> Vec<String> {
        self.lock().connects.clone()
    }

    pub fn created(&self) -> Vec<TargetRef> {
        self.lock().created.clone()
    }

    pub fn factory(&self) -> FakeFactory {
        FakeFactory { svc: self.clone() }
    }

    pub fn admin(&self) -> FakeAdmin {
        FakeAdmin { svc: self.clone() }
    }

    fn record(
        &self,
        endpoint: &str,
        op: &'static str,
        stream_id: &str,
        detail: String,
    ) -> ServiceResult<()> {
        let mut inner = self.lock();
        inner.calls.push(Call {
            endpoint: endpoint.to_string(),
            op,
            stream_id: stream_id.to_string(),
            detail,
        });
        if inner.down.contains(endpoint) {
            return Err(ServiceError::new(503, "service unavailable"));
        }
        if let Some(queue) = inner.failures.get_mut(&(endpoint.to_string(), op)) {
            if let Some(err) = queue.pop_front() {
                return Err(err);
            }
        }
        Ok(())
    }
}

pub fn primary() -> TargetRef {
    TargetRef::new("primary-stream", PRIMARY_ENDPOINT)
}

pub fn unavailable() -> ServiceError {
    ServiceError::new(503, "service unavailable")
}

pub fn throttled() -> ServiceError {
    ServiceError::new(429, "too many requests")
}

pub struct FakeFactory {
    svc: FakeService,
}

impl ClientFactory for FakeFactory {
    type Client = FakeClient;

    fn connect(&self, endpoint: &str) -> hastream::Result<FakeClient> {
        if endpoint.is_empty() {
            return Err(Error::Connect {
                endpoint: endpoint.to_string(),
                reason: "empty".to_string(),
            });
        }
        self.svc.lock().connects.push(endpoint.to_string());
        Ok(FakeClient {
            svc: self.svc.clone(),
            endpoint: endpoint.to_string(),
        })
    }
}

pub struct FakeClient {
    svc: FakeService,
    endpoint: String,
}

impl StreamClient for FakeClient {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn create_cursor(
        &self,
        stream_id: &str,
        partition: &str,
        position: CursorPosition,
    ) -> ServiceResult<String> {
        self.svc.record(
            &self.endpoint,
            "create_cursor",
            stream_id,
            format!("{partition}:{position:?}"),
        )?;
        let inner = self.svc.lock();
        let values = inner
            .streams
            .get(&(self.endpoint.clone(), stream_id.to_string()))
            .ok_or_else(|| ServiceError::new(404, "no such stream"))?;
        let pos = match position {
            CursorPosition::TrimHorizon => 0,
            CursorPosition::Latest => values.len(),
        };
        Ok(format!("{stream_id}@{pos}"))
    }

    fn fetch(&self, stream_id: &str, cursor: &str, limit: usize) -> ServiceResult<FetchBatch> {
        self.svc
            .record(&self.endpoint, "fetch", stream_id, cursor.to_string())?;
        let (cursor_stream, pos) = cursor
            .split_once('@')
            .ok_or_else(|| ServiceError::new(400, "bad cursor"))?;
        if cursor_stream != stream_id {
            return Err(ServiceError::new(400, "cursor for another stream"));
        }
        let start: usize = pos
            .parse()
            .map_err(|_| ServiceError::new(400, "bad cursor"))?;
        let inner = self.svc.lock();
        let values = inner
            .streams
            .get(&(self.endpoint.clone(), stream_id.to_string()))
            .ok_or_else(|| ServiceError::new(404, "no such stream"))?;
        let end = (start + limit).min(values.len());
        let messages = values[start.min(end)..end]
            .iter()
            .enumerate()
            .map(|(i, value)| Message {
                offset: (start + i) as u64,
                key: b"k".to_vec(),
                value: value.clone(),
            })
            .collect();
        Ok(FetchBatch {
            messages,
            next_cursor: format!("{stream_id}@{end}"),
        })
    }

    fn put(&self, stream_id: &str, _key: &[u8], value: &[u8]) -> ServiceResult<()> {
        self.svc.record(
            &self.endpoint,
            "put",
            stream_id,
            String::from_utf8_lossy(value).into_owned(),
        )?;
        let mut inner = self.svc.lock();
        let values = inner
            .streams
            .get_mut(&(self.endpoint.clone(), stream_id.to_string()))
            .ok_or_else(|| ServiceError::new(404, "no such stream"))?;
        values.push(value.to_vec());
        Ok(())
    }
}

pub struct FakeAdmin {
    svc: FakeService,
}

impl AdminClient for FakeAdmin {
    fn create_target(&self, name: &str) -> ServiceResult<CreatedTarget> {
        self.svc
            .record(SECONDARY_ENDPOINT, "create_target", name, String::new())?;
        let mut inner = self.svc.lock();
        if let Some(err) = inner.admin_failure.clone() {
            return Err(err);
        }
        inner.next_id += 1;
        let target = TargetRef::new(format!("secondary-{}", inner.next_id), SECONDARY_ENDPOINT);
        inner
            .streams
            .insert((target.endpoint.clone(), target.id.clone()), Vec::new());
        inner.created.push(target.clone());
        inner.listable.push((name.to_string(), target.clone()));
        if inner.omit_identifiers {
            return Ok(CreatedTarget::default());
        }
        Ok(CreatedTarget {
            id: Some(target.id),
            endpoint: Some(target.endpoint),
        })
    }

    fn list_targets(&self, name: &str) -> ServiceResult<Vec<TargetRef>> {
        self.svc
            .record(SECONDARY_ENDPOINT, "list_targets", name, String::new())?;
        let inner = self.svc.lock();
        if inner.listing_lags {
            return Ok(Vec::new());
        }
        Ok(inner
            .listable
            .iter()
            .filter(|(listed_name, _)| listed_name == name)
            .map(|(_, target)| target.clone())
            .collect())
    }
}
