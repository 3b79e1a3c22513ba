//! Primary/secondary failover for one producer or consumer.
//!
//! A controller starts `OnPrimary` and moves to `OnSecondary` at most once.
//! There is no way back: once the primary has been abandoned the process keeps
//! using the secondary until it restarts.
//!
//! Only producers provision a secondary. Consumers learn about it through the
//! registry and keep retrying the primary until a producer has registered one.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};

use crate::client::{AdminClient, ClientFactory, ServiceResult, StreamClient};
use crate::error::{Error, Result};
use crate::export::{EnvExporter, NoopExporter, SECONDARY_ENDPOINT_VAR};
use crate::registry::{FailoverRegistry, Provision, Slot};
use crate::retry::RetryPolicy;
use crate::sleeper::{Sleeper, ThreadSleeper};
use crate::target::TargetRef;

pub const DEFAULT_SECONDARY_NAME: &str = "OCI-SECONDARY-STREAM";
pub const DEFAULT_RESOLVE_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Producer,
    Consumer,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Producer => f.write_str("producer"),
            Role::Consumer => f.write_str("consumer"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailoverState {
    OnPrimary,
    OnSecondary,
}

/// The remote operations a controller runs on behalf of the loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    CreateCursor,
    Fetch,
    Put,
}

impl OpKind {
    pub fn name(self) -> &'static str {
        match self {
            OpKind::CreateCursor => "create_cursor",
            OpKind::Fetch => "fetch",
            OpKind::Put => "put",
        }
    }

    /// Fetches carry a cursor issued by the old target and cannot be replayed
    /// against a new one.
    fn target_scoped(self) -> bool {
        matches!(self, OpKind::Fetch)
    }
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub retry: RetryPolicy,
    /// Name given to a secondary stream this controller creates.
    pub secondary_name: String,
    /// Pause before listing streams when a creation response lacked
    /// identifiers.
    pub resolve_delay: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            secondary_name: DEFAULT_SECONDARY_NAME.to_string(),
            resolve_delay: DEFAULT_RESOLVE_DELAY,
        }
    }
}

struct Bound<C> {
    target: TargetRef,
    client: C,
}

pub struct FailoverController<F: ClientFactory> {
    role: Role,
    config: ControllerConfig,
    factory: F,
    registry: Arc<dyn FailoverRegistry>,
    admin: Option<Box<dyn AdminClient + Send>>,
    exporter: Box<dyn EnvExporter>,
    sleeper: Arc<dyn Sleeper>,
    primary: TargetRef,
    registered: Option<TargetRef>,
    state: FailoverState,
    active: Bound<F::Client>,
}

impl<F: ClientFactory> FailoverController<F> {
    /// Bind to `primary` and look up any secondary already in the registry.
    ///
    /// Fails only if the primary is malformed or no client can be built for
    /// it; an unreadable registry is treated as empty.
    pub fn new(
        role: Role,
        primary: TargetRef,
        factory: F,
        registry: Arc<dyn FailoverRegistry>,
        config: ControllerConfig,
    ) -> Result<Self> {
        if !primary.is_complete() {
            return Err(Error::Config(format!("invalid primary target {primary:?}")));
        }
        let client = connect_bound(&factory, &primary.endpoint)?;
        let registered = load_or_degrade(registry.as_ref());
        match &registered {
            Some(target) => info!("{role}: secondary {target} already registered"),
            None => info!("{role}: no secondary registered yet"),
        }
        Ok(Self {
            role,
            config,
            factory,
            registry,
            admin: None,
            exporter: Box::new(NoopExporter),
            sleeper: Arc::new(ThreadSleeper),
            active: Bound {
                target: primary.clone(),
                client,
            },
            primary,
            registered,
            state: FailoverState::OnPrimary,
        })
    }

    /// Capability used to create the secondary. Ignored for consumers.
    pub fn with_admin(mut self, admin: impl AdminClient + Send + 'static) -> Self {
        self.admin = Some(Box::new(admin));
        self
    }

    pub fn with_exporter(mut self, exporter: impl EnvExporter + 'static) -> Self {
        self.exporter = Box::new(exporter);
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> FailoverState {
        self.state
    }

    pub fn primary(&self) -> &TargetRef {
        &self.primary
    }

    pub fn active_target(&self) -> &TargetRef {
        &self.active.target
    }

    /// Secondary seen in the registry or provisioned by this controller.
    pub fn registered_secondary(&self) -> Option<&TargetRef> {
        self.registered.as_ref()
    }

    /// Run `op` against the active target, retrying per policy.
    ///
    /// When retries are exhausted on the primary the controller transitions.
    /// Replayable operations then run again against the secondary; a fetch
    /// returns [`Error::FailedOver`] so the caller can rebuild its cursor.
    /// Exhaustion on the secondary is returned as is.
    pub fn execute<T, Op>(&mut self, kind: OpKind, mut op: Op) -> Result<T>
    where
        Op: FnMut(&F::Client, &TargetRef) -> ServiceResult<T>,
    {
        let err = match self.run_with_retries(kind, &mut op) {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        if self.state == FailoverState::OnSecondary {
            return Err(err);
        }

        warn!(
            "{}: primary failed after retries -> starting failover ({})",
            self.role,
            err.chain()
        );
        let from = self.active.target.clone();
        let to = self.transition()?;
        if kind.target_scoped() {
            return Err(Error::FailedOver { from, to });
        }
        self.run_with_retries(kind, &mut op)
    }

    /// Switch to the secondary, resolving (and for producers, provisioning)
    /// it first. Calling this again once `OnSecondary` is a no-op that returns
    /// the same target.
    ///
    /// Callers must rebuild any target-scoped state afterwards.
    pub fn transition(&mut self) -> Result<TargetRef> {
        if self.state == FailoverState::OnSecondary {
            return Ok(self.active.target.clone());
        }
        let target = self.resolve_secondary()?;
        let client = connect_bound(&self.factory, &target.endpoint)?;
        info!(
            "FAILOVER: {} now using secondary stream id={} endpoint={}",
            self.role, target.id, target.endpoint
        );
        self.active = Bound {
            target: target.clone(),
            client,
        };
        self.state = FailoverState::OnSecondary;
        Ok(target)
    }

    fn run_with_retries<T, Op>(&self, kind: OpKind, op: &mut Op) -> Result<T>
    where
        Op: FnMut(&F::Client, &TargetRef) -> ServiceResult<T>,
    {
        let mut attempt = 1u32;
        loop {
            let err = match op(&self.active.client, &self.active.target) {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            let decision = self.config.retry.should_retry(attempt, &err);
            if !decision.retry {
                error!(
                    "{} attempt {attempt} against {} final/irrecoverable: {err}",
                    kind.name(),
                    self.active.target
                );
                return Err(Error::Exhausted {
                    op: kind.name(),
                    target: self.active.target.clone(),
                    attempts: attempt,
                    source: err,
                });
            }
            warn!(
                "{} attempt {attempt} against {} failed: {err}. Retrying in {} ms",
                kind.name(),
                self.active.target,
                decision.delay.as_millis()
            );
            self.sleeper.sleep(decision.delay);
            attempt += 1;
        }
    }

    fn resolve_secondary(&mut self) -> Result<TargetRef> {
        if let Some(target) = load_or_degrade(self.registry.as_ref()) {
            self.registered = Some(target.clone());
            return Ok(target);
        }
        if let Some(target) = &self.registered {
            return Ok(target.clone());
        }
        match self.role {
            Role::Consumer => Err(Error::Resolution(
                "no secondary registered yet".to_string(),
            )),
            Role::Producer => self.provision(),
        }
    }

    fn provision(&mut self) -> Result<TargetRef> {
        let admin = self.admin.as_deref().ok_or_else(|| {
            Error::Resolution("no admin capability to create a secondary".to_string())
        })?;
        let name = self.config.secondary_name.as_str();
        let delay = self.config.resolve_delay;
        let sleeper = self.sleeper.as_ref();
        let provision = self.registry.try_create_if_absent(Slot::Secondary, &mut || {
            create_secondary(admin, name, sleeper, delay)
        })?;

        let target = match provision {
            Provision::Existing(target) => {
                info!("secondary {target} was provisioned by another process");
                target
            }
            Provision::Created { target, persisted } => {
                info!(
                    "secondary stream created: id={} endpoint={}",
                    target.id, target.endpoint
                );
                if let Some(err) = persisted {
                    error!("secondary {target} kept in memory only: {err}");
                }
                if let Err(err) = self.exporter.export(SECONDARY_ENDPOINT_VAR, &target.endpoint) {
                    warn!("failed to export {SECONDARY_ENDPOINT_VAR}: {err}");
                }
                target
            }
        };
        self.registered = Some(target.clone());
        Ok(target)
    }
}

/// Build a fresh client and make sure it really serves `endpoint`.
fn connect_bound<F: ClientFactory>(factory: &F, endpoint: &str) -> Result<F::Client> {
    let client = factory.connect(endpoint)?;
    if client.endpoint() != endpoint {
        return Err(Error::Connect {
            endpoint: endpoint.to_string(),
            reason: format!("client is bound to {}", client.endpoint()),
        });
    }
    Ok(client)
}

fn load_or_degrade(registry: &dyn FailoverRegistry) -> Option<TargetRef> {
    match registry.load(Slot::Secondary) {
        Ok(found) => found,
        Err(err) => {
            warn!("registry unreadable, assuming no secondary: {err}");
            None
        }
    }
}

fn create_secondary(
    admin: &(dyn AdminClient + Send),
    name: &str,
    sleeper: &dyn Sleeper,
    resolve_delay: Duration,
) -> Result<TargetRef> {
    info!("no secondary configured, creating stream {name}");
    let created = admin
        .create_target(name)
        .map_err(|err| Error::Resolution(format!("creating {name} failed: {err}")))?;
    if let Some(target) = created.into_target() {
        return Ok(target);
    }

    info!(
        "creation of {name} returned no identifiers, listing in {} ms",
        resolve_delay.as_millis()
    );
    sleeper.sleep(resolve_delay);
    let listed = admin
        .list_targets(name)
        .map_err(|err| Error::Resolution(format!("listing {name} failed: {err}")))?;
    listed
        .into_iter()
        .find(TargetRef::is_complete)
        .ok_or_else(|| {
            Error::Resolution(format!(
                "could not resolve id/endpoint of {name} after creation"
            ))
        })
}
