//! [`PlanCoordinator`]: whole-plan operations over the active link.
//!
//! # Design
//!
//! Every public operation takes the active link's busy token up front and
//! holds it until the operation ends, so a plan upload cannot interleave
//! with a download or a flash on the same link. Collections are always
//! processed Mission → Fence → Rally; the first failure stops the operation
//! and is reported as a [`PlanError`] naming the collection.
//!
//! When `auto_restart_on_failover` is set and a sub-transfer dies with
//! `LinkLost` because the health service promoted another link, the
//! coordinator takes the new link's token and restarts that sub-transfer
//! once. Collections already completed are not repeated.

use std::collections::BTreeMap;
use std::sync::Arc;

// ---

use thiserror::Error;
use tokio::sync::watch;
use tracing::Instrument;
use uuid::Uuid;

// ---

use planlink_domain::{
    // ---
    fence_from_collection,
    rally_from_collection,
    Collection,
    CollectionType,
    LinkId,
    LinkState,
    LinkStatus,
    Plan,
    PlanItem,
    PlanLinkError,
    Result,
};

// ---

use crate::clock::{ClockPtr, TokioClock};
use crate::config::EngineConfig;
use crate::events::{EventTx, PlanEvent, Router};
use crate::flash::{FirmwareImage, FlashError, FlashReport, FlashSession};
use crate::link::{LinkHandle, LinkLease};
use crate::runner::{drive, Exchange, Outlets, Signals};
use crate::transfer::TransferSession;

// ---------------------------------------------------------------------------
// PlanError / PlanOutcome
// ---------------------------------------------------------------------------

/// Failure of a coordinator operation.
#[derive(Debug, Error)]
#[error("{}: {source}", scope_name(.collection))]
pub struct PlanError {
    // ---
    /// Collection being transferred when the operation failed; `None` when
    /// it failed before any transfer started.
    pub collection: Option<CollectionType>,

    #[source]
    pub source: PlanLinkError,
}

fn scope_name(collection: &Option<CollectionType>) -> String {
    match collection {
        Some(kind) => kind.to_string(),
        None => "plan".into(),
    }
}

// ---

impl PlanError {
    // ---
    fn before_transfer(source: PlanLinkError) -> Self {
        Self {
            collection: None,
            source,
        }
    }

    fn during(kind: CollectionType) -> impl FnOnce(PlanLinkError) -> Self {
        move |source| Self {
            collection: Some(kind),
            source,
        }
    }
}

// ---

/// Summary of a successful operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlanOutcome {
    // ---
    /// Requests resent across all sub-transfers.
    pub retries: u32,

    /// Sub-transfers restarted after failover.
    pub restarts: u32,
}

// ---

/// Link and bookkeeping held for the duration of one operation.
struct Operation {
    // ---
    lease: LinkLease,
    signals: Signals,
    outcome: PlanOutcome,
}

// ---------------------------------------------------------------------------
// PlanCoordinator
// ---------------------------------------------------------------------------

pub struct PlanCoordinator {
    // ---
    config: EngineConfig,
    links: BTreeMap<LinkId, LinkHandle>,
    status: watch::Receiver<LinkStatus>,
    cancel: watch::Sender<bool>,
    events: EventTx,
    router: Router,
    clock: ClockPtr,
}

// ---

impl PlanCoordinator {
    // ---
    pub fn new(
        config: EngineConfig,
        links: Vec<LinkHandle>,
        status: watch::Receiver<LinkStatus>,
        events: EventTx,
        router: Router,
    ) -> Self {
        // ---
        let (cancel, _) = watch::channel(false);

        Self {
            config,
            links: links.into_iter().map(|h| (h.id(), h)).collect(),
            status,
            cancel,
            events,
            router,
            clock: Arc::new(TokioClock),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn status(&self) -> LinkStatus {
        *self.status.borrow()
    }

    /// True while any link's busy token is held.
    pub fn is_busy(&self) -> bool {
        self.links.values().any(LinkHandle::is_busy)
    }

    /// Abort the operation in progress, if any. It ends with
    /// [`PlanLinkError::Cancelled`] and releases the link.
    pub fn cancel(&self) {
        tracing::info!("cancel requested");
        self.cancel.send_replace(true);
    }

    // --- plan operations ----------------------------------------------------

    /// Replace all three collections on the vehicle with `plan`.
    pub async fn upload(&self, plan: &Plan) -> std::result::Result<PlanOutcome, PlanError> {
        // ---
        let op = Uuid::new_v4();
        let result = self
            .upload_plan(plan)
            .instrument(tracing::info_span!("upload", %op))
            .await;
        self.report(result.as_ref().err());
        result
    }

    /// Read all three collections from the vehicle.
    ///
    /// Complex items cannot be recovered; the mission comes back as simple
    /// items. The planned home position is not stored on the vehicle and is
    /// left empty.
    pub async fn download(&self) -> std::result::Result<Plan, PlanError> {
        // ---
        let op = Uuid::new_v4();
        let result = self
            .download_plan()
            .instrument(tracing::info_span!("download", %op))
            .await;
        self.report(result.as_ref().err());
        result
    }

    // --- single-collection operations ---------------------------------------

    pub async fn upload_collection(&self, collection: Collection) -> std::result::Result<PlanOutcome, PlanError> {
        // ---
        let op = Uuid::new_v4();
        let kind = collection.kind();
        let result = async {
            let mut operation = self.begin().map_err(PlanError::before_transfer)?;
            self.upload_one(&mut operation, collection).await?;
            Ok::<_, PlanError>(operation.outcome)
        }
        .instrument(tracing::info_span!("upload_collection", %op, %kind))
        .await;
        self.report(result.as_ref().err());
        result
    }

    pub async fn download_collection(&self, kind: CollectionType) -> std::result::Result<Collection, PlanError> {
        // ---
        let op = Uuid::new_v4();
        let result = async {
            let mut operation = self.begin().map_err(PlanError::before_transfer)?;
            self.download_one(&mut operation, kind).await
        }
        .instrument(tracing::info_span!("download_collection", %op, %kind))
        .await;
        self.report(result.as_ref().err());
        result
    }

    /// Remove `kind` from the vehicle.
    pub async fn clear_all(&self, kind: CollectionType) -> std::result::Result<(), PlanError> {
        // ---
        let op = Uuid::new_v4();
        let result = async {
            let mut operation = self.begin().map_err(PlanError::before_transfer)?;
            let policy = self.config.retry;
            self.run(&mut operation, || TransferSession::clear(kind, policy))
                .await
                .map_err(PlanError::during(kind))?;
            tracing::info!(%kind, "collection cleared on vehicle");
            Ok::<_, PlanError>(())
        }
        .instrument(tracing::info_span!("clear_all", %op, %kind))
        .await;
        self.report(result.as_ref().err());
        result
    }

    // --- firmware -----------------------------------------------------------

    /// Flash `image` through the bootloader on the active link.
    ///
    /// Never restarted after failover: a half-written image must be flashed
    /// again from the start by the operator.
    pub async fn flash(&self, image: &FirmwareImage) -> std::result::Result<FlashReport, FlashError> {
        // ---
        let op = Uuid::new_v4();
        let result = self
            .flash_image(image)
            .instrument(tracing::info_span!("flash", %op, board_id = image.board_id()))
            .await;

        let errors = result.as_ref().err().map(|e| vec![e.to_string()]);
        self.events.send(PlanEvent::Result {
            success: errors.is_none(),
            errors: errors.unwrap_or_default(),
        });
        result
    }

    // --- internals ----------------------------------------------------------

    async fn upload_plan(&self, plan: &Plan) -> std::result::Result<PlanOutcome, PlanError> {
        // ---
        plan.validate().map_err(PlanError::before_transfer)?;
        let mut operation = self.begin().map_err(PlanError::before_transfer)?;

        for kind in CollectionType::ALL {
            self.upload_one(&mut operation, plan.collection(kind)).await?;
        }

        tracing::info!(retries = operation.outcome.retries, "plan upload complete");
        Ok(operation.outcome)
    }

    async fn download_plan(&self) -> std::result::Result<Plan, PlanError> {
        // ---
        let mut operation = self.begin().map_err(PlanError::before_transfer)?;

        let mission = self.download_one(&mut operation, CollectionType::Mission).await?;
        let fence = self.download_one(&mut operation, CollectionType::Fence).await?;
        let rally = self.download_one(&mut operation, CollectionType::Rally).await?;

        let plan = Plan {
            mission: mission.into_items().into_iter().map(PlanItem::Simple).collect(),
            home: None,
            fence: fence_from_collection(&fence).map_err(PlanError::during(CollectionType::Fence))?,
            rally: rally_from_collection(&rally).map_err(PlanError::during(CollectionType::Rally))?,
        };

        tracing::info!(retries = operation.outcome.retries, "plan download complete");
        Ok(plan)
    }

    async fn upload_one(&self, operation: &mut Operation, collection: Collection) -> std::result::Result<(), PlanError> {
        // ---
        let kind = collection.kind();
        let policy = self.config.retry;
        let final_ack = self.config.final_ack_timeout();
        tracing::info!(%kind, items = collection.len(), "uploading");

        self.run(operation, || TransferSession::upload(collection.clone(), policy, final_ack))
            .await
            .map_err(PlanError::during(kind))?;
        Ok(())
    }

    async fn download_one(&self, operation: &mut Operation, kind: CollectionType) -> std::result::Result<Collection, PlanError> {
        // ---
        let policy = self.config.retry;
        tracing::info!(%kind, "downloading");

        let collection = self
            .run(operation, || TransferSession::download(kind, policy))
            .await
            .map_err(PlanError::during(kind))?;
        tracing::info!(%kind, items = collection.len(), "download complete");
        Ok(collection)
    }

    async fn flash_image(&self, image: &FirmwareImage) -> std::result::Result<FlashReport, FlashError> {
        // ---
        let mut operation = self.begin().map_err(|source| FlashError {
            last_good_address: None,
            source,
        })?;

        let mut session = FlashSession::new(image.clone(), self.config.flash, self.config.retry);
        drive(&mut session, &mut operation.lease, &mut operation.signals, &self.outlets()).await;

        let last_good_address = session.last_good_address();
        session.finish().map_err(|source| FlashError {
            last_good_address,
            source,
        })
    }

    // ---

    /// Take the active link for a new operation and clear any stale cancel.
    fn begin(&self) -> Result<Operation> {
        // ---
        let status = *self.status.borrow();
        if status.state == LinkState::Lost {
            return Err(PlanLinkError::LinkLost);
        }

        let mut lease = self.lease(status.active)?;
        self.cancel.send_replace(false);

        let signals = Signals {
            cancel: self.cancel.subscribe(),
            status: self.status.clone(),
        };

        // Anything still queued belongs to an earlier exchange.
        for stale in lease.drain_stale() {
            self.router.route(stale);
        }

        Ok(Operation {
            lease,
            signals,
            outcome: PlanOutcome::default(),
        })
    }

    fn lease(&self, link: LinkId) -> Result<LinkLease> {
        self.links
            .get(&link)
            .ok_or_else(|| PlanLinkError::Transport(format!("no {link:?} link configured")))?
            .try_acquire()
    }

    fn outlets(&self) -> Outlets<'_> {
        Outlets {
            router: &self.router,
            events: &self.events,
            clock: self.clock.as_ref(),
        }
    }

    // ---

    /// Drive sessions built by `make` until one finishes, restarting once on
    /// a freshly promoted link when configured to.
    async fn run<E, F>(&self, operation: &mut Operation, make: F) -> Result<E::Output>
    where
        E: Exchange,
        F: Fn() -> E,
    {
        // ---
        loop {
            let mut session = make();
            drive(&mut session, &mut operation.lease, &mut operation.signals, &self.outlets()).await;
            operation.outcome.retries += session.retries();

            match session.finish() {
                Err(e) if e.is_link_failure() && self.config.auto_restart_on_failover && operation.outcome.restarts == 0 => {
                    // ---
                    let lost = operation.lease.id();
                    let status = *self.status.borrow();
                    if status.active == lost || !status.permits(status.active) {
                        return Err(e);
                    }

                    operation.lease = self.lease(status.active)?;
                    for stale in operation.lease.drain_stale() {
                        self.router.route(stale);
                    }
                    operation.outcome.restarts += 1;
                    tracing::warn!(from = ?lost, to = ?status.active, "restarting transfer after failover");
                }
                other => return other,
            }
        }
    }

    // ---

    fn report(&self, error: Option<&PlanError>) {
        // ---
        match error {
            None => {
                self.events.send(PlanEvent::Result {
                    success: true,
                    errors: Vec::new(),
                });
            }
            Some(e) => {
                tracing::warn!("operation failed: {e}");
                self.events.send(PlanEvent::Result {
                    success: false,
                    errors: vec![e.to_string()],
                });
            }
        }
    }
}
