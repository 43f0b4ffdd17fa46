//! Invoice challenger.
//!
//! Creates invoices through the Lightning SPI and tracks their settlement
//! so verifiers can ask "has hash H settled?" with a deadline. A single
//! subscription task consumes the node's invoice stream and publishes
//! updates into a guarded state map; waiting verifiers each park on a
//! one-shot channel keyed by payment hash, so a settlement wakes exactly
//! the requests that care about it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt as _;
use futures::stream::BoxStream;
use thiserror::Error;
use tokio::sync::{Mutex, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use tollgate_lsat::PAYMENT_HASH_LEN;

pub type PaymentHash = [u8; PAYMENT_HASH_LEN];

/// Memo placed on every invoice we create.
const INVOICE_MEMO: &str = "LSAT";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvoiceState {
    Open,
    Settled,
    Canceled,
}

impl InvoiceState {
    fn is_terminal(self) -> bool {
        matches!(self, InvoiceState::Settled | InvoiceState::Canceled)
    }
}

/// A freshly created invoice: the bolt11 string handed to clients and the
/// payment hash the token is bound to.
#[derive(Debug, Clone)]
pub struct Invoice {
    pub payment_request: String,
    pub payment_hash: PaymentHash,
}

#[derive(Debug, Clone)]
pub struct InvoiceUpdate {
    pub payment_hash: PaymentHash,
    pub state: InvoiceState,
}

/// Contract for the backing Lightning node.
#[async_trait]
pub trait LightningClient: Send + Sync {
    async fn add_invoice(&self, value_msat: u64, memo: &str) -> anyhow::Result<Invoice>;

    /// Opens the invoice update stream. On (re)subscription the stream
    /// must replay the current state of previously issued invoices before
    /// delivering live updates, so a restarted process resyncs hashes that
    /// settled while it was down.
    async fn subscribe_invoices(
        &self,
    ) -> anyhow::Result<BoxStream<'static, anyhow::Result<InvoiceUpdate>>>;
}

#[derive(Debug, Error)]
pub enum ChallengerError {
    #[error("timed out waiting for invoice state")]
    Timeout,
    #[error("invoice is {0:?}")]
    UnexpectedState(InvoiceState),
    #[error("challenger stopped")]
    Stopped,
    #[error(transparent)]
    Node(#[from] anyhow::Error),
}

struct Waiter {
    expected: InvoiceState,
    tx: oneshot::Sender<InvoiceState>,
}

#[derive(Default)]
struct Pending {
    states: HashMap<PaymentHash, InvoiceState>,
    waiters: HashMap<PaymentHash, Vec<Waiter>>,
}

pub struct Challenger {
    client: Arc<dyn LightningClient>,
    inner: Arc<Mutex<Pending>>,
    shutdown: watch::Sender<bool>,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Challenger {
    pub fn new(client: Arc<dyn LightningClient>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            client,
            inner: Arc::new(Mutex::new(Pending::default())),
            shutdown,
            task: std::sync::Mutex::new(None),
        }
    }

    /// Subscribes to the node's invoice stream and spawns the consumer
    /// task. Must complete before the first `verify_invoice_status`.
    pub async fn start(&self) -> anyhow::Result<()> {
        {
            let guard = self.task.lock().expect("challenger task lock");
            if guard.is_some() {
                anyhow::bail!("challenger already started");
            }
        }

        let mut stream = self.client.subscribe_invoices().await?;
        let inner = Arc::clone(&self.inner);
        let mut shutdown_rx = self.shutdown.subscribe();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    update = stream.next() => match update {
                        Some(Ok(update)) => publish(&inner, update).await,
                        Some(Err(e)) => {
                            warn!(error = %e, "invoice stream error");
                        }
                        None => {
                            warn!("invoice stream ended");
                            break;
                        }
                    },
                }
            }
            // Unpark anyone still waiting; their one-shot senders drop
            // and the receivers observe Stopped.
            inner.lock().await.waiters.clear();
        });

        *self.task.lock().expect("challenger task lock") = Some(handle);
        Ok(())
    }

    /// Stops the subscription task. Outstanding waits fail with
    /// `Stopped`.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let handle = self.task.lock().expect("challenger task lock").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Creates a fresh invoice for `price_msat` and registers its hash as
    /// pending.
    pub async fn new_challenge(&self, price_msat: u64) -> Result<Invoice, ChallengerError> {
        let invoice = self.client.add_invoice(price_msat, INVOICE_MEMO).await?;
        self.inner
            .lock()
            .await
            .states
            .entry(invoice.payment_hash)
            .or_insert(InvoiceState::Open);
        debug!(
            payment_hash = %hex::encode(invoice.payment_hash),
            price_msat,
            "created invoice challenge"
        );
        Ok(invoice)
    }

    /// Waits up to `timeout` for `payment_hash` to reach `expected`. A
    /// zero timeout only consults the cached state. Dropping the returned
    /// future cancels the wait; the subscription task prunes dead waiters
    /// on its next pass over the hash.
    pub async fn verify_invoice_status(
        &self,
        payment_hash: PaymentHash,
        expected: InvoiceState,
        timeout: Duration,
    ) -> Result<(), ChallengerError> {
        let rx = {
            let mut inner = self.inner.lock().await;
            match inner.states.get(&payment_hash) {
                Some(state) if *state == expected => return Ok(()),
                Some(state) if state.is_terminal() => {
                    return Err(ChallengerError::UnexpectedState(*state));
                }
                _ => {}
            }
            if timeout.is_zero() {
                return Err(ChallengerError::Timeout);
            }

            let (tx, rx) = oneshot::channel();
            inner
                .waiters
                .entry(payment_hash)
                .or_default()
                .push(Waiter { expected, tx });
            rx
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(state)) if state == expected => Ok(()),
            Ok(Ok(state)) => Err(ChallengerError::UnexpectedState(state)),
            Ok(Err(_)) => Err(ChallengerError::Stopped),
            Err(_) => Err(ChallengerError::Timeout),
        }
    }
}

async fn publish(inner: &Mutex<Pending>, update: InvoiceUpdate) {
    let mut inner = inner.lock().await;
    inner.states.insert(update.payment_hash, update.state);

    let Some(waiters) = inner.waiters.remove(&update.payment_hash) else {
        return;
    };
    if update.state.is_terminal() {
        // Terminal states resolve every wait, matching or not; the waiter
        // surfaces a mismatch as UnexpectedState.
        for waiter in waiters {
            let _ = waiter.tx.send(update.state);
        }
        return;
    }

    let mut keep = Vec::with_capacity(waiters.len());
    for waiter in waiters {
        if waiter.tx.is_closed() {
            continue;
        }
        if waiter.expected == update.state {
            let _ = waiter.tx.send(update.state);
        } else {
            keep.push(waiter);
        }
    }
    if !keep.is_empty() {
        inner.waiters.insert(update.payment_hash, keep);
    }
}
