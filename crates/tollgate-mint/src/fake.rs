//! In-process Lightning backend.
//!
//! Settles invoices on demand (or immediately with `auto_settle`), which
//! is what the test suites and demo deployments run against. The
//! subscription stream honors the replay contract: new subscribers first
//! receive the current state of every invoice issued so far.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt as _;
use futures::stream::BoxStream;
use rand::RngCore as _;
use sha2::{Digest as _, Sha256};
use tokio::sync::{Mutex, mpsc};

use crate::challenger::{Invoice, InvoiceState, InvoiceUpdate, LightningClient, PaymentHash};

struct FakeInvoice {
    preimage: [u8; 32],
    state: InvoiceState,
}

#[derive(Default)]
struct Inner {
    invoices: HashMap<PaymentHash, FakeInvoice>,
    subscribers: Vec<mpsc::UnboundedSender<InvoiceUpdate>>,
}

#[derive(Default)]
pub struct FakeLightningClient {
    inner: Arc<Mutex<Inner>>,
    auto_settle: bool,
}

impl FakeLightningClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every invoice settles the moment it is created. Useful for demo
    /// deployments where no real payment flow exists.
    pub fn auto_settling() -> Self {
        Self {
            inner: Arc::default(),
            auto_settle: true,
        }
    }

    /// The preimage that pays the given invoice.
    pub async fn preimage_for(&self, payment_hash: PaymentHash) -> Option<[u8; 32]> {
        self.inner
            .lock()
            .await
            .invoices
            .get(&payment_hash)
            .map(|inv| inv.preimage)
    }

    pub async fn settle(&self, payment_hash: PaymentHash) {
        self.transition(payment_hash, InvoiceState::Settled).await;
    }

    pub async fn cancel(&self, payment_hash: PaymentHash) {
        self.transition(payment_hash, InvoiceState::Canceled).await;
    }

    async fn transition(&self, payment_hash: PaymentHash, state: InvoiceState) {
        let mut inner = self.inner.lock().await;
        if let Some(invoice) = inner.invoices.get_mut(&payment_hash) {
            invoice.state = state;
        }
        broadcast(&mut inner, InvoiceUpdate {
            payment_hash,
            state,
        });
    }
}

fn broadcast(inner: &mut Inner, update: InvoiceUpdate) {
    inner
        .subscribers
        .retain(|tx| tx.send(update.clone()).is_ok());
}

#[async_trait]
impl LightningClient for FakeLightningClient {
    async fn add_invoice(&self, value_msat: u64, _memo: &str) -> anyhow::Result<Invoice> {
        let mut preimage = [0u8; 32];
        rand::rng().fill_bytes(&mut preimage);
        let payment_hash: PaymentHash = Sha256::digest(preimage).into();

        let state = if self.auto_settle {
            InvoiceState::Settled
        } else {
            InvoiceState::Open
        };

        let mut inner = self.inner.lock().await;
        inner
            .invoices
            .insert(payment_hash, FakeInvoice { preimage, state });
        broadcast(&mut inner, InvoiceUpdate {
            payment_hash,
            state,
        });

        Ok(Invoice {
            payment_request: format!(
                "lnfake{}m{}",
                value_msat,
                hex::encode(&payment_hash[..8])
            ),
            payment_hash,
        })
    }

    async fn subscribe_invoices(
        &self,
    ) -> anyhow::Result<BoxStream<'static, anyhow::Result<InvoiceUpdate>>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().await;
        for (payment_hash, invoice) in &inner.invoices {
            let _ = tx.send(InvoiceUpdate {
                payment_hash: *payment_hash,
                state: invoice.state,
            });
        }
        inner.subscribers.push(tx);

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|update| (Ok(update), rx))
        });
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt as _;
    use tollgate_lsat::payment_hash_for_preimage;

    #[tokio::test]
    async fn preimage_hashes_to_payment_hash() {
        let client = FakeLightningClient::new();
        let invoice = client.add_invoice(1000, "LSAT").await.unwrap();
        let preimage = client.preimage_for(invoice.payment_hash).await.unwrap();
        assert_eq!(payment_hash_for_preimage(&preimage), invoice.payment_hash);
    }

    #[tokio::test]
    async fn subscribers_see_replay_then_live_updates() {
        let client = FakeLightningClient::new();
        let invoice = client.add_invoice(1000, "LSAT").await.unwrap();

        let mut stream = client.subscribe_invoices().await.unwrap();
        let replayed = stream.next().await.unwrap().unwrap();
        assert_eq!(replayed.payment_hash, invoice.payment_hash);
        assert_eq!(replayed.state, InvoiceState::Open);

        client.settle(invoice.payment_hash).await;
        let live = stream.next().await.unwrap().unwrap();
        assert_eq!(live.state, InvoiceState::Settled);
    }

    #[tokio::test]
    async fn auto_settling_creates_settled_invoices() {
        let client = FakeLightningClient::auto_settling();
        let invoice = client.add_invoice(1000, "LSAT").await.unwrap();
        let mut stream = client.subscribe_invoices().await.unwrap();
        let update = stream.next().await.unwrap().unwrap();
        assert_eq!(update.payment_hash, invoice.payment_hash);
        assert_eq!(update.state, InvoiceState::Settled);
    }
}
