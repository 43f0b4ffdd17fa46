//! lnd as the backing Lightning node, over its REST interface.
//!
//! lnd's autogenerated `tls.cert` is self-signed, so the client pins it
//! as the sole trust root instead of consulting system roots. Requests
//! authenticate with the node macaroon in the `Grpc-Metadata-macaroon`
//! header. The invoice subscription is lnd's streaming REST endpoint:
//! newline-delimited JSON, one `{"result": <invoice>}` event per line,
//! replaying from the first index so earlier invoices resync on restart.

use anyhow::Context as _;
use async_trait::async_trait;
use base64::Engine as _;
use futures::StreamExt as _;
use futures::stream::BoxStream;
use serde::Deserialize;
use tracing::debug;

use tollgate_mint::challenger::{Invoice, InvoiceState, InvoiceUpdate, LightningClient, PaymentHash};

use crate::config::LightningConfig;

const MACAROON_HEADER: &str = "Grpc-Metadata-macaroon";

pub struct LndRestClient {
    http: reqwest::Client,
    base_url: String,
    macaroon_hex: String,
}

#[derive(Debug, serde::Serialize)]
struct AddInvoiceRequest<'a> {
    memo: &'a str,
    value_msat: String,
}

#[derive(Debug, Deserialize)]
struct AddInvoiceResponse {
    r_hash: String,
    payment_request: String,
}

#[derive(Debug, Deserialize)]
struct RestInvoice {
    r_hash: String,
    state: String,
}

#[derive(Debug, Deserialize)]
struct SubscribeEvent {
    result: RestInvoice,
}

impl LndRestClient {
    pub fn from_config(cfg: &LightningConfig) -> anyhow::Result<Self> {
        let base_url = cfg
            .address
            .clone()
            .context("lightning.address is required")?;
        if !base_url.starts_with("https://") {
            anyhow::bail!("lnd REST address must be https");
        }
        let base_url = base_url.trim_end_matches('/').to_string();

        let cert_path = cfg
            .tls_cert_path
            .as_ref()
            .context("lightning.tls_cert_path is required")?;
        let pem = std::fs::read(cert_path)
            .with_context(|| format!("read lnd tls cert {}", cert_path.display()))?;
        let cert = reqwest::Certificate::from_pem(&pem).context("parse lnd tls cert")?;

        let macaroon_path = cfg
            .macaroon_path
            .as_ref()
            .context("lightning.macaroon_path is required")?;
        let macaroon = std::fs::read(macaroon_path)
            .with_context(|| format!("read lnd macaroon {}", macaroon_path.display()))?;

        let http = reqwest::Client::builder()
            .use_rustls_tls()
            .tls_built_in_root_certs(false)
            .add_root_certificate(cert)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .context("build lnd client")?;

        Ok(Self {
            http,
            base_url,
            macaroon_hex: hex::encode(macaroon),
        })
    }

    fn new_with_client(http: reqwest::Client, base_url: String, macaroon_hex: String) -> Self {
        Self {
            http,
            base_url,
            macaroon_hex,
        }
    }
}

fn decode_r_hash(b64: &str) -> anyhow::Result<PaymentHash> {
    let raw = base64::engine::general_purpose::STANDARD
        .decode(b64)
        .context("base64 decode r_hash")?;
    let hash: PaymentHash = raw
        .try_into()
        .map_err(|_| anyhow::anyhow!("r_hash is not 32 bytes"))?;
    Ok(hash)
}

fn parse_state(state: &str) -> anyhow::Result<InvoiceState> {
    match state {
        "OPEN" | "ACCEPTED" => Ok(InvoiceState::Open),
        "SETTLED" => Ok(InvoiceState::Settled),
        "CANCELED" => Ok(InvoiceState::Canceled),
        other => anyhow::bail!("unknown invoice state {other:?}"),
    }
}

impl RestInvoice {
    fn into_update(self) -> anyhow::Result<InvoiceUpdate> {
        Ok(InvoiceUpdate {
            payment_hash: decode_r_hash(&self.r_hash)?,
            state: parse_state(&self.state)?,
        })
    }
}

struct LineReader {
    inner: BoxStream<'static, reqwest::Result<bytes::Bytes>>,
    buf: Vec<u8>,
}

#[async_trait]
impl LightningClient for LndRestClient {
    async fn add_invoice(&self, value_msat: u64, memo: &str) -> anyhow::Result<Invoice> {
        let resp = self
            .http
            .post(format!("{}/v1/invoices", self.base_url))
            .header(MACAROON_HEADER, &self.macaroon_hex)
            .json(&AddInvoiceRequest {
                memo,
                value_msat: value_msat.to_string(),
            })
            .send()
            .await
            .context("lnd AddInvoice")?;
        if !resp.status().is_success() {
            anyhow::bail!("lnd AddInvoice failed: {}", resp.status());
        }
        let resp: AddInvoiceResponse = resp.json().await.context("decode AddInvoice response")?;

        let payment_hash = decode_r_hash(&resp.r_hash)?;
        debug!(payment_hash = %hex::encode(payment_hash), "created lnd invoice");
        Ok(Invoice {
            payment_request: resp.payment_request,
            payment_hash,
        })
    }

    async fn subscribe_invoices(
        &self,
    ) -> anyhow::Result<BoxStream<'static, anyhow::Result<InvoiceUpdate>>> {
        let resp = self
            .http
            .get(format!(
                "{}/v1/invoices/subscribe?add_index=1&settle_index=1",
                self.base_url
            ))
            .header(MACAROON_HEADER, &self.macaroon_hex)
            .send()
            .await
            .context("lnd SubscribeInvoices")?;
        if !resp.status().is_success() {
            anyhow::bail!("lnd SubscribeInvoices failed: {}", resp.status());
        }

        let reader = LineReader {
            inner: resp.bytes_stream().boxed(),
            buf: Vec::new(),
        };
        let stream = futures::stream::try_unfold(reader, |mut reader| async move {
            loop {
                if let Some(pos) = reader.buf.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = reader.buf.drain(..=pos).collect();
                    let line = &line[..line.len() - 1];
                    if line.iter().all(u8::is_ascii_whitespace) {
                        continue;
                    }
                    let event: SubscribeEvent =
                        serde_json::from_slice(line).context("decode invoice event")?;
                    return Ok(Some((event.result.into_update()?, reader)));
                }
                match reader.inner.next().await {
                    Some(Ok(chunk)) => reader.buf.extend_from_slice(&chunk),
                    Some(Err(e)) => return Err(anyhow::Error::from(e).context("invoice stream")),
                    None => return Ok(None),
                }
            }
        });
        Ok(stream.boxed())
    }
}
