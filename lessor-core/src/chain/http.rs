use std::time::Duration;

use async_stream::stream;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, trace};
use url::Url;

use super::{
    BroadcastReceipt, ChainClient, ChainEvent, EventQuery, EventStream, LeaseStatus, SignedTx,
};
use crate::checkpoint::EventPosition;
use crate::error::{LessorError, Result};
use crate::transport::ensure_success;
use crate::types::{BidId, Order, OrderId, ProviderAddress};

/// JSON/HTTP gateway client for the marketplace chain.
///
/// Subscriptions are consumed as newline-delimited JSON over a long-lived
/// response body; everything else is plain request/response.
#[derive(Clone, Debug)]
pub struct HttpChainClient {
    http: reqwest::Client,
    base: Url,
}

#[derive(Deserialize)]
struct AccountView {
    sequence: u64,
}

#[derive(Deserialize)]
struct BidView {
    bid_id: BidId,
}

impl HttpChainClient {
    /// Only connection setup is bounded here. Callers apply per-call
    /// deadlines, since the subscription body is expected to stay open.
    pub fn new(mut base: Url, connect_timeout: Duration) -> Result<Self> {
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .user_agent(concat!("lessor/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { http, base })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base
            .join(path)
            .map_err(|err| LessorError::Validation(format!("bad chain endpoint {path}: {err}")))
    }

    async fn get_json<T>(&self, url: Url) -> Result<T>
    where
        T: serde::de::DeserializeOwned,
    {
        let response = self.http.get(url).send().await?;
        let response = ensure_success(response).await?;
        Ok(response.json().await?)
    }

    async fn get_optional<T>(&self, url: Url) -> Result<Option<T>>
    where
        T: serde::de::DeserializeOwned,
    {
        let response = self.http.get(url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = ensure_success(response).await?;
        Ok(Some(response.json().await?))
    }
}

fn position_params(url: &mut Url, query: &EventQuery, after: Option<EventPosition>) {
    let mut pairs = url.query_pairs_mut();
    pairs.append_pair("query", &query.0);
    if let Some(after) = after {
        pairs.append_pair("after_height", &after.height.to_string());
        pairs.append_pair("after_seq", &after.seq.to_string());
    }
}

#[async_trait]
impl ChainClient for HttpChainClient {
    async fn open_orders(&self) -> Result<Vec<Order>> {
        let mut url = self.endpoint("market/v1/orders")?;
        url.query_pairs_mut().append_pair("state", "open");
        self.get_json(url).await
    }

    async fn query_order(&self, order_id: &OrderId) -> Result<Option<Order>> {
        let url = self.endpoint(&format!("market/v1/orders/{}", order_id.as_str()))?;
        self.get_optional(url).await
    }

    async fn query_provider_bid(
        &self,
        order_id: &OrderId,
        provider: &ProviderAddress,
    ) -> Result<Option<BidId>> {
        let url = self.endpoint(&format!(
            "market/v1/bids/{}/{}",
            order_id.as_str(),
            provider.0
        ))?;
        let view: Option<BidView> = self.get_optional(url).await?;
        Ok(view.map(|view| view.bid_id))
    }

    async fn lease_states(&self, provider: &ProviderAddress) -> Result<Vec<LeaseStatus>> {
        let mut url = self.endpoint("market/v1/leases")?;
        url.query_pairs_mut().append_pair("provider", &provider.0);
        self.get_json(url).await
    }

    async fn account_sequence(&self, address: &ProviderAddress) -> Result<u64> {
        let url = self.endpoint(&format!("auth/v1/accounts/{}", address.0))?;
        let view: AccountView = self.get_json(url).await?;
        Ok(view.sequence)
    }

    async fn broadcast(&self, tx: &SignedTx) -> Result<BroadcastReceipt> {
        let url = self.endpoint("tx/v1/broadcast")?;
        let response = self.http.post(url).json(tx).send().await?;
        let response = ensure_success(response).await?;
        let receipt: BroadcastReceipt = response.json().await?;
        debug!(
            target: "lessor::chain",
            tx_hash = %receipt.tx_hash,
            code = receipt.code,
            sequence = tx.body.sequence,
            "transaction broadcast"
        );
        Ok(receipt)
    }

    async fn subscribe(
        &self,
        query: &EventQuery,
        after: Option<EventPosition>,
    ) -> Result<EventStream> {
        let mut url = self.endpoint("events/v1/subscribe")?;
        position_params(&mut url, query, after);
        let response = self.http.get(url).send().await?;
        let response = ensure_success(response).await?;

        let mut body = response.bytes_stream();
        let events = stream! {
            let mut buffer: Vec<u8> = Vec::new();
            while let Some(chunk) = body.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(err) => {
                        yield Err(LessorError::Transient(format!("subscription interrupted: {err}")));
                        return;
                    }
                };
                buffer.extend_from_slice(&chunk);
                while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=pos).collect();
                    let line = line.trim_ascii();
                    if line.is_empty() {
                        // keepalive
                        continue;
                    }
                    match serde_json::from_slice::<ChainEvent>(line) {
                        Ok(event) => yield Ok(event),
                        Err(err) => {
                            trace!(target: "lessor::chain", error = %err, "undecodable subscription frame");
                            yield Err(LessorError::Transient(format!("bad subscription frame: {err}")));
                            return;
                        }
                    }
                }
            }
        };
        Ok(events.boxed())
    }

    async fn poll_events(
        &self,
        query: &EventQuery,
        after: Option<EventPosition>,
        limit: usize,
    ) -> Result<Vec<ChainEvent>> {
        let mut url = self.endpoint("events/v1/search")?;
        position_params(&mut url, query, after);
        url.query_pairs_mut().append_pair("limit", &limit.to_string());
        self.get_json(url).await
    }
}
