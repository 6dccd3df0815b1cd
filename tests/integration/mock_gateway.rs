//! Mock settlement gateway for integration testing.
//!
//! Provides a deterministic `SettlementGateway` implementation that stages
//! and "sends" offers, lets test code resolve them, and exposes the
//! resulting status events — all in-memory with no external dependencies.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use potline::gateway::{
    GatewayEvent, OfferDirection, OfferHandle, OfferStatus, SettlementGateway,
};
use potline::types::UserProfile;

/// One offer the mock gateway has seen.
#[derive(Debug, Clone)]
pub struct RecordedOffer {
    pub offer_id: String,
    pub user_id: String,
    pub asset_ids: Vec<String>,
    pub direction: OfferDirection,
    pub status: OfferStatus,
}

/// A mock trade-offer service for deterministic testing.
///
/// All state is in-memory. Offers, statuses, and the event queue are
/// fully controllable from test code.
pub struct MockGateway {
    connected: Mutex<bool>,
    offers: Mutex<HashMap<String, RecordedOffer>>,
    events: Mutex<Vec<GatewayEvent>>,
    next_id: Mutex<u64>,
    /// If set, all operations will return this error.
    force_error: Mutex<Option<String>>,
}

impl MockGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(MockGateway {
            connected: Mutex::new(true),
            offers: Mutex::new(HashMap::new()),
            events: Mutex::new(Vec::new()),
            next_id: Mutex::new(0),
            force_error: Mutex::new(None),
        })
    }

    /// Force all subsequent operations to return an error.
    pub fn set_error(&self, msg: &str) {
        *self.force_error.lock().unwrap() = Some(msg.to_string());
    }

    /// Clear any forced error.
    pub fn clear_error(&self) {
        *self.force_error.lock().unwrap() = None;
    }

    pub fn set_connected(&self, connected: bool) {
        *self.connected.lock().unwrap() = connected;
    }

    /// Resolve an offer as the counterparty would, queueing the status
    /// event the engine will consume.
    pub fn resolve(&self, offer_id: &str, status: OfferStatus) {
        if let Some(offer) = self.offers.lock().unwrap().get_mut(offer_id) {
            offer.status = status;
        }
        self.events.lock().unwrap().push(GatewayEvent {
            offer_id: offer_id.to_string(),
            status,
        });
    }

    /// Drop an offer entirely, as if the gateway lost it.
    pub fn forget(&self, offer_id: &str) {
        self.offers.lock().unwrap().remove(offer_id);
    }

    /// Drain the queued status events, oldest first.
    pub fn drain_events(&self) -> Vec<GatewayEvent> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }

    /// All offers recorded so far.
    pub fn offers(&self) -> Vec<RecordedOffer> {
        self.offers.lock().unwrap().values().cloned().collect()
    }

    /// The single outgoing (payout) offer, if exactly one was sent.
    pub fn outgoing_offer(&self) -> Option<RecordedOffer> {
        let offers = self.offers.lock().unwrap();
        let mut outgoing = offers
            .values()
            .filter(|o| o.direction == OfferDirection::Outgoing);
        match (outgoing.next(), outgoing.next()) {
            (Some(offer), None) => Some(offer.clone()),
            _ => None,
        }
    }

    fn check_error(&self) -> Result<()> {
        if let Some(err) = self.force_error.lock().unwrap().as_ref() {
            return Err(anyhow!("{}", err));
        }
        Ok(())
    }
}

#[async_trait]
impl SettlementGateway for MockGateway {
    async fn propose(
        &self,
        user: &UserProfile,
        asset_ids: &[String],
        direction: OfferDirection,
    ) -> Result<OfferHandle> {
        self.check_error()?;

        let mut next = self.next_id.lock().unwrap();
        *next += 1;
        let offer_id = format!("T-{}", *next);

        self.offers.lock().unwrap().insert(
            offer_id.clone(),
            RecordedOffer {
                offer_id: offer_id.clone(),
                user_id: user.id.clone(),
                asset_ids: asset_ids.to_vec(),
                direction,
                status: OfferStatus::Sent,
            },
        );

        // The handle is the offer id; `send` just acknowledges it.
        Ok(OfferHandle { id: offer_id })
    }

    async fn send(&self, handle: &OfferHandle) -> Result<(OfferStatus, String)> {
        self.check_error()?;
        let offers = self.offers.lock().unwrap();
        let offer = offers
            .get(&handle.id)
            .ok_or_else(|| anyhow!("Unknown offer handle: {}", handle.id))?;
        Ok((offer.status, offer.offer_id.clone()))
    }

    async fn status(&self, external_id: &str) -> Result<Option<OfferStatus>> {
        self.check_error()?;
        Ok(self
            .offers
            .lock()
            .unwrap()
            .get(external_id)
            .map(|o| o.status))
    }

    fn is_connected(&self) -> bool {
        *self.connected.lock().unwrap()
    }

    fn name(&self) -> &str {
        "mock-gateway"
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: &str) -> UserProfile {
        UserProfile {
            id: id.to_string(),
            name: format!("user-{id}"),
            avatar: String::new(),
            trade_url: Some(format!("https://trade.example.com/{id}")),
        }
    }

    #[tokio::test]
    async fn test_mock_propose_send_roundtrip() {
        let gateway = MockGateway::new();
        let handle = gateway
            .propose(&user("u1"), &["a1".to_string()], OfferDirection::Incoming)
            .await
            .unwrap();
        let (status, offer_id) = gateway.send(&handle).await.unwrap();

        assert_eq!(status, OfferStatus::Sent);
        assert_eq!(offer_id, "T-1");
        assert_eq!(gateway.offers().len(), 1);
    }

    #[tokio::test]
    async fn test_mock_resolve_queues_event() {
        let gateway = MockGateway::new();
        let handle = gateway
            .propose(&user("u1"), &["a1".to_string()], OfferDirection::Incoming)
            .await
            .unwrap();
        let (_, offer_id) = gateway.send(&handle).await.unwrap();

        gateway.resolve(&offer_id, OfferStatus::Accepted);

        let events = gateway.drain_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status, OfferStatus::Accepted);
        assert_eq!(
            gateway.status(&offer_id).await.unwrap(),
            Some(OfferStatus::Accepted)
        );
        // Draining empties the queue.
        assert!(gateway.drain_events().is_empty());
    }

    #[tokio::test]
    async fn test_mock_forced_error() {
        let gateway = MockGateway::new();
        gateway.set_error("simulated bot disconnect");

        assert!(gateway
            .propose(&user("u1"), &[], OfferDirection::Incoming)
            .await
            .is_err());
        assert!(gateway.status("T-1").await.is_err());

        gateway.clear_error();
        assert!(gateway.status("T-1").await.is_ok());
    }

    #[tokio::test]
    async fn test_mock_forget_makes_status_unknown() {
        let gateway = MockGateway::new();
        let handle = gateway
            .propose(&user("u1"), &["a1".to_string()], OfferDirection::Incoming)
            .await
            .unwrap();
        let (_, offer_id) = gateway.send(&handle).await.unwrap();

        gateway.forget(&offer_id);
        assert_eq!(gateway.status(&offer_id).await.unwrap(), None);
    }
}
