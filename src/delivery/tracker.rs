//! Delivery tracker
//!
//! Inbound flow per packet identifier:
//! - QoS 1: `Sent` (handed to the dispatcher) then `Complete` with PUBACK
//!   once the handlers succeed.
//! - QoS 2: `Sent`, then `AcknowledgedPartial` with PUBREC once the handlers
//!   succeed, then `Complete` with PUBCOMP when the broker releases it.
//!
//! `Complete` inbound records stay in the session as dedup markers. A
//! redelivery (DUP set) of a completed identifier is answered without
//! reaching the handlers again; a fresh PUBLISH reusing the identifier
//! replaces the marker.
//!
//! Outbound flow: `Queued` until the window has room, `Sent` once written,
//! `AcknowledgedPartial` after PUBREC (QoS 2), removed on PUBACK/PUBCOMP.

use std::collections::BTreeSet;
use std::sync::MutexGuard;

use tracing::{debug, warn};

use super::packet_id::lowest_free;
use crate::dispatch::Delivery;
use crate::session::{DeliveryState, Direction, InFlightMessage, Session, SharedSession};
use crate::transport::{Packet, Publish, QoS, TopicSubscription};
use crate::utils::error::{Error, Result};

/// What to do with an inbound PUBLISH.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundAction {
    /// New message: hand it to the dispatcher.
    Deliver(Delivery),
    /// Duplicate: only answer the broker.
    Reply(Packet),
    /// Duplicate of a message whose handlers are still running.
    Ignore,
}

#[derive(Debug)]
pub struct DeliveryTracker {
    session: SharedSession,
    control_ids: BTreeSet<u16>,
}

impl DeliveryTracker {
    pub fn new(session: SharedSession) -> Self {
        Self {
            session,
            control_ids: BTreeSet::new(),
        }
    }

    pub fn session(&self) -> &SharedSession {
        &self.session
    }

    fn lock(&self) -> MutexGuard<'_, Session> {
        match self.session.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Copy of the session for persisting outside the lock.
    pub fn snapshot(&self) -> Session {
        self.lock().clone()
    }

    pub fn with_session<R>(&self, f: impl FnOnce(&mut Session) -> R) -> R {
        f(&mut self.lock())
    }

    pub fn subscriptions(&self) -> Vec<TopicSubscription> {
        self.lock().subscriptions.iter().map(Into::into).collect()
    }

    pub fn on_publish(&mut self, publish: Publish) -> InboundAction {
        let Some(packet_id) = publish.packet_id else {
            return InboundAction::Deliver(Delivery {
                topic: publish.topic,
                payload: publish.payload,
                qos: publish.qos,
                packet_id: None,
            });
        };

        let mut session = self.lock();
        let existing = session
            .inbound_mut(packet_id)
            .map(|record| (record.state, record.carries(&publish.topic, &publish.payload)));
        if let Some((state, same_message)) = existing {
            match state {
                DeliveryState::Complete if publish.dup && same_message => {
                    debug!("Duplicate PUBLISH {packet_id} on '{}' discarded", publish.topic);
                    return InboundAction::Reply(receipt(publish.qos, packet_id));
                }
                DeliveryState::AcknowledgedPartial => {
                    debug!("PUBLISH {packet_id} already received, repeating PUBREC");
                    return InboundAction::Reply(Packet::PubRec { packet_id });
                }
                DeliveryState::Sent | DeliveryState::Queued => {
                    debug!("PUBLISH {packet_id} still being handled, ignoring duplicate");
                    return InboundAction::Ignore;
                }
                DeliveryState::Complete => {
                    // the broker reused a released identifier for a new message
                }
            }
            session.remove_inbound(packet_id);
        }

        session.pending_inbound.push(InFlightMessage::new(
            packet_id,
            publish.topic.clone(),
            publish.payload.clone(),
            publish.qos,
            DeliveryState::Sent,
        ));

        InboundAction::Deliver(Delivery {
            topic: publish.topic,
            payload: publish.payload,
            qos: publish.qos,
            packet_id: Some(packet_id),
        })
    }

    /// Records the handlers' verdict for an inbound message and returns the
    /// acknowledgment to send, if any. On failure the record is dropped so
    /// the broker's redelivery goes through the handlers again.
    pub fn on_handler_outcome(&mut self, packet_id: u16, acknowledge: bool) -> Option<Packet> {
        let mut session = self.lock();
        let Some((qos, state)) = session
            .inbound_mut(packet_id)
            .map(|record| (record.qos, record.state))
        else {
            debug!("Handler finished for untracked inbound packet {packet_id}");
            return None;
        };
        if state != DeliveryState::Sent {
            debug!("Handler finished for inbound packet {packet_id} in state {state:?}");
            return None;
        }

        let (next, reply) = match (acknowledge, qos) {
            (true, QoS::AtLeastOnce) => (DeliveryState::Complete, Packet::PubAck { packet_id }),
            (true, QoS::ExactlyOnce) => {
                (DeliveryState::AcknowledgedPartial, Packet::PubRec { packet_id })
            }
            _ => {
                session.remove_inbound(packet_id);
                return None;
            }
        };
        if let Some(record) = session.inbound_mut(packet_id) {
            record.set_state(next);
            record.release_payload();
        }
        Some(reply)
    }

    /// Completes an inbound QoS 2 flow. PUBCOMP is always returned so the
    /// broker can release its state, even for identifiers we do not know.
    pub fn on_pubrel(&mut self, packet_id: u16) -> Packet {
        let mut session = self.lock();
        match session.inbound_mut(packet_id) {
            Some(record) if record.state == DeliveryState::AcknowledgedPartial => {
                record.set_state(DeliveryState::Complete);
            }
            Some(record) if record.state == DeliveryState::Complete => {
                debug!("Repeated PUBREL {packet_id}");
            }
            Some(record) => {
                warn!(
                    "PUBREL {packet_id} arrived in state {:?}, completing anyway",
                    record.state
                );
                record.set_state(DeliveryState::Complete);
                record.release_payload();
            }
            None => warn!("PUBREL for unknown packet {packet_id}"),
        }
        Packet::PubComp { packet_id }
    }

    /// Forgets all inbound state, used when the broker has no session.
    pub fn forget_inbound(&mut self) -> usize {
        let mut session = self.lock();
        let dropped = session.pending_inbound.len();
        session.pending_inbound.clear();
        dropped
    }

    /// Appends a QoS 1/2 publish to the outbound queue under the lowest free
    /// packet identifier.
    pub fn enqueue(&mut self, topic: String, payload: Vec<u8>, qos: QoS) -> Result<u16> {
        let mut session = self.lock();
        let packet_id = allocate(&session, &self.control_ids)?;
        session.pending_outbound.push(InFlightMessage::new(
            packet_id,
            topic,
            payload,
            qos,
            DeliveryState::Queued,
        ));
        Ok(packet_id)
    }

    /// Accepted outbound messages not yet acknowledged.
    pub fn outbound_len(&self) -> usize {
        self.lock().pending_outbound.len()
    }

    /// Outbound messages written to the broker and not yet acknowledged.
    pub fn in_flight(&self) -> usize {
        in_flight(&self.lock())
    }

    /// Packets that resume every unacknowledged outbound flow after a
    /// reconnect, in enqueue order: the PUBLISH again (DUP set) or, for QoS 2
    /// flows past PUBREC, the PUBREL.
    pub fn replay(&self) -> Vec<Packet> {
        let session = self.lock();
        session
            .pending_outbound
            .iter()
            .filter_map(|record| match record.state {
                DeliveryState::Sent => Some(Packet::Publish(record.to_publish(true))),
                DeliveryState::AcknowledgedPartial => Some(Packet::PubRel {
                    packet_id: record.packet_id,
                }),
                DeliveryState::Queued | DeliveryState::Complete => None,
            })
            .collect()
    }

    /// Moves queued messages to `Sent` while fewer than `window` are in
    /// flight and returns their PUBLISH packets in enqueue order.
    pub fn transmit_queued(&mut self, window: usize) -> Vec<Packet> {
        let mut session = self.lock();
        let mut in_flight = in_flight(&session);
        let mut packets = Vec::new();
        for record in session.pending_outbound.iter_mut() {
            if in_flight >= window {
                break;
            }
            if record.state == DeliveryState::Queued {
                record.set_state(DeliveryState::Sent);
                packets.push(Packet::Publish(record.to_publish(false)));
                in_flight += 1;
            }
        }
        packets
    }

    /// Completes an outbound QoS 1 flow. Returns the identifier released.
    pub fn on_puback(&mut self, packet_id: u16) -> Option<u16> {
        let mut session = self.lock();
        match outbound_progress(&mut session, packet_id) {
            Some((QoS::AtLeastOnce, DeliveryState::Sent)) => {
                session.remove_outbound(packet_id);
                Some(packet_id)
            }
            Some((qos, state)) => {
                warn!(
                    "PUBACK {packet_id} does not fit QoS {} message in state {state:?}, ignoring",
                    u8::from(qos)
                );
                None
            }
            None => {
                warn!("PUBACK for unknown packet {packet_id}, ignoring");
                None
            }
        }
    }

    /// Advances an outbound QoS 2 flow past PUBREC and returns the PUBREL.
    pub fn on_pubrec(&mut self, packet_id: u16) -> Option<Packet> {
        let mut session = self.lock();
        match outbound_progress(&mut session, packet_id) {
            Some((QoS::ExactlyOnce, DeliveryState::Sent | DeliveryState::AcknowledgedPartial)) => {
                if let Some(record) = session.outbound_mut(packet_id) {
                    record.set_state(DeliveryState::AcknowledgedPartial);
                }
                Some(Packet::PubRel { packet_id })
            }
            Some((qos, state)) => {
                warn!(
                    "PUBREC {packet_id} does not fit QoS {} message in state {state:?}, ignoring",
                    u8::from(qos)
                );
                None
            }
            None => {
                warn!("PUBREC for unknown packet {packet_id}, ignoring");
                None
            }
        }
    }

    /// Completes an outbound QoS 2 flow. Returns the identifier released.
    pub fn on_pubcomp(&mut self, packet_id: u16) -> Option<u16> {
        let mut session = self.lock();
        match outbound_progress(&mut session, packet_id) {
            Some((QoS::ExactlyOnce, DeliveryState::AcknowledgedPartial)) => {
                session.remove_outbound(packet_id);
                Some(packet_id)
            }
            Some((_, state)) => {
                warn!("PUBCOMP {packet_id} arrived in state {state:?}, ignoring");
                None
            }
            None => {
                warn!("PUBCOMP for unknown packet {packet_id}, ignoring");
                None
            }
        }
    }

    /// Identifier for a SUBSCRIBE or UNSUBSCRIBE, drawn from the same space
    /// as outbound publishes.
    pub fn allocate_control_id(&mut self) -> Result<u16> {
        let packet_id = allocate(&self.lock(), &self.control_ids)?;
        self.control_ids.insert(packet_id);
        Ok(packet_id)
    }

    pub fn release_control_id(&mut self, packet_id: u16) -> bool {
        self.control_ids.remove(&packet_id)
    }

    /// Control packets do not survive a dropped link.
    pub fn release_control_ids(&mut self) {
        self.control_ids.clear();
    }
}

fn outbound_progress(session: &mut Session, packet_id: u16) -> Option<(QoS, DeliveryState)> {
    session
        .outbound_mut(packet_id)
        .map(|record| (record.qos, record.state))
}

fn in_flight(session: &Session) -> usize {
    session
        .pending_outbound
        .iter()
        .filter(|m| {
            matches!(
                m.state,
                DeliveryState::Sent | DeliveryState::AcknowledgedPartial
            )
        })
        .count()
}

/// Lowest identifier unused by outbound messages, unacknowledged inbound
/// messages and outstanding control packets.
fn allocate(session: &Session, control_ids: &BTreeSet<u16>) -> Result<u16> {
    let mut in_use = session.unacknowledged_ids(Direction::Outbound);
    in_use.extend(session.unacknowledged_ids(Direction::Inbound));
    in_use.extend(control_ids.iter().copied());
    lowest_free(&in_use).ok_or(Error::PacketIdsExhausted)
}

fn receipt(qos: QoS, packet_id: u16) -> Packet {
    match qos {
        QoS::ExactlyOnce => Packet::PubRec { packet_id },
        _ => Packet::PubAck { packet_id },
    }
}
