//! Pending-operation tracker
//!
//! Maps outbound packet identifiers to the request that used them, the
//! acknowledgment expected next, and the caller waiting for completion.
//! Identifiers come from a single allocator shared by PUBLISH, SUBSCRIBE and
//! UNSUBSCRIBE, so an identifier is never reused while any operation holds it.

use super::dispatcher::MessageHandler;
use crate::error::{MqttError, MqttResult};
use crate::protocol::{Packet, Publish, QoS, SubAck, Subscribe, SubscribeReturnCode, Unsubscribe};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Acknowledgment a pending operation is waiting for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedAck {
    PubAck,
    PubRec,
    PubComp,
    SubAck,
    UnsubAck,
}

/// Per-filter outcome of a SUBSCRIBE
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionResult {
    pub filter: String,
    pub requested: QoS,
    pub return_code: SubscribeReturnCode,
}

impl SubscriptionResult {
    /// QoS granted by the broker, or None if it refused the filter
    pub fn granted(&self) -> Option<QoS> {
        match self.return_code {
            SubscribeReturnCode::Success(qos) => Some(qos),
            SubscribeReturnCode::Failure => None,
        }
    }
}

/// Terminal result delivered to the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ack {
    Published,
    Subscribed(Vec<SubscriptionResult>),
    Unsubscribed,
}

pub type Completion = oneshot::Sender<MqttResult<Ack>>;

/// The original request behind a pending operation
#[derive(Clone)]
pub enum PendingRequest {
    Publish(Publish),
    Subscribe {
        filters: Vec<(String, QoS)>,
        handler: Option<Arc<dyn MessageHandler>>,
    },
    Unsubscribe {
        filters: Vec<String>,
    },
}

impl PendingRequest {
    fn initial_ack(&self) -> ExpectedAck {
        match self {
            PendingRequest::Publish(publish) if publish.qos == QoS::ExactlyOnce => {
                ExpectedAck::PubRec
            }
            PendingRequest::Publish(_) => ExpectedAck::PubAck,
            PendingRequest::Subscribe { .. } => ExpectedAck::SubAck,
            PendingRequest::Unsubscribe { .. } => ExpectedAck::UnsubAck,
        }
    }
}

struct PendingOperation {
    request: PendingRequest,
    expected: ExpectedAck,
    sent: bool,
    seq: u64,
    completion: Option<Completion>,
}

impl PendingOperation {
    fn complete(&mut self, result: MqttResult<Ack>) {
        if let Some(completion) = self.completion.take() {
            let _ = completion.send(result);
        }
    }
}

/// What the session must do after an acknowledgment was applied
pub enum AckOutcome {
    /// Terminal acknowledgment; the caller has been notified
    Completed { request: PendingRequest, ack: Ack },
    /// PUBREC accepted (or repeated); send PUBREL for this identifier
    Release(u16),
    /// No operation holds this identifier; a late acknowledgment
    Unknown,
    /// Out-of-order acknowledgment; the operation was failed and dropped
    Violation(String),
}

#[derive(Default)]
pub struct PendingTracker {
    operations: HashMap<u16, PendingOperation>,
    last_id: u16,
    next_seq: u64,
}

impl PendingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn contains(&self, packet_id: u16) -> bool {
        self.operations.contains_key(&packet_id)
    }

    pub fn expected(&self, packet_id: u16) -> Option<ExpectedAck> {
        self.operations.get(&packet_id).map(|op| op.expected)
    }

    fn allocate_id(&mut self) -> MqttResult<u16> {
        if self.operations.len() >= usize::from(u16::MAX) {
            return Err(MqttError::PacketIdsExhausted);
        }
        loop {
            self.last_id = self.last_id.checked_add(1).unwrap_or(1);
            if !self.operations.contains_key(&self.last_id) {
                return Ok(self.last_id);
            }
        }
    }

    /// Record a new operation and return the packet that carries it
    ///
    /// The identifier is written into the returned packet. QoS 0 publishes
    /// are not tracked and must not be passed here.
    pub fn register(
        &mut self,
        mut request: PendingRequest,
        completion: Option<Completion>,
    ) -> MqttResult<(u16, Packet)> {
        if matches!(&request, PendingRequest::Publish(publish) if publish.qos == QoS::AtMostOnce) {
            return Err(MqttError::protocol_violation(
                "QoS 0 publishes carry no packet identifier",
            ));
        }

        let packet_id = self.allocate_id()?;
        if let PendingRequest::Publish(publish) = &mut request {
            publish.packet_id = Some(packet_id);
            publish.dup = false;
        }

        let operation = PendingOperation {
            expected: request.initial_ack(),
            request,
            sent: false,
            seq: self.next_seq,
            completion,
        };
        self.next_seq += 1;

        let packet = Self::packet_for(packet_id, &operation);
        self.operations.insert(packet_id, operation);
        debug!(target: "mqtt_session", "Registered pending operation {}", packet_id);
        Ok((packet_id, packet))
    }

    pub fn mark_sent(&mut self, packet_id: u16) {
        if let Some(operation) = self.operations.get_mut(&packet_id) {
            operation.sent = true;
        }
    }

    fn packet_for(packet_id: u16, operation: &PendingOperation) -> Packet {
        match (&operation.request, operation.expected) {
            (PendingRequest::Publish(_), ExpectedAck::PubComp) => Packet::PubRel(packet_id),
            (PendingRequest::Publish(publish), _) => {
                let mut publish = publish.clone();
                publish.dup = operation.sent;
                Packet::Publish(publish)
            }
            (PendingRequest::Subscribe { filters, .. }, _) => Packet::Subscribe(Subscribe {
                packet_id,
                filters: filters.clone(),
            }),
            (PendingRequest::Unsubscribe { filters }, _) => Packet::Unsubscribe(Unsubscribe {
                packet_id,
                filters: filters.clone(),
            }),
        }
    }

    /// Packets to send after a (re)connect, in original issue order
    ///
    /// PUBLISH packets already written once carry the DUP flag; QoS 2
    /// exchanges past PUBREC resume with PUBREL.
    pub fn retransmissions(&self) -> Vec<Packet> {
        let mut ids: Vec<(u64, u16)> = self
            .operations
            .iter()
            .map(|(id, op)| (op.seq, *id))
            .collect();
        ids.sort_unstable();

        ids.into_iter()
            .filter_map(|(_, id)| self.operations.get(&id).map(|op| Self::packet_for(id, op)))
            .collect()
    }

    /// Apply an inbound acknowledgment packet
    pub fn acknowledge(&mut self, packet: &Packet) -> AckOutcome {
        let (packet_id, received) = match packet {
            Packet::PubAck(id) => (*id, ExpectedAck::PubAck),
            Packet::PubRec(id) => (*id, ExpectedAck::PubRec),
            Packet::PubComp(id) => (*id, ExpectedAck::PubComp),
            Packet::SubAck(suback) => (suback.packet_id, ExpectedAck::SubAck),
            Packet::UnsubAck(id) => (*id, ExpectedAck::UnsubAck),
            other => {
                return AckOutcome::Violation(format!(
                    "{:?} is not an acknowledgment",
                    other.packet_type()
                ))
            }
        };

        let Some(expected) = self.expected(packet_id) else {
            debug!(
                target: "mqtt_session",
                "Discarding {:?} for unknown packet id {}", received, packet_id
            );
            return AckOutcome::Unknown;
        };

        match (expected, received) {
            (ExpectedAck::PubRec, ExpectedAck::PubRec) => {
                if let Some(operation) = self.operations.get_mut(&packet_id) {
                    operation.expected = ExpectedAck::PubComp;
                }
                AckOutcome::Release(packet_id)
            }
            // Broker did not see our PUBREL; send it again
            (ExpectedAck::PubComp, ExpectedAck::PubRec) => AckOutcome::Release(packet_id),
            (ExpectedAck::SubAck, ExpectedAck::SubAck) => match packet {
                Packet::SubAck(suback) => self.complete_subscribe(suback),
                _ => AckOutcome::Unknown,
            },
            (expected, received) if expected == received => {
                let ack = match received {
                    ExpectedAck::UnsubAck => Ack::Unsubscribed,
                    _ => Ack::Published,
                };
                self.finish(packet_id, ack)
            }
            (expected, received) => self.violate(
                packet_id,
                format!("received {received:?} for packet {packet_id} while expecting {expected:?}"),
            ),
        }
    }

    fn complete_subscribe(&mut self, suback: &SubAck) -> AckOutcome {
        let packet_id = suback.packet_id;
        let requested = match self.operations.get(&packet_id).map(|op| &op.request) {
            Some(PendingRequest::Subscribe { filters, .. }) => filters.clone(),
            _ => return AckOutcome::Unknown,
        };

        if requested.len() != suback.return_codes.len() {
            return self.violate(
                packet_id,
                format!(
                    "SUBACK {} carries {} return codes for {} filters",
                    packet_id,
                    suback.return_codes.len(),
                    requested.len()
                ),
            );
        }

        let results = requested
            .into_iter()
            .zip(suback.return_codes.iter().copied())
            .map(|((filter, requested), return_code)| SubscriptionResult {
                filter,
                requested,
                return_code,
            })
            .collect();
        self.finish(packet_id, Ack::Subscribed(results))
    }

    fn finish(&mut self, packet_id: u16, ack: Ack) -> AckOutcome {
        match self.operations.remove(&packet_id) {
            Some(mut operation) => {
                operation.complete(Ok(ack.clone()));
                AckOutcome::Completed {
                    request: operation.request,
                    ack,
                }
            }
            None => AckOutcome::Unknown,
        }
    }

    fn violate(&mut self, packet_id: u16, message: String) -> AckOutcome {
        warn!(target: "mqtt_session", "Protocol violation: {}", message);
        if let Some(mut operation) = self.operations.remove(&packet_id) {
            operation.complete(Err(MqttError::ProtocolViolation(message.clone())));
        }
        AckOutcome::Violation(message)
    }

    /// Forget an operation whose caller stopped waiting
    ///
    /// A later acknowledgment for the identifier is reported as
    /// [`AckOutcome::Unknown`].
    pub fn abandon(&mut self, packet_id: u16) -> bool {
        self.operations.remove(&packet_id).is_some()
    }

    /// Fail every operation with `error` and free all identifiers
    pub fn fail_all(&mut self, error: MqttError) {
        for (_, mut operation) in self.operations.drain() {
            operation.complete(Err(error.clone()));
        }
    }

    /// Fail operations that reached the wire; keep ones never sent
    ///
    /// Returns the requests that were failed.
    pub fn fail_sent(&mut self, error: MqttError) -> Vec<PendingRequest> {
        let sent: Vec<u16> = self
            .operations
            .iter()
            .filter(|(_, op)| op.sent)
            .map(|(id, _)| *id)
            .collect();

        sent.into_iter()
            .filter_map(|id| self.operations.remove(&id))
            .map(|mut operation| {
                operation.complete(Err(error.clone()));
                operation.request
            })
            .collect()
    }
}
