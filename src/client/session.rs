//! Session state machine
//!
//! Owns everything that must survive a reconnect of a persistent session:
//! pending operations, the subscription set, inbound QoS 2 receipts and
//! publishes queued while offline. It performs no I/O. Every method returns
//! the packets the caller must write, in order, and the event loop is the
//! only thing that mutates a `Session`.

use super::dispatcher::{Dispatcher, InboundMessage, MessageHandler};
use super::pending::{Ack, AckOutcome, Completion, PendingRequest, PendingTracker};
use crate::error::{MqttError, MqttResult};
use crate::protocol::{Packet, Publish, QoS};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct Session {
    clean_session: bool,
    online: bool,
    tracker: PendingTracker,
    subscriptions: HashMap<String, QoS>,
    inbound_qos2: HashSet<u16>,
    queued: Vec<(Publish, Option<Completion>)>,
    dispatcher: Dispatcher,
}

impl Session {
    pub fn new(clean_session: bool, dispatcher: Dispatcher) -> Self {
        Self {
            clean_session,
            online: false,
            tracker: PendingTracker::new(),
            subscriptions: HashMap::new(),
            inbound_qos2: HashSet::new(),
            queued: Vec::new(),
            dispatcher,
        }
    }

    pub fn is_online(&self) -> bool {
        self.online
    }

    pub fn pending_count(&self) -> usize {
        self.tracker.len()
    }

    pub fn queued_count(&self) -> usize {
        self.queued.len()
    }

    /// Active subscriptions with their requested QoS
    pub fn subscriptions(&self) -> &HashMap<String, QoS> {
        &self.subscriptions
    }

    pub fn set_default_handler(&mut self, handler: Option<Arc<dyn MessageHandler>>) {
        self.dispatcher.set_default_handler(handler);
    }

    /// Issue a PUBLISH
    ///
    /// Returns the packet identifier (QoS 1 and 2) and the packets to write
    /// now. While offline nothing is written: QoS 0 messages wait in a queue
    /// and QoS 1/2 operations go out with the post-connect retransmissions.
    pub fn publish(
        &mut self,
        publish: Publish,
        completion: Option<Completion>,
    ) -> MqttResult<(Option<u16>, Vec<Packet>)> {
        if publish.qos == QoS::AtMostOnce {
            if !self.online {
                self.queued.push((publish, completion));
                return Ok((None, Vec::new()));
            }
            complete(completion, Ok(Ack::Published));
            return Ok((None, vec![Packet::Publish(publish)]));
        }

        let (packet_id, packet) = self
            .tracker
            .register(PendingRequest::Publish(publish), completion)?;
        if !self.online {
            return Ok((Some(packet_id), Vec::new()));
        }
        self.tracker.mark_sent(packet_id);
        Ok((Some(packet_id), vec![packet]))
    }

    pub fn subscribe(
        &mut self,
        filters: Vec<(String, QoS)>,
        handler: Option<Arc<dyn MessageHandler>>,
        completion: Option<Completion>,
    ) -> MqttResult<(u16, Packet)> {
        self.issue(PendingRequest::Subscribe { filters, handler }, completion)
    }

    pub fn unsubscribe(
        &mut self,
        filters: Vec<String>,
        completion: Option<Completion>,
    ) -> MqttResult<(u16, Packet)> {
        self.issue(PendingRequest::Unsubscribe { filters }, completion)
    }

    fn issue(
        &mut self,
        request: PendingRequest,
        completion: Option<Completion>,
    ) -> MqttResult<(u16, Packet)> {
        let (packet_id, packet) = self.tracker.register(request, completion)?;
        self.tracker.mark_sent(packet_id);
        Ok((packet_id, packet))
    }

    /// Stop tracking an operation whose caller gave up waiting
    pub fn abandon(&mut self, packet_id: u16) {
        if self.tracker.abandon(packet_id) {
            debug!(target: "mqtt_session", "Abandoned pending operation {}", packet_id);
        }
    }

    /// Apply one inbound packet
    ///
    /// An error means the broker broke the protocol and the connection must
    /// be torn down.
    pub fn handle_packet(&mut self, packet: Packet) -> MqttResult<Vec<Packet>> {
        match packet {
            Packet::Publish(publish) => self.handle_inbound_publish(publish),
            Packet::PubRel(packet_id) => {
                // Reply even for an unknown id so the broker can finish
                self.inbound_qos2.remove(&packet_id);
                Ok(vec![Packet::PubComp(packet_id)])
            }
            ack @ (Packet::PubAck(_)
            | Packet::PubRec(_)
            | Packet::PubComp(_)
            | Packet::SubAck(_)
            | Packet::UnsubAck(_)) => self.handle_ack(&ack),
            Packet::PingResp => Ok(Vec::new()),
            other => Err(MqttError::protocol_violation(format!(
                "unexpected {:?} from broker",
                other.packet_type()
            ))),
        }
    }

    fn handle_inbound_publish(&mut self, publish: Publish) -> MqttResult<Vec<Packet>> {
        debug!(
            target: "mqtt_session",
            "Received PUBLISH on {} ({}, dup={})", publish.topic, publish.qos, publish.dup
        );

        match (publish.qos, publish.packet_id) {
            (QoS::AtMostOnce, _) => {
                self.dispatcher.dispatch(InboundMessage::from(publish));
                Ok(Vec::new())
            }
            (QoS::AtLeastOnce, Some(packet_id)) => {
                self.dispatcher.dispatch(InboundMessage::from(publish));
                Ok(vec![Packet::PubAck(packet_id)])
            }
            (QoS::ExactlyOnce, Some(packet_id)) => {
                if self.inbound_qos2.insert(packet_id) {
                    self.dispatcher.dispatch(InboundMessage::from(publish));
                } else {
                    debug!(
                        target: "mqtt_session",
                        "Suppressing redelivery of QoS 2 packet {}", packet_id
                    );
                }
                Ok(vec![Packet::PubRec(packet_id)])
            }
            (qos, None) => Err(MqttError::protocol_violation(format!(
                "{qos} PUBLISH without packet identifier"
            ))),
        }
    }

    /// The operation behind an out-of-sequence ack has already failed; the
    /// error tears the connection down.
    fn handle_ack(&mut self, ack: &Packet) -> MqttResult<Vec<Packet>> {
        match self.tracker.acknowledge(ack) {
            AckOutcome::Completed { request, ack } => {
                self.apply_completed(request, ack);
                Ok(Vec::new())
            }
            AckOutcome::Release(packet_id) => Ok(vec![Packet::PubRel(packet_id)]),
            AckOutcome::Unknown => match ack {
                // The broker still holds the message; let it finish
                Packet::PubRec(packet_id) => Ok(vec![Packet::PubRel(*packet_id)]),
                _ => Ok(Vec::new()),
            },
            AckOutcome::Violation(message) => Err(MqttError::ProtocolViolation(message)),
        }
    }

    fn apply_completed(&mut self, request: PendingRequest, ack: Ack) {
        match (request, ack) {
            (PendingRequest::Subscribe { handler, .. }, Ack::Subscribed(results)) => {
                for result in results {
                    if result.return_code.is_success() {
                        self.subscriptions
                            .insert(result.filter.clone(), result.requested);
                        if let Some(handler) = &handler {
                            self.dispatcher.register(&result.filter, handler.clone());
                        }
                    } else {
                        warn!("Broker refused subscription to {}", result.filter);
                        self.subscriptions.remove(&result.filter);
                        self.dispatcher.unregister(&result.filter);
                    }
                }
            }
            (PendingRequest::Unsubscribe { filters }, _) => {
                for filter in filters {
                    self.subscriptions.remove(&filter);
                    self.dispatcher.unregister(&filter);
                }
            }
            _ => {}
        }
    }

    /// CONNACK accepted; returns everything to write before new requests
    ///
    /// Order: pending retransmissions in issue order, a resubscribe when the
    /// broker forgot a persistent session, then publishes queued offline.
    pub fn on_connected(&mut self, session_present: bool) -> MqttResult<Vec<Packet>> {
        self.online = true;
        if !session_present {
            self.inbound_qos2.clear();
        }

        let mut packets = self.tracker.retransmissions();
        for packet in &packets {
            if let Some(packet_id) = packet.packet_id() {
                self.tracker.mark_sent(packet_id);
            }
        }
        if !packets.is_empty() {
            info!("Resending {} unacknowledged operation(s)", packets.len());
        }

        if !self.clean_session && !session_present && !self.subscriptions.is_empty() {
            let mut filters: Vec<(String, QoS)> = self
                .subscriptions
                .iter()
                .map(|(filter, qos)| (filter.clone(), *qos))
                .collect();
            filters.sort();
            info!("Broker lost session state, resubscribing {} filter(s)", filters.len());
            let (_, packet) = self.subscribe(filters, None, None)?;
            packets.push(packet);
        }

        for (publish, completion) in self.queued.drain(..) {
            complete(completion, Ok(Ack::Published));
            packets.push(Packet::Publish(publish));
        }
        Ok(packets)
    }

    /// The connection dropped without a disconnect request
    pub fn on_connection_lost(&mut self) {
        self.online = false;
        if self.clean_session {
            let failed = self.tracker.fail_sent(MqttError::SessionLost);
            if !failed.is_empty() {
                warn!("Clean session lost {} in-flight operation(s)", failed.len());
            }
            self.subscriptions.clear();
            self.dispatcher.clear();
            self.inbound_qos2.clear();
        }
    }

    /// Fail every pending and queued operation with `error`
    pub fn fail_all(&mut self, error: MqttError) {
        self.online = false;
        self.tracker.fail_all(error.clone());
        for (_, completion) in self.queued.drain(..) {
            complete(completion, Err(error.clone()));
        }
    }
}

fn complete(completion: Option<Completion>, result: MqttResult<Ack>) {
    if let Some(completion) = completion {
        let _ = completion.send(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::dispatcher::ChannelHandler;
    use crate::client::observer::{LoggingObserver, Notifier};
    use crate::protocol::{SubAck, SubscribeReturnCode};
    use bytes::Bytes;
    use tokio::sync::{mpsc, oneshot};

    fn session(clean_session: bool) -> Session {
        let dispatcher = Dispatcher::spawn(Notifier::spawn(Arc::new(LoggingObserver))).unwrap();
        let mut session = Session::new(clean_session, dispatcher);
        session.on_connected(false).unwrap();
        session
    }

    fn subscribed_session(
        clean_session: bool,
        filter: &str,
    ) -> (Session, mpsc::UnboundedReceiver<InboundMessage>) {
        let mut session = session(clean_session);
        let (handler, rx) = ChannelHandler::channel();
        let (id, _) = session
            .subscribe(
                vec![(filter.to_string(), QoS::ExactlyOnce)],
                Some(Arc::new(handler)),
                None,
            )
            .unwrap();
        session
            .handle_packet(Packet::SubAck(SubAck {
                packet_id: id,
                return_codes: vec![SubscribeReturnCode::Success(QoS::ExactlyOnce)],
            }))
            .unwrap();
        (session, rx)
    }

    fn inbound(topic: &str, qos: QoS, packet_id: Option<u16>, dup: bool) -> Packet {
        let mut publish = Publish::new(topic, qos, Bytes::from_static(b"payload"));
        publish.packet_id = packet_id;
        publish.dup = dup;
        Packet::Publish(publish)
    }

    #[tokio::test]
    async fn test_inbound_qos1_dispatched_and_acked() {
        let (mut session, mut rx) = subscribed_session(true, "a/#");

        let replies = session
            .handle_packet(inbound("a/b", QoS::AtLeastOnce, Some(7), false))
            .unwrap();

        assert_eq!(replies, vec![Packet::PubAck(7)]);
        assert_eq!(rx.recv().await.unwrap().topic, "a/b");
    }

    #[tokio::test]
    async fn test_inbound_qos2_delivered_once() {
        let (mut session, mut rx) = subscribed_session(true, "a/#");

        let replies = session
            .handle_packet(inbound("a/b", QoS::ExactlyOnce, Some(9), false))
            .unwrap();
        assert_eq!(replies, vec![Packet::PubRec(9)]);

        let replies = session
            .handle_packet(inbound("a/b", QoS::ExactlyOnce, Some(9), true))
            .unwrap();
        assert_eq!(replies, vec![Packet::PubRec(9)]);

        let replies = session.handle_packet(Packet::PubRel(9)).unwrap();
        assert_eq!(replies, vec![Packet::PubComp(9)]);

        assert_eq!(rx.recv().await.unwrap().packet_id, Some(9));
        // Release frees the identifier for the next exchange
        session
            .handle_packet(inbound("a/c", QoS::ExactlyOnce, Some(9), false))
            .unwrap();
        assert_eq!(rx.recv().await.unwrap().topic, "a/c");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unexpected_packets_are_violations() {
        let mut session = session(true);
        assert!(matches!(
            session.handle_packet(Packet::PingReq),
            Err(MqttError::ProtocolViolation(_))
        ));
        assert!(session.handle_packet(Packet::Disconnect).is_err());
        assert!(session.handle_packet(Packet::PingResp).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_refused_filter_is_not_registered() {
        let mut session = session(true);
        let (handler, _rx) = ChannelHandler::channel();
        let (id, _) = session
            .subscribe(
                vec![
                    ("ok/#".to_string(), QoS::AtLeastOnce),
                    ("denied/#".to_string(), QoS::AtLeastOnce),
                ],
                Some(Arc::new(handler)),
                None,
            )
            .unwrap();
        session
            .handle_packet(Packet::SubAck(SubAck {
                packet_id: id,
                return_codes: vec![
                    SubscribeReturnCode::Success(QoS::AtMostOnce),
                    SubscribeReturnCode::Failure,
                ],
            }))
            .unwrap();

        assert!(session.subscriptions().contains_key("ok/#"));
        assert!(!session.subscriptions().contains_key("denied/#"));
    }

    #[tokio::test]
    async fn test_qos2_outbound_sends_pubrel_after_pubrec() {
        let mut session = session(true);
        let (tx, mut rx) = oneshot::channel();
        let (id, packets) = session
            .publish(Publish::new("x", QoS::ExactlyOnce, Bytes::new()), Some(tx))
            .unwrap();
        let id = id.unwrap();
        assert_eq!(packets.len(), 1);

        assert_eq!(
            session.handle_packet(Packet::PubRec(id)).unwrap(),
            vec![Packet::PubRel(id)]
        );
        assert!(session.handle_packet(Packet::PubComp(id)).unwrap().is_empty());
        assert_eq!(rx.try_recv().unwrap(), Ok(Ack::Published));
    }

    #[tokio::test]
    async fn test_out_of_sequence_ack_fails_operation_and_connection() {
        let mut session = session(true);
        let (tx, mut rx) = oneshot::channel();
        let (id, _) = session
            .publish(Publish::new("x", QoS::ExactlyOnce, Bytes::new()), Some(tx))
            .unwrap();
        let id = id.unwrap();

        let result = session.handle_packet(Packet::PubComp(id));
        assert!(matches!(result, Err(MqttError::ProtocolViolation(_))));
        assert!(matches!(
            rx.try_recv().unwrap(),
            Err(MqttError::ProtocolViolation(_))
        ));
        assert_eq!(session.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_persistent_session_resends_with_dup() {
        let (mut session, _rx) = subscribed_session(false, "a/#");
        let (first, _) = session
            .publish(Publish::new("x", QoS::AtLeastOnce, Bytes::new()), None)
            .unwrap();

        session.on_connection_lost();
        let (queued, packets) = session
            .publish(Publish::new("y", QoS::AtMostOnce, Bytes::new()), None)
            .unwrap();
        assert!(queued.is_none() && packets.is_empty());

        let packets = session.on_connected(false).unwrap();
        assert_eq!(packets.len(), 3);
        assert!(matches!(&packets[0], Packet::Publish(p) if p.dup && p.packet_id == first));
        assert!(matches!(&packets[1], Packet::Subscribe(s) if s.filters[0].0 == "a/#"));
        assert!(matches!(&packets[2], Packet::Publish(p) if p.topic == "y"));
    }

    #[tokio::test]
    async fn test_clean_session_discards_state_on_loss() {
        let (mut session, _rx) = subscribed_session(true, "a/#");
        let (tx, mut rx) = oneshot::channel();
        session
            .publish(Publish::new("x", QoS::AtLeastOnce, Bytes::new()), Some(tx))
            .unwrap();

        session.on_connection_lost();
        assert_eq!(rx.try_recv().unwrap(), Err(MqttError::SessionLost));
        assert!(session.subscriptions().is_empty());

        assert!(session.on_connected(false).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fail_all_cancels_queued_and_pending() {
        let mut session = session(false);
        session.on_connection_lost();
        let (queued_tx, mut queued_rx) = oneshot::channel();
        let (pending_tx, mut pending_rx) = oneshot::channel();
        session
            .publish(Publish::new("a", QoS::AtMostOnce, Bytes::new()), Some(queued_tx))
            .unwrap();
        session
            .publish(Publish::new("b", QoS::AtLeastOnce, Bytes::new()), Some(pending_tx))
            .unwrap();

        session.fail_all(MqttError::Cancelled);
        assert_eq!(queued_rx.try_recv().unwrap(), Err(MqttError::Cancelled));
        assert_eq!(pending_rx.try_recv().unwrap(), Err(MqttError::Cancelled));
        assert_eq!(session.pending_count(), 0);
        assert_eq!(session.queued_count(), 0);
    }
}
