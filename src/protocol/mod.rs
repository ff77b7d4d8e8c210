//! MQTT v3.1.1 wire protocol
//!
//! Packet types, the stateless codec and topic rules shared by the client
//! session engine and the test broker.

pub mod codec;
pub mod packet;
pub mod topics;

pub use codec::{decode, decode_with_limit, encode, encode_to_bytes, CodecError};
pub use packet::*;
pub use topics::{topic_matches, validate_topic_filter, validate_topic_name, TopicError};
